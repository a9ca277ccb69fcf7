//! vault header
//!
//! what an owner persists: the kdf salt and work factor, the vault root key
//! sealed under the password-derived master key, and the owner keypair.
//! the root key is what documents are encrypted under and what guardians
//! hold shares of.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, KdfParams, KdfPolicy, SALT_LEN};
use crate::envelope::{self, Envelope};
use crate::ids::OwnerId;
use crate::keys::{KeyPair, MasterKeyMaterial, SecretKey, SymmetricKey};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultHeader {
    pub owner_id: OwnerId,
    #[serde(with = "crate::envelope::hex_array")]
    pub salt: [u8; SALT_LEN],
    pub params: KdfParams,
    /// vault root key sealed under the master key
    pub sealed_root: Envelope,
    pub keypair: KeyPair,
}

/// keys recovered by a successful password check
pub struct UnlockedKeys {
    pub master: MasterKeyMaterial,
    pub root: SymmetricKey,
}

impl VaultHeader {
    /// set up a new vault, returning the header and the fresh root key
    pub fn create(
        owner_id: OwnerId,
        password: &[u8],
        params: KdfParams,
        policy: &KdfPolicy,
    ) -> Result<(Self, SymmetricKey)> {
        let salt: [u8; SALT_LEN] = crypto::random_bytes();
        let master = crypto::derive_key(password, &salt, &params, policy)?;
        let root = SymmetricKey::generate();

        let sealed_root = envelope::encrypt_with_aad(root.as_bytes(), master.key(), &root_aad(&owner_id))?;
        let keypair = KeyPair::generate(master.key())?;

        Ok((
            Self {
                owner_id,
                salt,
                params,
                sealed_root,
                keypair,
            },
            root,
        ))
    }

    /// derive the master key and open the root; a wrong password is an
    /// authentication failure
    pub fn unlock(&self, password: &[u8], policy: &KdfPolicy) -> Result<UnlockedKeys> {
        let master = crypto::derive_key(password, &self.salt, &self.params, policy)?;
        let root = self.open_root(&master)?;
        Ok(UnlockedKeys { master, root })
    }

    pub fn open_root(&self, master: &MasterKeyMaterial) -> Result<SymmetricKey> {
        let bytes = envelope::decrypt_with_aad(&self.sealed_root, master.key(), &root_aad(&self.owner_id))?;
        SymmetricKey::from_slice(&bytes).map_err(|_| Error::InvalidEnvelope)
    }

    pub fn owner_secret_key(&self, master: &MasterKeyMaterial) -> Result<SecretKey> {
        self.keypair.unseal(master.key())
    }

    /// re-seal under a new password (and optionally a new work factor);
    /// the root key and keypair are unchanged, so guardian shares stay valid
    pub fn change_password(
        &self,
        old_password: &[u8],
        new_password: &[u8],
        params: KdfParams,
        policy: &KdfPolicy,
    ) -> Result<Self> {
        let unlocked = self.unlock(old_password, policy)?;

        let salt: [u8; SALT_LEN] = crypto::random_bytes();
        let master = crypto::derive_key(new_password, &salt, &params, policy)?;
        let sealed_root = envelope::encrypt_with_aad(
            unlocked.root.as_bytes(),
            master.key(),
            &root_aad(&self.owner_id),
        )?;
        let keypair = self.keypair.reseal(unlocked.master.key(), master.key())?;

        Ok(Self {
            owner_id: self.owner_id.clone(),
            salt,
            params,
            sealed_root,
            keypair,
        })
    }
}

fn root_aad(owner_id: &OwnerId) -> Vec<u8> {
    let mut aad = b"shieldbox:vault_root:".to_vec();
    aad.extend_from_slice(owner_id.as_str().as_bytes());
    aad
}
