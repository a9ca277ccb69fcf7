//! key material
//!
//! symmetric keys are zeroized on drop. asymmetric keys are x25519; the
//! private half only ever leaves memory sealed under a symmetric key.

use std::fmt;

use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, KdfParams, KEY_LEN, NONCE_LEN, SALT_LEN};
use crate::envelope::{self, Envelope};
use crate::{Error, Result};

/// 256-bit symmetric key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidSecretLength)?;
        Ok(Self(arr))
    }

    pub fn generate() -> Self {
        Self(crypto::random_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// password-derived key plus the parameters that produced it
///
/// the key zeroizes itself on drop; salt and params are not secret.
#[derive(Clone, Debug)]
pub struct MasterKeyMaterial {
    key: SymmetricKey,
    salt: [u8; SALT_LEN],
    params: KdfParams,
}

impl MasterKeyMaterial {
    pub(crate) fn new(key: SymmetricKey, salt: [u8; SALT_LEN], params: KdfParams) -> Self {
        Self { key, salt, params }
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }
}

/// x25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "crate::envelope::hex_array")] pub [u8; 32]);

impl PublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidSecretLength)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidSecretLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// x25519 static secret, zeroized on drop by x25519-dalek
pub struct SecretKey(StaticSecret);

impl SecretKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(rand::thread_rng()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    fn diffie_hellman(&self, their_public: &PublicKey) -> Zeroizing<[u8; 32]> {
        let their = x25519_dalek::PublicKey::from(their_public.0);
        Zeroizing::new(self.0.diffie_hellman(&their).to_bytes())
    }

    fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.0.to_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(pub={})", self.public_key().to_hex())
    }
}

const KEYPAIR_AAD: &[u8] = b"shieldbox:keypair:v1";

/// asymmetric keypair whose private half is stored sealed
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyPair {
    pub public: PublicKey,
    pub sealed_private: Envelope,
}

impl KeyPair {
    /// generate a keypair, sealing the private key under `sealing_key`
    pub fn generate(sealing_key: &SymmetricKey) -> Result<Self> {
        let secret = SecretKey::generate();
        Self::from_secret(&secret, sealing_key)
    }

    pub fn from_secret(secret: &SecretKey, sealing_key: &SymmetricKey) -> Result<Self> {
        let public = secret.public_key();
        let aad = [KEYPAIR_AAD, &public.0[..]].concat();
        let sealed_private = envelope::encrypt_with_aad(&*secret.to_bytes(), sealing_key, &aad)?;
        Ok(Self { public, sealed_private })
    }

    /// recover the private key
    pub fn unseal(&self, sealing_key: &SymmetricKey) -> Result<SecretKey> {
        let aad = [KEYPAIR_AAD, &self.public.0[..]].concat();
        let bytes = envelope::decrypt_with_aad(&self.sealed_private, sealing_key, &aad)?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| Error::InvalidEnvelope)?;
        let secret = SecretKey::from_bytes(arr);
        if secret.public_key() != self.public {
            return Err(Error::AuthenticationFailure);
        }
        Ok(secret)
    }

    /// re-seal under a new key without changing the keypair
    pub fn reseal(&self, old_key: &SymmetricKey, new_key: &SymmetricKey) -> Result<Self> {
        let secret = self.unseal(old_key)?;
        Self::from_secret(&secret, new_key)
    }
}

/// payload sealed to an x25519 public key (ephemeral-static ecdh)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    pub ephemeral_public: PublicKey,
    #[serde(with = "crate::envelope::hex_array")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "crate::envelope::hex_bytes")]
    pub ciphertext: Vec<u8>,
}

impl SealedBox {
    /// seal `plaintext` so only the holder of `recipient`'s secret can open it
    pub fn seal_to(recipient: &PublicKey, plaintext: &[u8], aad: &[u8]) -> Result<Self> {
        let ephemeral = SecretKey::generate();
        let ephemeral_public = ephemeral.public_key();
        let shared = ephemeral.diffie_hellman(recipient);
        let key = box_key(&*shared, &ephemeral_public, recipient)?;

        let nonce: [u8; NONCE_LEN] = crypto::random_bytes();
        let ciphertext = crypto::aead_seal(&key, &nonce, plaintext, aad)?;

        Ok(Self { ephemeral_public, nonce, ciphertext })
    }

    /// open with the recipient's secret key
    pub fn open(&self, recipient: &SecretKey, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let shared = recipient.diffie_hellman(&self.ephemeral_public);
        let key = box_key(&*shared, &self.ephemeral_public, &recipient.public_key())?;
        crypto::aead_open(&key, &self.nonce, &self.ciphertext, aad)
    }
}

/// derive the box key from the shared secret, bound to both public keys
fn box_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> Result<SymmetricKey> {
    crypto::hkdf_expand(
        shared,
        b"shieldbox:sealed_box:v1",
        &[&ephemeral.0[..], &recipient.0[..]],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_seal_unseal() {
        let master = SymmetricKey::generate();
        let pair = KeyPair::generate(&master).unwrap();

        let secret = pair.unseal(&master).unwrap();
        assert_eq!(secret.public_key(), pair.public);

        let wrong = SymmetricKey::generate();
        assert!(matches!(pair.unseal(&wrong), Err(Error::AuthenticationFailure)));
    }

    #[test]
    fn test_keypair_reseal() {
        let old = SymmetricKey::generate();
        let new = SymmetricKey::generate();
        let pair = KeyPair::generate(&old).unwrap();

        let resealed = pair.reseal(&old, &new).unwrap();
        assert_eq!(resealed.public, pair.public);
        assert!(resealed.unseal(&new).is_ok());
        assert!(resealed.unseal(&old).is_err());
    }

    #[test]
    fn test_sealed_box() {
        let guardian = SecretKey::generate();
        let sealed = SealedBox::seal_to(&guardian.public_key(), b"share bytes", b"aad").unwrap();

        let opened = sealed.open(&guardian, b"aad").unwrap();
        assert_eq!(opened.as_slice(), b"share bytes");

        // wrong recipient
        let other = SecretKey::generate();
        assert!(sealed.open(&other, b"aad").is_err());

        // wrong aad
        assert!(sealed.open(&guardian, b"other").is_err());
    }

    #[test]
    fn test_debug_does_not_leak() {
        let key = SymmetricKey::from_bytes([7u8; 32]);
        assert_eq!(format!("{:?}", key), "SymmetricKey(..)");
    }

    #[test]
    fn test_public_key_hex() {
        let pk = SecretKey::generate().public_key();
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
        assert!(PublicKey::from_hex("abcd").is_err());
    }
}
