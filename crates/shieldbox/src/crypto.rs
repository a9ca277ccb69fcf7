//! cryptographic primitives for shieldbox
//!
//! - argon2id for password stretching
//! - xchacha20poly1305 for authenticated encryption
//! - hkdf-sha256 / hmac-sha256 for key separation and tags

use argon2::{Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit as AeadKeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use hmac::{digest::KeyInit, Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::keys::{MasterKeyMaterial, SymmetricKey};
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
pub const KEY_LEN: usize = 32;

/// argon2 refuses anything below 8 KiB per lane
const ARGON2_FLOOR_KIB: u32 = 8;

/// argon2id work factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 16 * 1024, // 16 MiB
            iterations: 3,
            parallelism: 1,
        }
    }
}

/// lowest work factor the vault accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfPolicy {
    pub min_memory_kib: u32,
    pub min_iterations: u32,
}

impl Default for KdfPolicy {
    fn default() -> Self {
        Self {
            min_memory_kib: 8 * 1024,
            min_iterations: 2,
        }
    }
}

impl KdfPolicy {
    pub fn check(&self, params: &KdfParams) -> Result<()> {
        if params.memory_kib < self.min_memory_kib
            || params.iterations < self.min_iterations
            || params.parallelism == 0
            || params.memory_kib < ARGON2_FLOOR_KIB * params.parallelism
        {
            return Err(Error::WeakWorkFactor {
                memory_kib: params.memory_kib,
                iterations: params.iterations,
                min_memory_kib: self.min_memory_kib,
                min_iterations: self.min_iterations,
            });
        }
        Ok(())
    }
}

/// stretch a password into a master key
///
/// deterministic in (password, salt, params). params below the policy are a
/// configuration error, never silently raised.
pub fn derive_key(
    password: &[u8],
    salt: &[u8; SALT_LEN],
    params: &KdfParams,
    policy: &KdfPolicy,
) -> Result<MasterKeyMaterial> {
    policy.check(params)?;

    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| Error::KdfFailed(e.to_string()))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password, salt, &mut output[..])
        .map_err(|e| Error::KdfFailed(e.to_string()))?;

    Ok(MasterKeyMaterial::new(SymmetricKey::from_bytes(*output), *salt, *params))
}

/// generate random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// random lowercase hex identifier
pub fn random_id() -> String {
    hex::encode(random_bytes::<16>())
}

/// compute hmac-sha256 tag
pub fn mac(key: &[u8], data: &[&[u8]]) -> [u8; 32] {
    let mut h: HmacSha256 = KeyInit::new_from_slice(key).expect("hmac accepts any key length");
    for d in data {
        Mac::update(&mut h, d);
    }
    h.finalize().into_bytes().into()
}

/// hkdf-sha256 expand into a fresh 32 byte key
pub fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[&[u8]]) -> Result<SymmetricKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let info = info.concat();
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(&info, &mut okm[..])
        .map_err(|e| Error::KdfFailed(e.to_string()))?;
    Ok(SymmetricKey::from_bytes(*okm))
}

/// constant time equality
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// seal with xchacha20poly1305
pub fn aead_seal(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher: XChaCha20Poly1305 = AeadKeyInit::new_from_slice(key.as_bytes())
        .map_err(|e| Error::EncryptionFailed(e.to_string()))?;
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|e| Error::EncryptionFailed(e.to_string()))
}

/// open with xchacha20poly1305, any mismatch is an authentication failure
pub fn aead_open(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher: XChaCha20Poly1305 = AeadKeyInit::new_from_slice(key.as_bytes())
        .map_err(|_| Error::AuthenticationFailure)?;
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| Error::AuthenticationFailure)
}

#[cfg(test)]
pub(crate) fn test_params() -> (KdfParams, KdfPolicy) {
    (
        KdfParams { memory_kib: 64, iterations: 1, parallelism: 1 },
        KdfPolicy { min_memory_kib: 64, min_iterations: 1 },
    )
}
