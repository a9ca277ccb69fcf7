//! envelope codec
//!
//! every payload (documents, metadata, sealed private keys, the vault root)
//! is stored as an [`Envelope`]: algorithm tag, per-envelope salt, nonce and
//! ciphertext. the aead key is `hkdf(key, salt)`, so a fresh salt gives a
//! fresh aead key on every call on top of the fresh 192-bit nonce.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{self, NONCE_LEN, SALT_LEN};
use crate::ids::{DocumentId, OwnerId};
use crate::keys::SymmetricKey;
use crate::permissions::Category;
use crate::{Error, Result};

/// current binary format version
const FORMAT_V1: u8 = 1;

/// aead construction used for an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "xchacha20poly1305-hkdf-sha256")]
    XChaCha20Poly1305,
}

impl Algorithm {
    fn tag(self) -> u8 {
        match self {
            Algorithm::XChaCha20Poly1305 => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Algorithm::XChaCha20Poly1305),
            _ => Err(Error::InvalidEnvelope),
        }
    }
}

/// encrypted payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub algorithm: Algorithm,
    #[serde(with = "hex_array")]
    pub salt: [u8; SALT_LEN],
    #[serde(with = "hex_array")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// serialize to the compact form kept in the blob store
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + SALT_LEN + NONCE_LEN + self.ciphertext.len());
        bytes.push(FORMAT_V1);
        bytes.push(self.algorithm.tag());
        bytes.extend_from_slice(&self.salt);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = 2 + SALT_LEN + NONCE_LEN;
        // an empty plaintext still carries a 16 byte tag
        if bytes.len() < header + 16 || bytes[0] != FORMAT_V1 {
            return Err(Error::InvalidEnvelope);
        }
        let algorithm = Algorithm::from_tag(bytes[1])?;
        let salt: [u8; SALT_LEN] = bytes[2..2 + SALT_LEN]
            .try_into()
            .map_err(|_| Error::InvalidEnvelope)?;
        let nonce: [u8; NONCE_LEN] = bytes[2 + SALT_LEN..header]
            .try_into()
            .map_err(|_| Error::InvalidEnvelope)?;
        Ok(Self {
            algorithm,
            salt,
            nonce,
            ciphertext: bytes[header..].to_vec(),
        })
    }

    fn header_aad(&self, aad: &[u8]) -> Vec<u8> {
        header_aad(self.algorithm, &self.salt, aad)
    }
}

fn header_aad(algorithm: Algorithm, salt: &[u8; SALT_LEN], aad: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + SALT_LEN + aad.len());
    out.push(algorithm.tag());
    out.extend_from_slice(salt);
    out.extend_from_slice(aad);
    out
}

fn envelope_key(key: &SymmetricKey, salt: &[u8; SALT_LEN]) -> Result<SymmetricKey> {
    crypto::hkdf_expand(key.as_bytes(), salt, &[b"shieldbox:envelope:v1"])
}

/// encrypt under `key` with fresh salt and nonce
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> Result<Envelope> {
    encrypt_with_aad(plaintext, key, &[])
}

pub fn encrypt_with_aad(plaintext: &[u8], key: &SymmetricKey, aad: &[u8]) -> Result<Envelope> {
    let algorithm = Algorithm::XChaCha20Poly1305;
    let salt: [u8; SALT_LEN] = crypto::random_bytes();
    let nonce: [u8; NONCE_LEN] = crypto::random_bytes();

    let subkey = envelope_key(key, &salt)?;
    let ciphertext = crypto::aead_seal(&subkey, &nonce, plaintext, &header_aad(algorithm, &salt, aad))?;

    Ok(Envelope { algorithm, salt, nonce, ciphertext })
}

/// authenticated decryption; fails closed on any tamper
pub fn decrypt(envelope: &Envelope, key: &SymmetricKey) -> Result<Zeroizing<Vec<u8>>> {
    decrypt_with_aad(envelope, key, &[])
}

pub fn decrypt_with_aad(
    envelope: &Envelope,
    key: &SymmetricKey,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let subkey = envelope_key(key, &envelope.salt)?;
    crypto::aead_open(&subkey, &envelope.nonce, &envelope.ciphertext, &envelope.header_aad(aad))
}

/// a stored document: versioned content plus separately encrypted metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEnvelope {
    pub id: DocumentId,
    pub owner_id: OwnerId,
    /// plaintext label, needed to authorize access without decrypting.
    /// bound into both aads together with `owner_id`
    pub category: Category,
    pub version: u32,
    pub created_at: u64,
    pub content: Envelope,
    pub metadata: Envelope,
}

impl DocumentEnvelope {
    /// encrypt a new document at version 1
    pub fn seal(
        owner_id: OwnerId,
        category: Category,
        content: &[u8],
        metadata: &[u8],
        key: &SymmetricKey,
        now: u64,
    ) -> Result<Self> {
        let id = DocumentId::random();
        let content = encrypt_with_aad(content, key, &content_aad(&id, &owner_id, category, 1))?;
        let metadata = encrypt_with_aad(metadata, key, &metadata_aad(&id, &owner_id, category))?;
        Ok(Self {
            id,
            owner_id,
            category,
            version: 1,
            created_at: now,
            content,
            metadata,
        })
    }

    /// new version with replaced content; `self` is left untouched
    pub fn supersede(&self, content: &[u8], key: &SymmetricKey, now: u64) -> Result<Self> {
        // refuse to write a new version under a key that can't read this one
        self.open_metadata(key)?;

        let version = self
            .version
            .checked_add(1)
            .ok_or_else(|| Error::Internal("document version overflow".into()))?;
        let content = encrypt_with_aad(
            content,
            key,
            &content_aad(&self.id, &self.owner_id, self.category, version),
        )?;
        Ok(Self {
            version,
            created_at: now,
            content,
            ..self.clone()
        })
    }

    /// re-encrypt metadata under a new key, leaving content as is
    pub fn rotate_metadata(&self, old_key: &SymmetricKey, new_key: &SymmetricKey) -> Result<Self> {
        let plain = self.open_metadata(old_key)?;
        let metadata = encrypt_with_aad(
            &plain,
            new_key,
            &metadata_aad(&self.id, &self.owner_id, self.category),
        )?;
        Ok(Self {
            metadata,
            ..self.clone()
        })
    }

    pub fn open(&self, key: &SymmetricKey) -> Result<Zeroizing<Vec<u8>>> {
        decrypt_with_aad(
            &self.content,
            key,
            &content_aad(&self.id, &self.owner_id, self.category, self.version),
        )
    }

    pub fn open_metadata(&self, key: &SymmetricKey) -> Result<Zeroizing<Vec<u8>>> {
        decrypt_with_aad(
            &self.metadata,
            key,
            &metadata_aad(&self.id, &self.owner_id, self.category),
        )
    }
}

/// id, owner and category, each length prefixed
fn document_aad(domain: &[u8], id: &DocumentId, owner_id: &OwnerId, category: Category) -> Vec<u8> {
    let mut aad = domain.to_vec();
    for field in [id.as_str(), owner_id.as_str(), category.as_str()] {
        aad.extend_from_slice(&(field.len() as u32).to_be_bytes());
        aad.extend_from_slice(field.as_bytes());
    }
    aad
}

fn content_aad(id: &DocumentId, owner_id: &OwnerId, category: Category, version: u32) -> Vec<u8> {
    let mut aad = document_aad(b"shieldbox:document:content", id, owner_id, category);
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

fn metadata_aad(id: &DocumentId, owner_id: &OwnerId, category: Category) -> Vec<u8> {
    document_aad(b"shieldbox:document:metadata", id, owner_id, category)
}

/// all versions of one document, oldest first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentHistory {
    versions: Vec<DocumentEnvelope>,
}

impl DocumentHistory {
    pub fn new(first: DocumentEnvelope) -> Self {
        Self { versions: vec![first] }
    }

    /// append a superseding version
    pub fn push(&mut self, next: DocumentEnvelope) -> Result<()> {
        if let Some(latest) = self.versions.last() {
            if latest.id != next.id || next.version <= latest.version {
                return Err(Error::DocumentConflict(format!(
                    "version {} of {} does not supersede {} of {}",
                    next.version, next.id, latest.version, latest.id
                )));
            }
        }
        self.versions.push(next);
        Ok(())
    }

    pub fn latest(&self) -> Option<&DocumentEnvelope> {
        self.versions.last()
    }

    pub fn get(&self, version: u32) -> Option<&DocumentEnvelope> {
        self.versions.iter().find(|d| d.version == version)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// hex serialization helper for serde
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// fixed-size variant of [`hex_bytes`]
pub(crate) mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {} bytes", N)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = SymmetricKey::generate();
        let envelope = encrypt(b"hello world", &key).unwrap();
        let plain = decrypt(&envelope, &key).unwrap();
        assert_eq!(plain.as_slice(), b"hello world");
    }

    #[test]
    fn test_probabilistic_encryption() {
        let key = SymmetricKey::generate();
        let a = encrypt(b"same plaintext", &key).unwrap();
        let b = encrypt(b"same plaintext", &key).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = encrypt(b"secret", &SymmetricKey::generate()).unwrap();
        let result = decrypt(&envelope, &SymmetricKey::generate());
        assert!(matches!(result, Err(Error::AuthenticationFailure)));
    }

    #[test]
    fn test_header_tamper_fails() {
        let key = SymmetricKey::generate();
        let mut envelope = encrypt(b"secret", &key).unwrap();
        envelope.nonce[0] ^= 1;
        assert!(decrypt(&envelope, &key).is_err());

        let mut envelope = encrypt(b"secret", &key).unwrap();
        envelope.salt[15] ^= 0x80;
        assert!(decrypt(&envelope, &key).is_err());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let key = SymmetricKey::generate();
        let envelope = encrypt(b"", &key).unwrap();
        let parsed = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(parsed, envelope);
        assert!(decrypt(&parsed, &key).unwrap().is_empty());

        assert!(Envelope::from_bytes(&[1, 1, 0]).is_err());
        let mut bad_version = envelope.to_bytes();
        bad_version[0] = 9;
        assert!(Envelope::from_bytes(&bad_version).is_err());
    }

    #[test]
    fn test_json_shape() {
        let key = SymmetricKey::generate();
        let envelope = encrypt(b"x", &key).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["algorithm"], "xchacha20poly1305-hkdf-sha256");
        assert_eq!(json["nonce"].as_str().unwrap().len(), NONCE_LEN * 2);

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_document_versions() {
        let key = SymmetricKey::generate();
        let v1 = DocumentEnvelope::seal(
            OwnerId::from("alice"),
            Category::Will,
            b"last will v1",
            b"{\"title\":\"will\"}",
            &key,
            100,
        )
        .unwrap();
        assert_eq!(v1.version, 1);

        let v2 = v1.supersede(b"last will v2", &key, 200).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.id, v1.id);
        assert_eq!(v2.metadata, v1.metadata);

        // old version still readable and unchanged
        assert_eq!(v1.open(&key).unwrap().as_slice(), b"last will v1");
        assert_eq!(v2.open(&key).unwrap().as_slice(), b"last will v2");

        let mut history = DocumentHistory::new(v1.clone());
        history.push(v2.clone()).unwrap();
        assert!(history.push(v1.clone()).is_err());
        assert_eq!(history.latest().unwrap().version, 2);
        assert_eq!(history.get(1).unwrap(), &v1);
    }

    #[test]
    fn test_content_bound_to_version() {
        let key = SymmetricKey::generate();
        let v1 = DocumentEnvelope::seal(OwnerId::from("a"), Category::Tax, b"one", b"m", &key, 0).unwrap();
        let v2 = v1.supersede(b"two", &key, 1).unwrap();

        // replaying v1 content under the v2 label must fail
        let spliced = DocumentEnvelope { content: v1.content.clone(), ..v2 };
        assert!(matches!(spliced.open(&key), Err(Error::AuthenticationFailure)));
    }

    #[test]
    fn test_relabelled_document_fails_closed() {
        let key = SymmetricKey::generate();
        let bank = DocumentEnvelope::seal(OwnerId::from("a"), Category::Bank, b"statement", b"m", &key, 0).unwrap();

        let as_will = DocumentEnvelope { category: Category::Will, ..bank.clone() };
        assert!(matches!(as_will.open(&key), Err(Error::AuthenticationFailure)));
        assert!(matches!(as_will.open_metadata(&key), Err(Error::AuthenticationFailure)));

        let other_owner = DocumentEnvelope { owner_id: OwnerId::from("b"), ..bank.clone() };
        assert!(other_owner.open(&key).is_err());
        assert!(other_owner.open_metadata(&key).is_err());

        // supersede keeps the labels it was sealed under
        let v2 = bank.supersede(b"statement 2", &key, 1).unwrap();
        assert_eq!(v2.category, Category::Bank);
        assert!(DocumentEnvelope { category: Category::Will, ..v2 }.open(&key).is_err());
    }

    #[test]
    fn test_rotate_metadata() {
        let old = SymmetricKey::generate();
        let new = SymmetricKey::generate();
        let doc = DocumentEnvelope::seal(OwnerId::from("a"), Category::Bank, b"statement", b"meta", &old, 0).unwrap();

        let rotated = doc.rotate_metadata(&old, &new).unwrap();
        assert_eq!(rotated.content, doc.content);
        assert_eq!(rotated.version, doc.version);
        assert_eq!(rotated.open_metadata(&new).unwrap().as_slice(), b"meta");
        assert!(rotated.open_metadata(&old).is_err());
    }

    #[test]
    fn test_supersede_with_wrong_key_refused() {
        let key = SymmetricKey::generate();
        let doc = DocumentEnvelope::seal(OwnerId::from("a"), Category::Bank, b"x", b"m", &key, 0).unwrap();
        assert!(doc.supersede(b"y", &SymmetricKey::generate(), 1).is_err());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(plaintext in proptest::collection::vec(any::<u8>(), 0..512)) {
            let key = SymmetricKey::generate();
            let envelope = encrypt(&plaintext, &key).unwrap();
            let decrypted = decrypt(&envelope, &key).unwrap();
            prop_assert_eq!(decrypted.as_slice(), plaintext.as_slice());
        }

        #[test]
        fn prop_bit_flip_detected(
            plaintext in proptest::collection::vec(any::<u8>(), 0..256),
            position in any::<usize>(),
            bit in 0u8..8,
        ) {
            let key = SymmetricKey::generate();
            let mut envelope = encrypt(&plaintext, &key).unwrap();
            let index = position % envelope.ciphertext.len();
            envelope.ciphertext[index] ^= 1 << bit;
            prop_assert!(matches!(decrypt(&envelope, &key), Err(Error::AuthenticationFailure)));
        }
    }
}
