//! collaborator traits
//!
//! everything the core reads or writes outside its own memory goes through
//! these. implementations:
//! - memory: in-process maps, for tests and single-node use
//! - shieldbox-vault: sled-backed blob store and catalog, json directory

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::ids::{ActivationId, DocumentId, GuardianId, OwnerId};
use crate::keys::PublicKey;
use crate::permissions::{Category, GuardianRoles};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerProfile {
    pub owner_id: OwnerId,
    pub is_shield_enabled: bool,
    /// guardian confirmations needed to activate
    pub required_confirmations: u32,
    /// overrides the configured dead-man's-switch threshold
    #[serde(default)]
    pub inactivity_threshold_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianProfile {
    pub guardian_id: GuardianId,
    pub owner_id: OwnerId,
    pub public_key: PublicKey,
    #[serde(default)]
    pub roles: GuardianRoles,
}

/// plaintext facts about a stored document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDescriptor {
    pub document_id: DocumentId,
    pub owner_id: OwnerId,
    pub category: Category,
    pub version: u32,
}

/// what the delivery channel sends to a guardian
#[derive(Clone)]
pub struct DeliveryPayload {
    pub owner_id: OwnerId,
    pub guardian_id: GuardianId,
    pub activation_id: ActivationId,
    pub access_link: String,
    pub verification_code: Zeroizing<String>,
    pub expires_at: u64,
    pub message: Option<String>,
}

impl fmt::Debug for DeliveryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryPayload")
            .field("owner_id", &self.owner_id)
            .field("guardian_id", &self.guardian_id)
            .field("activation_id", &self.activation_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// owner and guardian lookup
pub trait Directory: Send + Sync {
    fn owner(&self, owner_id: &OwnerId) -> Result<Option<OwnerProfile>>;

    /// a guardian, only if entrusted by `owner_id`
    fn guardian(&self, owner_id: &OwnerId, guardian_id: &GuardianId) -> Result<Option<GuardianProfile>>;

    fn guardians(&self, owner_id: &OwnerId) -> Result<Vec<GuardianProfile>>;
}

/// latest known version of each document
pub trait DocumentCatalog: Send + Sync {
    fn describe(&self, document_id: &DocumentId) -> Result<Option<DocumentDescriptor>>;

    fn register(&self, descriptor: &DocumentDescriptor) -> Result<()>;
}

/// opaque ciphertext storage addressed by document id and version
///
/// insert-only: a stored version is never replaced.
pub trait BlobStore: Send + Sync {
    /// fails with `DocumentConflict` if the version is already stored
    fn put(&self, id: &DocumentId, version: u32, bytes: &[u8]) -> Result<()>;

    fn get(&self, id: &DocumentId, version: u32) -> Result<Option<Vec<u8>>>;

    /// stored versions of `id`, ascending
    fn versions(&self, id: &DocumentId) -> Result<Vec<u32>>;
}

/// email / sms dispatch
pub trait DeliveryChannel: Send + Sync {
    fn deliver(&self, payload: &DeliveryPayload) -> Result<()>;
}
