//! in-memory collaborators
//!
//! no persistence. used by tests and by single-node deployments that load
//! the directory from a file at startup.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::audit::{AuditLogEntry, AuditSink};
use crate::directory::{
    BlobStore, DeliveryChannel, DeliveryPayload, Directory, DocumentCatalog, DocumentDescriptor,
    GuardianProfile, OwnerProfile,
};
use crate::ids::{DocumentId, GuardianId, OwnerId};
use crate::{Error, Result};

fn poisoned<E: std::fmt::Display>(e: E) -> Error {
    Error::Storage(e.to_string())
}

/// serialized form of a directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub owners: Vec<OwnerProfile>,
    #[serde(default)]
    pub guardians: Vec<GuardianProfile>,
}

#[derive(Default)]
pub struct MemoryDirectory {
    owners: RwLock<HashMap<OwnerId, OwnerProfile>>,
    guardians: RwLock<HashMap<OwnerId, Vec<GuardianProfile>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Result<Self> {
        let dir = Self::new();
        for owner in snapshot.owners {
            dir.put_owner(owner)?;
        }
        for guardian in snapshot.guardians {
            dir.put_guardian(guardian)?;
        }
        Ok(dir)
    }

    pub fn put_owner(&self, owner: OwnerProfile) -> Result<()> {
        let mut owners = self.owners.write().map_err(poisoned)?;
        owners.insert(owner.owner_id.clone(), owner);
        Ok(())
    }

    /// add or replace a guardian of `guardian.owner_id`
    pub fn put_guardian(&self, guardian: GuardianProfile) -> Result<()> {
        let mut guardians = self.guardians.write().map_err(poisoned)?;
        let list = guardians.entry(guardian.owner_id.clone()).or_default();
        list.retain(|g| g.guardian_id != guardian.guardian_id);
        list.push(guardian);
        Ok(())
    }

    pub fn set_shield_enabled(&self, owner_id: &OwnerId, enabled: bool) -> Result<()> {
        let mut owners = self.owners.write().map_err(poisoned)?;
        let owner = owners
            .get_mut(owner_id)
            .ok_or_else(|| Error::UserNotFound(owner_id.to_string()))?;
        owner.is_shield_enabled = enabled;
        Ok(())
    }
}

impl Directory for MemoryDirectory {
    fn owner(&self, owner_id: &OwnerId) -> Result<Option<OwnerProfile>> {
        let owners = self.owners.read().map_err(poisoned)?;
        Ok(owners.get(owner_id).cloned())
    }

    fn guardian(&self, owner_id: &OwnerId, guardian_id: &GuardianId) -> Result<Option<GuardianProfile>> {
        let guardians = self.guardians.read().map_err(poisoned)?;
        Ok(guardians
            .get(owner_id)
            .and_then(|list| list.iter().find(|g| &g.guardian_id == guardian_id))
            .cloned())
    }

    fn guardians(&self, owner_id: &OwnerId) -> Result<Vec<GuardianProfile>> {
        let guardians = self.guardians.read().map_err(poisoned)?;
        Ok(guardians.get(owner_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    documents: RwLock<HashMap<DocumentId, DocumentDescriptor>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentCatalog for MemoryCatalog {
    fn describe(&self, document_id: &DocumentId) -> Result<Option<DocumentDescriptor>> {
        let documents = self.documents.read().map_err(poisoned)?;
        Ok(documents.get(document_id).cloned())
    }

    fn register(&self, descriptor: &DocumentDescriptor) -> Result<()> {
        let mut documents = self.documents.write().map_err(poisoned)?;
        documents.insert(descriptor.document_id.clone(), descriptor.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<DocumentId, BTreeMap<u32, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, id: &DocumentId, version: u32, bytes: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(poisoned)?;
        let versions = blobs.entry(id.clone()).or_default();
        if versions.contains_key(&version) {
            return Err(Error::DocumentConflict(format!("{} version {} already stored", id, version)));
        }
        versions.insert(version, bytes.to_vec());
        Ok(())
    }

    fn get(&self, id: &DocumentId, version: u32) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().map_err(poisoned)?;
        Ok(blobs.get(id).and_then(|v| v.get(&version)).cloned())
    }

    fn versions(&self, id: &DocumentId) -> Result<Vec<u32>> {
        let blobs = self.blobs.read().map_err(poisoned)?;
        Ok(blobs.get(id).map(|v| v.keys().copied().collect()).unwrap_or_default())
    }
}

/// append-only vec; can be switched to fail every append
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditLogEntry>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::AuditWriteFailure("audit sink unavailable".into()));
        }
        let mut entries = self.entries.lock().map_err(poisoned)?;
        if entries.iter().any(|e| e.sequence == entry.sequence) {
            return Err(Error::AuditWriteFailure(format!(
                "sequence {} already written",
                entry.sequence
            )));
        }
        entries.push(entry.clone());
        Ok(())
    }
}

/// keeps every payload instead of sending it
#[derive(Default)]
pub struct RecordingDelivery {
    delivered: Mutex<Vec<DeliveryPayload>>,
    failing: AtomicBool,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<DeliveryPayload> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

impl DeliveryChannel for RecordingDelivery {
    fn deliver(&self, payload: &DeliveryPayload) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Delivery("channel unavailable".into()));
        }
        self.delivered.lock().map_err(poisoned)?.push(payload.clone());
        Ok(())
    }
}
