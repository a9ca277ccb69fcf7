//! sled-backed storage for the vault node
//!
//! three trees:
//!   audit      big-endian sequence -> audit entry json, insert-only
//!   blobs      document id, 0, big-endian version -> sealed envelope json, insert-only
//!   documents  document id -> latest catalog descriptor json

use shieldbox::audit::{verify_chain, AuditLogEntry, AuditSink, GENESIS_HASH};
use shieldbox::directory::{BlobStore, DocumentCatalog, DocumentDescriptor};
use shieldbox::{DocumentId, Error, Result};
use tracing::{debug, error};

fn storage<E: std::fmt::Display>(e: E) -> Error {
    Error::Storage(e.to_string())
}

fn blob_prefix(id: &DocumentId) -> Vec<u8> {
    let mut key = id.as_str().as_bytes().to_vec();
    key.push(0);
    key
}

fn blob_key(id: &DocumentId, version: u32) -> Vec<u8> {
    let mut key = blob_prefix(id);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

pub struct SledStore {
    db: sled::Db,
    audit: sled::Tree,
    blobs: sled::Tree,
    documents: sled::Tree,
}

impl SledStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path).map_err(storage)?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            audit: db.open_tree("audit").map_err(storage)?,
            blobs: db.open_tree("blobs").map_err(storage)?,
            documents: db.open_tree("documents").map_err(storage)?,
            db,
        })
    }

    /// every audit entry, in sequence order
    pub fn audit_entries(&self) -> Result<Vec<AuditLogEntry>> {
        self.audit
            .iter()
            .values()
            .map(|v| {
                let bytes = v.map_err(storage)?;
                serde_json::from_slice(&bytes).map_err(storage)
            })
            .collect()
    }

    /// check the stored chain and return where to continue it
    pub fn audit_head(&self) -> Result<(u64, [u8; 32])> {
        let entries = self.audit_entries()?;
        if entries.is_empty() {
            return Ok((0, GENESIS_HASH));
        }
        let head = verify_chain(&entries)?;
        Ok((entries.len() as u64, head))
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn audit_len(&self) -> usize {
        self.audit.len()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage)?;
        Ok(())
    }
}

impl AuditSink for SledStore {
    fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        let key = entry.sequence.to_be_bytes();
        let value = serde_json::to_vec(entry).map_err(|e| Error::AuditWriteFailure(e.to_string()))?;

        match self.audit.compare_and_swap(key, None as Option<&[u8]>, Some(value)) {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                error!(sequence = entry.sequence, "audit sequence already taken");
                return Err(Error::AuditWriteFailure(format!(
                    "sequence {} already recorded",
                    entry.sequence
                )));
            }
            Err(e) => return Err(Error::AuditWriteFailure(e.to_string())),
        }

        // an entry only counts once it is on disk
        self.audit
            .flush()
            .map_err(|e| Error::AuditWriteFailure(e.to_string()))?;
        debug!(sequence = entry.sequence, "audit entry persisted");
        Ok(())
    }
}

impl BlobStore for SledStore {
    fn put(&self, id: &DocumentId, version: u32, bytes: &[u8]) -> Result<()> {
        match self
            .blobs
            .compare_and_swap(blob_key(id, version), None as Option<&[u8]>, Some(bytes))
            .map_err(storage)?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::DocumentConflict(format!("{} version {} already stored", id, version))),
        }
    }

    fn get(&self, id: &DocumentId, version: u32) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .get(blob_key(id, version))
            .map_err(storage)?
            .map(|v| v.to_vec()))
    }

    fn versions(&self, id: &DocumentId) -> Result<Vec<u32>> {
        let prefix = blob_prefix(id);
        self.blobs
            .scan_prefix(&prefix)
            .keys()
            .map(|k| {
                let key = k.map_err(storage)?;
                let version: [u8; 4] = key[prefix.len()..]
                    .try_into()
                    .map_err(|_| Error::Storage("malformed blob key".into()))?;
                Ok(u32::from_be_bytes(version))
            })
            .collect()
    }
}

impl DocumentCatalog for SledStore {
    fn describe(&self, document_id: &DocumentId) -> Result<Option<DocumentDescriptor>> {
        match self.documents.get(document_id.as_str()).map_err(storage)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(storage)?)),
            None => Ok(None),
        }
    }

    fn register(&self, descriptor: &DocumentDescriptor) -> Result<()> {
        let value = serde_json::to_vec(descriptor).map_err(storage)?;
        self.documents
            .insert(descriptor.document_id.as_str(), value)
            .map_err(storage)?;
        Ok(())
    }
}
