//! access audit log
//!
//! every access decision is appended as a hash-chained entry:
//!
//! ```text
//!   entry_hash[n] = sha256("shieldbox:audit:v1" || entry_hash[n-1] || body[n])
//! ```
//!
//! entry 0 chains from all zeros. the chain head can be signed with an
//! ed25519 key so an exported log can be checked against a checkpoint.
//! making the storage itself append-only is the sink's job.

use std::sync::{Arc, Mutex};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::clock::Clock;
use crate::ids::{ActivationId, DocumentId, GuardianId, OwnerId, TokenId};
use crate::permissions::Category;
use crate::{Error, Result};

pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccessDecision {
    Granted,
    Denied { code: String },
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, AccessDecision::Granted)
    }
}

/// what the caller knows about an access attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditDraft {
    pub owner_id: Option<OwnerId>,
    pub activation_id: Option<ActivationId>,
    pub token_id: Option<TokenId>,
    pub guardian_id: Option<GuardianId>,
    pub document_id: DocumentId,
    pub category: Option<Category>,
    pub decision: AccessDecision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub sequence: u64,
    pub recorded_at: u64,
    pub owner_id: Option<OwnerId>,
    pub activation_id: Option<ActivationId>,
    pub token_id: Option<TokenId>,
    pub guardian_id: Option<GuardianId>,
    pub document_id: DocumentId,
    pub category: Option<Category>,
    pub decision: AccessDecision,
    #[serde(with = "crate::envelope::hex_array")]
    pub prev_hash: [u8; 32],
    #[serde(with = "crate::envelope::hex_array")]
    pub entry_hash: [u8; 32],
}

/// the hashed part of an entry
#[derive(Serialize)]
struct EntryBody<'a> {
    sequence: u64,
    recorded_at: u64,
    owner_id: &'a Option<OwnerId>,
    activation_id: &'a Option<ActivationId>,
    token_id: &'a Option<TokenId>,
    guardian_id: &'a Option<GuardianId>,
    document_id: &'a DocumentId,
    category: &'a Option<Category>,
    decision: &'a AccessDecision,
}

impl AuditLogEntry {
    fn compute_hash(&self) -> Result<[u8; 32]> {
        let body = EntryBody {
            sequence: self.sequence,
            recorded_at: self.recorded_at,
            owner_id: &self.owner_id,
            activation_id: &self.activation_id,
            token_id: &self.token_id,
            guardian_id: &self.guardian_id,
            document_id: &self.document_id,
            category: &self.category,
            decision: &self.decision,
        };
        let body = serde_json::to_vec(&body).map_err(|e| Error::Internal(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(b"shieldbox:audit:v1");
        hasher.update(self.prev_hash);
        hasher.update(&body);
        Ok(hasher.finalize().into())
    }
}

/// where entries are persisted; must never overwrite or delete
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditLogEntry) -> Result<()>;
}

/// check a full log from the genesis entry
pub fn verify_chain(entries: &[AuditLogEntry]) -> Result<[u8; 32]> {
    verify_from(entries, 0, GENESIS_HASH)
}

/// check a contiguous run of entries starting at `sequence` after `prev_hash`
pub fn verify_from(entries: &[AuditLogEntry], sequence: u64, prev_hash: [u8; 32]) -> Result<[u8; 32]> {
    let mut expected_seq = sequence;
    let mut prev = prev_hash;

    for entry in entries {
        if entry.sequence != expected_seq
            || entry.prev_hash != prev
            || entry.compute_hash()? != entry.entry_hash
        {
            return Err(Error::AuditChainBroken { sequence: entry.sequence });
        }
        prev = entry.entry_hash;
        expected_seq += 1;
    }

    Ok(prev)
}

/// signed statement of the chain head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCheckpoint {
    /// number of entries covered
    pub entries: u64,
    #[serde(with = "crate::envelope::hex_array")]
    pub head_hash: [u8; 32],
    pub signed_at: u64,
    #[serde(with = "crate::envelope::hex_array")]
    pub signer: [u8; 32],
    #[serde(with = "crate::envelope::hex_array")]
    pub signature: [u8; 64],
}

impl SignedCheckpoint {
    fn message(entries: u64, head_hash: &[u8; 32], signed_at: u64) -> Vec<u8> {
        let mut msg = b"shieldbox:audit_checkpoint:v1".to_vec();
        msg.extend_from_slice(&entries.to_be_bytes());
        msg.extend_from_slice(head_hash);
        msg.extend_from_slice(&signed_at.to_be_bytes());
        msg
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        if key.to_bytes() != self.signer {
            return Err(Error::AuthenticationFailure);
        }
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&Self::message(self.entries, &self.head_hash, self.signed_at), &signature)
            .map_err(|_| Error::AuthenticationFailure)
    }

    /// verify the signature and that `entries` hash to the signed head
    pub fn verify_log(&self, key: &VerifyingKey, entries: &[AuditLogEntry]) -> Result<()> {
        self.verify(key)?;
        let covered = usize::try_from(self.entries).map_err(|e| Error::Internal(e.to_string()))?;
        let prefix = entries
            .get(..covered)
            .ok_or(Error::AuditChainBroken { sequence: entries.len() as u64 })?;
        let head = verify_chain(prefix)?;
        if head != self.head_hash {
            return Err(Error::AuditChainBroken { sequence: self.entries });
        }
        Ok(())
    }
}

struct ChainHead {
    next_sequence: u64,
    last_hash: [u8; 32],
}

/// serializing writer in front of an [`AuditSink`]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    head: Mutex<ChainHead>,
    signer: Option<SigningKey>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self::resume(sink, clock, 0, GENESIS_HASH)
    }

    /// continue an existing chain
    pub fn resume(
        sink: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        next_sequence: u64,
        last_hash: [u8; 32],
    ) -> Self {
        Self {
            sink,
            clock,
            head: Mutex::new(ChainHead { next_sequence, last_hash }),
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: SigningKey) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        self.signer.as_ref().map(|s| s.verifying_key())
    }

    /// append one entry
    ///
    /// the head only advances once the sink accepted the entry. any sink
    /// error is an `AuditWriteFailure` and must fail the access it records.
    pub fn record(&self, draft: AuditDraft) -> Result<AuditLogEntry> {
        let mut head = self
            .head
            .lock()
            .map_err(|_| Error::AuditWriteFailure("audit head lock poisoned".into()))?;

        let mut entry = AuditLogEntry {
            sequence: head.next_sequence,
            recorded_at: self.clock.now(),
            owner_id: draft.owner_id,
            activation_id: draft.activation_id,
            token_id: draft.token_id,
            guardian_id: draft.guardian_id,
            document_id: draft.document_id,
            category: draft.category,
            decision: draft.decision,
            prev_hash: head.last_hash,
            entry_hash: [0u8; 32],
        };
        entry.entry_hash = entry
            .compute_hash()
            .map_err(|e| Error::AuditWriteFailure(e.to_string()))?;

        if let Err(e) = self.sink.append(&entry) {
            error!(
                sequence = entry.sequence,
                document = %entry.document_id,
                error = %e,
                "AUDIT WRITE FAILED, denying access"
            );
            return Err(match e {
                Error::AuditWriteFailure(msg) => Error::AuditWriteFailure(msg),
                other => Error::AuditWriteFailure(other.to_string()),
            });
        }

        head.next_sequence += 1;
        head.last_hash = entry.entry_hash;
        debug!(sequence = entry.sequence, granted = entry.decision.is_granted(), "audit entry recorded");
        Ok(entry)
    }

    /// (next sequence, last entry hash)
    pub fn head(&self) -> Result<(u64, [u8; 32])> {
        let head = self
            .head
            .lock()
            .map_err(|_| Error::Internal("audit head lock poisoned".into()))?;
        Ok((head.next_sequence, head.last_hash))
    }

    /// sign the current head
    pub fn checkpoint(&self) -> Result<SignedCheckpoint> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| Error::Configuration("audit log has no checkpoint key".into()))?;
        let (entries, head_hash) = self.head()?;
        let signed_at = self.clock.now();

        let signature = signer.sign(&SignedCheckpoint::message(entries, &head_hash, signed_at));
        Ok(SignedCheckpoint {
            entries,
            head_hash,
            signed_at,
            signer: signer.verifying_key().to_bytes(),
            signature: signature.to_bytes(),
        })
    }
}
