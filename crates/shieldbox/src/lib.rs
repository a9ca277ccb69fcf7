//! # shieldbox
//!
//! zero-knowledge document vault with guardian-threshold recovery and
//! guardian-mediated emergency access.
//!
//! the owner's password never leaves the session manager in usable form.
//! documents are sealed under a random vault root key, and the root key is
//! what guardians hold shares of.
//!
//! ## architecture
//!
//! ```text
//! ┌────────────────┐
//! │ owner password │
//! └───────┬────────┘
//!         │ argon2id
//!         ▼
//!   ┌────────────┐   opens    ┌───────────┐  seals   ┌───────────┐
//!   │ master key │ ─────────▶ │ vault root│ ───────▶ │ documents │
//!   └────────────┘            └─────┬─────┘          └─────┬─────┘
//!                                   │ shamir M-of-N        │
//!                        ┌──────────┼──────────┐           │
//!                        ▼          ▼          ▼           │
//!                     ┌─────┐    ┌─────┐    ┌─────┐        │
//!                     │ G1  │    │ G2  │    │ G3  │  (x25519 sealed shares)
//!                     └──┬──┘    └──┬──┘    └─────┘        │
//!                        └── confirm ──┐                   │
//!                                      ▼                   │
//!                             ┌─────────────────┐ authorize│
//!                             │ emergency token │ ─────────┘ (audited)
//!                             └─────────────────┘
//! ```
//!
//! ## security properties
//!
//! - fresh salt and nonce per envelope, any tamper fails closed
//! - keys are zeroized when the session locks or expires
//! - fewer than M guardian shares say nothing about the root
//! - one token per activation, permissions fixed from guardian roles
//! - every access decision is audited before it is returned
//!
//! ## usage
//!
//! ```rust,ignore
//! use shieldbox::{vault::VaultHeader, session::SessionManager, permissions::Category};
//!
//! let (header, _root) = VaultHeader::create(owner, b"password", params, &policy)?;
//! let session = SessionManager::new(header, policy, SessionPolicy::default(), clock);
//! session.unlock(b"password")?;
//! let doc = session.seal_document(Category::Will, b"...", b"{}")?;
//! let shares = session.protect_with_guardians(&guardians, 2)?;
//! ```

pub mod audit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod emergency;
pub mod envelope;
pub mod error;
pub mod guardian;
pub mod ids;
pub mod keys;
pub mod permissions;
pub mod session;
pub mod shamir;
pub mod shield;
pub mod vault;

#[cfg(feature = "software")]
pub mod memory;

pub use audit::{AccessDecision, AuditLog, AuditLogEntry, AuditSink, SignedCheckpoint};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ShieldboxConfig;
pub use emergency::{
    AccessGrant, ActivationReason, ActivationState, ConfirmOutcome, EmergencyCoordinator, EmergencyPolicy,
    InactivityDecision, InactivitySignal, IssuedToken, Trigger,
};
pub use envelope::{DocumentEnvelope, Envelope};
pub use error::{Error, ErrorKind, Result};
pub use guardian::{EncryptedGuardianShare, GuardianShare};
pub use ids::{ActivationId, DocumentId, GuardianId, OwnerId, TokenId};
pub use keys::{KeyPair, MasterKeyMaterial, PublicKey, SecretKey, SymmetricKey};
pub use permissions::{Category, GuardianPermissions, GuardianRoles};
pub use session::{SessionManager, SessionPolicy, SessionStatus};
pub use shamir::{reconstruct, split_secret, Share};
pub use shield::Shield;
pub use vault::VaultHeader;
