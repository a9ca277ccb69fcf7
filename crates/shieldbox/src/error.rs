//! error types for shieldbox
//!
//! variants keep their full detail internally; `code()` is the only thing
//! meant to cross an api boundary.

use thiserror::Error;

use crate::permissions::Category;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // === configuration ===
    #[error("invalid threshold: {threshold}-of-{total}")]
    InvalidThreshold { threshold: usize, total: usize },

    #[error("work factor below minimum: {memory_kib} KiB / {iterations} iterations (min {min_memory_kib} KiB / {min_iterations})")]
    WeakWorkFactor {
        memory_kib: u32,
        iterations: u32,
        min_memory_kib: u32,
        min_iterations: u32,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    // === authentication ===
    #[error("wrong password: {attempts} failed attempts, {remaining} remaining")]
    WrongPassword { attempts: u32, remaining: u32 },

    #[error("locked out: {attempts} failed attempts, retry in {lockout_seconds}s")]
    LockedOut { attempts: u32, lockout_seconds: u64 },

    #[error("session is locked")]
    SessionLocked,

    #[error("authentication failed")]
    AuthenticationFailure,

    #[error("kdf failed: {0}")]
    KdfFailed(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("invalid envelope format")]
    InvalidEnvelope,

    // === recovery ===
    #[error("invalid secret length")]
    InvalidSecretLength,

    #[error("not enough shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("shares do not belong to the same split")]
    InconsistentShares,

    #[error("share verification failed")]
    ShareVerificationFailed,

    // === emergency access ===
    #[error("missing fields: {0}")]
    MissingFields(String),

    #[error("shield not enabled for owner {0}")]
    ShieldNotEnabled(String),

    #[error("invalid inactivity signal: {0}")]
    InvalidSignal(String),

    #[error("activation {0} has expired")]
    ActivationExpired(String),

    #[error("access token expired")]
    TokenExpired,

    #[error("access token invalid")]
    TokenInvalid,

    #[error("invalid verification code")]
    InvalidVerificationCode,

    #[error("verification code exchange required")]
    VerificationRequired,

    #[error("forbidden: token does not cover category {category}")]
    Forbidden { category: Category },

    // === audit ===
    #[error("audit write failed: {0}")]
    AuditWriteFailure(String),

    #[error("audit chain broken at sequence {sequence}")]
    AuditChainBroken { sequence: u64 },

    // === not found ===
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("guardian {0} not found or not authorized")]
    GuardianNotFound(String),

    #[error("activation not found: {0}")]
    ActivationNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    // === documents ===
    #[error("document conflict: {0}")]
    DocumentConflict(String),

    // === collaborators ===
    #[error("storage error: {0}")]
    Storage(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// coarse classification, one per failure class the vault distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Recovery,
    Access,
    Audit,
    NotFound,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            InvalidThreshold { .. } | WeakWorkFactor { .. } | Configuration(_) => {
                ErrorKind::Configuration
            }
            WrongPassword { .. }
            | LockedOut { .. }
            | SessionLocked
            | AuthenticationFailure
            | KdfFailed(_)
            | EncryptionFailed(_)
            | InvalidEnvelope => ErrorKind::Authentication,
            InvalidSecretLength
            | InsufficientShares { .. }
            | InconsistentShares
            | ShareVerificationFailed => ErrorKind::Recovery,
            MissingFields(_)
            | ShieldNotEnabled(_)
            | InvalidSignal(_)
            | ActivationExpired(_)
            | TokenExpired
            | TokenInvalid
            | InvalidVerificationCode
            | VerificationRequired
            | Forbidden { .. }
            | DocumentConflict(_) => ErrorKind::Access,
            AuditWriteFailure(_) | AuditChainBroken { .. } => ErrorKind::Audit,
            UserNotFound(_) | GuardianNotFound(_) | ActivationNotFound(_) | DocumentNotFound(_) => {
                ErrorKind::NotFound
            }
            Storage(_) | Delivery(_) | Internal(_) => ErrorKind::Internal,
        }
    }

    /// external error code
    pub fn code(&self) -> &'static str {
        use Error::*;
        match self {
            MissingFields(_) => "missing_fields",
            UserNotFound(_) | ShieldNotEnabled(_) => "user_not_found",
            GuardianNotFound(_) => "guardian_not_found_or_unauthorized",
            TokenExpired | TokenInvalid | ActivationExpired(_) | ActivationNotFound(_) => {
                "token_invalid_or_expired"
            }
            InvalidVerificationCode | VerificationRequired => "invalid_verification_code",
            Forbidden { .. } => "insufficient_permissions_for_category",
            DocumentNotFound(_) => "document_not_found",
            DocumentConflict(_) => "document_conflict",
            _ => "internal_error",
        }
    }
}
