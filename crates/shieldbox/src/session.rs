//! session manager
//!
//! holds the unlocked keys for one owner in memory. states:
//!
//! ```text
//!   Locked ──unlock──▶ Unlocking ──ok──▶ Unlocked ──lock / timeout──▶ Locked
//!                          │
//!                          └─ max failures ─▶ LockedOut ──lockout elapsed──▶ Locked
//! ```
//!
//! the whole unlock (lockout check, derivation, counter update, transition)
//! runs under one mutex, so parallel unlocks cannot both slip past the
//! lockout check. expiry is checked lazily on every privileged call.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::crypto::{KdfParams, KdfPolicy};
use crate::directory::GuardianProfile;
use crate::envelope::DocumentEnvelope;
use crate::guardian::{self, EncryptedGuardianShare};
use crate::ids::OwnerId;
use crate::keys::{MasterKeyMaterial, SecretKey, SymmetricKey};
use crate::permissions::Category;
use crate::vault::VaultHeader;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    pub auto_lock_timeout_secs: u64,
    pub max_failed_attempts: u32,
    pub lockout_duration_secs: u64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            auto_lock_timeout_secs: 15 * 60,
            max_failed_attempts: 5,
            lockout_duration_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Locked,
    /// another call holds the session mutex
    Unlocking,
    Unlocked { expires_at: u64 },
    LockedOut { until: u64 },
}

/// unlocked key material, dropped (and zeroized) on lock
pub struct EncryptionSession {
    master: MasterKeyMaterial,
    root: SymmetricKey,
    unlocked_at: u64,
    expires_at: u64,
}

impl EncryptionSession {
    pub fn master(&self) -> &MasterKeyMaterial {
        &self.master
    }

    /// vault root key, documents are sealed under it
    pub fn root_key(&self) -> &SymmetricKey {
        &self.root
    }

    pub fn unlocked_at(&self) -> u64 {
        self.unlocked_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }
}

struct SessionState {
    header: VaultHeader,
    session: Option<EncryptionSession>,
    failed_attempts: u32,
    locked_out_until: Option<u64>,
}

impl SessionState {
    /// drop an expired session, returning the live one if any
    fn live_session(&mut self, now: u64) -> Option<&EncryptionSession> {
        if matches!(&self.session, Some(s) if now >= s.expires_at) {
            debug!(owner = %self.header.owner_id, "session expired, locking");
            self.session = None;
        }
        self.session.as_ref()
    }
}

pub struct SessionManager {
    owner_id: OwnerId,
    kdf_policy: KdfPolicy,
    policy: SessionPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(
        header: VaultHeader,
        kdf_policy: KdfPolicy,
        policy: SessionPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            owner_id: header.owner_id.clone(),
            kdf_policy,
            policy,
            clock,
            state: Mutex::new(SessionState {
                header,
                session: None,
                failed_attempts: 0,
                locked_out_until: None,
            }),
        }
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn header(&self) -> Result<VaultHeader> {
        Ok(self.state()?.header.clone())
    }

    fn state(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("session lock poisoned".into()))
    }

    /// unlock with the owner's password
    ///
    /// returns the auto-lock deadline. while locked out every attempt fails
    /// with `LockedOut`, whether or not the password is right.
    pub fn unlock(&self, password: &[u8]) -> Result<u64> {
        let mut state = self.state()?;
        let now = self.clock.now();

        if let Some(until) = state.locked_out_until {
            if now < until {
                warn!(owner = %self.owner_id, until, "unlock rejected, locked out");
                return Err(Error::LockedOut {
                    attempts: state.failed_attempts,
                    lockout_seconds: until - now,
                });
            }
            state.locked_out_until = None;
            state.failed_attempts = 0;
        }

        match state.header.unlock(password, &self.kdf_policy) {
            Ok(keys) => {
                let expires_at = now.saturating_add(self.policy.auto_lock_timeout_secs);
                state.failed_attempts = 0;
                state.session = Some(EncryptionSession {
                    master: keys.master,
                    root: keys.root,
                    unlocked_at: now,
                    expires_at,
                });
                info!(owner = %self.owner_id, expires_at, "session unlocked");
                Ok(expires_at)
            }
            Err(Error::AuthenticationFailure) => {
                state.failed_attempts = state.failed_attempts.saturating_add(1);
                let attempts = state.failed_attempts;

                if attempts >= self.policy.max_failed_attempts {
                    let until = now.saturating_add(self.policy.lockout_duration_secs);
                    state.locked_out_until = Some(until);
                    state.session = None;
                    warn!(owner = %self.owner_id, attempts, until, "too many failed unlocks, locking out");
                } else {
                    warn!(owner = %self.owner_id, attempts, "wrong password");
                }

                Err(Error::WrongPassword {
                    attempts,
                    remaining: self.policy.max_failed_attempts.saturating_sub(attempts),
                })
            }
            // configuration problems are not guesses and don't count
            Err(e) => Err(e),
        }
    }

    /// discard the keys; idempotent
    pub fn lock(&self) -> Result<()> {
        let mut state = self.state()?;
        if state.session.take().is_some() {
            info!(owner = %self.owner_id, "session locked");
        }
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return SessionStatus::Unlocking,
            Err(TryLockError::Poisoned(_)) => return SessionStatus::Locked,
        };
        let now = self.clock.now();

        if let Some(until) = state.locked_out_until {
            if now < until {
                return SessionStatus::LockedOut { until };
            }
        }
        match state.live_session(now) {
            Some(s) => SessionStatus::Unlocked { expires_at: s.expires_at },
            None => SessionStatus::Locked,
        }
    }

    /// run `f` against the live session, or fail with `SessionLocked`
    pub fn with_session<T>(&self, f: impl FnOnce(&EncryptionSession) -> Result<T>) -> Result<T> {
        let mut state = self.state()?;
        let now = self.clock.now();
        match state.live_session(now) {
            Some(session) => f(session),
            None => Err(Error::SessionLocked),
        }
    }

    pub fn seal_document(
        &self,
        category: Category,
        content: &[u8],
        metadata: &[u8],
    ) -> Result<DocumentEnvelope> {
        let now = self.clock.now();
        self.with_session(|s| {
            DocumentEnvelope::seal(self.owner_id.clone(), category, content, metadata, s.root_key(), now)
        })
    }

    pub fn open_document(&self, document: &DocumentEnvelope) -> Result<Zeroizing<Vec<u8>>> {
        self.with_session(|s| document.open(s.root_key()))
    }

    pub fn open_metadata(&self, document: &DocumentEnvelope) -> Result<Zeroizing<Vec<u8>>> {
        self.with_session(|s| document.open_metadata(s.root_key()))
    }

    pub fn supersede_document(&self, document: &DocumentEnvelope, content: &[u8]) -> Result<DocumentEnvelope> {
        let now = self.clock.now();
        self.with_session(|s| document.supersede(content, s.root_key(), now))
    }

    pub fn owner_secret_key(&self) -> Result<SecretKey> {
        let state = self.state()?;
        let now = self.clock.now();
        match &state.session {
            Some(s) if now < s.expires_at => state.header.owner_secret_key(s.master()),
            _ => Err(Error::SessionLocked),
        }
    }

    /// split the vault root among guardians, each share sealed to its guardian
    pub fn protect_with_guardians(
        &self,
        guardians: &[GuardianProfile],
        threshold: usize,
    ) -> Result<Vec<EncryptedGuardianShare>> {
        let now = self.clock.now();
        self.with_session(|s| guardian::distribute(s.root_key().as_bytes(), guardians, threshold, now))
    }

    /// re-seal the vault under a new password; requires an unlocked session
    pub fn change_password(&self, old_password: &[u8], new_password: &[u8], params: KdfParams) -> Result<()> {
        let mut state = self.state()?;
        let now = self.clock.now();
        if state.live_session(now).is_none() {
            return Err(Error::SessionLocked);
        }

        let header = state
            .header
            .change_password(old_password, new_password, params, &self.kdf_policy)?;
        state.header = header;
        // the old master key no longer matches the header
        state.session = None;
        info!(owner = %self.owner_id, "password changed, session locked");
        Ok(())
    }
}
