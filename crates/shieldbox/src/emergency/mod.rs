//! emergency access state machine
//!
//! ```text
//!   Idle ─trigger─▶ Triggered ─▶ AwaitingConfirmations ─quorum─▶ Activated ─ttl─▶ Expired
//!                                         ▲                                         │
//!                                         └──────────── trigger (fresh episode) ────┘
//! ```
//!
//! one live episode per owner, each behind its own mutex. appending a
//! confirmation, counting and transitioning is one step under that mutex,
//! so a quorum can only be reached once and only one token is minted.
//!
//! lock order: registry, then episode, then token index. nothing takes the
//! registry while holding an episode.

mod inactivity;
mod token;

pub use inactivity::{InactivityDecision, InactivitySignal};
pub use token::{parse_wire, AccessToken, IssuedToken};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AccessDecision, AuditDraft, AuditLog};
use crate::clock::Clock;
use crate::crypto::{ct_eq, mac};
use crate::directory::{DocumentCatalog, Directory, OwnerProfile};
use crate::ids::{ActivationId, DocumentId, GuardianId, OwnerId, TokenId};
use crate::keys::SymmetricKey;
use crate::permissions::{Category, GuardianPermissions};
use crate::{Error, Result};

use token::MintParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyPolicy {
    pub token_ttl_secs: u64,
    pub verification_code_digits: u32,
    pub max_code_attempts: u32,
    pub inactivity_threshold_secs: u64,
    pub max_clock_skew_secs: u64,
    /// how long an ended episode stays readable before the sweep drops it
    pub retention_secs: u64,
}

impl Default for EmergencyPolicy {
    fn default() -> Self {
        Self {
            token_ttl_secs: 72 * 60 * 60,
            verification_code_digits: 6,
            max_code_attempts: 5,
            inactivity_threshold_secs: 30 * 24 * 60 * 60,
            max_clock_skew_secs: 300,
            retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReason {
    Manual,
    Inactivity,
    HealthCheck,
    Emergency,
}

impl ActivationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivationReason::Manual => "manual",
            ActivationReason::Inactivity => "inactivity",
            ActivationReason::HealthCheck => "health_check",
            ActivationReason::Emergency => "emergency",
        }
    }
}

impl fmt::Display for ActivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivationReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "manual" => Ok(ActivationReason::Manual),
            "inactivity" => Ok(ActivationReason::Inactivity),
            "health_check" => Ok(ActivationReason::HealthCheck),
            "emergency" => Ok(ActivationReason::Emergency),
            other => Err(Error::Configuration(format!("unknown activation reason: {}", other))),
        }
    }
}

/// who started an episode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Trigger {
    Guardian { guardian_id: GuardianId },
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    Idle,
    Triggered,
    AwaitingConfirmations,
    Activated,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianConfirmation {
    pub guardian_id: GuardianId,
    pub confirmed_at: u64,
    pub message: Option<String>,
}

/// one dead-man's-switch episode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyActivation {
    pub id: ActivationId,
    pub owner_id: OwnerId,
    pub trigger: Trigger,
    pub reason: ActivationReason,
    pub custom_message: Option<String>,
    pub state: ActivationState,
    pub confirmations: Vec<GuardianConfirmation>,
    /// snapshot of the owner's setting when the episode started
    pub required_confirmations: u32,
    pub triggered_at: u64,
    pub activated_at: Option<u64>,
    pub expires_at: Option<u64>,
    /// when the episode expired or was cancelled
    #[serde(default)]
    pub ended_at: Option<u64>,
    pub token: Option<AccessToken>,
}

impl EmergencyActivation {
    fn has_confirmed(&self, guardian_id: &GuardianId) -> bool {
        self.confirmations.iter().any(|c| &c.guardian_id == guardian_id)
    }

    /// lazy expiry; true if this call moved the episode to `Expired`
    fn refresh(&mut self, now: u64) -> bool {
        match (self.state, self.expires_at) {
            (ActivationState::Activated, Some(expires_at)) if now >= expires_at => {
                self.state = ActivationState::Expired;
                self.ended_at = Some(expires_at);
                info!(activation = %self.id, owner = %self.owner_id, "activation expired");
                true
            }
            _ => false,
        }
    }

    fn is_live(&self) -> bool {
        self.state != ActivationState::Expired
    }

    /// ended long enough ago to be forgotten
    fn is_stale(&self, now: u64, retention_secs: u64) -> bool {
        match self.ended_at {
            Some(ended_at) => !self.is_live() && now >= ended_at.saturating_add(retention_secs),
            None => false,
        }
    }

    pub fn summary(&self) -> ActivationSummary {
        ActivationSummary {
            activation_id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            reason: self.reason,
            state: self.state,
            confirmations: self.confirmations.iter().map(|c| c.guardian_id.clone()).collect(),
            required_confirmations: self.required_confirmations,
            triggered_at: self.triggered_at,
            activated_at: self.activated_at,
            expires_at: self.expires_at,
        }
    }
}

/// public view of an episode, without token material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationSummary {
    pub activation_id: ActivationId,
    pub owner_id: OwnerId,
    pub reason: ActivationReason,
    pub state: ActivationState,
    pub confirmations: Vec<GuardianId>,
    pub required_confirmations: u32,
    pub triggered_at: u64,
    pub activated_at: Option<u64>,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    Pending {
        activation_id: ActivationId,
        confirmations: u32,
        required_confirmations: u32,
    },
    /// this confirmation completed the quorum
    Activated(IssuedToken),
    /// quorum was already met; recorded, no new token
    AlreadyActivated { activation_id: ActivationId },
}

/// token state after a successful code exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedToken {
    pub token_id: TokenId,
    pub activation_id: ActivationId,
    pub permissions: GuardianPermissions,
    pub expires_at: u64,
}

/// permission to fetch one document, backed by an audit entry
///
/// only the coordinator that issued a grant can build one, see
/// [`EmergencyCoordinator::verify_grant`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessGrant {
    pub activation_id: ActivationId,
    pub token_id: TokenId,
    pub owner_id: OwnerId,
    pub guardian_id: GuardianId,
    pub document_id: DocumentId,
    pub category: Category,
    pub version: u32,
    pub granted_at: u64,
    /// the token's expiry
    pub expires_at: u64,
    pub audit_sequence: u64,
    #[serde(skip_serializing)]
    seal: [u8; 32],
}

type Episode = Arc<Mutex<EmergencyActivation>>;

#[derive(Default)]
struct Registry {
    by_owner: HashMap<OwnerId, ActivationId>,
    by_id: HashMap<ActivationId, Episode>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| Error::Internal("emergency lock poisoned".into()))
}

pub struct EmergencyCoordinator {
    directory: Arc<dyn Directory>,
    catalog: Arc<dyn DocumentCatalog>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    policy: EmergencyPolicy,
    /// keys the token and code tags
    token_key: SymmetricKey,
    registry: Mutex<Registry>,
    tokens: Mutex<HashMap<TokenId, ActivationId>>,
}

impl EmergencyCoordinator {
    pub fn new(
        directory: Arc<dyn Directory>,
        catalog: Arc<dyn DocumentCatalog>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        policy: EmergencyPolicy,
    ) -> Self {
        Self {
            directory,
            catalog,
            audit,
            clock,
            policy,
            token_key: SymmetricKey::generate(),
            registry: Mutex::new(Registry::default()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &EmergencyPolicy {
        &self.policy
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn shielded_owner(&self, owner_id: &OwnerId) -> Result<OwnerProfile> {
        let owner = self
            .directory
            .owner(owner_id)?
            .ok_or_else(|| Error::UserNotFound(owner_id.to_string()))?;
        if !owner.is_shield_enabled {
            return Err(Error::ShieldNotEnabled(owner_id.to_string()));
        }
        Ok(owner)
    }

    fn episode(&self, activation_id: &ActivationId) -> Result<Episode> {
        lock(&self.registry)?
            .by_id
            .get(activation_id)
            .cloned()
            .ok_or_else(|| Error::ActivationNotFound(activation_id.to_string()))
    }

    /// start an episode for `owner_id`, or join the live one
    pub fn trigger(
        &self,
        owner_id: &OwnerId,
        trigger: Trigger,
        reason: ActivationReason,
        message: Option<String>,
    ) -> Result<EmergencyActivation> {
        self.trigger_inner(owner_id, trigger, reason, message)
            .map(|(activation, _)| activation)
    }

    fn trigger_inner(
        &self,
        owner_id: &OwnerId,
        trigger: Trigger,
        reason: ActivationReason,
        message: Option<String>,
    ) -> Result<(EmergencyActivation, bool)> {
        let owner = self.shielded_owner(owner_id)?;

        if let Trigger::Guardian { guardian_id } = &trigger {
            if self.directory.guardian(owner_id, guardian_id)?.is_none() {
                warn!(owner = %owner_id, guardian = %guardian_id, "trigger from unknown guardian");
                return Err(Error::GuardianNotFound(guardian_id.to_string()));
            }
        }

        let guardians = self.directory.guardians(owner_id)?.len();
        let required = owner.required_confirmations as usize;
        if required < 1 || required > guardians {
            return Err(Error::InvalidThreshold {
                threshold: required,
                total: guardians,
            });
        }

        let now = self.clock.now();
        let mut registry = lock(&self.registry)?;

        if let Some(existing) = registry.by_owner.get(owner_id).and_then(|id| registry.by_id.get(id)) {
            let mut episode = lock(existing)?;
            episode.refresh(now);
            if episode.is_live() {
                debug!(activation = %episode.id, owner = %owner_id, "joining live activation");
                return Ok((episode.clone(), false));
            }
        }

        let mut activation = EmergencyActivation {
            id: ActivationId::random(),
            owner_id: owner_id.clone(),
            trigger,
            reason,
            custom_message: message,
            state: ActivationState::Triggered,
            confirmations: Vec::new(),
            required_confirmations: owner.required_confirmations,
            triggered_at: now,
            activated_at: None,
            expires_at: None,
            ended_at: None,
            token: None,
        };
        info!(activation = %activation.id, owner = %owner_id, reason = %reason, "activation triggered");
        activation.state = ActivationState::AwaitingConfirmations;

        // a replaced episode stays readable by id until swept; only the owner slot moves
        registry.by_owner.insert(owner_id.clone(), activation.id.clone());
        registry
            .by_id
            .insert(activation.id.clone(), Arc::new(Mutex::new(activation.clone())));

        Ok((activation, true))
    }

    /// record a guardian's confirmation
    pub fn confirm(
        &self,
        activation_id: &ActivationId,
        guardian_id: &GuardianId,
        message: Option<String>,
    ) -> Result<ConfirmOutcome> {
        let episode = self.episode(activation_id)?;
        let mut ep = lock(&episode)?;
        let now = self.clock.now();
        ep.refresh(now);

        if ep.state == ActivationState::Expired {
            return Err(Error::ActivationExpired(activation_id.to_string()));
        }

        let guardian = self
            .directory
            .guardian(&ep.owner_id, guardian_id)?
            .ok_or_else(|| Error::GuardianNotFound(guardian_id.to_string()))?;

        if ep.state == ActivationState::Activated {
            if !ep.has_confirmed(guardian_id) {
                ep.confirmations.push(GuardianConfirmation {
                    guardian_id: guardian_id.clone(),
                    confirmed_at: now,
                    message,
                });
            }
            debug!(activation = %activation_id, guardian = %guardian_id, "late confirmation recorded");
            return Ok(ConfirmOutcome::AlreadyActivated {
                activation_id: activation_id.clone(),
            });
        }

        if !ep.has_confirmed(guardian_id) {
            ep.confirmations.push(GuardianConfirmation {
                guardian_id: guardian_id.clone(),
                confirmed_at: now,
                message,
            });
        }

        let confirmations = ep.confirmations.len() as u32;
        if confirmations < ep.required_confirmations {
            info!(
                activation = %activation_id,
                guardian = %guardian_id,
                confirmations,
                required = ep.required_confirmations,
                "confirmation recorded"
            );
            return Ok(ConfirmOutcome::Pending {
                activation_id: activation_id.clone(),
                confirmations,
                required_confirmations: ep.required_confirmations,
            });
        }

        // quorum reached, still holding the episode lock
        let permissions = GuardianPermissions::from_roles(&guardian.roles);
        let (token, issued) = AccessToken::mint(MintParams {
            key: &self.token_key,
            activation_id: &ep.id,
            owner_id: &ep.owner_id,
            guardian_id,
            permissions,
            now,
            ttl_secs: self.policy.token_ttl_secs,
            code_digits: self.policy.verification_code_digits,
        });

        lock(&self.tokens)?.insert(token.id.clone(), ep.id.clone());
        ep.state = ActivationState::Activated;
        ep.activated_at = Some(now);
        ep.expires_at = Some(token.expires_at);
        ep.token = Some(token);

        info!(
            activation = %activation_id,
            owner = %ep.owner_id,
            guardian = %guardian_id,
            token = %issued.token_id,
            permissions = ?issued.permissions,
            expires_at = issued.expires_at,
            "activation complete, token issued"
        );

        Ok(ConfirmOutcome::Activated(issued))
    }

    /// react to a scheduler's inactivity report
    pub fn report_inactivity(&self, signal: &InactivitySignal) -> Result<InactivityDecision> {
        let owner = self.directory.owner(&signal.owner_id)?;
        let now = self.clock.now();
        let idle_secs = inactivity::validate(signal, owner.as_ref(), now, self.policy.max_clock_skew_secs)?;

        let threshold_secs = owner
            .and_then(|o| o.inactivity_threshold_secs)
            .unwrap_or(self.policy.inactivity_threshold_secs);

        if idle_secs < threshold_secs {
            debug!(owner = %signal.owner_id, idle_secs, threshold_secs, "owner active");
            return Ok(InactivityDecision::Active { idle_secs, threshold_secs });
        }

        let (activation, created) = self.trigger_inner(
            &signal.owner_id,
            Trigger::System,
            ActivationReason::Inactivity,
            None,
        )?;

        Ok(if created {
            info!(owner = %signal.owner_id, idle_secs, "inactivity threshold crossed");
            InactivityDecision::Triggered { activation_id: activation.id }
        } else {
            InactivityDecision::AlreadyTriggered { activation_id: activation.id }
        })
    }

    /// look up the episode behind a presented token
    fn token_episode(&self, token: &str) -> Result<(TokenId, zeroize::Zeroizing<Vec<u8>>, Episode)> {
        let (token_id, secret) = parse_wire(token)?;
        let activation_id = lock(&self.tokens)?
            .get(&token_id)
            .cloned()
            .ok_or(Error::TokenInvalid)?;
        let episode = self.episode(&activation_id).map_err(|_| Error::TokenInvalid)?;
        Ok((token_id, secret, episode))
    }

    /// prove possession of the delivery channel
    pub fn exchange_verification_code(&self, token: &str, code: &str) -> Result<VerifiedToken> {
        let (token_id, secret, episode) = self.token_episode(token)?;
        let mut ep = lock(&episode)?;
        let now = self.clock.now();
        ep.refresh(now);

        let expired = ep.state == ActivationState::Expired;
        let activation_id = ep.id.clone();
        self.check_token(ep.token.as_mut(), &activation_id, expired, &token_id, &secret, Some(code), now)
    }

    /// token checks shared by code exchange and authorize
    ///
    /// runs under the episode lock. a wrong code counts toward revocation.
    #[allow(clippy::too_many_arguments)]
    fn check_token(
        &self,
        token: Option<&mut AccessToken>,
        activation_id: &ActivationId,
        expired: bool,
        token_id: &TokenId,
        secret: &[u8],
        code: Option<&str>,
        now: u64,
    ) -> Result<VerifiedToken> {
        let max_attempts = self.policy.max_code_attempts;

        let token = match token {
            Some(t) if &t.id == token_id && t.secret_matches(&self.token_key, secret) => t,
            _ => return Err(Error::TokenInvalid),
        };
        if token.revoked {
            return Err(Error::TokenInvalid);
        }
        if expired || token.is_expired(now) {
            return Err(Error::TokenExpired);
        }

        if !token.verified {
            let code = code.ok_or(Error::VerificationRequired)?;
            if token.code_matches(&self.token_key, code) {
                token.verified = true;
                info!(activation = %activation_id, token = %token_id, "verification code accepted");
            } else {
                token.code_attempts += 1;
                if token.code_attempts >= max_attempts {
                    token.revoked = true;
                    warn!(activation = %activation_id, token = %token_id, "too many wrong codes, token revoked");
                } else {
                    warn!(activation = %activation_id, token = %token_id, attempts = token.code_attempts, "wrong verification code");
                }
                return Err(Error::InvalidVerificationCode);
            }
        }

        Ok(VerifiedToken {
            token_id: token.id.clone(),
            activation_id: activation_id.clone(),
            permissions: token.permissions,
            expires_at: token.expires_at,
        })
    }

    /// decide on one document request and audit the decision
    ///
    /// the audit entry is written before returning, grant or deny. if it
    /// can't be written the request fails with `AuditWriteFailure` and the
    /// token is left as it was.
    pub fn authorize(&self, token: &str, document_id: &DocumentId, code: Option<&str>) -> Result<AccessGrant> {
        let (token_id, secret, episode) = match self.token_episode(token) {
            Ok(found) => found,
            Err(e) => {
                let token_id = parse_wire(token).ok().map(|(id, _)| id);
                self.audit_denial(None, None, token_id, None, document_id, None, &e)?;
                return Err(e);
            }
        };

        let mut ep = lock(&episode)?;
        let now = self.clock.now();
        ep.refresh(now);

        let guardian_id = ep.token.as_ref().map(|t| t.guardian_id.clone());
        let expired = ep.state == ActivationState::Expired;
        let mut category = None;

        // code checks run on a copy, committed once the decision is audited
        let mut staged = ep.token.clone();
        let decision = self
            .check_token(staged.as_mut(), &ep.id, expired, &token_id, &secret, code, now)
            .and_then(|verified| {
                let doc = self
                    .catalog
                    .describe(document_id)?
                    .filter(|d| d.owner_id == ep.owner_id)
                    .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;
                category = Some(doc.category);
                if !verified.permissions.contains(doc.category) {
                    return Err(Error::Forbidden { category: doc.category });
                }
                Ok((verified, doc))
            });

        match decision {
            Ok((verified, doc)) => {
                let entry = self.audit.record(AuditDraft {
                    owner_id: Some(ep.owner_id.clone()),
                    activation_id: Some(ep.id.clone()),
                    token_id: Some(token_id.clone()),
                    guardian_id: guardian_id.clone(),
                    document_id: document_id.clone(),
                    category: Some(doc.category),
                    decision: AccessDecision::Granted,
                })?;
                ep.token = staged;
                info!(
                    activation = %ep.id,
                    token = %token_id,
                    document = %document_id,
                    category = %doc.category,
                    "access granted"
                );
                let mut grant = AccessGrant {
                    activation_id: ep.id.clone(),
                    token_id,
                    owner_id: ep.owner_id.clone(),
                    guardian_id: guardian_id.ok_or_else(|| Error::Internal("token without guardian".into()))?,
                    document_id: document_id.clone(),
                    category: doc.category,
                    version: doc.version,
                    granted_at: now,
                    expires_at: verified.expires_at,
                    audit_sequence: entry.sequence,
                    seal: [0u8; 32],
                };
                grant.seal = self.grant_seal(&grant);
                Ok(grant)
            }
            Err(e) => {
                self.audit_denial(
                    Some(ep.owner_id.clone()),
                    Some(ep.id.clone()),
                    Some(token_id),
                    guardian_id,
                    document_id,
                    category,
                    &e,
                )?;
                ep.token = staged;
                Err(e)
            }
        }
    }

    fn grant_seal(&self, grant: &AccessGrant) -> [u8; 32] {
        mac(
            self.token_key.as_bytes(),
            &[
                b"shieldbox:access_grant:v1",
                grant.activation_id.as_str().as_bytes(),
                &[0],
                grant.token_id.as_str().as_bytes(),
                &[0],
                grant.owner_id.as_str().as_bytes(),
                &[0],
                grant.guardian_id.as_str().as_bytes(),
                &[0],
                grant.document_id.as_str().as_bytes(),
                &[0],
                grant.category.as_str().as_bytes(),
                &[0],
                &grant.version.to_be_bytes(),
                &grant.granted_at.to_be_bytes(),
                &grant.expires_at.to_be_bytes(),
                &grant.audit_sequence.to_be_bytes(),
            ],
        )
    }

    /// check that `grant` came from [`authorize`](Self::authorize) on this
    /// coordinator, unaltered, and that its token is still good
    pub fn verify_grant(&self, grant: &AccessGrant) -> Result<()> {
        if !ct_eq(&self.grant_seal(grant), &grant.seal) {
            warn!(token = %grant.token_id, document = %grant.document_id, "forged or altered access grant");
            return Err(Error::TokenInvalid);
        }

        let activation_id = lock(&self.tokens)?
            .get(&grant.token_id)
            .cloned()
            .ok_or(Error::TokenInvalid)?;
        let episode = self.episode(&activation_id).map_err(|_| Error::TokenInvalid)?;
        let mut ep = lock(&episode)?;
        let now = self.clock.now();
        ep.refresh(now);

        let token = ep
            .token
            .as_ref()
            .filter(|t| t.id == grant.token_id)
            .ok_or(Error::TokenInvalid)?;
        if token.revoked {
            return Err(Error::TokenInvalid);
        }
        if ep.state == ActivationState::Expired || token.is_expired(now) {
            return Err(Error::TokenExpired);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn audit_denial(
        &self,
        owner_id: Option<OwnerId>,
        activation_id: Option<ActivationId>,
        token_id: Option<TokenId>,
        guardian_id: Option<GuardianId>,
        document_id: &DocumentId,
        category: Option<Category>,
        reason: &Error,
    ) -> Result<()> {
        warn!(
            token = ?token_id.as_ref().map(|t| t.as_str()),
            document = %document_id,
            reason = %reason,
            "access denied"
        );
        self.audit.record(AuditDraft {
            owner_id,
            activation_id,
            token_id,
            guardian_id,
            document_id: document_id.clone(),
            category,
            decision: AccessDecision::Denied {
                code: reason.code().to_string(),
            },
        })?;
        Ok(())
    }

    /// current state, applying expiry
    pub fn state(&self, activation_id: &ActivationId) -> Result<ActivationState> {
        let episode = self.episode(activation_id)?;
        let mut ep = lock(&episode)?;
        ep.refresh(self.clock.now());
        Ok(ep.state)
    }

    /// `Idle` when the owner has no episode
    pub fn owner_state(&self, owner_id: &OwnerId) -> Result<ActivationState> {
        let activation_id = lock(&self.registry)?.by_owner.get(owner_id).cloned();
        match activation_id {
            Some(id) => self.state(&id),
            None => Ok(ActivationState::Idle),
        }
    }

    pub fn summary(&self, activation_id: &ActivationId) -> Result<ActivationSummary> {
        let episode = self.episode(activation_id)?;
        let mut ep = lock(&episode)?;
        ep.refresh(self.clock.now());
        Ok(ep.summary())
    }

    /// owner is back: end the episode and revoke its token
    pub fn cancel(&self, activation_id: &ActivationId) -> Result<()> {
        let episode = self.episode(activation_id)?;
        let mut ep = lock(&episode)?;
        if ep.state != ActivationState::Expired {
            ep.state = ActivationState::Expired;
            ep.ended_at = Some(self.clock.now());
            if let Some(token) = ep.token.as_mut() {
                token.revoked = true;
            }
            info!(activation = %activation_id, owner = %ep.owner_id, "activation cancelled");
        }
        Ok(())
    }

    /// expire everything past its deadline and drop episodes that ended
    /// more than `retention_secs` ago; returns how many expired
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut registry = lock(&self.registry)?;
        let mut expired = 0;
        let mut stale = Vec::new();
        for (id, episode) in registry.by_id.iter() {
            let mut ep = lock(episode)?;
            if ep.refresh(now) {
                expired += 1;
            }
            if ep.is_stale(now, self.policy.retention_secs) {
                stale.push((id.clone(), ep.owner_id.clone(), ep.token.as_ref().map(|t| t.id.clone())));
            }
        }

        if !stale.is_empty() {
            let mut tokens = lock(&self.tokens)?;
            for (id, owner_id, token_id) in &stale {
                registry.by_id.remove(id);
                if registry.by_owner.get(owner_id) == Some(id) {
                    registry.by_owner.remove(owner_id);
                }
                if let Some(token_id) = token_id {
                    tokens.remove(token_id);
                }
            }
            info!(pruned = stale.len(), "dropped ended activations");
        }
        if expired > 0 {
            info!(expired, "swept expired activations");
        }
        Ok(expired)
    }
}
