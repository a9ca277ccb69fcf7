//! dead-man's-switch input
//!
//! the scheduler that notices inactivity lives outside this crate. what it
//! sends is treated as untrusted: it has to name a real owner with the
//! shield enabled and carry timestamps that make sense.

use serde::{Deserialize, Serialize};

use crate::directory::OwnerProfile;
use crate::ids::{ActivationId, OwnerId};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InactivitySignal {
    pub owner_id: OwnerId,
    /// last time the owner was seen
    pub last_activity_at: u64,
    /// when the scheduler made the observation
    pub observed_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum InactivityDecision {
    /// owner still within the threshold
    Active { idle_secs: u64, threshold_secs: u64 },
    Triggered { activation_id: ActivationId },
    /// a live episode already exists
    AlreadyTriggered { activation_id: ActivationId },
}

/// idle seconds, or why the signal is rejected
pub(crate) fn validate(
    signal: &InactivitySignal,
    owner: Option<&OwnerProfile>,
    now: u64,
    max_skew_secs: u64,
) -> Result<u64> {
    let owner = owner.ok_or_else(|| Error::UserNotFound(signal.owner_id.to_string()))?;
    if !owner.is_shield_enabled {
        return Err(Error::ShieldNotEnabled(signal.owner_id.to_string()));
    }
    if signal.last_activity_at > signal.observed_at {
        return Err(Error::InvalidSignal(format!(
            "last activity {} after observation {}",
            signal.last_activity_at, signal.observed_at
        )));
    }
    if signal.observed_at > now.saturating_add(max_skew_secs) {
        return Err(Error::InvalidSignal(format!(
            "observation {} is in the future (now {})",
            signal.observed_at, now
        )));
    }
    Ok(signal.observed_at - signal.last_activity_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(enabled: bool) -> OwnerProfile {
        OwnerProfile {
            owner_id: "alice".into(),
            is_shield_enabled: enabled,
            required_confirmations: 1,
            inactivity_threshold_secs: None,
        }
    }

    fn signal(last: u64, observed: u64) -> InactivitySignal {
        InactivitySignal {
            owner_id: "alice".into(),
            last_activity_at: last,
            observed_at: observed,
        }
    }

    #[test]
    fn test_validate() {
        let o = owner(true);
        assert_eq!(validate(&signal(100, 400), Some(&o), 400, 10).unwrap(), 300);
        // skew tolerated
        assert!(validate(&signal(100, 410), Some(&o), 400, 10).is_ok());
        assert!(matches!(
            validate(&signal(100, 411), Some(&o), 400, 10),
            Err(Error::InvalidSignal(_))
        ));
        assert!(matches!(
            validate(&signal(500, 400), Some(&o), 400, 10),
            Err(Error::InvalidSignal(_))
        ));
    }

    #[test]
    fn test_unknown_or_disabled_owner() {
        assert!(matches!(validate(&signal(0, 1), None, 1, 0), Err(Error::UserNotFound(_))));
        assert!(matches!(
            validate(&signal(0, 1), Some(&owner(false)), 1, 0),
            Err(Error::ShieldNotEnabled(_))
        ));
    }
}
