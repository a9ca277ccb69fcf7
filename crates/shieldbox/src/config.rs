//! shieldbox configuration
//!
//! every field has a default, so `{}` is a valid config file.

use serde::{Deserialize, Serialize};

use crate::crypto::{KdfParams, KdfPolicy};
use crate::emergency::EmergencyPolicy;
use crate::session::SessionPolicy;
use crate::shield::DownloadPolicy;
use crate::{Error, Result};

/// argon2 floor for a single lane, in KiB
const ARGON2_MIN_MEMORY_KIB: u32 = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// work factor for newly created vaults
    pub params: KdfParams,
    /// lowest work factor accepted when deriving
    pub policy: KdfPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldboxConfig {
    pub kdf: KdfConfig,
    pub session: SessionPolicy,
    pub emergency: EmergencyPolicy,
    pub download: DownloadPolicy,
}

impl ShieldboxConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// reject values that can't be meant, never adjust them
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Configuration(msg.to_string()));

        if self.kdf.policy.min_memory_kib < ARGON2_MIN_MEMORY_KIB || self.kdf.policy.min_iterations == 0 {
            return fail("kdf.policy is below argon2's own minimum");
        }
        self.kdf.policy.check(&self.kdf.params)?;

        if self.session.auto_lock_timeout_secs == 0 {
            return fail("session.auto_lock_timeout_secs must be positive");
        }
        if self.session.max_failed_attempts == 0 {
            return fail("session.max_failed_attempts must be positive");
        }
        if self.session.lockout_duration_secs == 0 {
            return fail("session.lockout_duration_secs must be positive");
        }

        if self.emergency.token_ttl_secs == 0 {
            return fail("emergency.token_ttl_secs must be positive");
        }
        if !(4..=9).contains(&self.emergency.verification_code_digits) {
            return fail("emergency.verification_code_digits must be between 4 and 9");
        }
        if self.emergency.max_code_attempts == 0 {
            return fail("emergency.max_code_attempts must be positive");
        }
        if self.emergency.inactivity_threshold_secs == 0 {
            return fail("emergency.inactivity_threshold_secs must be positive");
        }

        if self.download.url_ttl_secs == 0 {
            return fail("download.url_ttl_secs must be positive");
        }
        if !(self.download.base_url.starts_with("http://") || self.download.base_url.starts_with("https://")) {
            return fail("download.base_url must be an http(s) url");
        }

        Ok(())
    }
}
