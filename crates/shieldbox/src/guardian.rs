//! guardian threshold recovery
//!
//! the vault root is split M-of-N and every share is sealed to its
//! guardian's x25519 public key before it leaves this module. whoever stores
//! the N sealed shares learns nothing without M guardians' private keys.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroizing;

use crate::directory::GuardianProfile;
use crate::ids::GuardianId;
use crate::keys::{SealedBox, SecretKey};
use crate::shamir::{self, Share, SPLIT_ID_LEN};
use crate::{Error, Result};

/// one opened share, bound to the guardian holding it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianShare {
    pub guardian_id: GuardianId,
    pub created_at: u64,
    pub share: Share,
}

/// a share sealed to its guardian, safe to hand to any storage
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedGuardianShare {
    pub guardian_id: GuardianId,
    #[serde(with = "crate::envelope::hex_array")]
    pub split_id: [u8; SPLIT_ID_LEN],
    pub threshold: u8,
    pub total: u8,
    pub created_at: u64,
    pub sealed: SealedBox,
}

impl EncryptedGuardianShare {
    /// open with the guardian's secret key
    pub fn open(&self, guardian_secret: &SecretKey) -> Result<GuardianShare> {
        let plain = self
            .sealed
            .open(guardian_secret, &share_aad(&self.guardian_id, &self.split_id))?;
        let share = Share::from_bytes(&plain)?;

        if share.split_id != self.split_id || share.threshold != self.threshold || share.total != self.total {
            return Err(Error::ShareVerificationFailed);
        }

        Ok(GuardianShare {
            guardian_id: self.guardian_id.clone(),
            created_at: self.created_at,
            share,
        })
    }
}

fn share_aad(guardian_id: &GuardianId, split_id: &[u8; SPLIT_ID_LEN]) -> Vec<u8> {
    let mut aad = b"shieldbox:guardian_share:v1:".to_vec();
    aad.extend_from_slice(split_id);
    aad.extend_from_slice(guardian_id.as_str().as_bytes());
    aad
}

/// split `secret` among `guardians`, any `threshold` of them can recover it
pub fn distribute(
    secret: &[u8],
    guardians: &[GuardianProfile],
    threshold: usize,
    now: u64,
) -> Result<Vec<EncryptedGuardianShare>> {
    shamir::check_threshold(guardians.len(), threshold)?;

    let mut seen = HashSet::new();
    for g in guardians {
        if !seen.insert(&g.guardian_id) {
            return Err(Error::Configuration(format!(
                "guardian {} listed twice",
                g.guardian_id
            )));
        }
    }

    let shares = shamir::split_secret(secret, guardians.len(), threshold)?;

    let sealed = guardians
        .iter()
        .zip(shares.iter())
        .map(|(guardian, share)| {
            let sealed = SealedBox::seal_to(
                &guardian.public_key,
                &share.to_bytes(),
                &share_aad(&guardian.guardian_id, &share.split_id),
            )?;
            Ok(EncryptedGuardianShare {
                guardian_id: guardian.guardian_id.clone(),
                split_id: share.split_id,
                threshold: share.threshold,
                total: share.total,
                created_at: now,
                sealed,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    info!(
        guardians = guardians.len(),
        threshold,
        split = %hex::encode(&sealed[0].split_id[..4]),
        "distributed guardian shares"
    );

    Ok(sealed)
}

/// reconstruct from opened guardian shares
pub fn recover(shares: &[GuardianShare]) -> Result<Zeroizing<Vec<u8>>> {
    let mut seen = HashSet::new();
    for s in shares {
        if !seen.insert(&s.guardian_id) {
            return Err(Error::InconsistentShares);
        }
    }

    let raw: Vec<Share> = shares.iter().map(|s| s.share.clone()).collect();
    shamir::reconstruct(&raw)
}
