//! access tokens
//!
//! a token is handed out once, as `<token_id>.<base64url secret>`. the
//! coordinator keeps only hmac tags of the secret and of the verification
//! code, so a leaked coordinator snapshot can't be replayed as a token.

use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{self, mac};
use crate::ids::{ActivationId, GuardianId, OwnerId, TokenId};
use crate::keys::SymmetricKey;
use crate::permissions::GuardianPermissions;
use crate::{Error, Result};

const SECRET_LEN: usize = 32;

/// stored half of a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: TokenId,
    pub activation_id: ActivationId,
    pub owner_id: OwnerId,
    pub guardian_id: GuardianId,
    /// fixed at issuance
    pub permissions: GuardianPermissions,
    pub issued_at: u64,
    pub expires_at: u64,
    #[serde(with = "crate::envelope::hex_array")]
    secret_tag: [u8; 32],
    #[serde(with = "crate::envelope::hex_array")]
    code_tag: [u8; 32],
    pub code_attempts: u32,
    pub verified: bool,
    pub revoked: bool,
}

/// what the guardian receives, exactly once
#[derive(Clone)]
pub struct IssuedToken {
    pub token_id: TokenId,
    pub activation_id: ActivationId,
    pub guardian_id: GuardianId,
    pub access_token: Zeroizing<String>,
    pub verification_code: Zeroizing<String>,
    pub expires_at: u64,
    pub permissions: GuardianPermissions,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token_id", &self.token_id)
            .field("activation_id", &self.activation_id)
            .field("guardian_id", &self.guardian_id)
            .field("expires_at", &self.expires_at)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

pub(crate) struct MintParams<'a> {
    pub key: &'a SymmetricKey,
    pub activation_id: &'a ActivationId,
    pub owner_id: &'a OwnerId,
    pub guardian_id: &'a GuardianId,
    pub permissions: GuardianPermissions,
    pub now: u64,
    pub ttl_secs: u64,
    pub code_digits: u32,
}

impl AccessToken {
    pub(crate) fn mint(p: MintParams<'_>) -> (AccessToken, IssuedToken) {
        let id = TokenId::random();
        let secret = Zeroizing::new(crypto::random_bytes::<SECRET_LEN>());
        let code = generate_code(p.code_digits);
        let expires_at = p.now.saturating_add(p.ttl_secs);

        let token = AccessToken {
            id: id.clone(),
            activation_id: p.activation_id.clone(),
            owner_id: p.owner_id.clone(),
            guardian_id: p.guardian_id.clone(),
            permissions: p.permissions,
            issued_at: p.now,
            expires_at,
            secret_tag: secret_tag(p.key, &id, &secret[..]),
            code_tag: code_tag(p.key, &id, code.as_bytes()),
            code_attempts: 0,
            verified: false,
            revoked: false,
        };

        let issued = IssuedToken {
            access_token: Zeroizing::new(encode_wire(&id, &secret[..])),
            token_id: id,
            activation_id: p.activation_id.clone(),
            guardian_id: p.guardian_id.clone(),
            verification_code: code,
            expires_at,
            permissions: p.permissions,
        };

        (token, issued)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn secret_matches(&self, key: &SymmetricKey, secret: &[u8]) -> bool {
        crypto::ct_eq(&secret_tag(key, &self.id, secret), &self.secret_tag)
    }

    pub(crate) fn code_matches(&self, key: &SymmetricKey, code: &str) -> bool {
        crypto::ct_eq(&code_tag(key, &self.id, code.trim().as_bytes()), &self.code_tag)
    }
}

fn secret_tag(key: &SymmetricKey, id: &TokenId, secret: &[u8]) -> [u8; 32] {
    mac(key.as_bytes(), &[b"shieldbox:token_secret:v1", id.as_str().as_bytes(), secret])
}

fn code_tag(key: &SymmetricKey, id: &TokenId, code: &[u8]) -> [u8; 32] {
    mac(key.as_bytes(), &[b"shieldbox:verification_code:v1", id.as_str().as_bytes(), code])
}

/// uniform decimal code, zero padded
fn generate_code(digits: u32) -> Zeroizing<String> {
    let modulus = 10u64.pow(digits);
    let n = rand::thread_rng().gen_range(0..modulus);
    Zeroizing::new(format!("{:0width$}", n, width = digits as usize))
}

fn encode_wire(id: &TokenId, secret: &[u8]) -> String {
    use base64::Engine;
    format!(
        "{}.{}",
        id,
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(secret)
    )
}

/// split a presented token into id and secret
pub fn parse_wire(token: &str) -> Result<(TokenId, Zeroizing<Vec<u8>>)> {
    use base64::Engine;
    let (id, secret) = token.trim().split_once('.').ok_or(Error::TokenInvalid)?;
    if id.is_empty() {
        return Err(Error::TokenInvalid);
    }
    let secret = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(secret)
        .map_err(|_| Error::TokenInvalid)?;
    if secret.len() != SECRET_LEN {
        return Err(Error::TokenInvalid);
    }
    Ok((TokenId::new(id), Zeroizing::new(secret)))
}
