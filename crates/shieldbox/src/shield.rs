//! request-shaped surface over the emergency coordinator
//!
//! requests arrive with every field optional so a missing one becomes
//! `missing_fields` instead of a decode error. responses never carry more
//! than the guardian is entitled to.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::crypto::{self, mac};
use crate::directory::{BlobStore, DeliveryChannel, DeliveryPayload, DocumentCatalog, DocumentDescriptor};
use crate::emergency::{
    AccessGrant, ActivationReason, ConfirmOutcome, EmergencyCoordinator, IssuedToken, Trigger, VerifiedToken,
};
use crate::envelope::{DocumentEnvelope, DocumentHistory};
use crate::ids::{ActivationId, DocumentId, GuardianId, OwnerId, TokenId};
use crate::keys::SymmetricKey;
use crate::permissions::GuardianPermissions;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadPolicy {
    /// prefix for access links and download urls
    pub base_url: String,
    pub url_ttl_secs: u64,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4200".into(),
            url_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivateShieldRequest {
    pub owner_id: Option<String>,
    pub guardian_id: Option<String>,
    pub activation_reason: Option<String>,
    pub custom_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActivateShieldResponse {
    Activated {
        activation_id: ActivationId,
        token_id: TokenId,
        access_token: String,
        verification_code: String,
        expires_at: u64,
        permissions: GuardianPermissions,
    },
    Pending {
        activation_id: ActivationId,
        confirmations: u32,
        required_confirmations: u32,
    },
    AlreadyActivated {
        activation_id: ActivationId,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadDocumentRequest {
    pub token: Option<String>,
    pub document_id: Option<String>,
    pub verification_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadDocumentResponse {
    pub download_url: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyCodeRequest {
    pub token: Option<String>,
    pub verification_code: Option<String>,
}

/// the signed parts of a download url
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTicket {
    pub document_id: DocumentId,
    /// the version that was authorized
    pub version: u32,
    pub token_id: TokenId,
    pub expires: u64,
    pub signature: String,
}

/// trimmed, non-empty value or the field's name
fn required<'a>(value: &'a Option<String>, name: &'static str, missing: &mut Vec<&'static str>) -> &'a str {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => {
            missing.push(name);
            ""
        }
    }
}

fn missing_fields(missing: Vec<&'static str>) -> Result<()> {
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MissingFields(missing.join(", ")))
    }
}

pub struct Shield {
    coordinator: Arc<EmergencyCoordinator>,
    catalog: Arc<dyn DocumentCatalog>,
    blobs: Arc<dyn BlobStore>,
    delivery: Arc<dyn DeliveryChannel>,
    clock: Arc<dyn Clock>,
    download: DownloadPolicy,
    /// signs download urls
    url_key: SymmetricKey,
    /// serializes document writes so version checks and inserts don't interleave
    writes: Mutex<()>,
}

impl Shield {
    pub fn new(
        coordinator: Arc<EmergencyCoordinator>,
        catalog: Arc<dyn DocumentCatalog>,
        blobs: Arc<dyn BlobStore>,
        delivery: Arc<dyn DeliveryChannel>,
        clock: Arc<dyn Clock>,
        download: DownloadPolicy,
    ) -> Self {
        Self {
            coordinator,
            catalog,
            blobs,
            delivery,
            clock,
            download,
            url_key: SymmetricKey::generate(),
            writes: Mutex::new(()),
        }
    }

    pub fn coordinator(&self) -> &EmergencyCoordinator {
        &self.coordinator
    }

    /// trigger or join the owner's episode and record the caller's confirmation
    pub fn activate_shield(&self, req: &ActivateShieldRequest) -> Result<ActivateShieldResponse> {
        let mut missing = Vec::new();
        let owner_id = required(&req.owner_id, "owner_id", &mut missing);
        let guardian_id = required(&req.guardian_id, "guardian_id", &mut missing);
        let reason = required(&req.activation_reason, "activation_reason", &mut missing);
        missing_fields(missing)?;

        let reason: ActivationReason = reason
            .parse()
            .map_err(|_| Error::MissingFields("activation_reason".into()))?;
        let owner_id = OwnerId::from(owner_id);
        let guardian_id = GuardianId::from(guardian_id);
        let message = req
            .custom_message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(String::from);

        let activation = self.coordinator.trigger(
            &owner_id,
            Trigger::Guardian { guardian_id: guardian_id.clone() },
            reason,
            message.clone(),
        )?;

        match self.coordinator.confirm(&activation.id, &guardian_id, message.clone())? {
            ConfirmOutcome::Activated(issued) => {
                self.deliver(&owner_id, &issued, message);
                Ok(ActivateShieldResponse::Activated {
                    activation_id: issued.activation_id.clone(),
                    token_id: issued.token_id.clone(),
                    access_token: issued.access_token.to_string(),
                    verification_code: issued.verification_code.to_string(),
                    expires_at: issued.expires_at,
                    permissions: issued.permissions,
                })
            }
            ConfirmOutcome::Pending {
                activation_id,
                confirmations,
                required_confirmations,
            } => Ok(ActivateShieldResponse::Pending {
                activation_id,
                confirmations,
                required_confirmations,
            }),
            ConfirmOutcome::AlreadyActivated { activation_id } => {
                Ok(ActivateShieldResponse::AlreadyActivated { activation_id })
            }
        }
    }

    /// hand the link and code to the delivery channel; failure doesn't undo
    /// the activation
    fn deliver(&self, owner_id: &OwnerId, issued: &IssuedToken, message: Option<String>) {
        let payload = DeliveryPayload {
            owner_id: owner_id.clone(),
            guardian_id: issued.guardian_id.clone(),
            activation_id: issued.activation_id.clone(),
            access_link: format!(
                "{}/emergency-access?token={}",
                self.download.base_url.trim_end_matches('/'),
                issued.access_token.as_str()
            ),
            verification_code: issued.verification_code.clone(),
            expires_at: issued.expires_at,
            message,
        };
        if let Err(e) = self.delivery.deliver(&payload) {
            warn!(
                activation = %issued.activation_id,
                guardian = %issued.guardian_id,
                error = %e,
                "delivery failed, guardian must use the activation response"
            );
        }
    }

    pub fn verify_code(&self, req: &VerifyCodeRequest) -> Result<VerifiedToken> {
        let mut missing = Vec::new();
        let token = required(&req.token, "token", &mut missing);
        let code = required(&req.verification_code, "verification_code", &mut missing);
        missing_fields(missing)?;
        self.coordinator.exchange_verification_code(token, code)
    }

    /// authorize, then return a short-lived signed url for the ciphertext
    pub fn download_document(&self, req: &DownloadDocumentRequest) -> Result<DownloadDocumentResponse> {
        let mut missing = Vec::new();
        let token = required(&req.token, "token", &mut missing);
        let document_id = required(&req.document_id, "document_id", &mut missing);
        missing_fields(missing)?;

        let code = req.verification_code.as_deref().map(str::trim).filter(|c| !c.is_empty());
        let grant = self.coordinator.authorize(token, &DocumentId::from(document_id), code)?;

        let ttl = self.download.url_ttl_secs;
        let expires = self.clock.now().saturating_add(ttl).min(grant.expires_at);
        let ticket = self.sign(&grant.document_id, grant.version, &grant.token_id, expires);

        Ok(DownloadDocumentResponse {
            download_url: format!(
                "{}/documents/{}?version={}&expires={}&token_id={}&signature={}",
                self.download.base_url.trim_end_matches('/'),
                ticket.document_id,
                ticket.version,
                ticket.expires,
                ticket.token_id,
                ticket.signature
            ),
            expires_in: expires.saturating_sub(self.clock.now()),
        })
    }

    fn url_signature(&self, document_id: &DocumentId, version: u32, token_id: &TokenId, expires: u64) -> [u8; 32] {
        mac(
            self.url_key.as_bytes(),
            &[
                b"shieldbox:download_url:v1",
                document_id.as_str().as_bytes(),
                &[0],
                &version.to_be_bytes(),
                token_id.as_str().as_bytes(),
                &expires.to_be_bytes(),
            ],
        )
    }

    fn sign(&self, document_id: &DocumentId, version: u32, token_id: &TokenId, expires: u64) -> DownloadTicket {
        DownloadTicket {
            document_id: document_id.clone(),
            version,
            token_id: token_id.clone(),
            expires,
            signature: hex::encode(self.url_signature(document_id, version, token_id, expires)),
        }
    }

    /// check a ticket taken from a download url
    pub fn verify_download(&self, ticket: &DownloadTicket) -> Result<()> {
        let presented = hex::decode(&ticket.signature).map_err(|_| Error::TokenInvalid)?;
        let expected = self.url_signature(&ticket.document_id, ticket.version, &ticket.token_id, ticket.expires);
        if !crypto::ct_eq(&expected, &presented) {
            return Err(Error::TokenInvalid);
        }
        if self.clock.now() >= ticket.expires {
            return Err(Error::TokenExpired);
        }
        Ok(())
    }

    /// parse and check a full download url
    pub fn verify_download_url(&self, url: &str) -> Result<DownloadTicket> {
        let (path, query) = url.split_once('?').ok_or(Error::TokenInvalid)?;
        let document_id = path
            .rsplit_once("/documents/")
            .map(|(_, id)| id)
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .ok_or(Error::TokenInvalid)?;

        let mut version = None;
        let mut expires = None;
        let mut token_id = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("version", v)) => version = v.parse::<u32>().ok(),
                Some(("expires", v)) => expires = v.parse::<u64>().ok(),
                Some(("token_id", v)) => token_id = Some(v),
                Some(("signature", v)) => signature = Some(v),
                _ => {}
            }
        }

        let ticket = DownloadTicket {
            document_id: document_id.into(),
            version: version.ok_or(Error::TokenInvalid)?,
            token_id: token_id.ok_or(Error::TokenInvalid)?.into(),
            expires: expires.ok_or(Error::TokenInvalid)?,
            signature: signature.ok_or(Error::TokenInvalid)?.to_string(),
        };
        self.verify_download(&ticket)?;
        Ok(ticket)
    }

    /// store an already encrypted document and register it in the catalog
    ///
    /// a document keeps the owner and category it was first stored under,
    /// and every store must move it to a newer version. older versions
    /// stay in the blob store.
    pub fn store_document(&self, document: &DocumentEnvelope) -> Result<()> {
        let _writes = self
            .writes
            .lock()
            .map_err(|_| Error::Internal("document write lock poisoned".into()))?;

        if let Some(current) = self.catalog.describe(&document.id)? {
            if current.owner_id != document.owner_id || current.category != document.category {
                warn!(
                    document = %document.id,
                    owner = %document.owner_id,
                    category = %document.category,
                    "refusing to relabel stored document"
                );
                return Err(Error::DocumentConflict(format!(
                    "{} is registered to {} as {}",
                    document.id, current.owner_id, current.category
                )));
            }
            if document.version <= current.version {
                warn!(
                    document = %document.id,
                    version = document.version,
                    latest = current.version,
                    "refusing stale document version"
                );
                return Err(Error::DocumentConflict(format!(
                    "{} is at version {}, got {}",
                    document.id, current.version, document.version
                )));
            }
        }

        let bytes = serde_json::to_vec(document).map_err(|e| Error::Storage(e.to_string()))?;
        self.blobs.put(&document.id, document.version, &bytes)?;
        self.catalog.register(&DocumentDescriptor {
            document_id: document.id.clone(),
            owner_id: document.owner_id.clone(),
            category: document.category,
            version: document.version,
        })?;
        info!(document = %document.id, owner = %document.owner_id, version = document.version, "document stored");
        Ok(())
    }

    /// one stored version of a document
    pub fn load_document(&self, document_id: &DocumentId, version: u32) -> Result<DocumentEnvelope> {
        let bytes = self
            .blobs
            .get(document_id, version)?
            .ok_or_else(|| Error::DocumentNotFound(format!("{} version {}", document_id, version)))?;
        let document: DocumentEnvelope = serde_json::from_slice(&bytes).map_err(|_| Error::InvalidEnvelope)?;
        if &document.id != document_id || document.version != version {
            return Err(Error::InvalidEnvelope);
        }
        Ok(document)
    }

    /// every stored version of a document, oldest first
    pub fn document_history(&self, document_id: &DocumentId) -> Result<DocumentHistory> {
        let mut versions = self.blobs.versions(document_id)?.into_iter();
        let first = versions
            .next()
            .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;
        let mut history = DocumentHistory::new(self.load_document(document_id, first)?);
        for version in versions {
            history.push(self.load_document(document_id, version)?)?;
        }
        Ok(history)
    }

    /// decrypt a granted document with the recovered vault root
    ///
    /// only grants issued by this shield's coordinator are honoured, and
    /// only while their token is still good. the version released is the
    /// one that was authorized.
    pub fn release_document(
        &self,
        grant: &AccessGrant,
        document_id: &DocumentId,
        root_key: &SymmetricKey,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if &grant.document_id != document_id {
            return Err(Error::TokenInvalid);
        }
        self.coordinator.verify_grant(grant)?;
        if self.clock.now() >= grant.expires_at {
            return Err(Error::TokenExpired);
        }

        let document = self.load_document(document_id, grant.version)?;
        if document.owner_id != grant.owner_id {
            return Err(Error::DocumentNotFound(document_id.to_string()));
        }
        if document.category != grant.category {
            return Err(Error::Forbidden { category: document.category });
        }

        let plain = document.open(root_key)?;
        info!(
            document = %document_id,
            version = grant.version,
            guardian = %grant.guardian_id,
            "document released"
        );
        Ok(plain)
    }
}

#[cfg(all(test, feature = "software"))]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::clock::ManualClock;
    use crate::directory::{GuardianProfile, OwnerProfile};
    use crate::emergency::EmergencyPolicy;
    use crate::keys::SecretKey;
    use crate::memory::{MemoryAuditSink, MemoryBlobStore, MemoryCatalog, MemoryDirectory, RecordingDelivery};
    use crate::permissions::{Category, GuardianRoles};

    struct Fixture {
        clock: Arc<ManualClock>,
        delivery: Arc<RecordingDelivery>,
        shield: Shield,
        root: SymmetricKey,
    }

    fn fixture(required_confirmations: u32) -> Fixture {
        let clock = Arc::new(ManualClock::new(10_000));
        let directory = Arc::new(MemoryDirectory::new());
        directory
            .put_owner(OwnerProfile {
                owner_id: "alice".into(),
                is_shield_enabled: true,
                required_confirmations,
                inactivity_threshold_secs: None,
            })
            .unwrap();
        for (name, roles) in [
            ("exec", GuardianRoles { is_will_executor: true, ..Default::default() }),
            ("doc", GuardianRoles { can_access_health_docs: true, ..Default::default() }),
        ] {
            directory
                .put_guardian(GuardianProfile {
                    guardian_id: name.into(),
                    owner_id: "alice".into(),
                    public_key: SecretKey::generate().public_key(),
                    roles,
                })
                .unwrap();
        }

        let catalog = Arc::new(MemoryCatalog::new());
        let audit = Arc::new(AuditLog::new(Arc::new(MemoryAuditSink::new()), clock.clone()));
        let coordinator = Arc::new(EmergencyCoordinator::new(
            directory,
            catalog.clone(),
            audit,
            clock.clone(),
            EmergencyPolicy::default(),
        ));
        let delivery = Arc::new(RecordingDelivery::new());
        let shield = Shield::new(
            coordinator,
            catalog,
            Arc::new(MemoryBlobStore::new()),
            delivery.clone(),
            clock.clone(),
            DownloadPolicy {
                base_url: "https://vault.example/".into(),
                url_ttl_secs: 60,
            },
        );
        Fixture { clock, delivery, shield, root: SymmetricKey::generate() }
    }

    fn request(guardian: &str) -> ActivateShieldRequest {
        ActivateShieldRequest {
            owner_id: Some("alice".into()),
            guardian_id: Some(guardian.into()),
            activation_reason: Some("emergency".into()),
            custom_message: Some("hospital".into()),
        }
    }

    #[test]
    fn test_missing_fields() {
        let f = fixture(1);
        let err = f
            .shield
            .activate_shield(&ActivateShieldRequest {
                owner_id: Some("alice".into()),
                guardian_id: Some("  ".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), "missing_fields");
        assert!(err.to_string().contains("guardian_id, activation_reason"));

        let err = f.shield.download_document(&DownloadDocumentRequest::default()).unwrap_err();
        assert_eq!(err.code(), "missing_fields");
    }

    #[test]
    fn test_unknown_owner_and_guardian() {
        let f = fixture(1);
        let mut req = request("exec");
        req.owner_id = Some("bob".into());
        assert_eq!(f.shield.activate_shield(&req).unwrap_err().code(), "user_not_found");

        assert_eq!(
            f.shield.activate_shield(&request("mallory")).unwrap_err().code(),
            "guardian_not_found_or_unauthorized"
        );
    }

    #[test]
    fn test_activate_download_release() {
        let f = fixture(1);
        let will = DocumentEnvelope::seal("alice".into(), Category::Will, b"last will", b"{}", &f.root, 1).unwrap();
        f.shield.store_document(&will).unwrap();

        let (token, code) = match f.shield.activate_shield(&request("exec")).unwrap() {
            ActivateShieldResponse::Activated { access_token, verification_code, permissions, .. } => {
                assert!(permissions.contains(Category::Will));
                (access_token, verification_code)
            }
            other => panic!("unexpected {:?}", other),
        };

        let delivered = f.delivery.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].guardian_id.as_str(), "exec");
        assert!(delivered[0].access_link.starts_with("https://vault.example/emergency-access?token="));
        assert_eq!(delivered[0].message.as_deref(), Some("hospital"));

        let resp = f
            .shield
            .download_document(&DownloadDocumentRequest {
                token: Some(token.clone()),
                document_id: Some(will.id.to_string()),
                verification_code: Some(code),
            })
            .unwrap();
        assert_eq!(resp.expires_in, 60);
        let ticket = f.shield.verify_download_url(&resp.download_url).unwrap();
        assert_eq!(ticket.document_id, will.id);

        let mut forged = ticket.clone();
        forged.expires += 1_000;
        assert!(f.shield.verify_download(&forged).is_err());

        let grant = f.shield.coordinator().authorize(&token, &will.id, None).unwrap();
        let plain = f.shield.release_document(&grant, &will.id, &f.root).unwrap();
        assert_eq!(plain.as_slice(), b"last will");

        assert!(matches!(
            f.shield.release_document(&grant, &"other".into(), &f.root),
            Err(Error::TokenInvalid)
        ));

        f.clock.advance(61);
        assert!(matches!(f.shield.verify_download_url(&resp.download_url), Err(Error::TokenExpired)));
    }

    fn activated(f: &Fixture, guardian: &str) -> (String, String) {
        match f.shield.activate_shield(&request(guardian)).unwrap() {
            ActivateShieldResponse::Activated { access_token, verification_code, .. } => (access_token, verification_code),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_relabelled_document_is_refused() {
        let f = fixture(1);
        let bank = DocumentEnvelope::seal("alice".into(), Category::Bank, b"bank statement", b"{}", &f.root, 1).unwrap();
        f.shield.store_document(&bank).unwrap();

        let as_will = DocumentEnvelope { category: Category::Will, ..bank.clone() };
        assert!(matches!(f.shield.store_document(&as_will), Err(Error::DocumentConflict(_))));
        let as_newer_will = DocumentEnvelope { version: 2, ..as_will };
        assert!(matches!(f.shield.store_document(&as_newer_will), Err(Error::DocumentConflict(_))));
        let other_owner = DocumentEnvelope { owner_id: "mallory".into(), version: 3, ..bank.clone() };
        assert!(matches!(f.shield.store_document(&other_owner), Err(Error::DocumentConflict(_))));

        let (token, code) = activated(&f, "exec");
        let err = f
            .shield
            .download_document(&DownloadDocumentRequest {
                token: Some(token),
                document_id: Some(bank.id.to_string()),
                verification_code: Some(code),
            })
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden { category: Category::Bank }));
        assert_eq!(f.shield.document_history(&bank.id).unwrap().len(), 1);
    }

    #[test]
    fn test_versions_never_roll_back() {
        let f = fixture(1);
        let v1 = DocumentEnvelope::seal("alice".into(), Category::Will, b"will v1", b"{}", &f.root, 1).unwrap();
        let v2 = v1.supersede(b"will v2", &f.root, 2).unwrap();

        f.shield.store_document(&v1).unwrap();
        f.shield.store_document(&v2).unwrap();
        assert!(matches!(f.shield.store_document(&v1), Err(Error::DocumentConflict(_))));
        assert!(matches!(f.shield.store_document(&v2), Err(Error::DocumentConflict(_))));

        assert_eq!(f.shield.catalog.describe(&v1.id).unwrap().unwrap().version, 2);
        let old = f.shield.load_document(&v1.id, 1).unwrap();
        assert_eq!(old.open(&f.root).unwrap().as_slice(), b"will v1");

        let history = f.shield.document_history(&v1.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().unwrap().version, 2);
        assert_eq!(history.get(1).unwrap(), &v1);

        let (token, code) = activated(&f, "exec");
        let grant = f.shield.coordinator().authorize(&token, &v1.id, Some(&code)).unwrap();
        assert_eq!(grant.version, 2);
        let plain = f.shield.release_document(&grant, &v1.id, &f.root).unwrap();
        assert_eq!(plain.as_slice(), b"will v2");
    }

    #[test]
    fn test_altered_grant_is_refused() {
        let f = fixture(1);
        let will = DocumentEnvelope::seal("alice".into(), Category::Will, b"last will", b"{}", &f.root, 1).unwrap();
        let bank = DocumentEnvelope::seal("alice".into(), Category::Bank, b"bank statement", b"{}", &f.root, 1).unwrap();
        f.shield.store_document(&will).unwrap();
        f.shield.store_document(&bank).unwrap();

        let (token, code) = activated(&f, "exec");
        let grant = f.shield.coordinator().authorize(&token, &will.id, Some(&code)).unwrap();

        let mut forged = grant.clone();
        forged.document_id = bank.id.clone();
        forged.category = Category::Bank;
        assert!(matches!(
            f.shield.release_document(&forged, &bank.id, &f.root),
            Err(Error::TokenInvalid)
        ));

        f.shield.coordinator().cancel(&grant.activation_id).unwrap();
        assert!(matches!(
            f.shield.release_document(&grant, &will.id, &f.root),
            Err(Error::TokenInvalid)
        ));
    }

    #[test]
    fn test_delivery_failure_keeps_activation() {
        let f = fixture(1);
        f.delivery.set_failing(true);
        assert!(matches!(
            f.shield.activate_shield(&request("exec")).unwrap(),
            ActivateShieldResponse::Activated { .. }
        ));
        assert!(f.delivery.delivered().is_empty());
    }

    #[test]
    fn test_pending_then_activated() {
        let f = fixture(2);
        assert!(matches!(
            f.shield.activate_shield(&request("exec")).unwrap(),
            ActivateShieldResponse::Pending { confirmations: 1, required_confirmations: 2, .. }
        ));
        match f.shield.activate_shield(&request("doc")).unwrap() {
            ActivateShieldResponse::Activated { permissions, .. } => {
                assert!(permissions.contains(Category::Medical));
                assert!(!permissions.contains(Category::Will));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            f.shield.activate_shield(&request("exec")).unwrap(),
            ActivateShieldResponse::AlreadyActivated { .. }
        ));
    }

    #[test]
    fn test_verify_code() {
        let f = fixture(1);
        let (token, code) = match f.shield.activate_shield(&request("exec")).unwrap() {
            ActivateShieldResponse::Activated { access_token, verification_code, .. } => (access_token, verification_code),
            other => panic!("unexpected {:?}", other),
        };
        let err = f
            .shield
            .verify_code(&VerifyCodeRequest { token: Some(token.clone()), verification_code: Some("x".into()) })
            .unwrap_err();
        assert_eq!(err.code(), "invalid_verification_code");

        let verified = f
            .shield
            .verify_code(&VerifyCodeRequest { token: Some(token), verification_code: Some(code) })
            .unwrap();
        assert!(verified.permissions.contains(Category::Estate));
    }
}
