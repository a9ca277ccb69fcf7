//! http surface
//!
//! handlers are thin: decode, call into shieldbox, map the error. every
//! error leaves as `{"error": <code>, "message": ...}` with the external
//! code taxonomy.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use shieldbox::directory::{BlobStore, DeliveryChannel, DeliveryPayload};
use shieldbox::emergency::{ActivationSummary, VerifiedToken};
use shieldbox::shield::{
    ActivateShieldRequest, ActivateShieldResponse, DownloadDocumentRequest, DownloadDocumentResponse,
    DownloadTicket, VerifyCodeRequest,
};
use shieldbox::{
    ActivationId, AuditLog, DocumentEnvelope, DocumentId, Error, ErrorKind, InactivityDecision, InactivitySignal,
    Shield, SignedCheckpoint,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::store::SledStore;

/// app state shared across handlers
pub struct AppState {
    pub shield: Shield,
    pub store: Arc<SledStore>,
    pub audit: Arc<AuditLog>,
    /// hex node pubkey, signs audit checkpoints
    pub pubkey: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(node_info))
        .route("/health", get(health))
        .route("/activate-shield", post(activate_shield))
        .route("/verify-code", post(verify_code))
        .route("/download-document", post(download_document))
        .route("/inactivity", post(inactivity))
        .route("/activation/{id}", get(activation_status))
        .route("/documents/{id}", put(put_document).get(fetch_document))
        .route("/audit/checkpoint", get(audit_checkpoint))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// === errors ===

pub enum ApiError {
    Core(Error),
    BadRequest { code: &'static str, message: String },
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Core(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub fn status_for(e: &Error) -> StatusCode {
    match e.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Recovery => StatusCode::BAD_REQUEST,
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::Access => match e {
            Error::MissingFields(_) | Error::InvalidSignal(_) => StatusCode::BAD_REQUEST,
            Error::ShieldNotEnabled(_) => StatusCode::NOT_FOUND,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::DocumentConflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::UNAUTHORIZED,
        },
        ErrorKind::Configuration | ErrorKind::Audit | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Core(e) => {
                let status = status_for(&e);
                let code = e.code();
                counter!("shield_errors_total", "code" => code).increment(1);
                if matches!(e, Error::AuditWriteFailure(_)) {
                    counter!("shield_audit_failures_total").increment(1);
                }
                // internal detail stays in the log
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %e, "request failed");
                    "internal error".to_string()
                } else {
                    e.to_string()
                };
                (status, ErrorBody { error: code.into(), message })
            }
            ApiError::BadRequest { code, message } => {
                counter!("shield_errors_total", "code" => code).increment(1);
                (StatusCode::BAD_REQUEST, ErrorBody { error: code.into(), message })
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn observe(endpoint: &'static str, start: Instant) {
    histogram!("shield_request_duration_seconds", "endpoint" => endpoint).record(start.elapsed().as_secs_f64());
}

// === handlers ===

#[derive(Serialize, Deserialize)]
pub struct NodeInfoResponse {
    pub version: String,
    pub pubkey: String,
    pub documents: u64,
    pub audit_entries: u64,
    pub audit_head: String,
}

async fn node_info(State(state): State<Arc<AppState>>) -> ApiResult<Json<NodeInfoResponse>> {
    let (entries, head) = state.audit.head()?;
    Ok(Json(NodeInfoResponse {
        version: env!("CARGO_PKG_VERSION").into(),
        pubkey: state.pubkey.clone(),
        documents: state.store.document_count() as u64,
        audit_entries: entries,
        audit_head: hex::encode(head),
    }))
}

async fn health() -> &'static str {
    "ok"
}

pub async fn activate_shield(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ActivateShieldRequest>,
) -> ApiResult<Json<ActivateShieldResponse>> {
    let start = Instant::now();
    counter!("shield_requests_total", "endpoint" => "activate_shield").increment(1);

    let response = state.shield.activate_shield(&req)?;
    if let ActivateShieldResponse::Activated { activation_id, .. } = &response {
        counter!("shield_activations_total").increment(1);
        info!(activation = %activation_id, "shield activated");
    }

    observe("activate_shield", start);
    Ok(Json(response))
}

pub async fn verify_code(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyCodeRequest>,
) -> ApiResult<Json<VerifiedToken>> {
    counter!("shield_requests_total", "endpoint" => "verify_code").increment(1);
    Ok(Json(state.shield.verify_code(&req)?))
}

pub async fn download_document(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DownloadDocumentRequest>,
) -> ApiResult<Json<DownloadDocumentResponse>> {
    let start = Instant::now();
    counter!("shield_requests_total", "endpoint" => "download_document").increment(1);

    let response = state.shield.download_document(&req).map_err(|e| {
        if e.kind() == ErrorKind::Access || e.kind() == ErrorKind::NotFound {
            counter!("shield_access_denied_total", "code" => e.code()).increment(1);
        }
        e
    })?;

    observe("download_document", start);
    Ok(Json(response))
}

pub async fn inactivity(
    State(state): State<Arc<AppState>>,
    Json(signal): Json<InactivitySignal>,
) -> ApiResult<Json<InactivityDecision>> {
    counter!("shield_requests_total", "endpoint" => "inactivity").increment(1);
    let decision = state.shield.coordinator().report_inactivity(&signal)?;
    if matches!(decision, InactivityDecision::Triggered { .. }) {
        counter!("shield_inactivity_triggers_total").increment(1);
    }
    Ok(Json(decision))
}

async fn activation_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ActivationSummary>> {
    Ok(Json(state.shield.coordinator().summary(&ActivationId::from(id))?))
}

/// store an envelope the owner already sealed, as a new version
pub async fn put_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(document): Json<DocumentEnvelope>,
) -> ApiResult<StatusCode> {
    if document.id.as_str() != id {
        return Err(ApiError::BadRequest {
            code: "document_id_mismatch",
            message: format!("path names {} but envelope is {}", id, document.id),
        });
    }
    state.shield.store_document(&document)?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    version: u32,
    expires: u64,
    token_id: String,
    signature: String,
}

/// serve ciphertext behind a signed download url
pub async fn fetch_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let ticket = DownloadTicket {
        document_id: DocumentId::from(id),
        version: query.version,
        token_id: query.token_id.into(),
        expires: query.expires,
        signature: query.signature,
    };
    state.shield.verify_download(&ticket)?;

    let bytes = state
        .store
        .get(&ticket.document_id, ticket.version)?
        .ok_or_else(|| Error::DocumentNotFound(ticket.document_id.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "application/json")], bytes).into_response())
}

async fn audit_checkpoint(State(state): State<Arc<AppState>>) -> ApiResult<Json<SignedCheckpoint>> {
    Ok(Json(state.audit.checkpoint()?))
}

// === delivery ===

/// records dispatch in the log; the code itself is never logged
pub struct LogDelivery;

impl DeliveryChannel for LogDelivery {
    fn deliver(&self, payload: &DeliveryPayload) -> shieldbox::Result<()> {
        info!(
            owner = %payload.owner_id,
            guardian = %payload.guardian_id,
            activation = %payload.activation_id,
            expires_at = payload.expires_at,
            "emergency access dispatched to guardian"
        );
        counter!("shield_deliveries_total").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shieldbox::crypto::{KdfParams, KdfPolicy};
    use shieldbox::directory::{GuardianProfile, OwnerProfile};
    use shieldbox::memory::MemoryDirectory;
    use shieldbox::shield::DownloadPolicy;
    use shieldbox::{
        Category, EmergencyCoordinator, EmergencyPolicy, GuardianRoles, ManualClock, SecretKey, SessionManager,
        SessionPolicy, VaultHeader,
    };

    struct Fixture {
        state: Arc<AppState>,
        document: DocumentEnvelope,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path().to_str().unwrap()).unwrap());
        let clock = Arc::new(ManualClock::new(1_700_000_000));

        let directory = Arc::new(MemoryDirectory::new());
        directory
            .put_owner(OwnerProfile {
                owner_id: "alice".into(),
                is_shield_enabled: true,
                required_confirmations: 1,
                inactivity_threshold_secs: None,
            })
            .unwrap();
        directory
            .put_guardian(GuardianProfile {
                guardian_id: "exec".into(),
                owner_id: "alice".into(),
                public_key: SecretKey::generate().public_key(),
                roles: GuardianRoles { is_will_executor: true, ..Default::default() },
            })
            .unwrap();

        let signer = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
        let pubkey = hex::encode(signer.verifying_key().to_bytes());
        let audit = Arc::new(AuditLog::new(store.clone(), clock.clone()).with_signer(signer));
        let coordinator = Arc::new(EmergencyCoordinator::new(
            directory,
            store.clone(),
            audit.clone(),
            clock.clone(),
            EmergencyPolicy::default(),
        ));
        let shield = Shield::new(
            coordinator,
            store.clone(),
            store.clone(),
            Arc::new(LogDelivery),
            clock.clone(),
            DownloadPolicy::default(),
        );

        let policy = KdfPolicy { min_memory_kib: 64, min_iterations: 1 };
        let params = KdfParams { memory_kib: 64, iterations: 1, parallelism: 1 };
        let (header, _) = VaultHeader::create("alice".into(), b"pw", params, &policy).unwrap();
        let session = SessionManager::new(header, policy, SessionPolicy::default(), clock);
        session.unlock(b"pw").unwrap();
        let document = session.seal_document(Category::Will, b"to the cat", b"{}").unwrap();

        Fixture {
            state: Arc::new(AppState { shield, store, audit, pubkey }),
            document,
            _dir: dir,
        }
    }

    fn request(owner: Option<&str>, guardian: Option<&str>) -> ActivateShieldRequest {
        ActivateShieldRequest {
            owner_id: owner.map(String::from),
            guardian_id: guardian.map(String::from),
            activation_reason: Some("emergency".into()),
            custom_message: None,
        }
    }

    fn code_of(e: ApiError) -> (StatusCode, &'static str) {
        match e {
            ApiError::Core(e) => (status_for(&e), e.code()),
            ApiError::BadRequest { code, .. } => (StatusCode::BAD_REQUEST, code),
        }
    }

    #[tokio::test]
    async fn test_activation_download_and_fetch() {
        let f = fixture();
        let id = f.document.id.to_string();
        put_document(State(f.state.clone()), Path(id.clone()), Json(f.document.clone()))
            .await
            .ok()
            .unwrap();

        let Json(response) = activate_shield(State(f.state.clone()), Json(request(Some("alice"), Some("exec"))))
            .await
            .ok()
            .unwrap();
        let (token, code) = match response {
            ActivateShieldResponse::Activated { access_token, verification_code, .. } => {
                (access_token, verification_code)
            }
            _ => panic!("expected activation"),
        };

        let Json(download) = download_document(
            State(f.state.clone()),
            Json(DownloadDocumentRequest {
                token: Some(token),
                document_id: Some(id.clone()),
                verification_code: Some(code),
            }),
        )
        .await
        .ok()
        .unwrap();

        let ticket = f.state.shield.verify_download_url(&download.download_url).unwrap();
        let fetched = fetch_document(
            State(f.state.clone()),
            Path(id),
            Query(DownloadQuery {
                version: ticket.version,
                expires: ticket.expires,
                token_id: ticket.token_id.to_string(),
                signature: ticket.signature,
            }),
        )
        .await;
        assert!(fetched.is_ok());

        let Json(checkpoint) = audit_checkpoint(State(f.state.clone())).await.ok().unwrap();
        assert_eq!(checkpoint.entries, 1);
        assert_eq!(hex::encode(checkpoint.signer), f.state.pubkey);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let f = fixture();

        let err = activate_shield(State(f.state.clone()), Json(request(None, Some("exec"))))
            .await
            .err()
            .unwrap();
        assert_eq!(code_of(err), (StatusCode::BAD_REQUEST, "missing_fields"));

        let err = activate_shield(State(f.state.clone()), Json(request(Some("nobody"), Some("exec"))))
            .await
            .err()
            .unwrap();
        assert_eq!(code_of(err), (StatusCode::NOT_FOUND, "user_not_found"));

        let err = activate_shield(State(f.state.clone()), Json(request(Some("alice"), Some("stranger"))))
            .await
            .err()
            .unwrap();
        assert_eq!(code_of(err), (StatusCode::NOT_FOUND, "guardian_not_found_or_unauthorized"));

        let err = download_document(
            State(f.state.clone()),
            Json(DownloadDocumentRequest {
                token: Some("garbage".into()),
                document_id: Some("doc".into()),
                verification_code: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(code_of(err), (StatusCode::UNAUTHORIZED, "token_invalid_or_expired"));

        assert_eq!(
            status_for(&Error::Forbidden { category: Category::Bank }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&Error::AuditWriteFailure("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_put_document_rejects_mismatched_id() {
        let f = fixture();
        let err = put_document(State(f.state.clone()), Path("other".into()), Json(f.document.clone()))
            .await
            .err()
            .unwrap();
        assert_eq!(code_of(err), (StatusCode::BAD_REQUEST, "document_id_mismatch"));
    }

    #[tokio::test]
    async fn test_put_document_conflicts() {
        let f = fixture();
        let id = f.document.id.to_string();
        put_document(State(f.state.clone()), Path(id.clone()), Json(f.document.clone()))
            .await
            .ok()
            .unwrap();

        // same version again, then a relabel at a newer version
        let err = put_document(State(f.state.clone()), Path(id.clone()), Json(f.document.clone()))
            .await
            .err()
            .unwrap();
        assert_eq!(code_of(err), (StatusCode::CONFLICT, "document_conflict"));

        let relabelled = DocumentEnvelope {
            category: Category::Bank,
            version: 2,
            ..f.document.clone()
        };
        let err = put_document(State(f.state.clone()), Path(id), Json(relabelled))
            .await
            .err()
            .unwrap();
        assert_eq!(code_of(err), (StatusCode::CONFLICT, "document_conflict"));
        assert_eq!(f.state.store.versions(&f.document.id).unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_forged_download_signature() {
        let f = fixture();
        let err = fetch_document(
            State(f.state.clone()),
            Path(f.document.id.to_string()),
            Query(DownloadQuery {
                version: 1,
                expires: u64::MAX,
                token_id: "t".into(),
                signature: hex::encode([0u8; 32]),
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(code_of(err), (StatusCode::UNAUTHORIZED, "token_invalid_or_expired"));
    }
}
