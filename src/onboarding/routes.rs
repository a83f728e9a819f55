//! HTTP and WebSocket surface for the onboarding wizard.
//!
//! Every endpoint resolves the caller through the auth oracle and runs the
//! stage gate before touching any state.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::gate::GateOutcome;
use super::manager::{Access, OnboardingController, OnboardingEvent, StageEntry};
use super::model::PersonalInfoDraft;
use super::state::Stage;
use crate::error::{Error, OnboardingError};
use crate::remote::{AuthOracle, AuthSnapshot, DocumentFile};

/// Largest accepted upload request.
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub controller: Arc<OnboardingController>,
    pub oracle: Arc<dyn AuthOracle>,
}

/// Why a request was not served.
#[derive(Debug)]
pub enum ApiError {
    /// The stage gate did not allow the operation.
    Refused(GateOutcome),
    BadRequest(String),
    Failed(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Failed(e)
    }
}

impl From<OnboardingError> for ApiError {
    fn from(e: OnboardingError) -> Self {
        Self::Failed(e.into())
    }
}

fn outcome_json(outcome: &GateOutcome) -> serde_json::Value {
    match outcome {
        GateOutcome::Pending => serde_json::json!({ "outcome": "pending" }),
        GateOutcome::Allow => serde_json::json!({ "outcome": "allow" }),
        GateOutcome::RedirectTo(route) => {
            serde_json::json!({ "outcome": "redirect", "to": route.path() })
        }
    }
}

fn onboarding_status(e: &OnboardingError) -> StatusCode {
    match e {
        OnboardingError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OnboardingError::UnknownStage(_) | OnboardingError::DocumentNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        OnboardingError::UnknownSkill(_) | OnboardingError::UnknownCertType(_) => {
            StatusCode::BAD_REQUEST
        }
        OnboardingError::TransitionBlocked { .. }
        | OnboardingError::StageNotReached { .. }
        | OnboardingError::WrongStage { .. }
        | OnboardingError::AlreadyComplete
        | OnboardingError::WrongQuestion { .. }
        | OnboardingError::ConsentLocked
        | OnboardingError::ConsentIncomplete
        | OnboardingError::DocumentUploading(_)
        | OnboardingError::UploadsOutstanding { .. } => StatusCode::CONFLICT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Refused(outcome) => (StatusCode::CONFLICT, Json(outcome_json(&outcome))).into_response(),
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            Self::Failed(Error::Onboarding(OnboardingError::Validation(fields))) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "error": "Validation failed", "fields": fields })),
            )
                .into_response(),
            Self::Failed(Error::Onboarding(e)) => (
                onboarding_status(&e),
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response(),
            Self::Failed(Error::Remote(e)) => {
                warn!(error = %e, "Remote service call failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "error": e.to_string(), "retryable": true })),
                )
                    .into_response()
            }
            Self::Failed(e) => {
                warn!(error = %e, "Onboarding request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": "Internal error" })),
                )
                    .into_response()
            }
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

async fn snapshot(state: &OnboardingRouteState, headers: &HeaderMap) -> AuthSnapshot {
    state.oracle.resolve(bearer(headers)).await
}

/// Resolve the caller and gate the operation. `None` gates on the
/// applicant's current stage.
async fn authorize(
    state: &OnboardingRouteState,
    headers: &HeaderMap,
    stage: Option<Stage>,
) -> Result<String, ApiError> {
    let auth = snapshot(state, headers).await;
    match state.controller.access(&auth, stage).await? {
        Access::Granted(applicant_id) => Ok(applicant_id),
        Access::Refused(outcome) => {
            debug!(?stage, ?outcome, "Onboarding request refused by gate");
            Err(ApiError::Refused(outcome))
        }
    }
}

/// Build the onboarding REST and WebSocket routes.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/onboarding", get(ws_handler))
        .route("/api/onboarding/status", get(get_status))
        .route("/api/onboarding/stages/{stage}", get(enter_stage))
        .route("/api/onboarding/personal-info", put(put_personal_info))
        .route("/api/onboarding/personal-info/locate", post(locate))
        .route("/api/onboarding/consent/answer", post(answer_consent))
        .route("/api/onboarding/consent/submit", post(submit_consent))
        .route("/api/onboarding/skills/taxonomy", get(get_taxonomy))
        .route("/api/onboarding/skills/toggle", post(toggle_skill))
        .route(
            "/api/onboarding/documents",
            post(upload_document).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/onboarding/documents/commit", post(commit_documents))
        .route("/api/onboarding/documents/{id}", delete(remove_document))
        .route("/api/onboarding/advance", post(advance))
        .route("/api/onboarding/retreat", post(retreat))
        .route("/api/onboarding/restart", post(restart))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "rescue-onboard"
    }))
}

// ── Status & stage entry ────────────────────────────────────────────────

async fn get_status(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, None).await?;
    Ok(Json(state.controller.status(&applicant).await?))
}

/// GET /api/onboarding/stages/{stage}
///
/// Gate plus load. Pending and redirect outcomes are answers, not errors.
async fn enter_stage(
    State(state): State<OnboardingRouteState>,
    Path(stage): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let stage: Stage = stage.parse()?;
    let auth = snapshot(&state, &headers).await;
    let body = match state.controller.enter(&auth, stage).await? {
        StageEntry::Pending => serde_json::json!({ "outcome": "pending" }),
        StageEntry::Redirect(route) => {
            serde_json::json!({ "outcome": "redirect", "to": route.path() })
        }
        StageEntry::Allowed(view) => serde_json::json!({ "outcome": "allow", "view": view }),
    };
    Ok(Json(body))
}

// ── PersonalInfo ────────────────────────────────────────────────────────

async fn put_personal_info(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Json(draft): Json<PersonalInfoDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, Some(Stage::PersonalInfo)).await?;
    Ok(Json(state.controller.save_personal_info(&applicant, draft).await?))
}

#[derive(Debug, Deserialize)]
struct LocateRequest {
    lat: f64,
    lon: f64,
}

async fn locate(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Json(req): Json<LocateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, Some(Stage::PersonalInfo)).await?;
    Ok(Json(state.controller.locate(&applicant, req.lat, req.lon).await?))
}

// ── PrerequisiteConsent ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    index: usize,
    yes: bool,
}

async fn answer_consent(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Json(req): Json<AnswerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, Some(Stage::PrerequisiteConsent)).await?;
    let outcome = state
        .controller
        .answer_consent(&applicant, req.index, req.yes)
        .await?;
    Ok(Json(outcome))
}

async fn submit_consent(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, Some(Stage::PrerequisiteConsent)).await?;
    state.controller.submit_consent(&applicant).await?;
    Ok(Json(serde_json::json!({ "submitted": true })))
}

// ── SkillSelection ──────────────────────────────────────────────────────

async fn get_taxonomy(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers, Some(Stage::SkillSelection)).await?;
    let taxonomy = state.controller.taxonomy().await?;
    Ok(Json(taxonomy.as_ref().clone()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleRequest {
    skill_id: String,
}

async fn toggle_skill(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Json(req): Json<ToggleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, Some(Stage::SkillSelection)).await?;
    Ok(Json(state.controller.toggle_skill(&applicant, &req.skill_id).await?))
}

// ── DocumentUpload ──────────────────────────────────────────────────────

/// POST /api/onboarding/documents (multipart: `file`, `certTypeId`)
///
/// Answers 202 with the `uploading` entry; the result arrives over the
/// WebSocket.
async fn upload_document(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, Some(Stage::DocumentUpload)).await?;

    let mut file = None;
    let mut cert_type_id = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        match field.name() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or("document").to_string();
                let content_type = field.content_type().map(String::from);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read file: {e}")))?;
                file = Some(DocumentFile {
                    file_name,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            Some("certTypeId") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read certTypeId: {e}")))?;
                cert_type_id = Some(text);
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| ApiError::BadRequest("missing file field".into()))?;
    let cert_type_id =
        cert_type_id.ok_or_else(|| ApiError::BadRequest("missing certTypeId field".into()))?;

    let entry = state
        .controller
        .start_document_upload(&applicant, &cert_type_id, file)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(entry)))
}

async fn remove_document(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, Some(Stage::DocumentUpload)).await?;
    Ok(Json(state.controller.remove_document(&applicant, id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CommitRequest {
    #[serde(default)]
    skip: bool,
}

async fn commit_documents(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Json(req): Json<CommitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, Some(Stage::DocumentUpload)).await?;
    Ok(Json(state.controller.commit_documents(&applicant, req.skip).await?))
}

// ── Navigation ──────────────────────────────────────────────────────────

async fn advance(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, None).await?;
    Ok(Json(state.controller.advance(&applicant).await?))
}

async fn retreat(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, None).await?;
    Ok(Json(state.controller.retreat(&applicant).await?))
}

async fn restart(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let applicant = authorize(&state, &headers, None).await?;
    Ok(Json(state.controller.restart(&applicant).await?))
}

// ── WebSocket ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// GET /ws/onboarding
///
/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// also come as `?token=`.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<OnboardingRouteState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let token = bearer(&headers).map(String::from).or(params.token);
    let auth = state.oracle.resolve(token.as_deref()).await;
    let applicant_id = match auth.applicant_id {
        Some(id) if auth.state.is_authenticated => id,
        _ => {
            let status = if auth.state.is_loading {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::UNAUTHORIZED
            };
            return (status, Json(serde_json::json!({ "error": "Not authenticated" })))
                .into_response();
        }
    };

    info!(applicant = %applicant_id, "Onboarding WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state.controller, applicant_id))
}

async fn send_position(
    socket: &mut WebSocket,
    controller: &OnboardingController,
    applicant_id: &str,
) -> bool {
    let status = match controller.status(applicant_id).await {
        Ok(status) => status,
        Err(e) => {
            warn!(applicant = %applicant_id, error = %e, "Failed to load status for WS sync");
            return true;
        }
    };
    let sync = OnboardingEvent::StageChanged {
        applicant_id: applicant_id.to_string(),
        stage: status.position.stage,
        sub_step: status.position.sub_step,
    };
    match serde_json::to_string(&sync) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

async fn handle_socket(mut socket: WebSocket, controller: Arc<OnboardingController>, applicant_id: String) {
    // Subscribe before the initial sync so nothing falls in between.
    let mut rx = controller.subscribe();

    if !send_position(&mut socket, &controller, &applicant_id).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if event.applicant_id() != applicant_id {
                            continue;
                        }
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !send_position(&mut socket, &controller, &applicant_id).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(applicant = %applicant_id, "Onboarding WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
