pub mod orchestrator;
pub mod providers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{Extensions, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use concierge_config::Config;
use concierge_contracts::{flow, ChatRequest, ChatResponse, ErrorBody, ErrorResponse, ReloadOutcome};
use concierge_kernel::{ClientIdentity, EmergencyStatus, Transition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use orchestrator::{Orchestrator, PipelineError, SystemStatus, ValidationFailure, CHAT_CATEGORY};
pub use providers::{
    DirectoryDocumentSource, Document, DocumentSource, EmbeddingProvider, Generation,
    GenerationProvider, InMemoryVectorStore, ProviderError, Providers, ScoredDocument, VectorStore,
};

pub const ADMIN_CATEGORY: &str = "admin";

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let providers = Providers::from_config(&cfg)?;
    build_app_with(cfg, providers).await
}

/// Same as [`build_app`] with caller-supplied collaborators.
pub async fn build_app_with(cfg: Config, providers: Providers) -> Result<Router, String> {
    let state = AppState::new(cfg, providers).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/chat", post(chat))
        .route("/v1/admin/reload", post(admin_reload))
        .route("/v1/admin/emergency/activate", post(emergency_activate))
        .route("/v1/admin/emergency/deactivate", post(emergency_deactivate))
        .route("/v1/admin/rate-limits/reset", post(rate_limits_reset))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    admin_keys: Arc<Vec<String>>,
}

impl AppState {
    async fn new(cfg: Config, providers: Providers) -> Result<Self, String> {
        let orchestrator = Arc::new(Orchestrator::new(&cfg, providers)?);
        let outcome = orchestrator.reload_knowledge_base().await;
        if !outcome.success {
            warn!(error = ?outcome.error, "starting without a knowledge base");
        }
        Ok(Self {
            orchestrator,
            admin_keys: Arc::new(cfg.admin.api_keys),
        })
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let services = state.orchestrator.services_health().await;
    let emergency = state.orchestrator.emergency().is_active();
    let status = if emergency {
        "emergency"
    } else if services.unavailable().is_empty() {
        "healthy"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "emergency_mode": emergency,
        "services": services,
    }))
}

async fn status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(state.orchestrator.system_status().await)
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(request): Json<ChatRequest>,
) -> Response {
    let identity = client_identity(&headers, &extensions, request.session_id.as_deref());
    let cancel = CancellationToken::new();
    // Dropping this handler (client gone) cancels the pipeline task.
    let _guard = cancel.clone().drop_guard();
    let response = Arc::clone(&state.orchestrator)
        .handle_chat_task(request, identity, cancel)
        .await;
    chat_reply(response)
}

fn chat_reply(response: ChatResponse) -> Response {
    let trace = &response.metadata;
    let status = if trace.has_path(flow::RATE_LIMIT_EXCEEDED) {
        StatusCode::TOO_MANY_REQUESTS
    } else if trace.has_path(flow::INPUT_VALIDATION_FAILED) || trace.has_path(flow::INPUT_UNSAFE) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    let retry_after = response.retry_after;
    let mut reply = (status, Json(response)).into_response();
    if let Some(secs) = retry_after {
        reply.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    reply
}

#[derive(Debug, Default, Deserialize)]
struct EmergencyActivateInput {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmergencyToggle {
    transition: Transition,
    status: EmergencyStatus,
}

#[derive(Debug, Deserialize)]
struct RateLimitResetInput {
    identity: String,
}

async fn admin_reload(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<ReloadOutcome>, Response> {
    admit_admin(&state, &headers, &extensions)?;
    Ok(Json(state.orchestrator.reload_knowledge_base().await))
}

async fn emergency_activate(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(input): Json<EmergencyActivateInput>,
) -> Result<Json<EmergencyToggle>, Response> {
    admit_admin(&state, &headers, &extensions)?;
    let emergency = state.orchestrator.emergency();
    let reason = input
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "manual activation".to_string());
    let transition = emergency.activate(reason);
    Ok(Json(EmergencyToggle {
        transition,
        status: emergency.status(),
    }))
}

async fn emergency_deactivate(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<EmergencyToggle>, Response> {
    admit_admin(&state, &headers, &extensions)?;
    let emergency = state.orchestrator.emergency();
    let transition = emergency.deactivate();
    Ok(Json(EmergencyToggle {
        transition,
        status: emergency.status(),
    }))
}

async fn rate_limits_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(input): Json<RateLimitResetInput>,
) -> Result<Json<Value>, Response> {
    admit_admin(&state, &headers, &extensions)?;
    let identity = input.identity.trim();
    if identity.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "identity is required",
        ));
    }
    let windows_cleared = state
        .orchestrator
        .rate_limiter()
        .reset(&ClientIdentity::new(identity));
    info!(identity, windows_cleared, "rate limits reset");
    Ok(Json(json!({
        "identity": identity,
        "windows_cleared": windows_cleared,
    })))
}

/// Admission under the `admin` category, then the admin key check.
fn admit_admin(state: &AppState, headers: &HeaderMap, extensions: &Extensions) -> Result<(), Response> {
    let identity = client_identity(headers, extensions, None);
    let decision = state
        .orchestrator
        .rate_limiter()
        .admit(&identity, ADMIN_CATEGORY);
    if !decision.allowed {
        let mut reply = error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_exceeded",
            "admin rate limit exceeded",
        );
        reply
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
        return Err(reply);
    }

    if state.admin_keys.is_empty() {
        return Ok(());
    }
    let presented = header(headers, "x-admin-key");
    if presented.is_some_and(|key| state.admin_keys.iter().any(|k| k == key)) {
        Ok(())
    } else {
        warn!(identity = identity.as_str(), "admin request rejected");
        Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid admin key",
        ))
    }
}

fn client_identity(
    headers: &HeaderMap,
    extensions: &Extensions,
    session_id: Option<&str>,
) -> ClientIdentity {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    ClientIdentity::resolve(
        header(headers, "x-api-key"),
        session_id.or_else(|| header(headers, "x-session-id")),
        header(headers, "x-forwarded-for"),
        header(headers, "x-real-ip"),
        peer,
    )
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
                details: None,
            },
        }),
    )
        .into_response()
}
