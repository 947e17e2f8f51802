//! HTTP API
//!
//! JSON surface over the coordinator. Every body carries `ok`; failures
//! add the error code, a message and, for save, the probe matrix.
//! The session travels in the `x-session-id` header.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::coordinator::{Coordinator, PollOutcome, SaveRequest};
use crate::error::ResolveError;
use crate::session::SessionRegistry;

pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(coordinator: Coordinator, sessions: SessionRegistry) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            sessions: Arc::new(sessions),
        }
    }
}

// ============================================================
// Error Mapping
// ============================================================

/// `ResolveError` rendered as a JSON response
pub struct ApiError(ResolveError);

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        warn!(code = self.0.code(), error = %self.0, "Request failed");

        let mut body = json!({
            "ok": false,
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        if let Some(probes) = self.0.probes() {
            body["probes"] = json!(probes);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

// ============================================================
// Router
// ============================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/auth/start", post(start))
        .route("/api/auth/poll", get(poll))
        .route("/api/auth/save", post(save))
        .route("/api/connection", get(connection))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the listener fails
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Resolver listening on {}", addr);
    }
    axum::serve(listener, router(state)).await
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn with_session(id: &str, body: Value) -> Response {
    let mut response = Json(body).into_response();
    if let Ok(value) = HeaderValue::from_str(id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

// ============================================================
// Handlers
// ============================================================

async fn health_check() -> Json<Value> {
    Json(json!({
        "ok": true,
        "status": "healthy",
        "service": "plex-resolver",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn start(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let (id, session) = state.sessions.get_or_create(session_id(&headers)).await;
    let mut ctx = session.lock().await;
    let outcome = state.coordinator.start(&mut ctx).await?;

    Ok(with_session(
        &id,
        json!({
            "ok": true,
            "sessionId": id,
            "pinId": outcome.pin_id,
            "code": outcome.code,
            "expiresAt": outcome.expires_at,
            "deeplink": outcome.deeplink,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    #[serde(rename = "pinId")]
    pin_id: Option<String>,
}

async fn poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> ApiResult {
    let pin_id = query
        .pin_id
        .as_deref()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or(ResolveError::UnknownExchange)?;

    let id = session_id(&headers).ok_or(ResolveError::UnknownExchange)?;
    let session = state
        .sessions
        .get(id)
        .await
        .ok_or(ResolveError::UnknownExchange)?;
    let mut ctx = session.lock().await;

    let body = match state.coordinator.poll(&mut ctx, pin_id).await? {
        PollOutcome::Pending => json!({ "ok": true, "pending": true, "status": "pending" }),
        PollOutcome::ServersReady(servers) => json!({
            "ok": true,
            "pending": false,
            "status": "ready",
            "servers": servers,
        }),
    };
    Ok(with_session(id, body))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveBody {
    #[serde(default)]
    server_url: String,
    server_id: Option<String>,
    #[serde(default = "default_verify_ssl")]
    verify_ssl: bool,
    #[serde(default)]
    force_save: bool,
}

fn default_verify_ssl() -> bool {
    true
}

async fn save(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<SaveBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body.map_err(|e| ResolveError::InvalidRequest(e.body_text()))?;

    let id = session_id(&headers).ok_or(ResolveError::ExchangeNotReady)?;
    let session = state
        .sessions
        .get(id)
        .await
        .ok_or(ResolveError::ExchangeNotReady)?;
    let mut ctx = session.lock().await;

    let request = SaveRequest {
        server_url: body.server_url,
        server_id: body.server_id,
        verify_tls: body.verify_ssl,
        force: body.force_save,
    };
    let outcome = state.coordinator.save(&mut ctx, &request).await?;

    let mut response = json!(outcome);
    response["ok"] = json!(true);
    Ok(with_session(id, response))
}

async fn connection(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.coordinator.check_connection().await))
}
