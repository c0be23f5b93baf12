use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

use crate::adapter::AdapterHandle;
use crate::error::BridgeError;
use crate::registry::{ThingRegistry, ThingState};
use crate::transport::PendingPublish;

/// How long a request waits for the broker to accept its publish.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Pairing window when the request does not name one.
pub const DEFAULT_PAIRING_SECONDS: u64 = 60;

/// Shared application state
pub struct AppState {
    pub registry: Arc<ThingRegistry>,
    /// Running adapters by id
    pub adapters: HashMap<String, AdapterHandle>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<ThingRegistry>, adapters: Vec<AdapterHandle>) -> Self {
        Self {
            registry,
            adapters: adapters.into_iter().map(|h| (h.id().to_string(), h)).collect(),
            started_at: Instant::now(),
        }
    }

    /// The adapter that announced `thing_id`.
    fn adapter_for(&self, thing_id: &str) -> Result<&AdapterHandle, ApiError> {
        let adapter_id = self
            .registry
            .adapter_for(thing_id)
            .ok_or_else(|| BridgeError::UnknownDevice(thing_id.to_string()))?;
        self.adapters
            .get(&adapter_id)
            .ok_or(ApiError(BridgeError::AdapterStopped))
    }
}

/// PUT /api/things/{id}/properties/{name} request body
#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    #[serde(default)]
    pub value: Value,
}

/// POST /api/things/{id}/actions/{name} request body
#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub input: Value,
}

/// POST /api/pairing request body
#[derive(Debug, Default, Deserialize)]
pub struct PairingRequest {
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Bridge errors rendered as `{"error": ...}` with a matching status.
pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_routing_miss() => StatusCode::NOT_FOUND,
            BridgeError::Validation(_) | BridgeError::Parse(_) => StatusCode::BAD_REQUEST,
            BridgeError::Transport(_) | BridgeError::Protocol(_) => StatusCode::BAD_GATEWAY,
            BridgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/things", get(get_things))
        .route("/api/things/:id", get(get_thing).delete(remove_thing))
        .route("/api/things/:id/properties/:name", put(write_property))
        .route("/api/things/:id/actions/:name", post(perform_action))
        .route("/api/things/:id/refresh", post(refresh_thing))
        .route("/api/pairing", post(start_pairing).delete(cancel_pairing))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn settle(pending: PendingPublish) -> Result<(), ApiError> {
    pending.wait(Some(PUBLISH_TIMEOUT)).await.map_err(ApiError)
}

/// GET /api/things: every known thing
async fn get_things(State(app): State<Arc<AppState>>) -> Json<Vec<ThingState>> {
    Json(app.registry.get_all())
}

/// GET /api/things/{id}
async fn get_thing(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ThingState>, ApiError> {
    app.registry
        .get(&id)
        .map(Json)
        .ok_or(ApiError(BridgeError::UnknownDevice(id)))
}

/// PUT /api/things/{id}/properties/{name}: validated write
async fn write_property(
    State(app): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
    Json(body): Json<WriteRequest>,
) -> Result<Json<Value>, ApiError> {
    let adapter = app.adapter_for(&id)?;
    let pending = adapter.write_property(&id, &name, body.value.clone()).await?;
    settle(pending).await?;
    Ok(Json(json!({ name: body.value })))
}

/// POST /api/things/{id}/actions/{name}
async fn perform_action(
    State(app): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
    Json(body): Json<ActionRequest>,
) -> Result<Json<Value>, ApiError> {
    let adapter = app.adapter_for(&id)?;
    let pending = adapter.perform_action(&id, &name, body.input.clone()).await?;
    settle(pending).await?;
    Ok(Json(json!({ "name": name, "input": body.input, "status": "completed" })))
}

/// POST /api/things/{id}/refresh: ask the bridge for current values
async fn refresh_thing(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let adapter = app.adapter_for(&id)?;
    match adapter.refresh(&id).await? {
        Some(pending) => {
            settle(pending).await?;
            Ok(StatusCode::ACCEPTED)
        }
        None => Ok(StatusCode::NO_CONTENT),
    }
}

/// DELETE /api/things/{id}: the thing disappears once the bridge confirms
async fn remove_thing(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let adapter = app.adapter_for(&id)?;
    settle(adapter.remove_device(&id).await?).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/pairing: permit joining on every adapter
async fn start_pairing(
    State(app): State<Arc<AppState>>,
    body: Option<Json<PairingRequest>>,
) -> Result<Json<Value>, ApiError> {
    let seconds = body
        .and_then(|Json(b)| b.timeout)
        .unwrap_or(DEFAULT_PAIRING_SECONDS);

    for adapter in app.adapters.values() {
        settle(adapter.start_pairing(seconds).await?).await?;
    }
    Ok(Json(json!({ "adapters": app.adapters.len(), "timeout": seconds })))
}

/// DELETE /api/pairing
async fn cancel_pairing(State(app): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    for adapter in app.adapters.values() {
        settle(adapter.cancel_pairing().await?).await?;
    }
    Ok(Json(json!({ "adapters": app.adapters.len() })))
}

/// GET /api/health: health check with metrics
async fn health(State(app): State<Arc<AppState>>) -> Json<Value> {
    let rss_kb = read_rss_kb(std::process::id()).unwrap_or(0);

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "thing_count": app.registry.len(),
        "adapter_count": app.adapters.len(),
        "memory_rss_kb": rss_kb,
        "uptime_seconds": app.started_at.elapsed().as_secs(),
    }))
}

/// Read RSS from /proc/{pid}/status on Linux
fn read_rss_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            return parts.get(1)?.parse().ok();
        }
    }
    None
}
