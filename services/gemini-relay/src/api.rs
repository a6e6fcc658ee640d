//! HTTP surface: routes, handlers and shared state

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use dispatch::{DispatchError, Dispatcher};
use key_pool::KeyPool;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{instrument, warn};

use crate::config::ErrorMode;

/// Counters behind `/health`.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently inside `/generate`, reported when a drain times out.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

/// Counts one request in `in_flight` until dropped, including when the
/// handler future is cancelled by a client disconnect.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub pool: Arc<KeyPool>,
    pub metrics: ServiceMetrics,
    pub prometheus: PrometheusHandle,
    pub error_mode: ErrorMode,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` caps concurrently served requests.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/generate", post(generate_handler))
        .route("/key_info", get(key_info_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Structured error body used in `status` error mode.
fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    json_response(
        status,
        serde_json::json!({
            "error": {
                "type": "dispatch_error",
                "message": message,
                "request_id": request_id,
            }
        }),
    )
}

async fn root_handler() -> &'static str {
    "gemini-relay"
}

/// The non-empty string `prompt` field of a JSON object body.
fn extract_prompt(body: &[u8]) -> Option<String> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    json.get("prompt")?
        .as_str()
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
}

async fn generate_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let start = Instant::now();
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let in_flight = InFlightGuard::enter(&state.metrics.in_flight);

    let response = generate(&state, &body, &request_id).await;

    drop(in_flight);
    if !response.status().is_success() || response.extensions().get::<DispatchFailed>().is_some() {
        state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    crate::metrics::record_request(response.status().as_u16(), start.elapsed().as_secs_f64());
    response
}

/// Marks an inline-mode failure, which is reported with status 200.
#[derive(Clone, Copy)]
struct DispatchFailed;

#[instrument(skip_all, fields(request_id = %request_id))]
async fn generate(state: &AppState, body: &[u8], request_id: &str) -> Response {
    let Some(prompt) = extract_prompt(body) else {
        warn!("rejected request without prompt");
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "No prompt provided" }),
        );
    };

    match state.dispatcher.respond(&prompt).await {
        Ok(text) => json_response(StatusCode::OK, serde_json::json!({ "response": text })),
        Err(e) => {
            let message = e.to_string();
            match state.error_mode {
                ErrorMode::Inline => {
                    let mut response =
                        json_response(StatusCode::OK, serde_json::json!({ "response": message }));
                    response.extensions_mut().insert(DispatchFailed);
                    response
                }
                ErrorMode::Status => {
                    let status = match e {
                        DispatchError::AttemptsExhausted { .. } => StatusCode::BAD_GATEWAY,
                        DispatchError::AcquireTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                        DispatchError::Pool(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    };
                    error_response(status, &message, request_id)
                }
            }
        }
    }
}

/// Per-key usage, keyed by display prefix.
async fn key_info_handler(State(state): State<AppState>) -> Response {
    let mut body = serde_json::Map::new();
    for (idx, usage) in state.pool.usage_report().await.into_iter().enumerate() {
        let mut name = usage.key;
        if body.contains_key(&name) {
            name = format!("{name}#{idx}");
        }
        body.insert(
            name,
            serde_json::json!({
                "pro_count": usage.pro.short,
                "pro_daily": usage.pro.daily,
                "flash_count": usage.flash.short,
                "flash_daily": usage.flash.daily,
                "window_age_secs": usage.window_age_secs,
            }),
        );
    }
    json_response(StatusCode::OK, serde_json::Value::Object(body))
}

async fn health_handler(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "keys": state.pool.len(),
            "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
            "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
            "errors_total": state.metrics.errors_total.load(Ordering::Relaxed),
        }),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
