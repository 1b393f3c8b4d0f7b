//! The gateway's HTTP surface.
//!
//! This is intentionally a thin layer: routing lives in [`crate::router`],
//! dispatch in [`crate::dispatch`]. Handlers translate HTTP concerns —
//! validation bounds, status codes, the response envelope, the
//! `X-Session-ID` header — into calls to those modules and back.
//!
//! Request lifecycle for `POST /route`:
//! received → validated → routed → dispatched → responded, with 400 on
//! validation failures, 503/504/502 on routing and dispatch failures, and
//! 500 for anything unexpected. Stats are recorded exactly once per
//! accepted request on the response path, success or not.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::dispatch::{CompletionPayload, DispatchReply};
use crate::error::GatewayError;
use crate::registry::HealthState;
use crate::router::{self, RouteInput, RouterState};
use crate::session::SessionStoreStatus;
use crate::stats::RequestTimings;
use crate::usecase::{Modality, UseCase};

/// Bodies above this size are rejected before parsing.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Queries above this size are rejected before classification.
const MAX_QUERY_BYTES: usize = 64 * 1024;

const MAX_CONTEXT_ENTRIES: usize = 64;

/// Build the axum router.
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/route", post(route))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .route("/use-cases", get(use_cases))
        .route("/cleanup", post(cleanup))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(
            crate::api::request_id::assign_request_id,
        ))
        .with_state(state)
}

/// `POST /route` request body. Unrecognized keys are ignored; recognized
/// keys are type-strict.
#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Opaque caller identity; logged, never interpreted.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub modality: Modality,
    #[serde(default)]
    pub context: std::collections::BTreeMap<String, String>,
    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "defaults::temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub stream: bool,
}

mod defaults {
    pub fn max_tokens() -> u32 { 100 }
    pub fn temperature() -> f64 { 0.7 }
}

impl RouteRequest {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.query.len() > MAX_QUERY_BYTES {
            return Err(GatewayError::Validation(format!(
                "query exceeds {MAX_QUERY_BYTES} bytes"
            )));
        }
        if self.context.len() > MAX_CONTEXT_ENTRIES {
            return Err(GatewayError::Validation(format!(
                "context exceeds {MAX_CONTEXT_ENTRIES} entries"
            )));
        }
        if !(1..=4096).contains(&self.max_tokens) {
            return Err(GatewayError::Validation(
                "max_tokens must be between 1 and 4096".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(GatewayError::Validation(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if matches!(self.session_id.as_deref(), Some("")) {
            return Err(GatewayError::Validation("session_id must not be empty".into()));
        }
        Ok(())
    }
}

/// `POST /route` — classify (or bypass), dispatch, envelope.
async fn route(
    State(state): State<Arc<RouterState>>,
    payload: Result<Json<RouteRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();

    // Validation failures never reach the classifier, let alone a backend.
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return GatewayError::Validation(rejection.body_text()).into_response();
        }
    };
    if let Err(error) = request.validate() {
        return error.into_response();
    }
    if let Some(user_id) = &request.user_id {
        tracing::debug!(%user_id, "request attributed");
    }

    let routing_started = Instant::now();
    let routed = match router::route(
        &state,
        RouteInput {
            query: &request.query,
            session_id: request.session_id.as_deref(),
            modality: request.modality,
            context: &request.context,
        },
    )
    .await
    {
        Ok(routed) => routed,
        Err(error) => {
            let routing_time = routing_started.elapsed().as_secs_f64();
            state.stats.record(RequestTimings {
                routing_secs: routing_time,
                inference_secs: 0.0,
                total_secs: started.elapsed().as_secs_f64(),
                bypass: false,
                new_session: false,
                context_changed: false,
            });
            return failure(error, request.session_id.as_deref(), None, routing_time, 0.0, started);
        }
    };
    let routing_time = routing_started.elapsed().as_secs_f64();

    let completion = CompletionPayload {
        query: request.query.clone(),
        model_id: routed.model_id.clone(),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream: request.stream,
    };

    let inference_started = Instant::now();
    let reply = state
        .dispatcher
        .dispatch(&state.registry, Arc::clone(&routed.backend), &completion)
        .await;
    let inference_time = inference_started.elapsed().as_secs_f64();

    let timings = RequestTimings {
        routing_secs: routing_time,
        inference_secs: inference_time,
        total_secs: started.elapsed().as_secs_f64(),
        bypass: routed.bypass_used,
        new_session: routed.new_session,
        context_changed: routed.context_changed,
    };

    match reply {
        Ok(DispatchReply::Completed { result, endpoint, .. }) => {
            state.stats.record(timings);
            let body = json!({
                "success": true,
                "result": result,
                "use_case": routed.use_case.as_str(),
                "selected_model": routed.model_id,
                "endpoint": endpoint,
                "confidence": routed.confidence,
                "routing_time": routing_time,
                "bypass_used": routed.bypass_used,
                "session_id": routed.session_id,
                "new_session": routed.new_session,
                "inference_time": inference_time,
                "total_time": timings.total_secs,
            });
            with_session_header((StatusCode::OK, Json(body)).into_response(), &routed.session_id)
        }
        Ok(DispatchReply::Stream { stream, backend_key }) => {
            tracing::debug!(backend = %backend_key, "streaming passthrough");
            state.stats.record(RequestTimings { inference_secs: 0.0, ..timings });
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            with_session_header(response, &routed.session_id)
        }
        Err(error) => {
            state.stats.record(timings);
            failure(
                error,
                Some(&routed.session_id),
                Some(routed.use_case),
                routing_time,
                inference_time,
                started,
            )
        }
    }
}

/// Build the failure envelope with whatever metadata is available.
/// The session binding is untouched — failures never corrupt affinity.
fn failure(
    error: GatewayError,
    session_id: Option<&str>,
    use_case: Option<UseCase>,
    routing_time: f64,
    inference_time: f64,
    started: Instant,
) -> Response {
    let status = error.status_code();
    let mut body = json!({
        "success": false,
        "error_message": error.to_string(),
        "routing_time": routing_time,
        "inference_time": inference_time,
        "total_time": started.elapsed().as_secs_f64(),
    });
    if let Some(session_id) = session_id {
        body["session_id"] = json!(session_id);
    }
    if let Some(use_case) = use_case {
        body["use_case"] = json!(use_case.as_str());
    }
    tracing::warn!(error = %error, status = %status, "route request failed");

    let response = (status, Json(body)).into_response();
    match session_id {
        Some(session_id) => with_session_header(response, session_id),
        None => response,
    }
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert("x-session-id", value);
    }
    response
}

/// `GET /` — service banner and endpoint index.
async fn index(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(json!({
        "service": "ai-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "endpoints": ["/route", "/sessions/{id}", "/stats", "/health", "/use-cases", "/cleanup"],
    }))
}

/// `GET /sessions/{id}` — the binding's external view; 404 when absent or
/// expired.
async fn get_session(
    State(state): State<Arc<RouterState>>,
    Path(id): Path<String>,
) -> Response {
    match state.sessions.get(&id).await {
        Some(binding) => {
            with_session_header((StatusCode::OK, Json(binding.view())).into_response(), &id)
        }
        None => GatewayError::SessionNotFound(id).into_response(),
    }
}

/// `DELETE /sessions/{id}` — idempotent removal.
async fn delete_session(
    State(state): State<Arc<RouterState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let removed = state.sessions.delete(&id).await;
    Json(json!({ "success": true, "removed": removed }))
}

/// `GET /stats` — counters, EWMA timings, and the derived bypass rate.
async fn stats(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

/// `GET /health` — component statuses; the overall status is the worst of
/// the session store and every backend.
async fn health(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let store_status = state.sessions.status();
    let mut overall = match store_status {
        SessionStoreStatus::Connected => HealthState::Healthy,
        SessionStoreStatus::Degraded => HealthState::Degraded,
    };

    let mut backends = serde_json::Map::new();
    for (key, backend) in state.registry.iter() {
        let backend_health = backend.health();
        overall = overall.max(backend_health);
        backends.insert(
            key.clone(),
            json!({
                "status": backend_health.as_str(),
                "endpoint": backend.base_url,
                "last_latency_ms": backend.last_probe_latency_ms(),
            }),
        );
    }

    Json(json!({
        "status": overall.as_str(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session_store": store_status.as_str(),
        "backends": Value::Object(backends),
    }))
}

/// `GET /use-cases` — the closed routing set and where each case lands.
async fn use_cases(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let list: Vec<Value> = UseCase::ALL
        .iter()
        .map(|use_case| {
            let endpoint = state
                .registry
                .get(state.config.backend_key_for(*use_case))
                .map(|b| b.base_url.clone());
            json!({
                "id": use_case.as_str(),
                "description": use_case.description(),
                "endpoint": endpoint,
            })
        })
        .collect();
    Json(list)
}

/// `POST /cleanup` — force a sweep of expired session bindings.
async fn cleanup(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let removed = state.sessions.sweep().await;
    Json(json!({ "success": true, "removed_count": removed }))
}
