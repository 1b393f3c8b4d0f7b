//! Per-request correlation IDs.
//!
//! Each request gets an `X-Request-ID`: the caller's, when they sent a
//! non-empty one, or a fresh UUID v4. The ID wraps the downstream handler
//! in a tracing span and is echoed on the response, so one identifier ties
//! a client-observed response to its server log lines. It is independent
//! of the session id, which spans many requests.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

pub async fn assign_request_id(req: Request, next: Next) -> Response {
    let id = match req.headers().get("x-request-id").and_then(|v| v.to_str().ok()) {
        Some(inbound) if !inbound.is_empty() => inbound.to_owned(),
        _ => Uuid::new_v4().to_string(),
    };

    let span = tracing::debug_span!("request", id = %id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
