//! Backend dispatch: forwarding a routed request to its inference backend.
//!
//! The dispatcher speaks the OpenAI chat-completions protocol (path
//! overridable per backend) and owns all downstream failure policy:
//!
//! - connect errors and 5xx responses retry up to the configured budget
//!   with exponential backoff starting at 100 ms;
//! - after the primary's budget is spent, the configured fallback backend
//!   gets exactly one attempt — no further chaining;
//! - 4xx responses are surfaced to the caller as-is and never retried;
//! - the whole dispatch, retries included, is bounded by the request
//!   deadline;
//! - each backend has a fixed number of dispatch permits. When they are
//!   gone the request fails fast with `Overloaded` rather than queueing.
//!
//! Streaming requests are forwarded verbatim when the backend supports SSE.
//! Like the rest of the fast path, streaming skips retry and fallback — the
//! first connection wins or the request fails.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::registry::{Backend, BackendRegistry, HealthState};

/// Initial retry backoff; doubles per attempt.
const BACKOFF_START: Duration = Duration::from_millis(100);

/// A `Send`-able, heap-allocated SSE byte stream, forwarded verbatim.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// What the caller needs to build a completion request.
#[derive(Debug, Clone)]
pub struct CompletionPayload {
    pub query: String,
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub stream: bool,
}

impl CompletionPayload {
    fn body(&self, stream: bool) -> Value {
        json!({
            "model": self.model_id,
            "messages": [{ "role": "user", "content": self.query }],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": stream,
        })
    }
}

/// Outcome of a dispatch.
pub enum DispatchReply {
    /// Aggregated response: the extracted completion text.
    Completed {
        result: String,
        backend_key: String,
        endpoint: String,
    },
    /// Verbatim SSE passthrough. Chunk order is the backend's.
    Stream {
        stream: SseStream,
        backend_key: String,
    },
}

/// Whether a failed attempt may be retried.
enum Failure {
    Transient(GatewayError),
    Fatal(GatewayError),
}

impl Failure {
    fn into_error(self) -> GatewayError {
        match self {
            Self::Transient(e) | Self::Fatal(e) => e,
        }
    }
}

/// Stateless dispatch engine. One per process, shared via [`RouterState`].
///
/// [`RouterState`]: crate::router::RouterState
pub struct Dispatcher {
    /// No client-level timeout — per-attempt timeouts come from the backend
    /// config, and streaming bodies arrive incrementally.
    client: reqwest::Client,
    max_retries: u32,
    deadline: Duration,
}

impl Dispatcher {
    pub fn new(max_retries: u32, deadline: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .expect("failed to build dispatch client"),
            max_retries,
            deadline,
        }
    }

    /// Forward `payload` to `backend`, applying the retry/fallback policy.
    ///
    /// The deadline covers everything up to the last response byte for
    /// aggregated requests, and up to the response headers for streaming
    /// ones — a stream then flows unbounded, paced by the backend.
    pub async fn dispatch(
        &self,
        registry: &BackendRegistry,
        backend: Arc<Backend>,
        payload: &CompletionPayload,
    ) -> Result<DispatchReply, GatewayError> {
        if payload.stream && backend.supports_streaming() {
            return match tokio::time::timeout(self.deadline, self.open_stream(&backend, payload))
                .await
            {
                Ok(result) => result.map_err(Failure::into_error),
                Err(_) => Err(GatewayError::Timeout),
            };
        }

        match tokio::time::timeout(
            self.deadline,
            self.dispatch_aggregated(registry, &backend, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        }
    }

    async fn dispatch_aggregated(
        &self,
        registry: &BackendRegistry,
        primary: &Arc<Backend>,
        payload: &CompletionPayload,
    ) -> Result<DispatchReply, GatewayError> {
        let primary_failure = match self.attempt_with_retries(primary, payload).await {
            Ok(reply) => return Ok(reply),
            Err(Failure::Fatal(e)) => return Err(e),
            Err(Failure::Transient(e)) => e,
        };

        // Primary budget exhausted — one shot at the fallback, if it exists
        // and is dispatchable.
        let Some(fallback) = primary
            .fallback
            .as_deref()
            .and_then(|key| registry.get(key))
            .filter(|b| b.health() != HealthState::Unhealthy)
        else {
            return Err(primary_failure);
        };

        warn!(
            primary = %primary.key,
            fallback = %fallback.key,
            error = %primary_failure,
            "primary dispatch failed — trying fallback"
        );
        self.attempt(&fallback, payload)
            .await
            .map_err(Failure::into_error)
    }

    async fn attempt_with_retries(
        &self,
        backend: &Arc<Backend>,
        payload: &CompletionPayload,
    ) -> Result<DispatchReply, Failure> {
        let mut backoff = BACKOFF_START;
        let mut last_failure: Option<Failure> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                debug!(backend = %backend.key, attempt, "retrying dispatch");
            }
            match self.attempt(backend, payload).await {
                Ok(reply) => return Ok(reply),
                Err(Failure::Fatal(e)) => return Err(Failure::Fatal(e)),
                Err(transient) => last_failure = Some(transient),
            }
        }

        Err(last_failure.unwrap_or_else(|| {
            Failure::Transient(GatewayError::Internal("retry budget was zero".into()))
        }))
    }

    /// One aggregated attempt against one backend.
    async fn attempt(
        &self,
        backend: &Arc<Backend>,
        payload: &CompletionPayload,
    ) -> Result<DispatchReply, Failure> {
        let _permit = backend
            .permits
            .try_acquire()
            .map_err(|_| Failure::Fatal(GatewayError::Overloaded))?;

        let url = backend.completion_url();
        let response = self
            .client
            .post(&url)
            .timeout(backend.timeout)
            .json(&payload.body(false))
            .send()
            .await
            .map_err(|e| {
                Failure::Transient(GatewayError::Backend {
                    status: 502,
                    message: format!("POST {url}: {e}"),
                })
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            Failure::Transient(GatewayError::Backend {
                status: 502,
                message: format!("reading response body: {e}"),
            })
        })?;

        if status.is_client_error() {
            // The backend rejected the request itself; repeating it cannot help.
            return Err(Failure::Fatal(GatewayError::Backend {
                status: status.as_u16(),
                message: text,
            }));
        }
        if !status.is_success() {
            return Err(Failure::Transient(GatewayError::Backend {
                status: status.as_u16(),
                message: text,
            }));
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|e| {
            Failure::Transient(GatewayError::Internal(format!(
                "backend returned unparseable JSON: {e}"
            )))
        })?;
        let result = extract_content(&parsed).ok_or_else(|| {
            Failure::Transient(GatewayError::Internal(
                "backend response carried no completion content".into(),
            ))
        })?;

        Ok(DispatchReply::Completed {
            result,
            backend_key: backend.key.clone(),
            endpoint: backend.base_url.clone(),
        })
    }

    /// Open an SSE passthrough stream. Single attempt.
    async fn open_stream(
        &self,
        backend: &Arc<Backend>,
        payload: &CompletionPayload,
    ) -> Result<DispatchReply, Failure> {
        let permit = Arc::clone(&backend.permits)
            .try_acquire_owned()
            .map_err(|_| Failure::Fatal(GatewayError::Overloaded))?;

        let url = backend.completion_url();
        let response = self
            .client
            .post(&url)
            .json(&payload.body(true))
            .send()
            .await
            .map_err(|e| {
                Failure::Transient(GatewayError::Backend {
                    status: 502,
                    message: format!("POST {url} (streaming): {e}"),
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let error = GatewayError::Backend { status: status.as_u16(), message: text };
            return Err(if status.is_client_error() {
                Failure::Fatal(error)
            } else {
                Failure::Transient(error)
            });
        }

        // The permit rides inside the stream so the slot frees only when the
        // stream is dropped or exhausted.
        let stream = response.bytes_stream().map(move |chunk| {
            let _ = &permit;
            chunk.map_err(anyhow::Error::from)
        });

        Ok(DispatchReply::Stream {
            stream: Box::pin(stream),
            backend_key: backend.key.clone(),
        })
    }
}

/// Pull the completion text out of an OpenAI-style response: chat form
/// first, legacy completions form second.
fn extract_content(value: &Value) -> Option<String> {
    value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .or_else(|| value.pointer("/choices/0/text").and_then(Value::as_str))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry_from_toml(toml: &str) -> BackendRegistry {
        let config: Config = toml::from_str(toml).expect("test config should parse");
        BackendRegistry::from_config(&config)
    }

    fn single_backend(server: &MockServer) -> BackendRegistry {
        registry_from_toml(&format!(
            r#"
            [backends.mock]
            base_url = "{}"
            "#,
            server.uri()
        ))
    }

    fn payload() -> CompletionPayload {
        CompletionPayload {
            query: "Write a haiku about gateways".to_string(),
            model_id: "qwen2.5-7b-instruct".to_string(),
            max_tokens: 100,
            temperature: 0.7,
            stream: false,
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(2, Duration::from_secs(5))
    }

    fn chat_body(content: &str) -> Value {
        json!({ "choices": [{ "message": { "content": content } }] })
    }

    async fn run(
        registry: &BackendRegistry,
        dispatcher: &Dispatcher,
    ) -> Result<DispatchReply, GatewayError> {
        let backend = registry.get("mock").unwrap();
        dispatcher.dispatch(registry, backend, &payload()).await
    }

    // -----------------------------------------------------------------------
    // Happy path
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn dispatch_returns_the_completion_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("Routed and served.")))
            .mount(&server)
            .await;

        let registry = single_backend(&server);
        match run(&registry, &dispatcher()).await.unwrap() {
            DispatchReply::Completed { result, backend_key, endpoint } => {
                assert_eq!(result, "Routed and served.");
                assert_eq!(backend_key, "mock");
                assert_eq!(endpoint, server.uri());
            }
            DispatchReply::Stream { .. } => panic!("expected an aggregated reply"),
        }
    }

    #[tokio::test]
    async fn completion_path_override_is_honored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "choices": [{ "text": "legacy style" }] })),
            )
            .mount(&server)
            .await;

        let registry = registry_from_toml(&format!(
            r#"
            [backends.mock]
            base_url = "{}"
            completion_path = "/v1/completions"
            "#,
            server.uri()
        ));

        match run(&registry, &dispatcher()).await.unwrap() {
            DispatchReply::Completed { result, .. } => assert_eq!(result, "legacy style"),
            DispatchReply::Stream { .. } => panic!("expected an aggregated reply"),
        }
    }

    // -----------------------------------------------------------------------
    // Retry policy
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn transient_5xx_is_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("hiccup"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("second try worked")))
            .mount(&server)
            .await;

        let registry = single_backend(&server);
        match run(&registry, &dispatcher()).await.unwrap() {
            DispatchReply::Completed { result, .. } => assert_eq!(result, "second try worked"),
            DispatchReply::Stream { .. } => panic!("expected an aggregated reply"),
        }
    }

    #[tokio::test]
    async fn client_errors_are_never_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad prompt"))
            .expect(1)
            .mount(&server)
            .await;

        let registry = single_backend(&server);
        match run(&registry, &dispatcher()).await {
            Err(GatewayError::Backend { status, message }) => {
                assert_eq!(status, 422);
                assert_eq!(message, "bad prompt");
            }
            Err(e) => panic!("expected a backend error, got {e}"),
            Ok(_) => panic!("expected a backend error, got a reply"),
        }
        // wiremock verifies expect(1) on drop: no second attempt happened.
    }

    #[tokio::test]
    async fn retry_budget_is_respected() {
        let server = MockServer::start().await;
        // max_retries = 2 → exactly 3 attempts.
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let registry = single_backend(&server);
        let result = run(&registry, &dispatcher()).await;
        assert!(matches!(result, Err(GatewayError::Backend { status: 503, .. })));
    }

    // -----------------------------------------------------------------------
    // Fallback
    // -----------------------------------------------------------------------

    async fn primary_and_fallback(
        primary: &MockServer,
        fallback: &MockServer,
    ) -> BackendRegistry {
        registry_from_toml(&format!(
            r#"
            [backends.mock]
            base_url = "{}"
            fallback = "spare"

            [backends.spare]
            base_url = "{}"
            "#,
            primary.uri(),
            fallback.uri()
        ))
    }

    #[tokio::test]
    async fn fallback_serves_after_primary_budget_is_spent() {
        let primary = MockServer::start().await;
        let fallback = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&primary)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("from the spare")))
            .mount(&fallback)
            .await;

        let registry = primary_and_fallback(&primary, &fallback).await;
        match run(&registry, &dispatcher()).await.unwrap() {
            DispatchReply::Completed { result, backend_key, endpoint } => {
                assert_eq!(result, "from the spare");
                assert_eq!(backend_key, "spare");
                assert_eq!(endpoint, fallback.uri());
            }
            DispatchReply::Stream { .. } => panic!("expected an aggregated reply"),
        }
    }

    #[tokio::test]
    async fn unhealthy_fallback_is_not_attempted() {
        let primary = MockServer::start().await;
        let fallback = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("primary down"))
            .mount(&primary)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("should not serve")))
            .expect(0)
            .mount(&fallback)
            .await;

        let registry = primary_and_fallback(&primary, &fallback).await;
        registry
            .get("spare")
            .unwrap()
            .set_health(HealthState::Unhealthy);

        let result = run(&registry, &dispatcher()).await;
        assert!(matches!(result, Err(GatewayError::Backend { status: 500, .. })));
    }

    // -----------------------------------------------------------------------
    // Bounds
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn exhausted_permits_fail_fast_with_overloaded() {
        let server = MockServer::start().await;
        let registry = registry_from_toml(&format!(
            r#"
            [gateway]
            backend_concurrency_cap = 0

            [backends.mock]
            base_url = "{}"
            "#,
            server.uri()
        ));

        let result = run(&registry, &dispatcher()).await;
        assert!(matches!(result, Err(GatewayError::Overloaded)));
    }

    #[tokio::test]
    async fn deadline_breach_returns_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(chat_body("too late"))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let registry = single_backend(&server);
        let dispatcher = Dispatcher::new(0, Duration::from_millis(50));
        let result = run(&registry, &dispatcher).await;
        assert!(matches!(result, Err(GatewayError::Timeout)));
    }

    // -----------------------------------------------------------------------
    // Content extraction
    // -----------------------------------------------------------------------

    #[test]
    fn extract_content_reads_chat_and_legacy_shapes() {
        assert_eq!(
            extract_content(&chat_body("hello")).as_deref(),
            Some("hello")
        );
        assert_eq!(
            extract_content(&json!({ "choices": [{ "text": "plain" }] })).as_deref(),
            Some("plain")
        );
        assert!(extract_content(&json!({ "choices": [] })).is_none());
        assert!(extract_content(&json!({})).is_none());
    }
}
