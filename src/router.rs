//! Request routing logic — the brain of ai-gateway.
//!
//! Two paths through [`route`]:
//!
//! - **Bypass** (fast path): the request names a session whose cached
//!   binding still fits — context fingerprint unchanged (or carrying no
//!   signal at all), bypass enabled, bound backend not unhealthy. The
//!   binding is touched and reused without re-classification.
//!
//! - **Full route**: everything else. The classifier picks a use case, the
//!   registry supplies a healthy backend (falling back per config), and the
//!   binding is written back so the next turn can bypass.
//!
//! The context fingerprint is only updated on the full path, so a run of
//! bypassed turns keeps comparing against the fingerprint that established
//! the binding.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use uuid::Uuid;

use crate::classifier::classify;
use crate::config::Config;
use crate::context::fingerprint;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::registry::{Backend, BackendRegistry, HealthState};
use crate::session::{SessionBinding, SessionStore};
use crate::stats::Stats;
use crate::usecase::{Modality, UseCase};

/// Shared application state injected into every request handler via
/// [`axum::extract::State`].
pub struct RouterState {
    pub config: Arc<Config>,
    pub registry: Arc<BackendRegistry>,
    pub sessions: Arc<SessionStore>,
    pub stats: Arc<Stats>,
    pub dispatcher: Dispatcher,
    /// Gateway start time — reported by the service banner.
    pub started_at: Instant,
}

impl RouterState {
    pub fn new(config: Arc<Config>) -> Self {
        let registry = Arc::new(BackendRegistry::from_config(&config));
        let sessions = Arc::new(SessionStore::new(
            std::time::Duration::from_secs(config.session.ttl_seconds),
            config.session.store_url.clone(),
        ));
        let dispatcher = Dispatcher::new(
            config.gateway.max_retries,
            std::time::Duration::from_millis(config.gateway.request_deadline_ms),
        );
        Self {
            config,
            registry,
            sessions,
            stats: Arc::new(Stats::new()),
            dispatcher,
            started_at: Instant::now(),
        }
    }
}

/// The routing-relevant slice of an incoming request.
pub struct RouteInput<'a> {
    pub query: &'a str,
    pub session_id: Option<&'a str>,
    pub modality: Modality,
    pub context: &'a BTreeMap<String, String>,
}

/// A fully resolved routing decision, ready for dispatch.
pub struct RoutedRequest {
    pub session_id: String,
    pub use_case: UseCase,
    pub backend: Arc<Backend>,
    pub model_id: String,
    pub confidence: f64,
    pub bypass_used: bool,
    pub new_session: bool,
    pub context_changed: bool,
}

/// Resolve a request to a backend binding, creating or updating the session
/// binding along the way.
///
/// # Errors
/// [`GatewayError::NoHealthyBackend`] when neither the primary nor the
/// fallback backend for the classified use case is dispatchable.
#[tracing::instrument(
    skip(state, input),
    fields(
        session = tracing::field::Empty,
        use_case = tracing::field::Empty,
        bypass = tracing::field::Empty,
    )
)]
pub async fn route(
    state: &RouterState,
    input: RouteInput<'_>,
) -> Result<RoutedRequest, GatewayError> {
    let shape = fingerprint(input.query, input.modality, input.context);
    let span = tracing::Span::current();

    // Fast path: reuse the cached binding when nothing contradicts it.
    let mut prior: Option<SessionBinding> = None;
    if let Some(session_id) = input.session_id {
        if let Some(binding) = state.sessions.get(session_id).await {
            let backend_usable = state
                .registry
                .get(&binding.backend_key)
                .map(|b| b.health() != HealthState::Unhealthy)
                .unwrap_or(false);
            let context_matches = shape.neutral || shape.hash == binding.context_hash;

            if binding.bypass_enabled && context_matches && backend_usable {
                if let Some(touched) = state.sessions.touch(session_id).await {
                    // Write-time invariant: a stored backend_key always
                    // resolves, and we just checked its health above.
                    let backend = state.registry.get(&touched.backend_key).ok_or_else(|| {
                        GatewayError::Internal(format!(
                            "binding references unregistered backend `{}`",
                            touched.backend_key
                        ))
                    })?;

                    span.record("session", session_id);
                    span.record("use_case", touched.use_case.as_str());
                    span.record("bypass", true);
                    debug!(request_count = touched.request_count, "bypass hit");

                    return Ok(RoutedRequest {
                        session_id: touched.session_id.clone(),
                        use_case: touched.use_case,
                        model_id: touched.model_id.clone(),
                        confidence: touched.confidence,
                        backend,
                        bypass_used: true,
                        new_session: false,
                        context_changed: false,
                    });
                }
            }
            prior = Some(binding);
        }
    }

    // Full path: classify, pick a backend, write the binding back.
    let classification = classify(input.query, input.modality, input.context);
    let primary_key = state.config.backend_key_for(classification.use_case);
    let backend = state.registry.select(primary_key).ok_or_else(|| {
        GatewayError::NoHealthyBackend(classification.use_case.to_string())
    })?;
    let model_id = resolve_model_id(&state.config, classification.use_case, &backend);

    let context_changed = prior
        .as_ref()
        .map(|b| !shape.neutral && shape.hash != b.context_hash)
        .unwrap_or(false);

    let session_id = input
        .session_id
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut binding = SessionBinding::fresh(
        session_id,
        classification.use_case,
        backend.key.clone(),
        model_id.clone(),
        classification.confidence,
        shape.hash,
    );
    if let Some(prior) = &prior {
        // An operator-disabled bypass flag survives rebinding, and a
        // signal-free request must not overwrite the fingerprint that
        // established the binding.
        binding.bypass_enabled = prior.bypass_enabled;
        if shape.neutral {
            binding.context_hash = prior.context_hash;
        }
    }
    let (stored, existed) = state.sessions.put(binding).await;

    span.record("session", stored.session_id.as_str());
    span.record("use_case", stored.use_case.as_str());
    span.record("bypass", false);
    debug!(
        backend = %backend.key,
        confidence = classification.confidence,
        signals = ?classification.matched_signals,
        context_changed,
        "full route"
    );

    Ok(RoutedRequest {
        session_id: stored.session_id.clone(),
        use_case: stored.use_case,
        confidence: stored.confidence,
        model_id,
        backend,
        bypass_used: false,
        new_session: !existed,
        context_changed,
    })
}

/// Model id precedence: use-case override, the selected backend's model,
/// the use case's built-in default.
fn resolve_model_id(config: &Config, use_case: UseCase, backend: &Backend) -> String {
    config
        .use_cases
        .get(use_case.as_str())
        .and_then(|route| route.model_id.clone())
        .or_else(|| backend.model_id.clone())
        .unwrap_or_else(|| use_case.default_model_id().to_string())
}
