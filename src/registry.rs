//! Backend registry and health tracking.
//!
//! The registry is built once from config at startup and never mutated —
//! the set of backends is immutable for the life of the process. The only
//! mutable state is per-backend health, written by the single background
//! prober and read lock-free on the hot path via atomics. Readers may
//! observe health up to one probe interval stale; the dispatcher's own
//! error handling covers the gap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, Config};

/// Consecutive failed probes after which a backend is `Unhealthy`.
const UNHEALTHY_AFTER: u32 = 3;

/// Dispatchability of a backend.
///
/// `Degraded` backends still receive traffic; only `Unhealthy` ones are
/// routed around. Variant order is severity order, so `max` picks the
/// worst of two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Healthy,
            1 => Self::Degraded,
            _ => Self::Unhealthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured inference backend plus its runtime state.
pub struct Backend {
    pub key: String,
    pub base_url: String,
    pub model_id: Option<String>,
    pub timeout: Duration,
    pub supported_formats: Vec<String>,
    pub completion_path: String,
    pub fallback: Option<String>,

    /// Dispatch permits — the per-backend concurrency cap. `Arc` so a
    /// streaming response can hold its permit for the stream's lifetime.
    pub permits: Arc<Semaphore>,

    // Single writer (the prober, or tests); many lock-free readers.
    health: AtomicU8,
    consecutive_failures: AtomicU32,
    last_latency_ms: AtomicU64,
}

impl Backend {
    fn from_config(key: &str, cfg: &BackendConfig, concurrency_cap: usize) -> Self {
        Self {
            key: key.to_string(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model_id: cfg.model_id.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
            supported_formats: cfg.supported_formats.clone(),
            completion_path: cfg.completion_path.clone(),
            fallback: cfg.fallback.clone(),
            permits: Arc::new(Semaphore::new(concurrency_cap)),
            health: AtomicU8::new(HealthState::Healthy.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            last_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Force a health state. Used by tests and operational tooling; the
    /// prober will overwrite it on its next round.
    pub fn set_health(&self, state: HealthState) {
        self.health.store(state.as_u8(), Ordering::Release);
    }

    /// Apply one probe outcome. Transitions: any → healthy on success;
    /// healthy → degraded on the first failure; degraded → unhealthy on
    /// the third consecutive failure.
    pub fn record_probe(&self, success: bool, latency_ms: u64) {
        if success {
            self.consecutive_failures.store(0, Ordering::Release);
            self.last_latency_ms.store(latency_ms, Ordering::Release);
            let previous = self.health.swap(HealthState::Healthy.as_u8(), Ordering::AcqRel);
            if previous != HealthState::Healthy.as_u8() {
                info!(backend = %self.key, "backend recovered");
            }
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            let next = if failures >= UNHEALTHY_AFTER {
                HealthState::Unhealthy
            } else {
                HealthState::Degraded
            };
            let previous = self.health.swap(next.as_u8(), Ordering::AcqRel);
            if previous != next.as_u8() {
                warn!(backend = %self.key, failures, state = %next, "backend health transition");
            }
        }
    }

    /// Latency of the most recent successful probe, if any.
    pub fn last_probe_latency_ms(&self) -> Option<u64> {
        match self.last_latency_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn supports_streaming(&self) -> bool {
        self.supported_formats.iter().any(|f| f == "sse")
    }

    pub fn completion_url(&self) -> String {
        format!("{}{}", self.base_url, self.completion_path)
    }
}

/// Immutable map of backend key → [`Backend`].
pub struct BackendRegistry {
    backends: HashMap<String, Arc<Backend>>,
}

impl BackendRegistry {
    pub fn from_config(config: &Config) -> Self {
        let backends = config
            .backends
            .iter()
            .map(|(key, cfg)| {
                (
                    key.clone(),
                    Arc::new(Backend::from_config(
                        key,
                        cfg,
                        config.gateway.backend_concurrency_cap,
                    )),
                )
            })
            .collect();
        Self { backends }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Backend>> {
        self.backends.get(key).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Backend>)> {
        self.backends.iter()
    }

    /// Pick a dispatchable backend for the given primary key: the primary
    /// unless it is unhealthy, else its configured fallback unless that is
    /// unhealthy too. `None` means no healthy candidate exists.
    pub fn select(&self, primary_key: &str) -> Option<Arc<Backend>> {
        let primary = self.get(primary_key)?;
        if primary.health() != HealthState::Unhealthy {
            return Some(primary);
        }
        let fallback = self.get(primary.fallback.as_deref()?)?;
        if fallback.health() != HealthState::Unhealthy {
            debug!(
                primary = %primary_key,
                fallback = %fallback.key,
                "primary unhealthy — selecting fallback"
            );
            return Some(fallback);
        }
        None
    }

    /// Probe every backend once and apply the health transitions.
    ///
    /// A backend is considered up if either its `/health` endpoint or its
    /// OpenAI-style `/v1/models` listing answers 2xx within the probe
    /// timeout.
    pub async fn probe_all(&self, client: &reqwest::Client) {
        for backend in self.backends.values() {
            let started = Instant::now();
            let up = probe_backend(client, &backend.base_url).await;
            backend.record_probe(up, started.elapsed().as_millis() as u64);
        }
    }
}

async fn probe_backend(client: &reqwest::Client, base_url: &str) -> bool {
    for path in ["/health", "/v1/models"] {
        let url = format!("{base_url}{path}");
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => {
                debug!(%url, status = %response.status(), "probe endpoint refused");
            }
            Err(e) => {
                debug!(%url, error = %e, "probe request failed");
            }
        }
    }
    false
}

/// Background task: probe all backends every `interval`.
pub async fn run_prober(registry: Arc<BackendRegistry>, interval: Duration, probe_timeout: Duration) {
    let client = match reqwest::Client::builder().timeout(probe_timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "failed to build probe client — health probing disabled");
            return;
        }
    };

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        registry.probe_all(&client).await;
    }
}
