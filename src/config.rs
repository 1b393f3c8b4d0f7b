//! Configuration types for ai-gateway.
//!
//! Config is loaded once at startup from a TOML file, overridden by
//! environment variables, and validated before the server opens any ports.
//! Invalid configs are rejected with a clear error rather than silently
//! falling back to defaults. The backend set is immutable for the life of
//! the process — there is no hot-add.
//!
//! # Example
//! ```toml
//! [gateway]
//! port = 8000
//!
//! [backends.text-gen]
//! base_url = "http://vllm-text:8001"
//! model_id = "qwen2.5-7b-instruct"
//! fallback = "text-gen-spare"
//!
//! [backends.speech]
//! base_url = "http://whisper:8002"
//! model_id = "whisper-large-v3"
//!
//! [use_cases.stt]
//! backend = "speech"
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::usecase::UseCase;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Named inference backends, keyed by the `backend_key` the registry
    /// and session bindings refer to.
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// Per-use-case routing overrides. Absent use cases fall back to their
    /// built-in default backend key.
    #[serde(default)]
    pub use_cases: HashMap<String, UseCaseRoute>,
}

impl Config {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.apply_env_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build from environment alone — used when no config file is present.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        config.apply_env_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the recognized environment overrides.
    ///
    /// `get` abstracts the environment so tests can inject values without
    /// mutating process state.
    pub fn apply_env_from(
        &mut self,
        get: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        fn parse<T: std::str::FromStr>(name: &str, raw: String) -> anyhow::Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {name}={raw}: {e}"))
        }

        if let Some(raw) = get("AIG_PORT") {
            self.gateway.port = parse("AIG_PORT", raw)?;
        }
        if let Some(raw) = get("REQUEST_DEADLINE_MS") {
            self.gateway.request_deadline_ms = parse("REQUEST_DEADLINE_MS", raw)?;
        }
        if let Some(raw) = get("MAX_RETRIES") {
            self.gateway.max_retries = parse("MAX_RETRIES", raw)?;
        }
        if let Some(raw) = get("BACKEND_CONCURRENCY_CAP") {
            self.gateway.backend_concurrency_cap = parse("BACKEND_CONCURRENCY_CAP", raw)?;
        }
        if let Some(raw) = get("SESSION_TTL_SECONDS") {
            self.session.ttl_seconds = parse("SESSION_TTL_SECONDS", raw)?;
        }
        if let Some(raw) = get("SESSION_STORE_URL") {
            self.session.store_url = Some(raw).filter(|s| !s.is_empty());
        }
        if let Some(raw) = get("PROBE_INTERVAL_SECONDS") {
            self.health.probe_interval_seconds = parse("PROBE_INTERVAL_SECONDS", raw)?;
        }
        if let Some(raw) = get("BACKENDS") {
            let entries: Vec<BackendEnvEntry> =
                serde_json::from_str(&raw).context("parsing BACKENDS as a JSON list")?;
            self.backends = entries
                .into_iter()
                .map(|e| {
                    (
                        e.key,
                        BackendConfig {
                            base_url: e.base_url,
                            model_id: e.model_id,
                            timeout_ms: e.timeout_ms,
                            supported_formats: e.supported_formats,
                            completion_path: defaults::completion_path(),
                            fallback: None,
                        },
                    )
                })
                .collect();
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.gateway.port != 0, "gateway port must be non-zero");

        // Every use-case override must name a real use case and a known backend
        let valid_names: Vec<&str> = UseCase::ALL.iter().map(|u| u.as_str()).collect();
        for (name, route) in &self.use_cases {
            anyhow::ensure!(
                valid_names.contains(&name.as_str()),
                "[use_cases.{name}] is not a known use case (expected one of {valid_names:?})"
            );
            anyhow::ensure!(
                self.backends.contains_key(&route.backend),
                "[use_cases.{name}] references unknown backend `{}`",
                route.backend
            );
        }

        // Every fallback must resolve and must not self-reference
        for (key, backend) in &self.backends {
            if let Some(fallback) = &backend.fallback {
                anyhow::ensure!(
                    fallback != key,
                    "backend `{key}` lists itself as its fallback"
                );
                anyhow::ensure!(
                    self.backends.contains_key(fallback),
                    "backend `{key}` references unknown fallback `{fallback}`"
                );
            }
        }

        Ok(())
    }

    /// Backend key the given use case routes to: config override first,
    /// built-in default otherwise.
    pub fn backend_key_for(&self, use_case: UseCase) -> &str {
        self.use_cases
            .get(use_case.as_str())
            .map(|r| r.backend.as_str())
            .unwrap_or_else(|| use_case.default_backend_key())
    }

    /// Model id the given use case is served with, honoring overrides in
    /// precedence order: use-case override, backend model, built-in default.
    pub fn model_id_for(&self, use_case: UseCase) -> String {
        if let Some(route) = self.use_cases.get(use_case.as_str()) {
            if let Some(model) = &route.model_id {
                return model.clone();
            }
        }
        self.backends
            .get(self.backend_key_for(use_case))
            .and_then(|b| b.model_id.clone())
            .unwrap_or_else(|| use_case.default_model_id().to_string())
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen port for the HTTP API (default: 8000).
    pub port: u16,

    /// Whole-request deadline, including retries and fallback (default: 30 000 ms).
    pub request_deadline_ms: u64,

    /// Additional attempts after the first failure (default: 2).
    ///
    /// Waits 100 ms before the first retry, doubling per attempt. Only
    /// transient errors (connect failures, 5xx) are retried; 4xx responses
    /// are surfaced to the caller untouched.
    pub max_retries: u32,

    /// Maximum in-flight dispatches per backend (default: 64). When the cap
    /// is reached new dispatches fail fast with `Overloaded` instead of
    /// queueing.
    pub backend_concurrency_cap: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            request_deadline_ms: defaults::request_deadline_ms(),
            max_retries: defaults::max_retries(),
            backend_concurrency_cap: defaults::backend_concurrency_cap(),
        }
    }
}

/// Session affinity settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle lifetime of a session binding (default: 1 800 s).
    pub ttl_seconds: u64,

    /// How often the background sweeper evicts expired bindings (default: 60 s).
    pub sweep_interval_seconds: u64,

    /// Base URL of an external key/value store to mirror bindings into.
    /// Unset means purely in-process state — affinity does not survive a
    /// restart.
    pub store_url: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: defaults::session_ttl_seconds(),
            sweep_interval_seconds: defaults::sweep_interval_seconds(),
            store_url: None,
        }
    }
}

/// Backend health probing settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between probe rounds (default: 10).
    pub probe_interval_seconds: u64,

    /// Per-probe timeout (default: 2 000 ms).
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_seconds: defaults::probe_interval_seconds(),
            probe_timeout_ms: defaults::probe_timeout_ms(),
        }
    }
}

/// A named inference backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base URL, without a trailing slash or `/v1`.
    pub base_url: String,

    /// Model identifier sent in completion requests. Falls back to the use
    /// case's built-in default when unset.
    #[serde(default)]
    pub model_id: Option<String>,

    /// Request timeout for a single attempt (default: 30 000 ms).
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Response formats this backend can produce. `"sse"` enables streaming
    /// passthrough.
    #[serde(default = "defaults::supported_formats")]
    pub supported_formats: Vec<String>,

    /// Completion endpoint path (default: `/v1/chat/completions`).
    #[serde(default = "defaults::completion_path")]
    pub completion_path: String,

    /// Backend key tried once when this backend fails or is unhealthy.
    #[serde(default)]
    pub fallback: Option<String>,
}

/// Routing override for one use case.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UseCaseRoute {
    /// Backend key this use case routes to (must exist in `[backends]`).
    pub backend: String,

    /// Model id override for this use case.
    #[serde(default)]
    pub model_id: Option<String>,
}

/// Shape of one entry in the `BACKENDS` environment variable (JSON list).
#[derive(Debug, Deserialize)]
struct BackendEnvEntry {
    key: String,
    base_url: String,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default = "defaults::timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "defaults::supported_formats")]
    supported_formats: Vec<String>,
}

mod defaults {
    pub fn port() -> u16 { 8000 }
    pub fn request_deadline_ms() -> u64 { 30_000 }
    pub fn max_retries() -> u32 { 2 }
    pub fn backend_concurrency_cap() -> usize { 64 }
    pub fn session_ttl_seconds() -> u64 { 1_800 }
    pub fn sweep_interval_seconds() -> u64 { 60 }
    pub fn probe_interval_seconds() -> u64 { 10 }
    pub fn probe_timeout_ms() -> u64 { 2_000 }
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn supported_formats() -> Vec<String> { vec!["json".to_string()] }
    pub fn completion_path() -> String { "/v1/chat/completions".to_string() }
}
