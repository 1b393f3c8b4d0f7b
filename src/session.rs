//! Session bindings and the store that keeps them.
//!
//! A [`SessionBinding`] is the cached routing decision for one conversation.
//! The store is a sharded concurrent map keyed by session id: every mutation
//! happens under that key's entry guard, so read-modify-write is atomic per
//! session and `request_count` increments are never lost. Different session
//! ids never contend on a common lock.
//!
//! TTL is enforced twice: lazily on read (an expired binding is deleted and
//! reported absent) and by the periodic sweeper driven from `main`.
//!
//! When a `SESSION_STORE_URL` is configured, bindings are mirrored to an
//! external HTTP key/value store (`PUT`/`GET`/`DELETE {base}/sessions/{id}`)
//! so affinity survives a process restart. Mirror failures never fail a
//! request: the store flips to `degraded`, keeps serving from process
//! memory, and recovers on the next successful mirror call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::usecase::UseCase;

/// Timeout for a single mirror round-trip. Kept short — the mirror is
/// best-effort and must not stall the request path.
const MIRROR_TIMEOUT: Duration = Duration::from_secs(2);

/// The cached routing decision for one conversation.
#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub session_id: String,
    pub use_case: UseCase,
    pub backend_key: String,
    pub model_id: String,
    pub confidence: f64,
    pub context_hash: u64,
    pub request_count: u64,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub bypass_enabled: bool,
}

impl SessionBinding {
    /// A first-request binding: count 1, both timestamps now, bypass on.
    pub fn fresh(
        session_id: String,
        use_case: UseCase,
        backend_key: String,
        model_id: String,
        confidence: f64,
        context_hash: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            use_case,
            backend_key,
            model_id,
            confidence,
            context_hash,
            request_count: 1,
            created_at: now,
            last_accessed_at: now,
            bypass_enabled: true,
        }
    }

    /// External view for `GET /sessions/{id}` — everything but the hash.
    pub fn view(&self) -> SessionView {
        let now = Instant::now();
        SessionView {
            session_id: self.session_id.clone(),
            use_case: self.use_case,
            backend_key: self.backend_key.clone(),
            model_id: self.model_id.clone(),
            confidence: self.confidence,
            request_count: self.request_count,
            age_seconds: now.duration_since(self.created_at).as_secs(),
            idle_seconds: now.duration_since(self.last_accessed_at).as_secs(),
            bypass_enabled: self.bypass_enabled,
        }
    }
}

/// Serializable binding view. Timestamps are exposed as ages so the
/// response carries no process-local clock values.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub use_case: UseCase,
    pub backend_key: String,
    pub model_id: String,
    pub confidence: f64,
    pub request_count: u64,
    pub age_seconds: u64,
    pub idle_seconds: u64,
    pub bypass_enabled: bool,
}

/// Reachability of the external mirror, reported under `session_store`
/// in `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStoreStatus {
    Connected,
    Degraded,
}

impl SessionStoreStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        }
    }
}

/// Sharded session store with TTL and optional external mirroring.
pub struct SessionStore {
    ttl: Duration,
    sessions: DashMap<String, SessionBinding>,
    mirror: Option<Mirror>,
    mirror_degraded: AtomicBool,
}

impl SessionStore {
    pub fn new(ttl: Duration, store_url: Option<String>) -> Self {
        let mirror = store_url.map(|base_url| Mirror {
            client: reqwest::Client::builder()
                .timeout(MIRROR_TIMEOUT)
                .build()
                .expect("failed to build session mirror client"),
            base_url: base_url.trim_end_matches('/').to_string(),
        });
        Self {
            ttl,
            sessions: DashMap::new(),
            mirror,
            mirror_degraded: AtomicBool::new(false),
        }
    }

    /// Current mirror reachability. `Connected` when no mirror is configured
    /// — purely in-process state has nothing to lose contact with.
    pub fn status(&self) -> SessionStoreStatus {
        if self.mirror.is_some() && self.mirror_degraded.load(Ordering::Relaxed) {
            SessionStoreStatus::Degraded
        } else {
            SessionStoreStatus::Connected
        }
    }

    /// Look up a binding. Expired bindings are deleted and reported absent.
    ///
    /// On a local miss with a mirror configured, the mirror is consulted so
    /// affinity survives restarts.
    pub async fn get(&self, session_id: &str) -> Option<SessionBinding> {
        self.expire_if_stale(session_id);
        if let Some(found) = self.sessions.get(session_id) {
            return Some(found.clone());
        }

        let mirror = self.mirror.as_ref()?;
        match mirror.fetch(session_id).await {
            Ok(stored) => {
                self.mirror_degraded.store(false, Ordering::Relaxed);
                let binding = stored?.into_binding(self.ttl)?;
                debug!(session = %session_id, "restored session binding from mirror");
                self.sessions.insert(session_id.to_string(), binding.clone());
                Some(binding)
            }
            Err(e) => {
                self.note_mirror_failure(&e);
                None
            }
        }
    }

    /// Fast-path access: bump `request_count`, refresh `last_accessed_at`,
    /// and return the updated binding. `None` if absent or expired.
    pub async fn touch(&self, session_id: &str) -> Option<SessionBinding> {
        self.expire_if_stale(session_id);
        let touched = {
            let mut entry = self.sessions.get_mut(session_id)?;
            entry.request_count += 1;
            entry.last_accessed_at = Instant::now();
            entry.clone()
        };
        self.mirror_store(&touched).await;
        Some(touched)
    }

    /// Upsert a binding, serialized per session id under the entry guard.
    ///
    /// When the session already exists (and is not expired) the stored
    /// binding keeps its `created_at` and takes `request_count + 1`, so
    /// concurrent writers can never lose an increment. Returns the stored
    /// binding and whether the session previously existed.
    pub async fn put(&self, binding: SessionBinding) -> (SessionBinding, bool) {
        let now = Instant::now();
        let (stored, existed) = match self.sessions.entry(binding.session_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get(), now) {
                    occupied.insert(binding.clone());
                    (binding, false)
                } else {
                    let current = occupied.get_mut();
                    current.use_case = binding.use_case;
                    current.backend_key = binding.backend_key;
                    current.model_id = binding.model_id;
                    current.confidence = binding.confidence;
                    current.context_hash = binding.context_hash;
                    current.bypass_enabled = binding.bypass_enabled;
                    current.request_count += 1;
                    current.last_accessed_at = now;
                    (current.clone(), true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(binding.clone());
                (binding, false)
            }
        };
        self.mirror_store(&stored).await;
        (stored, existed)
    }

    /// Delete a binding. Idempotent; returns whether one existed.
    pub async fn delete(&self, session_id: &str) -> bool {
        let existed = self.sessions.remove(session_id).is_some();
        if let Some(mirror) = &self.mirror {
            match mirror.remove(session_id).await {
                Ok(()) => self.mirror_degraded.store(false, Ordering::Relaxed),
                Err(e) => self.note_mirror_failure(&e),
            }
        }
        existed
    }

    /// Evict every binding idle past the TTL. Returns the eviction count.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted: Vec<String> = Vec::new();
        self.sessions.retain(|id, binding| {
            if now.duration_since(binding.last_accessed_at) > self.ttl {
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });

        if let Some(mirror) = &self.mirror {
            for id in &evicted {
                if let Err(e) = mirror.remove(id).await {
                    self.note_mirror_failure(&e);
                }
            }
        }

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "swept expired session bindings");
        }
        evicted.len()
    }

    fn is_expired(&self, binding: &SessionBinding, now: Instant) -> bool {
        now.duration_since(binding.last_accessed_at) > self.ttl
    }

    fn expire_if_stale(&self, session_id: &str) {
        let now = Instant::now();
        self.sessions
            .remove_if(session_id, |_, binding| self.is_expired(binding, now));
    }

    async fn mirror_store(&self, binding: &SessionBinding) {
        if let Some(mirror) = &self.mirror {
            match mirror.store(binding, self.ttl).await {
                Ok(()) => self.mirror_degraded.store(false, Ordering::Relaxed),
                Err(e) => self.note_mirror_failure(&e),
            }
        }
    }

    fn note_mirror_failure(&self, error: &anyhow::Error) {
        if !self.mirror_degraded.swap(true, Ordering::Relaxed) {
            warn!(error = %error, "session mirror unreachable — degrading to in-process state");
        }
    }
}

/// Thin client for the external session KV.
struct Mirror {
    client: reqwest::Client,
    base_url: String,
}

/// Wire form of a binding. `Instant`s travel as ages relative to the
/// writing process; the reader reconstructs its own timestamps.
#[derive(Debug, Serialize, Deserialize)]
struct StoredBinding {
    session_id: String,
    use_case: UseCase,
    backend_key: String,
    model_id: String,
    confidence: f64,
    context_hash: u64,
    request_count: u64,
    age_seconds: u64,
    idle_seconds: u64,
    bypass_enabled: bool,
}

impl StoredBinding {
    fn from_binding(binding: &SessionBinding) -> Self {
        let now = Instant::now();
        Self {
            session_id: binding.session_id.clone(),
            use_case: binding.use_case,
            backend_key: binding.backend_key.clone(),
            model_id: binding.model_id.clone(),
            confidence: binding.confidence,
            context_hash: binding.context_hash,
            request_count: binding.request_count,
            age_seconds: now.duration_since(binding.created_at).as_secs(),
            idle_seconds: now.duration_since(binding.last_accessed_at).as_secs(),
            bypass_enabled: binding.bypass_enabled,
        }
    }

    /// `None` if the stored binding has already outlived the TTL.
    fn into_binding(self, ttl: Duration) -> Option<SessionBinding> {
        let idle = Duration::from_secs(self.idle_seconds);
        if idle > ttl {
            return None;
        }
        let now = Instant::now();
        Some(SessionBinding {
            session_id: self.session_id,
            use_case: self.use_case,
            backend_key: self.backend_key,
            model_id: self.model_id,
            confidence: self.confidence,
            context_hash: self.context_hash,
            request_count: self.request_count,
            created_at: now
                .checked_sub(Duration::from_secs(self.age_seconds))
                .unwrap_or(now),
            last_accessed_at: now.checked_sub(idle).unwrap_or(now),
            bypass_enabled: self.bypass_enabled,
        })
    }
}

impl Mirror {
    fn url(&self, session_id: &str) -> String {
        format!("{}/sessions/{session_id}", self.base_url)
    }

    async fn fetch(&self, session_id: &str) -> anyhow::Result<Option<StoredBinding>> {
        let response = self.client.get(self.url(session_id)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        anyhow::ensure!(
            response.status().is_success(),
            "mirror GET returned HTTP {}",
            response.status()
        );
        Ok(Some(response.json().await?))
    }

    async fn store(&self, binding: &SessionBinding, ttl: Duration) -> anyhow::Result<()> {
        let response = self
            .client
            .put(self.url(&binding.session_id))
            .query(&[("ttl_seconds", ttl.as_secs())])
            .json(&StoredBinding::from_binding(binding))
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "mirror PUT returned HTTP {}",
            response.status()
        );
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> anyhow::Result<()> {
        let response = self.client.delete(self.url(session_id)).send().await?;
        anyhow::ensure!(
            response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND,
            "mirror DELETE returned HTTP {}",
            response.status()
        );
        Ok(())
    }
}
