//! Process-wide request counters and timing averages.
//!
//! Counters are plain atomics incremented exactly once per request on the
//! response path. Timing averages are exponentially weighted means behind a
//! single short-lived mutex — the critical section is four float updates.
//! `/stats` reads a snapshot with no cross-field consistency guarantee
//! beyond "each field reflects some past moment".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// EWMA smoothing factor: each sample contributes 10 %.
const ALPHA: f64 = 0.1;

/// Per-request timing observations, in seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTimings {
    pub routing_secs: f64,
    pub inference_secs: f64,
    pub total_secs: f64,
    pub bypass: bool,
    pub new_session: bool,
    pub context_changed: bool,
}

#[derive(Debug, Default)]
struct Averages {
    routing: Option<f64>,
    bypass: Option<f64>,
    inference: Option<f64>,
    total: Option<f64>,
}

fn ewma(current: &mut Option<f64>, sample: f64) {
    *current = Some(match *current {
        Some(avg) => avg * (1.0 - ALPHA) + sample * ALPHA,
        None => sample,
    });
}

/// Shared stats collector. Cheap to update on the hot path.
#[derive(Default)]
pub struct Stats {
    total_requests: AtomicU64,
    bypass_requests: AtomicU64,
    full_routing_requests: AtomicU64,
    session_creations: AtomicU64,
    context_changes: AtomicU64,
    averages: Mutex<Averages>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request. Called exactly once per accepted
    /// request, regardless of downstream outcome.
    pub fn record(&self, timings: RequestTimings) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if timings.bypass {
            self.bypass_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.full_routing_requests.fetch_add(1, Ordering::Relaxed);
        }
        if timings.new_session {
            self.session_creations.fetch_add(1, Ordering::Relaxed);
        }
        if timings.context_changed {
            self.context_changes.fetch_add(1, Ordering::Relaxed);
        }

        let mut averages = self
            .averages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if timings.bypass {
            ewma(&mut averages.bypass, timings.routing_secs);
        } else {
            ewma(&mut averages.routing, timings.routing_secs);
        }
        if timings.inference_secs > 0.0 {
            ewma(&mut averages.inference, timings.inference_secs);
        }
        ewma(&mut averages.total, timings.total_secs);
    }

    /// Point-in-time view for `/stats`.
    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let bypass = self.bypass_requests.load(Ordering::Relaxed);
        let averages = self
            .averages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        StatsSnapshot {
            total_requests: total,
            bypass_requests: bypass,
            full_routing_requests: self.full_routing_requests.load(Ordering::Relaxed),
            session_creations: self.session_creations.load(Ordering::Relaxed),
            context_changes: self.context_changes.load(Ordering::Relaxed),
            avg_routing_time: averages.routing.unwrap_or(0.0),
            avg_bypass_time: averages.bypass.unwrap_or(0.0),
            avg_inference_time: averages.inference.unwrap_or(0.0),
            avg_total_time: averages.total.unwrap_or(0.0),
            bypass_rate_percent: if total == 0 {
                0.0
            } else {
                bypass as f64 / total as f64 * 100.0
            },
        }
    }
}

/// Serializable `/stats` body.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub bypass_requests: u64,
    pub full_routing_requests: u64,
    pub session_creations: u64,
    pub context_changes: u64,
    pub avg_routing_time: f64,
    pub avg_bypass_time: f64,
    pub avg_inference_time: f64,
    pub avg_total_time: f64,
    pub bypass_rate_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_route_timings(routing: f64) -> RequestTimings {
        RequestTimings {
            routing_secs: routing,
            inference_secs: 0.5,
            total_secs: routing + 0.5,
            bypass: false,
            new_session: false,
            context_changed: false,
        }
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    #[test]
    fn counters_split_bypass_and_full_routing() {
        let stats = Stats::new();
        stats.record(RequestTimings {
            bypass: true,
            ..Default::default()
        });
        stats.record(full_route_timings(0.01));
        stats.record(full_route_timings(0.01));

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.bypass_requests, 1);
        assert_eq!(snap.full_routing_requests, 2);
    }

    #[test]
    fn session_creation_and_context_change_are_counted() {
        let stats = Stats::new();
        stats.record(RequestTimings {
            new_session: true,
            ..Default::default()
        });
        stats.record(RequestTimings {
            context_changed: true,
            ..Default::default()
        });

        let snap = stats.snapshot();
        assert_eq!(snap.session_creations, 1);
        assert_eq!(snap.context_changes, 1);
    }

    #[test]
    fn bypass_rate_is_a_percentage() {
        let stats = Stats::new();
        for i in 0..4 {
            stats.record(RequestTimings {
                bypass: i < 3,
                ..Default::default()
            });
        }
        let snap = stats.snapshot();
        assert!((snap.bypass_rate_percent - 75.0).abs() < 1e-9);
    }

    #[test]
    fn fresh_snapshot_is_all_zero() {
        let snap = Stats::new().snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.bypass_rate_percent, 0.0);
        assert_eq!(snap.avg_total_time, 0.0);
    }

    // -----------------------------------------------------------------------
    // EWMA
    // -----------------------------------------------------------------------

    #[test]
    fn first_sample_initializes_the_average() {
        let stats = Stats::new();
        stats.record(full_route_timings(0.2));
        let snap = stats.snapshot();
        assert!((snap.avg_routing_time - 0.2).abs() < 1e-9);
    }

    #[test]
    fn ewma_moves_toward_new_samples() {
        let stats = Stats::new();
        stats.record(full_route_timings(0.1));
        stats.record(full_route_timings(0.2));
        let snap = stats.snapshot();
        // 0.1 * 0.9 + 0.2 * 0.1 = 0.11
        assert!((snap.avg_routing_time - 0.11).abs() < 1e-9);
    }

    #[test]
    fn bypass_timings_feed_the_bypass_average_only() {
        let stats = Stats::new();
        stats.record(RequestTimings {
            routing_secs: 0.003,
            total_secs: 0.4,
            bypass: true,
            ..Default::default()
        });
        let snap = stats.snapshot();
        assert!((snap.avg_bypass_time - 0.003).abs() < 1e-9);
        assert_eq!(snap.avg_routing_time, 0.0);
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_records_lose_no_counts() {
        let stats = std::sync::Arc::new(Stats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = std::sync::Arc::clone(&stats);
            handles.push(std::thread::spawn(move || {
                for _ in 0..250 {
                    stats.record(full_route_timings(0.01));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().total_requests, 2000);
    }
}
