//! Injectable engine observability state.
//!
//! All process-wide counters live here, behind an `Arc` handed to the
//! components that mutate them — no ambient globals. Counters are
//! monotonic; `active_sessions` is a gauge maintained by the workers.
//! `snapshot()` is cheap enough to call from a health endpoint or the
//! shutdown path.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Shared atomic counters for the engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Events pulled from the broker (pre-validation).
    pub events_consumed: AtomicU64,
    /// Events dropped by schema validation.
    pub malformed_events: AtomicU64,
    /// Events dropped by the router.
    pub routing_errors: AtomicU64,
    /// Events ignored as phase anomalies.
    pub anomalies: AtomicU64,
    /// Redelivered events absorbed by the dedupe window.
    pub duplicates: AtomicU64,
    /// Events dropped because their session was already finalized.
    pub late_for_finalized: AtomicU64,
    /// Currently resident sessions across all shards (gauge).
    pub active_sessions: AtomicU64,
    /// Sessions finalized, total.
    pub sessions_finalized: AtomicU64,
    /// Finalized as purchased.
    pub sessions_purchased: AtomicU64,
    /// Finalized as abandoned.
    pub sessions_abandoned: AtomicU64,
    /// Finalized as browsing-only.
    pub sessions_browsing_closed: AtomicU64,
    /// Summaries durably upserted.
    pub summaries_persisted: AtomicU64,
    /// Summaries dead-lettered after retry exhaustion.
    pub dead_letters: AtomicU64,
    /// Intake polls denied by the rate limiter.
    pub rate_limited_polls: AtomicU64,
    /// Broker reconnect attempts.
    pub broker_reconnects: AtomicU64,
}

impl EngineMetrics {
    /// Create zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_consumed: self.events_consumed.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
            routing_errors: self.routing_errors.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            late_for_finalized: self.late_for_finalized.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            sessions_finalized: self.sessions_finalized.load(Ordering::Relaxed),
            sessions_purchased: self.sessions_purchased.load(Ordering::Relaxed),
            sessions_abandoned: self.sessions_abandoned.load(Ordering::Relaxed),
            sessions_browsing_closed: self.sessions_browsing_closed.load(Ordering::Relaxed),
            summaries_persisted: self.summaries_persisted.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            rate_limited_polls: self.rate_limited_polls.load(Ordering::Relaxed),
            broker_reconnects: self.broker_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero (tests, counter rollover drills).
    pub fn reset(&self) {
        self.events_consumed.store(0, Ordering::Relaxed);
        self.malformed_events.store(0, Ordering::Relaxed);
        self.routing_errors.store(0, Ordering::Relaxed);
        self.anomalies.store(0, Ordering::Relaxed);
        self.duplicates.store(0, Ordering::Relaxed);
        self.late_for_finalized.store(0, Ordering::Relaxed);
        self.active_sessions.store(0, Ordering::Relaxed);
        self.sessions_finalized.store(0, Ordering::Relaxed);
        self.sessions_purchased.store(0, Ordering::Relaxed);
        self.sessions_abandoned.store(0, Ordering::Relaxed);
        self.sessions_browsing_closed.store(0, Ordering::Relaxed);
        self.summaries_persisted.store(0, Ordering::Relaxed);
        self.dead_letters.store(0, Ordering::Relaxed);
        self.rate_limited_polls.store(0, Ordering::Relaxed);
        self.broker_reconnects.store(0, Ordering::Relaxed);
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Serializable point-in-time view of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_consumed: u64,
    pub malformed_events: u64,
    pub routing_errors: u64,
    pub anomalies: u64,
    pub duplicates: u64,
    pub late_for_finalized: u64,
    pub active_sessions: u64,
    pub sessions_finalized: u64,
    pub sessions_purchased: u64,
    pub sessions_abandoned: u64,
    pub sessions_browsing_closed: u64,
    pub summaries_persisted: u64,
    pub dead_letters: u64,
    pub rate_limited_polls: u64,
    pub broker_reconnects: u64,
}

/// Coarse engine health, derived from the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Dead letters are accumulating; data loss risk.
    Degraded,
    /// Broker unavailable; intake halted.
    Unhealthy,
}

/// Health/liveness report exposed to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active_sessions: u64,
    pub dead_letters: u64,
    /// Events consumed but not yet acknowledged (lag proxy).
    pub in_flight: u64,
    pub metrics: MetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = EngineMetrics::new();
        EngineMetrics::incr(&metrics.events_consumed);
        EngineMetrics::incr(&metrics.events_consumed);
        EngineMetrics::incr(&metrics.dead_letters);
        let snap = metrics.snapshot();
        assert_eq!(snap.events_consumed, 2);
        assert_eq!(snap.dead_letters, 1);
        assert_eq!(snap.anomalies, 0);
    }

    #[test]
    fn reset_zeroes_everything() {
        let metrics = EngineMetrics::new();
        EngineMetrics::incr(&metrics.sessions_finalized);
        metrics.active_sessions.store(9, Ordering::Relaxed);
        metrics.reset();
        let snap = metrics.snapshot();
        assert_eq!(snap.sessions_finalized, 0);
        assert_eq!(snap.active_sessions, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let snap = EngineMetrics::new().snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn health_status_orders_by_severity() {
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Unhealthy);
    }
}
