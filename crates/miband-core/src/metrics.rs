//! Refresh and radio operation counters.
//!
//! Each [`crate::DeviceSession`] keeps a [`SessionMetrics`]; hosts read a
//! serializable [`SessionMetricsSummary`] through
//! [`crate::DeviceSession::metrics`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::RefreshOutcome;

/// Serializable view of one [`OperationCounter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    /// Successful operations.
    pub succeeded: u64,
    /// Failed operations.
    pub failed: u64,
    /// Slowest recorded operation in milliseconds.
    pub max_duration_ms: Option<u64>,
    /// Mean duration in milliseconds.
    pub avg_duration_ms: Option<f64>,
}

impl OperationStats {
    /// Total recorded operations.
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// Lock-free success/failure counter with durations.
#[derive(Debug, Default)]
pub struct OperationCounter {
    succeeded: AtomicU64,
    failed: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl OperationCounter {
    /// Record one operation.
    pub fn record(&self, ok: bool, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Current values.
    pub fn stats(&self) -> OperationStats {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let count = succeeded + failed;
        let total_ms = self.total_ms.load(Ordering::Relaxed);

        OperationStats {
            succeeded,
            failed,
            max_duration_ms: (count > 0).then(|| self.max_ms.load(Ordering::Relaxed)),
            avg_duration_ms: (count > 0).then(|| total_ms as f64 / count as f64),
        }
    }
}

/// Counters kept by a device session.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    /// Individual connect attempts.
    pub connects: OperationCounter,
    /// Individual characteristic reads.
    pub reads: OperationCounter,
    refresh_success: AtomicU64,
    refresh_partial: AtomicU64,
    refresh_failure: AtomicU64,
    cycle_retries: AtomicU64,
    decode_failures: AtomicU64,
    notification_timeouts: AtomicU64,
}

impl SessionMetrics {
    /// Create empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a finished refresh.
    pub fn record_refresh(&self, outcome: RefreshOutcome) {
        let counter = match outcome {
            RefreshOutcome::Success => &self.refresh_success,
            RefreshOutcome::PartialFailure => &self.refresh_partial,
            RefreshOutcome::Failure => &self.refresh_failure,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a whole-cycle restart.
    pub fn record_cycle_retry(&self) {
        self.cycle_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a payload that failed to decode.
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a notification wait that ended without data.
    pub fn record_notification_timeout(&self) {
        self.notification_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters.
    pub fn summary(&self) -> SessionMetricsSummary {
        SessionMetricsSummary {
            refresh_success: self.refresh_success.load(Ordering::Relaxed),
            refresh_partial: self.refresh_partial.load(Ordering::Relaxed),
            refresh_failure: self.refresh_failure.load(Ordering::Relaxed),
            cycle_retries: self.cycle_retries.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            notification_timeouts: self.notification_timeouts.load(Ordering::Relaxed),
            connects: self.connects.stats(),
            reads: self.reads.stats(),
        }
    }
}

/// Serializable summary of [`SessionMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetricsSummary {
    /// Refreshes that produced every requested reading.
    pub refresh_success: u64,
    /// Refreshes that produced some readings.
    pub refresh_partial: u64,
    /// Refreshes that produced nothing.
    pub refresh_failure: u64,
    /// Whole-cycle restarts after link drops.
    pub cycle_retries: u64,
    /// Payloads that failed to decode.
    pub decode_failures: u64,
    /// Notification waits that timed out.
    pub notification_timeouts: u64,
    /// Connect attempts.
    pub connects: OperationStats,
    /// Characteristic reads.
    pub reads: OperationStats,
}

impl SessionMetricsSummary {
    /// Total refreshes of any outcome.
    pub fn refreshes(&self) -> u64 {
        self.refresh_success + self.refresh_partial + self.refresh_failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_counter() {
        let counter = OperationCounter::default();
        assert_eq!(counter.stats(), OperationStats::default());

        counter.record(true, Duration::from_millis(100));
        counter.record(false, Duration::from_millis(300));

        let stats = counter.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.max_duration_ms, Some(300));
        assert_eq!(stats.avg_duration_ms, Some(200.0));
    }

    #[test]
    fn test_refresh_outcomes() {
        let metrics = SessionMetrics::new();
        metrics.record_refresh(RefreshOutcome::Success);
        metrics.record_refresh(RefreshOutcome::Success);
        metrics.record_refresh(RefreshOutcome::Failure);
        metrics.record_cycle_retry();
        metrics.record_decode_failure();

        let summary = metrics.summary();
        assert_eq!(summary.refresh_success, 2);
        assert_eq!(summary.refresh_partial, 0);
        assert_eq!(summary.refresh_failure, 1);
        assert_eq!(summary.refreshes(), 3);
        assert_eq!(summary.cycle_retries, 1);
        assert_eq!(summary.decode_failures, 1);
    }

    #[test]
    fn test_summary_serializes() {
        let metrics = SessionMetrics::new();
        metrics.connects.record(true, Duration::from_millis(1500));
        let json = serde_json::to_value(metrics.summary()).unwrap();
        assert_eq!(json["connects"]["succeeded"], 1);
        assert_eq!(json["connects"]["max_duration_ms"], 1500);
    }
}
