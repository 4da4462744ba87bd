use crate::telemetry::log::DropReason;
use serde::Serialize;
use std::sync::Mutex;

pub struct MetricsRecorder {
    inner: Mutex<MetricsSnapshot>,
}

/// Counters accumulated over the life of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_accepted: u64,
    pub samples_written: u64,
    pub dropped_out_of_order: u64,
    pub rejected_non_finite: u64,
    pub rejected_capacity: u64,
    pub rejected_malformed: u64,
    pub changes_applied: u64,
    pub changes_failed: u64,
    pub empty_pulls: u64,
}

impl MetricsSnapshot {
    pub fn chunks_dropped(&self) -> u64 {
        self.dropped_out_of_order
            + self.rejected_non_finite
            + self.rejected_capacity
            + self.rejected_malformed
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut metrics) = self.inner.lock() {
            apply(&mut metrics);
        }
    }

    pub fn record_accepted(&self, samples: usize) {
        self.update(|m| {
            m.chunks_accepted += 1;
            m.samples_written += samples as u64;
        });
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.update(|m| match reason {
            DropReason::OutOfOrder => m.dropped_out_of_order += 1,
            DropReason::NonFinite => m.rejected_non_finite += 1,
            DropReason::CapacityExceeded => m.rejected_capacity += 1,
            DropReason::Malformed => m.rejected_malformed += 1,
        });
    }

    pub fn record_change_applied(&self) {
        self.update(|m| m.changes_applied += 1);
    }

    pub fn record_change_failed(&self) {
        self.update(|m| m.changes_failed += 1);
    }

    pub fn record_empty_pull(&self) {
        self.update(|m| m.empty_pulls += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        if let Ok(metrics) = self.inner.lock() {
            metrics.clone()
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
