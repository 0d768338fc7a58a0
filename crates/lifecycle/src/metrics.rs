//! Prometheus metrics for lifecycle operations

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

pub struct LifecycleMetrics {
    /// Verification verdicts by outcome.
    pub verdicts_total: IntCounterVec,
    /// Attempt deadline expiries.
    pub timeouts_total: IntCounter,
    /// Subtask assignments handed to providers.
    pub assignments_total: IntCounter,
    /// Inbound frames dropped, by reason.
    pub dropped_frames_total: IntCounterVec,
}

impl LifecycleMetrics {
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let verdicts_total = IntCounterVec::new(
            Opts::new(
                "taskgrid_lifecycle_verdicts_total",
                "Total verification verdicts by outcome",
            ),
            &["verdict"],
        )?;

        let timeouts_total = IntCounter::new(
            "taskgrid_lifecycle_timeouts_total",
            "Total subtask attempt deadline expiries",
        )?;

        let assignments_total = IntCounter::new(
            "taskgrid_lifecycle_assignments_total",
            "Total subtask assignments",
        )?;

        let dropped_frames_total = IntCounterVec::new(
            Opts::new(
                "taskgrid_lifecycle_dropped_frames_total",
                "Total inbound frames dropped",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(verdicts_total.clone()))?;
        registry.register(Box::new(timeouts_total.clone()))?;
        registry.register(Box::new(assignments_total.clone()))?;
        registry.register(Box::new(dropped_frames_total.clone()))?;

        Ok(Self {
            verdicts_total,
            timeouts_total,
            assignments_total,
            dropped_frames_total,
        })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_unregistered() -> Self {
        Self {
            verdicts_total: IntCounterVec::new(
                Opts::new("test_lifecycle_verdicts_total", "test"),
                &["verdict"],
            )
            .unwrap(),
            timeouts_total: IntCounter::new("test_lifecycle_timeouts_total", "test").unwrap(),
            assignments_total: IntCounter::new("test_lifecycle_assignments_total", "test").unwrap(),
            dropped_frames_total: IntCounterVec::new(
                Opts::new("test_lifecycle_dropped_frames_total", "test"),
                &["reason"],
            )
            .unwrap(),
        }
    }
}
