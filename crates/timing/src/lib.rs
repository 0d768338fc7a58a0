//! Protocol timing policy
//!
//! Encodes the deadline rules that keep exchanges between mutually
//! distrusting peers auditable: every message kind has a lifetime after
//! which it is no longer actionable, built from a maximum transport time and
//! a maximum reaction time, with a clock-skew tolerance for peers whose
//! clocks disagree. The default lifetime of a generic exchange is
//! `3 * transport + 3 * reaction`; deadline-forcing messages override it
//! with a shorter window.
//!
//! The policy itself never reads the clock: callers pass `now` in, which
//! keeps the lifecycle machine testable with injected time. [`unix_now_ms`]
//! is the single helper the service layer uses at its edges.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use taskgrid_wire::MessageKind;

/// Timing parameters, threaded into the policy constructor.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Maximum one-way transport time for a message.
    pub transport: Duration,
    /// Maximum tolerated clock skew between peers.
    pub clock_skew: Duration,
    /// Maximum reaction time for a simple protocol step.
    pub reaction: Duration,
    /// Shortened lifetime for deadline-forced reports.
    pub force_report_lifetime: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            transport: Duration::from_secs(30),
            clock_skew: Duration::from_secs(120),
            reaction: Duration::from_secs(30),
            force_report_lifetime: Duration::from_secs(60),
        }
    }
}

/// Per-kind message deadline policy.
#[derive(Debug, Clone)]
pub struct TimingPolicy {
    config: TimingConfig,
}

impl TimingPolicy {
    /// Create a policy from explicit timing parameters.
    pub fn new(config: TimingConfig) -> Self {
        Self { config }
    }

    /// The configured parameters.
    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Lifetime of a generic exchange: `3 * transport + 3 * reaction`.
    pub fn default_lifetime(&self) -> Duration {
        self.config.transport * 3 + self.config.reaction * 3
    }

    /// Lifetime of a message of the given kind.
    pub fn lifetime_for(&self, kind: MessageKind) -> Duration {
        match kind {
            MessageKind::ForceReport => self.config.force_report_lifetime,
            _ => self.default_lifetime(),
        }
    }

    /// Instant (unix ms) past which a message of this kind is no longer
    /// actionable.
    pub fn deadline_for(&self, kind: MessageKind, sent_at_ms: u64) -> u64 {
        sent_at_ms.saturating_add(self.lifetime_for(kind).as_millis() as u64)
    }

    /// Whether a message is stale at `now_ms`.
    ///
    /// A message is stale once its deadline has passed, and also when its
    /// claimed creation time lies further in the future than the tolerated
    /// clock skew, a timestamp no honest peer could have produced.
    pub fn is_stale(&self, kind: MessageKind, sent_at_ms: u64, now_ms: u64) -> bool {
        if sent_at_ms > now_ms.saturating_add(self.config.clock_skew.as_millis() as u64) {
            return true;
        }
        now_ms > self.deadline_for(kind, sent_at_ms)
    }

    /// Staleness check for a decoded message.
    pub fn is_stale_message(&self, message: &taskgrid_wire::Message, now_ms: u64) -> bool {
        self.is_stale(message.kind(), message.timestamp_ms, now_ms)
    }
}

/// Current unix time in milliseconds.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
