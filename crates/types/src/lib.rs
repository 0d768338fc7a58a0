//! Core types for the taskgrid compute marketplace
//!
//! This crate provides shared type definitions used across all taskgrid
//! components: node identity, subtask verification states, result handles
//! and workload geometry.

use serde::{Deserialize, Serialize};

/// Stable identity of a network participant, derived from its public key.
///
/// Rendered as lowercase hex. Ordering is lexicographic, which gives the
/// deterministic tie-break used by provider selection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node id from its textual form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static information about a network participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Public-key-derived identity.
    pub id: NodeId,
    /// Network address in `host:port` form.
    pub address: String,
    /// Declared capability/performance score (benchmark units).
    pub performance: u64,
}

/// Verification state of a single subtask.
///
/// Closed set; the lifecycle state machine is the sole mutator. `Verified`
/// and `WrongAnswer` are terminal. Retry is legal only from `Waiting` and
/// `Timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubtaskVerificationState {
    /// Subtask exists but has not been offered yet.
    Unknown,
    /// Offered, no provider assigned.
    Waiting,
    /// A provider is computing the subtask.
    InProgress,
    /// Result returned in time and accepted.
    Verified,
    /// Result returned in time but rejected deterministically.
    WrongAnswer,
    /// Verification could not reach a confident verdict; needs escalation.
    NotSure,
    /// Attempt deadline elapsed with no usable result.
    Timeout,
}

impl SubtaskVerificationState {
    /// Whether this state ends the subtask's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::WrongAnswer)
    }

    /// Whether a new attempt may start from this state.
    pub fn can_retry(&self) -> bool {
        matches!(self, Self::Waiting | Self::Timeout)
    }
}

impl std::fmt::Display for SubtaskVerificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Waiting => "waiting",
            Self::InProgress => "in_progress",
            Self::Verified => "verified",
            Self::WrongAnswer => "wrong_answer",
            Self::NotSure => "not_sure",
            Self::Timeout => "timeout",
        };
        write!(f, "{}", name)
    }
}

/// Why a subtask attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Job crashed or produced no output.
    SandboxFault,
    /// Wall-clock budget exceeded.
    Timeout,
    /// Input did not pass shape validation.
    InvalidInput,
    /// Other error.
    Other(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SandboxFault => write!(f, "sandbox fault"),
            Self::Timeout => write!(f, "timeout"),
            Self::InvalidInput => write!(f, "invalid input"),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// Opaque content handle for a resource bundle or result payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultRef(pub String);

impl ResultRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }
}

impl std::fmt::Display for ResultRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output resolution of a rendered work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count.
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Output pixel formats understood by the verification pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 8-bit RGBA.
    Png,
    /// 32-bit float RGBA.
    Exr,
    /// 8-bit RGB.
    Bmp,
}

impl OutputFormat {
    /// Bytes per pixel of the decoded payload this format declares.
    pub fn bytes_per_pixel(&self) -> u64 {
        match self {
            OutputFormat::Png => 4,
            OutputFormat::Exr => 16,
            OutputFormat::Bmp => 3,
        }
    }

    /// File extension without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Exr => "exr",
            OutputFormat::Bmp => "bmp",
        }
    }
}

/// Rectangular crop region inside a work item, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether the crop lies entirely inside the given resolution.
    pub fn fits_within(&self, resolution: Resolution) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.saturating_add(self.width) <= resolution.width
            && self.y.saturating_add(self.height) <= resolution.height
    }

    /// Pixel count of the crop.
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SubtaskVerificationState::Verified.is_terminal());
        assert!(SubtaskVerificationState::WrongAnswer.is_terminal());
        assert!(!SubtaskVerificationState::NotSure.is_terminal());
        assert!(!SubtaskVerificationState::Timeout.is_terminal());
        assert!(!SubtaskVerificationState::InProgress.is_terminal());
    }

    #[test]
    fn test_retry_states() {
        assert!(SubtaskVerificationState::Waiting.can_retry());
        assert!(SubtaskVerificationState::Timeout.can_retry());
        assert!(!SubtaskVerificationState::InProgress.can_retry());
        assert!(!SubtaskVerificationState::Verified.can_retry());
        assert!(!SubtaskVerificationState::Unknown.can_retry());
    }

    #[test]
    fn test_node_id_ordering() {
        let a = NodeId::new("0a");
        let b = NodeId::new("0b");
        assert!(a < b);
    }

    #[test]
    fn test_crop_bounds() {
        let res = Resolution::new(200, 100);
        assert!(CropRegion::new(0, 0, 200, 100).fits_within(res));
        assert!(CropRegion::new(150, 50, 50, 50).fits_within(res));
        assert!(!CropRegion::new(150, 50, 51, 50).fits_within(res));
        assert!(!CropRegion::new(0, 0, 0, 10).fits_within(res));
    }

    #[test]
    fn test_resolution_pixels() {
        assert_eq!(Resolution::new(100, 100).pixels(), 10_000);
        assert_eq!(Resolution::new(1920, 1080).pixels(), 2_073_600);
    }

    #[test]
    fn test_state_serialization_roundtrip() {
        let state = SubtaskVerificationState::WrongAnswer;
        let json = serde_json::to_string(&state).expect("serialize");
        let back: SubtaskVerificationState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, state);
    }
}
