//! Error types for sandboxed execution.

use thiserror::Error;

/// Errors raised while running a sandboxed job.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Container runtime could not be reached.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    /// Container runtime operation failed.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Host-side filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Parameter document could not be serialized.
    #[error("params serialization failed: {0}")]
    Params(String),

    /// Wall-clock budget elapsed before the job finished.
    #[error("wall-clock budget of {budget_ms}ms exceeded")]
    BudgetExceeded {
        /// Budget that was exceeded, in milliseconds.
        budget_ms: u64,
    },

    /// Job was cancelled cooperatively before completion.
    #[error("job cancelled")]
    Cancelled,
}

/// Result type alias for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;
