//! Error types for task/subtask lifecycle orchestration.

use taskgrid_ident::Identifier;
use taskgrid_types::SubtaskVerificationState;
use thiserror::Error;

/// Errors raised by lifecycle operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// A transition outside the state table was attempted.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// State the subtask was in.
        from: SubtaskVerificationState,
        /// State that was requested.
        to: SubtaskVerificationState,
    },

    /// Task is not known to this state machine.
    #[error("task not found: {0}")]
    TaskNotFound(Identifier),

    /// Subtask is not known to this state machine.
    #[error("subtask not found: {0}")]
    SubtaskNotFound(Identifier),

    /// No candidate provider is eligible for assignment. Not retried
    /// internally; retrying without new information cannot help.
    #[error("no eligible provider for subtask {0}")]
    NoEligibleProvider(Identifier),

    /// Retry attempted from a state that does not allow it.
    #[error("subtask {id} cannot retry from state {state}")]
    RetryNotAllowed {
        /// Subtask concerned.
        id: Identifier,
        /// Its current state.
        state: SubtaskVerificationState,
    },

    /// Attempt ceiling reached; the subtask is permanently failed.
    #[error("subtask {id} exhausted its {attempts} attempts")]
    AttemptsExhausted {
        /// Subtask concerned.
        id: Identifier,
        /// Attempts consumed.
        attempts: u32,
    },

    /// An attempt budget would overrun the owning task's deadline.
    #[error("attempt budget of {budget_ms}ms overruns task deadline at {deadline_ms}")]
    BudgetOverrun {
        /// Requested attempt budget in milliseconds.
        budget_ms: u64,
        /// Owning task deadline, unix ms.
        deadline_ms: u64,
    },

    /// Operation attempted on a cancelled task.
    #[error("task {0} is cancelled")]
    TaskCancelled(Identifier),

    /// Identifier generation or parsing failed.
    #[error("identifier error: {0}")]
    Identifier(#[from] taskgrid_ident::InvalidIdentifierError),
}

/// Result type alias for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;
