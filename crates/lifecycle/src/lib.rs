//! Task/subtask lifecycle engine for the taskgrid marketplace
//!
//! Tracks a unit of work from creation through assignment, remote
//! execution, verification and settlement decision, with the protocol
//! timing rules that keep the process auditable between mutually
//! distrusting peers.
//!
//! ## Architecture
//!
//! - [`state`]: the pure state machine with tasks, subtasks, the closed
//!   transition table, provider selection and the timeout sweep. All clocks
//!   are injected.
//! - [`registry`]: bounded node cache with least-recently-seen eviction
//!   and lock-free performance score counters.
//! - [`service`]: the async orchestrator wiring wire frames, the sandbox,
//!   the verification engine and settlement messages around the state core.
//! - [`metrics`]: prometheus counters for transitions and drops.
//!
//! ## Example
//!
//! ```no_run
//! use taskgrid_lifecycle::{LifecycleConfig, LifecycleState};
//! use taskgrid_types::{NodeId, ResultRef};
//! use std::time::Duration;
//!
//! let mut state = LifecycleState::new(LifecycleConfig::default());
//! let task_id = state
//!     .create_task(
//!         b"\x01\x02\x03\x04\x05\x06-public-key",
//!         NodeId::new("owner"),
//!         ResultRef::new("bundle-1"),
//!         100,
//!         1_700_000_600_000,
//!         4,
//!     )
//!     .unwrap();
//!
//! // Providers surface through demand-offer messages; the state machine
//! // assigns the best-scoring one.
//! let subtask_id = state.task(&task_id).unwrap().parts[0];
//! let _ = state.assign(
//!     &subtask_id,
//!     &[NodeId::new("provider-a")],
//!     1_700_000_000_000,
//!     Duration::from_secs(300),
//! );
//! ```

pub mod error;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod state;

pub use error::{LifecycleError, LifecycleResult};
pub use metrics::LifecycleMetrics;
pub use registry::{NodeCache, NodeEntry};
pub use service::{
    part_region, InMemoryResultStore, OrchestratorService, ResultStore, ServiceConfig,
    ServiceHandle, TaskTemplate,
};
pub use state::{
    is_valid_transition, LifecycleConfig, LifecycleEvent, LifecycleState, ProviderChoice,
    ResultDisposition, Subtask, Task,
};
