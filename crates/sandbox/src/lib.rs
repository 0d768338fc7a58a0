//! Sandboxed job execution
//!
//! Runs untrusted work items inside isolated Docker containers with:
//! - a read-only resources mount, a writable work mount and a writable
//!   output mount (the fixed job directory contract),
//! - a structured `params.json` document written into the work mount before
//!   launch and read by the job entrypoint,
//! - no network access beyond what the job spec explicitly grants,
//! - a hard wall-clock budget after which the container is stopped and the
//!   run reported as a budget overrun (never a wrong answer),
//! - cooperative cancellation via a graceful stop, so a shared output mount
//!   is never corrupted by an abrupt kill.

pub mod error;
pub mod job;
pub mod runner;

pub use error::{SandboxError, SandboxResult};
pub use job::{JobMounts, JobOutcome, JobParams, JobSpec, OUTPUT_DIR, PARAMS_FILE, RESOURCES_DIR, WORK_DIR};
pub use runner::{DockerSandbox, Sandbox, SandboxConfig, StaticSandbox};
