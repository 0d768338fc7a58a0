//! Result verification for the taskgrid marketplace
//!
//! Judges whether a completed subtask's output is acceptable:
//! - a deterministic structural pre-check rejects malformed payloads
//!   immediately (wrong size or dimensions, no further work),
//! - an optional partial re-computation strategy re-renders a bounded
//!   random crop of the same work item in the sandbox and compares the
//!   independent fragment against the provider's with an explicit
//!   similarity tolerance,
//! - the band between the accept and reject thresholds is a first-class
//!   `Inconclusive` outcome, escalated once with a fresh crop before being
//!   surfaced as `NOT_SURE` for manual or arbiter resolution.
//!
//! The linear cost model in [`estimate`] projects full-scale recompute cost
//! from a cheap low-resolution probe and bounds the recompute budget.

pub mod compare;
pub mod engine;
pub mod estimate;

pub use compare::{extract_fragment, similarity};
pub use engine::{
    CostProbe, Evidence, ResultPayload, ShapeError, VerificationEngine, VerificationRecord,
    Verdict, VerifyConfig, VerifyRequest,
};
pub use estimate::{estimate, estimate_for_frames, EstimateError};
