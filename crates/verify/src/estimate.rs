//! Linear cost model for recomputation scheduling.
//!
//! The estimate scales a measured probe time by a pixel ratio and a quality
//! ratio; multi-frame cost is the per-frame estimate times the frame count.
//! The same law projects full-resolution cost from a cheap low-resolution
//! probe and bounds the verification recompute budget.

use std::time::Duration;
use taskgrid_types::Resolution;
use thiserror::Error;

/// Errors raised by the cost model.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EstimateError {
    /// Probe resolution has zero pixels.
    #[error("probe resolution has zero pixels")]
    ZeroProbePixels,

    /// Probe quality is zero.
    #[error("probe quality is zero")]
    ZeroProbeQuality,
}

/// Project the cost of one work unit at `target` scale from a probe that
/// took `test_time` at `test` scale:
/// `test_time * (target_pixels / test_pixels) * (target_quality / test_quality)`.
pub fn estimate(
    test_time: Duration,
    test: Resolution,
    test_quality: u32,
    target: Resolution,
    target_quality: u32,
) -> Result<Duration, EstimateError> {
    if test.pixels() == 0 {
        return Err(EstimateError::ZeroProbePixels);
    }
    if test_quality == 0 {
        return Err(EstimateError::ZeroProbeQuality);
    }

    let pixel_ratio = target.pixels() as f64 / test.pixels() as f64;
    let quality_ratio = f64::from(target_quality) / f64::from(test_quality);
    Ok(Duration::from_secs_f64(
        test_time.as_secs_f64() * pixel_ratio * quality_ratio,
    ))
}

/// Multi-frame projection: `frames * estimate(..)`.
pub fn estimate_for_frames(
    test_time: Duration,
    test: Resolution,
    test_quality: u32,
    target: Resolution,
    target_quality: u32,
    frames: u32,
) -> Result<Duration, EstimateError> {
    let per_frame = estimate(test_time, test, test_quality, target, target_quality)?;
    Ok(per_frame * frames)
}
