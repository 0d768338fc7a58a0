//! Verification engine: structural pre-check plus partial re-computation.

use crate::compare::{extract_fragment, similarity};
use crate::estimate::estimate;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskgrid_ident::Identifier;
use taskgrid_sandbox::{JobMounts, JobParams, JobSpec, Sandbox};
use taskgrid_types::{
    CropRegion, OutputFormat, Resolution, ResultRef, SubtaskVerificationState,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Shape errors for externally supplied verification inputs. Raised before
/// any verification work begins.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShapeError {
    /// Resolution has zero pixels.
    #[error("resolution has zero pixels")]
    ZeroResolution,

    /// Quality knob is zero.
    #[error("quality must be positive")]
    ZeroQuality,

    /// Frame list is empty.
    #[error("frame list is empty")]
    EmptyFrames,

    /// Subtask part region does not fit the full resolution.
    #[error("part region out of bounds")]
    PartOutOfBounds,

    /// Fragment count of zero requested.
    #[error("fragment count must be positive")]
    BadFragmentCount,

    /// Cost probe has zero pixels or zero quality.
    #[error("cost probe is degenerate")]
    BadProbe,
}

/// Verification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Result accepted.
    Accept,
    /// Result rejected deterministically.
    Reject,
    /// No confident verdict; escalation required.
    Inconclusive,
}

impl Verdict {
    /// The subtask state this verdict finalizes to.
    pub fn state(&self) -> SubtaskVerificationState {
        match self {
            Verdict::Accept => SubtaskVerificationState::Verified,
            Verdict::Reject => SubtaskVerificationState::WrongAnswer,
            Verdict::Inconclusive => SubtaskVerificationState::NotSure,
        }
    }
}

/// A measured low-cost probe used to bound the recompute budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostProbe {
    /// Wall-clock time of the probe run.
    pub test_time: Duration,
    /// Probe resolution.
    pub resolution: Resolution,
    /// Probe quality knob.
    pub quality: u32,
}

/// Externally supplied verification input, validated for shape before any
/// engine work.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    /// Subtask under verification.
    pub subtask_id: Identifier,
    /// Scene/workload reference inside the resources root.
    pub workload: ResultRef,
    /// Full work-item resolution.
    pub resolution: Resolution,
    /// Quality/sample knob the provider was asked to use.
    pub quality: u32,
    /// Frames the subtask covers.
    pub frames: Vec<u32>,
    /// Output format.
    pub output_format: OutputFormat,
    /// Region of the full work item this subtask covers.
    pub part: CropRegion,
    /// Optional fragment count for multi-fragment comparison strategies.
    pub fragment_count: Option<u32>,
    /// Host directory holding the workload resources.
    pub resources_dir: PathBuf,
    /// Optional probe bounding the recompute budget.
    pub probe: Option<CostProbe>,
}

impl VerifyRequest {
    /// Validate the request shape.
    pub fn validate(&self) -> Result<(), ShapeError> {
        if self.resolution.pixels() == 0 {
            return Err(ShapeError::ZeroResolution);
        }
        if self.quality == 0 {
            return Err(ShapeError::ZeroQuality);
        }
        if self.frames.is_empty() {
            return Err(ShapeError::EmptyFrames);
        }
        if !self.part.fits_within(self.resolution) {
            return Err(ShapeError::PartOutOfBounds);
        }
        if self.fragment_count == Some(0) {
            return Err(ShapeError::BadFragmentCount);
        }
        if let Some(probe) = &self.probe {
            if probe.resolution.pixels() == 0 || probe.quality == 0 {
                return Err(ShapeError::BadProbe);
            }
        }
        Ok(())
    }
}

/// Provider-reported result payload, already fetched and decoded.
#[derive(Debug, Clone)]
pub struct ResultPayload {
    /// Resolution the payload claims.
    pub resolution: Resolution,
    /// Format the payload claims.
    pub format: OutputFormat,
    /// Number of frames contained.
    pub frames: u32,
    /// Row-major pixel bytes, frames concatenated.
    pub data: Vec<u8>,
}

/// Evidence backing a verification outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Evidence {
    /// Whether the structural pre-check passed.
    pub structural_ok: bool,
    /// Fragment similarity of the last comparison, if one ran.
    pub similarity: Option<f32>,
    /// Crop used by the last comparison, if one ran.
    pub crop: Option<CropRegion>,
    /// Number of recompute attempts performed.
    pub recompute_attempts: u32,
}

/// Binds a subtask to a verification outcome and its evidence. Finalized
/// exactly once.
#[derive(Debug, Clone)]
pub struct VerificationRecord {
    /// Verified subtask.
    pub subtask_id: Identifier,
    /// Final verdict.
    pub verdict: Verdict,
    /// Subtask state the verdict maps to.
    pub state: SubtaskVerificationState,
    /// Supporting evidence.
    pub evidence: Evidence,
    /// When the record was finalized, unix ms.
    pub finalized_at_ms: u64,
}

/// Verification thresholds and recompute settings.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Similarity at or above this accepts.
    pub min_score: f32,
    /// Similarity below `min_score - epsilon` rejects; the band between is
    /// inconclusive.
    pub epsilon: f32,
    /// Maximum crop size for partial recomputation.
    pub crop_size: (u32, u32),
    /// Whether partial recomputation runs at all. When off, a payload that
    /// passes the structural pre-check is accepted.
    pub advanced: bool,
    /// Container image used for reference recomputation.
    pub recompute_image: String,
    /// Entrypoint run inside the recompute container.
    pub recompute_entrypoint: Vec<String>,
    /// Budget applied when no cost probe is available.
    pub default_recompute_budget: Duration,
    /// Host directory for per-verification work/output mounts.
    pub work_root: PathBuf,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            min_score: 0.95,
            epsilon: 0.05,
            crop_size: (64, 64),
            advanced: true,
            recompute_image: "taskgrid/reference:1".to_string(),
            recompute_entrypoint: vec!["reference-render".to_string()],
            default_recompute_budget: Duration::from_secs(120),
            work_root: std::env::temp_dir().join("taskgrid-verify"),
        }
    }
}

/// Basename of the reference fragment written by the recompute job.
const REFERENCE_BASENAME: &str = "reference";

/// Judges whether a completed subtask's output is acceptable.
pub struct VerificationEngine {
    config: VerifyConfig,
    sandbox: Arc<dyn Sandbox>,
}

impl VerificationEngine {
    /// Create an engine over the given sandbox.
    pub fn new(config: VerifyConfig, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { config, sandbox }
    }

    /// The engine configuration.
    pub fn config(&self) -> &VerifyConfig {
        &self.config
    }

    /// Verify a reported result. `now_ms` stamps the finalized record so the
    /// engine itself never reads the clock.
    ///
    /// An inconclusive first comparison is escalated once with a fresh
    /// independent crop; a second inconclusive outcome finalizes as
    /// `NOT_SURE` and is left to the caller's escalation policy.
    pub async fn verify(
        &self,
        request: &VerifyRequest,
        payload: &ResultPayload,
        now_ms: u64,
    ) -> Result<VerificationRecord, ShapeError> {
        request.validate()?;

        if !self.structural_check(request, payload) {
            debug!(subtask_id = %request.subtask_id, "Structural pre-check failed");
            return Ok(self.finalize(
                request,
                Verdict::Reject,
                Evidence {
                    structural_ok: false,
                    similarity: None,
                    crop: None,
                    recompute_attempts: 0,
                },
                now_ms,
            ));
        }

        if !self.config.advanced {
            return Ok(self.finalize(
                request,
                Verdict::Accept,
                Evidence {
                    structural_ok: true,
                    similarity: None,
                    crop: None,
                    recompute_attempts: 0,
                },
                now_ms,
            ));
        }

        let mut evidence = Evidence {
            structural_ok: true,
            similarity: None,
            crop: None,
            recompute_attempts: 0,
        };

        let mut verdict = Verdict::Inconclusive;
        for attempt in 1..=2u32 {
            evidence.recompute_attempts = attempt;
            let crop = self.choose_crop(request.part);
            evidence.crop = Some(crop);

            match self.recompute_and_compare(request, payload, crop, attempt).await {
                Some(score) => {
                    evidence.similarity = Some(score);
                    verdict = self.classify(score);
                }
                None => {
                    evidence.similarity = None;
                    verdict = Verdict::Inconclusive;
                }
            }

            if verdict != Verdict::Inconclusive {
                break;
            }
            if attempt == 1 {
                debug!(subtask_id = %request.subtask_id, "Comparison inconclusive, escalating with a fresh crop");
            }
        }

        Ok(self.finalize(request, verdict, evidence, now_ms))
    }

    fn finalize(
        &self,
        request: &VerifyRequest,
        verdict: Verdict,
        evidence: Evidence,
        now_ms: u64,
    ) -> VerificationRecord {
        info!(
            subtask_id = %request.subtask_id,
            verdict = ?verdict,
            similarity = ?evidence.similarity,
            attempts = evidence.recompute_attempts,
            "Verification finalized"
        );
        VerificationRecord {
            subtask_id: request.subtask_id,
            verdict,
            state: verdict.state(),
            evidence,
            finalized_at_ms: now_ms,
        }
    }

    /// Deterministic pre-check on the payload's structural contract.
    fn structural_check(&self, request: &VerifyRequest, payload: &ResultPayload) -> bool {
        let part_resolution = Resolution::new(request.part.width, request.part.height);
        if payload.resolution != part_resolution {
            return false;
        }
        if payload.format != request.output_format {
            return false;
        }
        if payload.frames as usize != request.frames.len() {
            return false;
        }
        let expected =
            part_resolution.pixels() * payload.format.bytes_per_pixel() * u64::from(payload.frames);
        payload.data.len() as u64 == expected
    }

    fn classify(&self, score: f32) -> Verdict {
        if score >= self.config.min_score {
            Verdict::Accept
        } else if score < self.config.min_score - self.config.epsilon {
            Verdict::Reject
        } else {
            Verdict::Inconclusive
        }
    }

    /// Random crop inside the part, bounded by the configured crop size.
    fn choose_crop(&self, part: CropRegion) -> CropRegion {
        let mut rng = rand::thread_rng();
        let width = self.config.crop_size.0.min(part.width);
        let height = self.config.crop_size.1.min(part.height);
        let x = part.x + rng.gen_range(0..=part.width - width);
        let y = part.y + rng.gen_range(0..=part.height - height);
        CropRegion::new(x, y, width, height)
    }

    /// Budget for one crop recompute, projected from the probe when present.
    fn recompute_budget(&self, request: &VerifyRequest, crop: CropRegion) -> Duration {
        match &request.probe {
            Some(probe) => estimate(
                probe.test_time,
                probe.resolution,
                probe.quality,
                Resolution::new(crop.width, crop.height),
                request.quality,
            )
            .unwrap_or(self.config.default_recompute_budget),
            None => self.config.default_recompute_budget,
        }
    }

    /// Recompute `crop` independently and compare fragments. `None` means
    /// the comparison could not be carried out (sandbox unavailable, budget
    /// overrun, missing or malformed reference): inconclusive, never a
    /// rejection.
    async fn recompute_and_compare(
        &self,
        request: &VerifyRequest,
        payload: &ResultPayload,
        crop: CropRegion,
        attempt: u32,
    ) -> Option<f32> {
        let job_name = format!("verify-{}-{}", request.subtask_id, attempt);
        let job_dir = self.config.work_root.join(&job_name);
        let work_dir = job_dir.join("work");
        let output_dir = job_dir.join("output");
        for dir in [&work_dir, &output_dir] {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                warn!(job = %job_name, error = %err, "Could not create verification mounts");
                return None;
            }
        }

        let params = JobParams::new(
            request.workload.clone(),
            request.resolution,
            request.quality,
            vec![request.frames[0]],
            request.output_format,
            REFERENCE_BASENAME,
        )
        .with_crop(crop);

        let spec = JobSpec::new(
            job_name.clone(),
            self.config.recompute_image.clone(),
            self.config.recompute_entrypoint.clone(),
            params,
        );
        let mounts = JobMounts::new(request.resources_dir.clone(), work_dir, output_dir.clone());
        let budget = self.recompute_budget(request, crop);

        let outcome = match self.sandbox.run(&spec, &mounts, budget).await {
            Ok(outcome) if outcome.succeeded() => outcome,
            Ok(outcome) => {
                warn!(job = %job_name, exit_code = outcome.exit_code, "Reference recompute failed");
                return None;
            }
            Err(err) => {
                warn!(job = %job_name, error = %err, "Reference recompute unavailable");
                return None;
            }
        };

        let reference_path = outcome
            .output_dir
            .join(format!("{}.{}", REFERENCE_BASENAME, request.output_format.extension()));
        let reference = match tokio::fs::read(&reference_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(job = %job_name, error = %err, "Reference fragment missing");
                return None;
            }
        };

        let bpp = request.output_format.bytes_per_pixel();
        if reference.len() as u64 != crop.pixels() * bpp {
            warn!(job = %job_name, "Reference fragment has unexpected size");
            return None;
        }

        let fragment = extract_fragment(&payload.data, request.part, crop, bpp)?;
        similarity(&reference, &fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use taskgrid_sandbox::{JobOutcome, SandboxError, SandboxResult};

    const SEED: &[u8] = b"\x01\x02\x03\x04\x05\x06-seed";

    /// Sandbox standing in for a reference-render job: writes a fragment of
    /// the scripted byte value into the output mount and exits 0.
    struct FragmentSandbox {
        byte: u8,
        failures_before_success: AtomicU32,
        budgets: Mutex<Vec<Duration>>,
    }

    impl FragmentSandbox {
        fn new(byte: u8) -> Self {
            Self {
                byte,
                failures_before_success: AtomicU32::new(0),
                budgets: Mutex::new(Vec::new()),
            }
        }

        fn failing_first(byte: u8, failures: u32) -> Self {
            let sandbox = Self::new(byte);
            sandbox.failures_before_success.store(failures, Ordering::SeqCst);
            sandbox
        }

        fn budgets(&self) -> Vec<Duration> {
            self.budgets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sandbox for FragmentSandbox {
        async fn run(
            &self,
            spec: &JobSpec,
            mounts: &JobMounts,
            budget: Duration,
        ) -> SandboxResult<JobOutcome> {
            self.budgets.lock().unwrap().push(budget);

            let remaining = self.failures_before_success.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_before_success.store(remaining - 1, Ordering::SeqCst);
                return Err(SandboxError::Unavailable("no runtime".to_string()));
            }

            let crop = spec.params.crop.expect("verification jobs carry a crop");
            let len = crop.pixels() * spec.params.output_format.bytes_per_pixel();
            let path = mounts.output_dir.join(format!(
                "{}.{}",
                spec.params.output_basename,
                spec.params.output_format.extension()
            ));
            tokio::fs::write(&path, vec![self.byte; len as usize])
                .await
                .expect("write reference");

            Ok(JobOutcome {
                exit_code: 0,
                output_dir: mounts.output_dir.clone(),
                duration: Duration::from_millis(5),
            })
        }

        async fn cancel(&self, _job_name: &str) -> SandboxResult<()> {
            Ok(())
        }
    }

    fn request(root: &std::path::Path) -> VerifyRequest {
        VerifyRequest {
            subtask_id: taskgrid_ident::generate(SEED).unwrap(),
            workload: ResultRef::new("scenes/main.blend"),
            resolution: Resolution::new(200, 200),
            quality: 16,
            frames: vec![1],
            output_format: OutputFormat::Bmp,
            part: CropRegion::new(0, 100, 200, 100),
            fragment_count: None,
            resources_dir: root.join("resources"),
            probe: None,
        }
    }

    fn payload_of(byte: u8, part: CropRegion, format: OutputFormat) -> ResultPayload {
        let len = part.pixels() * format.bytes_per_pixel();
        ResultPayload {
            resolution: Resolution::new(part.width, part.height),
            format,
            frames: 1,
            data: vec![byte; len as usize],
        }
    }

    fn engine_with(sandbox: Arc<dyn Sandbox>, root: &std::path::Path) -> VerificationEngine {
        let config = VerifyConfig {
            crop_size: (32, 32),
            work_root: root.join("verify"),
            ..VerifyConfig::default()
        };
        VerificationEngine::new(config, sandbox)
    }

    #[tokio::test]
    async fn test_shape_validation_runs_first() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_with(Arc::new(FragmentSandbox::new(0)), root.path());
        let mut bad = request(root.path());
        bad.frames.clear();
        let payload = payload_of(9, bad.part, bad.output_format);
        let err = engine.verify(&bad, &payload, 1).await.unwrap_err();
        assert_eq!(err, ShapeError::EmptyFrames);
    }

    #[tokio::test]
    async fn test_structural_mismatch_rejects_without_recompute() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(FragmentSandbox::new(0));
        let engine = engine_with(sandbox.clone(), root.path());
        let request = request(root.path());

        let mut payload = payload_of(9, request.part, request.output_format);
        payload.data.truncate(payload.data.len() - 1);

        let record = engine.verify(&request, &payload, 7).await.unwrap();
        assert_eq!(record.verdict, Verdict::Reject);
        assert_eq!(record.state, SubtaskVerificationState::WrongAnswer);
        assert!(!record.evidence.structural_ok);
        assert_eq!(record.evidence.recompute_attempts, 0);
        assert!(sandbox.budgets().is_empty(), "no recompute may run");
    }

    #[tokio::test]
    async fn test_matching_fragment_accepts() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_with(Arc::new(FragmentSandbox::new(9)), root.path());
        let request = request(root.path());
        let payload = payload_of(9, request.part, request.output_format);

        let record = engine.verify(&request, &payload, 7).await.unwrap();
        assert_eq!(record.verdict, Verdict::Accept);
        assert_eq!(record.state, SubtaskVerificationState::Verified);
        assert_eq!(record.evidence.similarity, Some(1.0));
        assert_eq!(record.evidence.recompute_attempts, 1);
        assert_eq!(record.finalized_at_ms, 7);
    }

    #[tokio::test]
    async fn test_divergent_fragment_rejects() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_with(Arc::new(FragmentSandbox::new(255)), root.path());
        let request = request(root.path());
        let payload = payload_of(0, request.part, request.output_format);

        let record = engine.verify(&request, &payload, 7).await.unwrap();
        assert_eq!(record.verdict, Verdict::Reject);
        assert!(record.evidence.similarity.unwrap() < 0.5);
        assert_eq!(record.evidence.recompute_attempts, 1);
    }

    #[tokio::test]
    async fn test_borderline_similarity_escalates_then_not_sure() {
        let root = tempfile::tempdir().unwrap();
        // Uniform diff of 20/255 gives similarity ~0.922, inside the
        // [min_score - epsilon, min_score) band on both attempts.
        let engine = engine_with(Arc::new(FragmentSandbox::new(120)), root.path());
        let request = request(root.path());
        let payload = payload_of(100, request.part, request.output_format);

        let record = engine.verify(&request, &payload, 7).await.unwrap();
        assert_eq!(record.verdict, Verdict::Inconclusive);
        assert_eq!(record.state, SubtaskVerificationState::NotSure);
        assert_eq!(record.evidence.recompute_attempts, 2);
        let sim = record.evidence.similarity.unwrap();
        assert!(sim < 0.95 && sim >= 0.90, "similarity {sim} outside the band");
    }

    #[tokio::test]
    async fn test_escalation_recovers_from_unavailable_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(FragmentSandbox::failing_first(9, 1));
        let engine = engine_with(sandbox, root.path());
        let request = request(root.path());
        let payload = payload_of(9, request.part, request.output_format);

        let record = engine.verify(&request, &payload, 7).await.unwrap();
        assert_eq!(record.verdict, Verdict::Accept);
        assert_eq!(record.evidence.recompute_attempts, 2);
    }

    #[tokio::test]
    async fn test_unavailable_sandbox_is_inconclusive_not_blocking() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(FragmentSandbox::failing_first(9, 2));
        let engine = engine_with(sandbox, root.path());
        let request = request(root.path());
        let payload = payload_of(9, request.part, request.output_format);

        let record = engine.verify(&request, &payload, 7).await.unwrap();
        assert_eq!(record.verdict, Verdict::Inconclusive);
        assert_eq!(record.state, SubtaskVerificationState::NotSure);
        assert_eq!(record.evidence.similarity, None);
    }

    #[tokio::test]
    async fn test_structural_only_mode_accepts_well_formed_payload() {
        let root = tempfile::tempdir().unwrap();
        let config = VerifyConfig {
            advanced: false,
            work_root: root.path().join("verify"),
            ..VerifyConfig::default()
        };
        let engine = VerificationEngine::new(config, Arc::new(FragmentSandbox::new(0)));
        let request = request(root.path());
        let payload = payload_of(9, request.part, request.output_format);

        let record = engine.verify(&request, &payload, 7).await.unwrap();
        assert_eq!(record.verdict, Verdict::Accept);
        assert_eq!(record.evidence.recompute_attempts, 0);
    }

    #[tokio::test]
    async fn test_probe_bounds_recompute_budget() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(FragmentSandbox::new(9));
        let config = VerifyConfig {
            crop_size: (50, 50),
            work_root: root.path().join("verify"),
            ..VerifyConfig::default()
        };
        let engine = VerificationEngine::new(config, sandbox.clone());

        let mut request = request(root.path());
        request.quality = 1;
        request.probe = Some(CostProbe {
            test_time: Duration::from_secs(10),
            resolution: Resolution::new(100, 100),
            quality: 1,
        });
        let payload = payload_of(9, request.part, request.output_format);

        let record = engine.verify(&request, &payload, 7).await.unwrap();
        assert_eq!(record.verdict, Verdict::Accept);
        // 10s scaled by 2500/10000 pixels at equal quality.
        assert_eq!(sandbox.budgets(), vec![Duration::from_secs_f64(2.5)]);
    }
}
