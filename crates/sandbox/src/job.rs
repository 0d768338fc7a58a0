//! Job directory contract and parameter document.
//!
//! A job sees three fixed roots inside the container and a single structured
//! parameter document at a fixed location in the work root. This boundary is
//! an external contract: application images are built against these paths.

use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskgrid_types::{CropRegion, OutputFormat, Resolution, ResultRef};

/// Static workload resources. Mounted read-only in the container.
pub const RESOURCES_DIR: &str = "/sandbox/resources";

/// Scratch space; holds the params document. Mounted read-write.
pub const WORK_DIR: &str = "/sandbox/work";

/// Everything written here is treated as job output. Mounted read-write.
pub const OUTPUT_DIR: &str = "/sandbox/output";

/// Name of the parameter document, relative to [`WORK_DIR`].
pub const PARAMS_FILE: &str = "params.json";

/// The structured parameter document read by the job entrypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    /// Scene/workload reference inside the resources root.
    pub workload: ResultRef,
    /// Output resolution.
    pub resolution: Resolution,
    /// Quality/sample knob.
    pub quality: u32,
    /// Frames or unit indices to produce.
    pub frames: Vec<u32>,
    /// Output format.
    pub output_format: OutputFormat,
    /// Optional crop restricting the work item to a fragment.
    pub crop: Option<CropRegion>,
    /// Basename for produced files.
    pub output_basename: String,
    /// Resources root as seen by the job.
    pub resources_dir: String,
    /// Work root as seen by the job.
    pub work_dir: String,
    /// Output root as seen by the job.
    pub output_dir: String,
}

impl JobParams {
    /// Build a parameter document with the container paths filled in.
    pub fn new(
        workload: ResultRef,
        resolution: Resolution,
        quality: u32,
        frames: Vec<u32>,
        output_format: OutputFormat,
        output_basename: impl Into<String>,
    ) -> Self {
        Self {
            workload,
            resolution,
            quality,
            frames,
            output_format,
            crop: None,
            output_basename: output_basename.into(),
            resources_dir: RESOURCES_DIR.to_string(),
            work_dir: WORK_DIR.to_string(),
            output_dir: OUTPUT_DIR.to_string(),
        }
    }

    /// Restrict the job to a crop of the full work item.
    pub fn with_crop(mut self, crop: CropRegion) -> Self {
        self.crop = Some(crop);
        self
    }
}

/// Specification of one sandboxed job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Unique job name; doubles as the container name and cancel handle.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Entrypoint command run inside the container.
    pub entrypoint: Vec<String>,
    /// Parameter document written before launch.
    pub params: JobParams,
    /// Network mode granted to the job. `None` means no network.
    pub network: Option<String>,
}

impl JobSpec {
    /// Create a job spec with no network access.
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        entrypoint: Vec<String>,
        params: JobParams,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            entrypoint,
            params,
            network: None,
        }
    }

    /// Explicitly grant a network mode to the job.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }
}

/// Host-side directories bound to the three container roots.
#[derive(Debug, Clone)]
pub struct JobMounts {
    /// Host directory bound read-only to [`RESOURCES_DIR`].
    pub resources_dir: PathBuf,
    /// Host directory bound read-write to [`WORK_DIR`].
    pub work_dir: PathBuf,
    /// Host directory bound read-write to [`OUTPUT_DIR`].
    pub output_dir: PathBuf,
}

impl JobMounts {
    pub fn new(
        resources_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            resources_dir: resources_dir.into(),
            work_dir: work_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Docker bind specifications for the three roots.
    pub fn bind_specs(&self) -> Vec<String> {
        vec![
            format!("{}:{}:ro", self.resources_dir.display(), RESOURCES_DIR),
            format!("{}:{}", self.work_dir.display(), WORK_DIR),
            format!("{}:{}", self.output_dir.display(), OUTPUT_DIR),
        ]
    }

    /// Host path of the parameter document.
    pub fn params_path(&self) -> PathBuf {
        self.work_dir.join(PARAMS_FILE)
    }
}

/// Result of a finished (not timed-out) job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Container exit code. 0 = success; any other value = failure,
    /// mapped by the caller without further distinction at this boundary.
    pub exit_code: i64,
    /// Host directory holding whatever the job wrote to its output root.
    pub output_dir: PathBuf,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl JobOutcome {
    /// Whether the job signalled success by exit code.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Serialize the params document into the work mount before launch.
pub async fn write_params(mounts: &JobMounts, params: &JobParams) -> SandboxResult<()> {
    let bytes = serde_json::to_vec_pretty(params)
        .map_err(|err| SandboxError::Params(err.to_string()))?;
    tokio::fs::write(mounts.params_path(), bytes).await?;
    Ok(())
}

/// Read a params document back from a work mount. Used by local test
/// harnesses standing in for a job entrypoint.
pub async fn read_params(work_dir: &Path) -> SandboxResult<JobParams> {
    let bytes = tokio::fs::read(work_dir.join(PARAMS_FILE)).await?;
    serde_json::from_slice(&bytes).map_err(|err| SandboxError::Params(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgrid_types::CropRegion;

    fn sample_params() -> JobParams {
        JobParams::new(
            ResultRef::new("scenes/main.blend"),
            Resolution::new(800, 600),
            64,
            vec![1, 2, 3],
            OutputFormat::Png,
            "frame",
        )
    }

    #[test]
    fn test_params_carry_container_paths() {
        let params = sample_params();
        assert_eq!(params.resources_dir, RESOURCES_DIR);
        assert_eq!(params.work_dir, WORK_DIR);
        assert_eq!(params.output_dir, OUTPUT_DIR);
    }

    #[test]
    fn test_params_crop() {
        let params = sample_params().with_crop(CropRegion::new(10, 10, 100, 100));
        assert_eq!(params.crop, Some(CropRegion::new(10, 10, 100, 100)));
    }

    #[test]
    fn test_bind_specs() {
        let mounts = JobMounts::new("/tmp/res", "/tmp/work", "/tmp/out");
        let binds = mounts.bind_specs();
        assert_eq!(binds[0], "/tmp/res:/sandbox/resources:ro");
        assert_eq!(binds[1], "/tmp/work:/sandbox/work");
        assert_eq!(binds[2], "/tmp/out:/sandbox/output");
    }

    #[test]
    fn test_job_spec_network_off_by_default() {
        let spec = JobSpec::new("job-1", "taskgrid/render:1", vec!["render".into()], sample_params());
        assert!(spec.network.is_none());
        let spec = spec.with_network("bridge");
        assert_eq!(spec.network.as_deref(), Some("bridge"));
    }

    #[test]
    fn test_outcome_exit_codes() {
        let ok = JobOutcome {
            exit_code: 0,
            output_dir: PathBuf::from("/tmp/out"),
            duration: Duration::from_secs(1),
        };
        assert!(ok.succeeded());
        let bad = JobOutcome { exit_code: 2, ..ok.clone() };
        assert!(!bad.succeeded());
    }

    #[tokio::test]
    async fn test_params_write_read_roundtrip() {
        let work = tempfile::tempdir().expect("tempdir");
        let mounts = JobMounts::new("/tmp/res", work.path(), "/tmp/out");
        let params = sample_params().with_crop(CropRegion::new(0, 0, 64, 64));

        write_params(&mounts, &params).await.expect("write");
        let back = read_params(work.path()).await.expect("read");
        assert_eq!(back, params);
    }
}
