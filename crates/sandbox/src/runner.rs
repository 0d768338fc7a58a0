//! Sandbox trait and the Docker-backed runner.

use crate::error::{SandboxError, SandboxResult};
use crate::job::{write_params, JobMounts, JobOutcome, JobSpec, WORK_DIR};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::TryStreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Execution backend for one unit of work.
///
/// Implemented by [`DockerSandbox`] in production; [`StaticSandbox`] serves
/// tests and bootstrap environments without a container runtime.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run a job to completion within `budget`.
    ///
    /// The params document is written into the work mount before launch.
    /// A budget overrun stops the container and yields
    /// [`SandboxError::BudgetExceeded`]; a cooperative cancel yields
    /// [`SandboxError::Cancelled`]. A nonzero exit code is NOT an error at
    /// this boundary; it is reported through [`JobOutcome::exit_code`].
    async fn run(
        &self,
        spec: &JobSpec,
        mounts: &JobMounts,
        budget: Duration,
    ) -> SandboxResult<JobOutcome>;

    /// Cooperatively cancel a running job by name. Idempotent; cancelling
    /// an unknown job is a no-op.
    async fn cancel(&self, job_name: &str) -> SandboxResult<()>;
}

/// Configuration for the Docker-backed sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Network mode applied when the job spec grants none.
    pub default_network_mode: String,
    /// Memory limit in bytes (0 = unlimited).
    pub memory_bytes: i64,
    /// CPU shares (relative weight, 0 = runtime default).
    pub cpu_shares: i64,
    /// Graceful stop window before the runtime escalates.
    pub stop_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_network_mode: "none".to_string(),
            memory_bytes: 0,
            cpu_shares: 0,
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Docker-backed sandbox runner.
///
/// Containers run with the three-root mount contract, bounded wall-clock
/// time and no network unless the job spec grants one. The container is
/// removed on success, failure, budget overrun and cancellation alike.
pub struct DockerSandbox {
    config: SandboxConfig,
    docker: Option<Docker>,
    docker_error: Option<String>,
    active: Arc<RwLock<HashSet<String>>>,
    cancelled: Arc<RwLock<HashSet<String>>>,
}

impl DockerSandbox {
    /// Create a sandbox with default configuration.
    pub fn new() -> Self {
        Self::with_config(SandboxConfig::default())
    }

    /// Create a sandbox with custom configuration.
    pub fn with_config(config: SandboxConfig) -> Self {
        let (docker, docker_error) = match Docker::connect_with_local_defaults() {
            Ok(docker) => (Some(docker), None),
            Err(err) => (None, Some(err.to_string())),
        };
        Self {
            config,
            docker,
            docker_error,
            active: Arc::new(RwLock::new(HashSet::new())),
            cancelled: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    fn docker(&self) -> SandboxResult<&Docker> {
        self.docker.as_ref().ok_or_else(|| {
            SandboxError::Unavailable(
                self.docker_error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            )
        })
    }

    async fn ensure_image(&self, image: &str) -> SandboxResult<()> {
        let docker = self.docker()?;
        if docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        debug!(image = %image, "Pulling job image");
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });
        let mut stream = docker.create_image(options, None, None);
        while let Some(_progress) = stream
            .try_next()
            .await
            .map_err(|err| SandboxError::Runtime(err.to_string()))?
        {}
        Ok(())
    }

    async fn remove_container(&self, name: &str) {
        if let Ok(docker) = self.docker() {
            let options = Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            });
            if let Err(err) = docker.remove_container(name, options).await {
                warn!(job = %name, error = %err, "Container removal failed");
            }
        }
        self.active.write().await.remove(name);
    }

    async fn stop_container(&self, name: &str) {
        if let Ok(docker) = self.docker() {
            let options = Some(StopContainerOptions {
                t: self.config.stop_timeout.as_secs() as i64,
            });
            if let Err(err) = docker.stop_container(name, options).await {
                warn!(job = %name, error = %err, "Container stop failed");
            }
        }
    }
}

impl Default for DockerSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(
        &self,
        spec: &JobSpec,
        mounts: &JobMounts,
        budget: Duration,
    ) -> SandboxResult<JobOutcome> {
        self.docker()?;
        self.ensure_image(&spec.image).await?;
        write_params(mounts, &spec.params).await?;

        let network_mode = spec
            .network
            .clone()
            .unwrap_or_else(|| self.config.default_network_mode.clone());

        let host_config = HostConfig {
            binds: Some(mounts.bind_specs()),
            network_mode: Some(network_mode),
            memory: (self.config.memory_bytes > 0).then_some(self.config.memory_bytes),
            cpu_shares: (self.config.cpu_shares > 0).then_some(self.config.cpu_shares),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.entrypoint.clone()),
            working_dir: Some(WORK_DIR.to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let docker = self.docker()?;
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });
        docker
            .create_container(options, container_config)
            .await
            .map_err(|err| SandboxError::Runtime(err.to_string()))?;

        info!(job = %spec.name, image = %spec.image, budget_ms = budget.as_millis() as u64, "Starting sandboxed job");

        if let Err(err) = docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_container(&spec.name).await;
            return Err(SandboxError::Runtime(err.to_string()));
        }

        self.active.write().await.insert(spec.name.clone());
        let started = Instant::now();

        let wait = async {
            docker
                .wait_container(&spec.name, None::<WaitContainerOptions<String>>)
                .try_next()
                .await
        };

        let waited = tokio::time::timeout(budget, wait).await;
        let duration = started.elapsed();

        let exit_code = match waited {
            Err(_elapsed) => {
                warn!(job = %spec.name, budget_ms = budget.as_millis() as u64, "Job exceeded wall-clock budget");
                self.stop_container(&spec.name).await;
                self.remove_container(&spec.name).await;
                self.cancelled.write().await.remove(&spec.name);
                return Err(SandboxError::BudgetExceeded {
                    budget_ms: budget.as_millis() as u64,
                });
            }
            Ok(Ok(Some(response))) => response.status_code,
            Ok(Ok(None)) => {
                self.remove_container(&spec.name).await;
                return Err(SandboxError::Runtime(
                    "wait stream ended without a status".to_string(),
                ));
            }
            Ok(Err(err)) => {
                // bollard surfaces nonzero exits as errors on some runtimes;
                // the exit code is still carried in the error response.
                if let bollard::errors::Error::DockerContainerWaitError { code, .. } = err {
                    code
                } else {
                    self.remove_container(&spec.name).await;
                    return Err(SandboxError::Runtime(err.to_string()));
                }
            }
        };

        self.remove_container(&spec.name).await;

        if self.cancelled.write().await.remove(&spec.name) {
            info!(job = %spec.name, "Job cancelled");
            return Err(SandboxError::Cancelled);
        }

        info!(job = %spec.name, exit_code, duration_ms = duration.as_millis() as u64, "Job finished");
        Ok(JobOutcome {
            exit_code,
            output_dir: mounts.output_dir.clone(),
            duration,
        })
    }

    async fn cancel(&self, job_name: &str) -> SandboxResult<()> {
        if !self.active.read().await.contains(job_name) {
            debug!(job = %job_name, "Cancel requested for unknown job");
            return Ok(());
        }

        info!(job = %job_name, "Cancelling job");
        self.cancelled.write().await.insert(job_name.to_string());
        self.stop_container(job_name).await;
        Ok(())
    }
}

/// Scripted sandbox for tests and bootstrap environments.
///
/// Returns queued outcomes in order, or a successful zero-exit outcome when
/// the queue is empty. Records every run and cancel for assertions.
#[derive(Default)]
pub struct StaticSandbox {
    outcomes: std::sync::Mutex<std::collections::VecDeque<SandboxResult<JobOutcome>>>,
    runs: std::sync::Mutex<Vec<JobSpec>>,
    cancels: std::sync::Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl StaticSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every run sleep before resolving, so budget expiry paths can be
    /// exercised.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue the outcome of the next run.
    pub fn push_outcome(&self, outcome: SandboxResult<JobOutcome>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Job specs this sandbox has run, in order.
    pub fn runs(&self) -> Vec<JobSpec> {
        self.runs.lock().unwrap().clone()
    }

    /// Job names cancelled so far, in order.
    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sandbox for StaticSandbox {
    async fn run(
        &self,
        spec: &JobSpec,
        mounts: &JobMounts,
        budget: Duration,
    ) -> SandboxResult<JobOutcome> {
        self.runs.lock().unwrap().push(spec.clone());

        if let Some(delay) = self.delay {
            if delay > budget {
                return Err(SandboxError::BudgetExceeded {
                    budget_ms: budget.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
        }

        match self.outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(JobOutcome {
                exit_code: 0,
                output_dir: mounts.output_dir.clone(),
                duration: Duration::from_millis(1),
            }),
        }
    }

    async fn cancel(&self, job_name: &str) -> SandboxResult<()> {
        self.cancels.lock().unwrap().push(job_name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobParams;
    use taskgrid_types::{OutputFormat, Resolution, ResultRef};

    fn sample_spec(name: &str) -> JobSpec {
        JobSpec::new(
            name,
            "taskgrid/render:1",
            vec!["render".to_string()],
            JobParams::new(
                ResultRef::new("scenes/main.blend"),
                Resolution::new(320, 240),
                16,
                vec![1],
                OutputFormat::Png,
                "frame",
            ),
        )
    }

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert_eq!(config.default_network_mode, "none");
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_static_sandbox_default_outcome() {
        let sandbox = StaticSandbox::new();
        let mounts = JobMounts::new("/tmp/res", "/tmp/work", "/tmp/out");
        let outcome = sandbox
            .run(&sample_spec("job-1"), &mounts, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(sandbox.runs().len(), 1);
    }

    #[tokio::test]
    async fn test_static_sandbox_scripted_outcomes() {
        let sandbox = StaticSandbox::new();
        sandbox.push_outcome(Err(SandboxError::BudgetExceeded { budget_ms: 10 }));
        let mounts = JobMounts::new("/tmp/res", "/tmp/work", "/tmp/out");
        let err = sandbox
            .run(&sample_spec("job-1"), &mounts, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn test_static_sandbox_delay_exceeding_budget() {
        let sandbox = StaticSandbox::new().with_delay(Duration::from_secs(5));
        let mounts = JobMounts::new("/tmp/res", "/tmp/work", "/tmp/out");
        let err = sandbox
            .run(&sample_spec("job-1"), &mounts, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn test_static_sandbox_records_cancels() {
        let sandbox = StaticSandbox::new();
        sandbox.cancel("job-7").await.unwrap();
        assert_eq!(sandbox.cancels(), vec!["job-7".to_string()]);
    }
}
