//! Task Orchestrator Service.
//!
//! Drives the complete task lifecycle around the pure state machine:
//! inbound frame decoding, staleness filtering, provider assignment,
//! sandboxed execution on the provider side, verification on the requestor
//! side, and outbound protocol messages / settlement decisions.
//!
//! Decode failures and stale messages are treated exactly like dropped
//! frames: no reply, no state change. Per-subtask mutation is serialized
//! with a per-subtask lock so a late result can never race a timeout sweep
//! for the same subtask.

use crate::error::{LifecycleError, LifecycleResult};
use crate::metrics::LifecycleMetrics;
use crate::state::{LifecycleConfig, LifecycleEvent, LifecycleState, ResultDisposition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskgrid_ident::Identifier;
use taskgrid_sandbox::{JobMounts, JobParams, JobSpec, Sandbox};
use taskgrid_timing::{unix_now_ms, TimingPolicy};
use taskgrid_types::{
    CropRegion, FailureReason, NodeId, NodeInfo, OutputFormat, Resolution, ResultRef,
};
use taskgrid_verify::{
    CostProbe, ResultPayload, VerificationEngine, Verdict, VerifyConfig, VerifyRequest,
};
use taskgrid_wire::{
    CannotAssign, Message, MessageBody, MessageCodec, ReportComputedTask, ResultsAccepted,
    ResultsRejected, TaskToCompute,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Work-item template registered with each task; drives job parameter
/// documents and verification requests for all of the task's subtasks.
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    /// Scene/workload reference inside the resources root.
    pub workload: ResultRef,
    /// Full output resolution.
    pub resolution: Resolution,
    /// Quality/sample knob.
    pub quality: u32,
    /// Frames the task covers.
    pub frames: Vec<u32>,
    /// Output format.
    pub output_format: OutputFormat,
    /// Optional measured probe bounding recompute budgets.
    pub probe: Option<CostProbe>,
}

/// Region of the full work item covered by one part: horizontal stripes,
/// the last part absorbing the remainder rows.
pub fn part_region(resolution: Resolution, part: usize, total: usize) -> CropRegion {
    let total = total.max(1) as u32;
    let part = (part as u32).min(total - 1);
    let base = resolution.height / total;
    let y = part * base;
    let height = if part == total - 1 {
        resolution.height - y
    } else {
        base
    };
    CropRegion::new(0, y, resolution.width, height)
}

/// Content-addressed payload storage behind the opaque result handles.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Resolve a handle to its payload bytes.
    async fn fetch(&self, handle: &ResultRef) -> Option<Vec<u8>>;

    /// Store payload bytes, returning their handle.
    async fn put(&self, bytes: Vec<u8>) -> ResultRef;
}

/// In-memory, hash-addressed result store.
#[derive(Default)]
pub struct InMemoryResultStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn fetch(&self, handle: &ResultRef) -> Option<Vec<u8>> {
        self.entries.read().await.get(&handle.0).cloned()
    }

    async fn put(&self, bytes: Vec<u8>) -> ResultRef {
        let handle = blake3::hash(&bytes).to_hex().to_string();
        self.entries.write().await.insert(handle.clone(), bytes);
        ResultRef::new(handle)
    }
}

/// Configuration for the orchestrator service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Timeout sweep interval.
    pub tick_interval: Duration,
    /// Inbound/outbound channel capacity.
    pub frame_buffer: usize,
    /// Lifecycle event channel capacity.
    pub event_buffer: usize,
    /// Attempt budget handed to assignment.
    pub attempt_budget: Duration,
    /// Container image executing provider-side jobs.
    pub job_image: String,
    /// Entrypoint run inside provider-side jobs.
    pub job_entrypoint: Vec<String>,
    /// Host root for per-job work/output mounts.
    pub mount_root: PathBuf,
    /// Host root holding per-task resource bundles.
    pub resources_root: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            frame_buffer: 64,
            event_buffer: 256,
            attempt_budget: Duration::from_secs(300),
            job_image: "taskgrid/render:1".to_string(),
            job_entrypoint: vec!["render".to_string()],
            mount_root: std::env::temp_dir().join("taskgrid-jobs"),
            resources_root: std::env::temp_dir().join("taskgrid-resources"),
        }
    }
}

/// Handle returned alongside the service: feeds inbound frames, drains
/// outbound frames and lifecycle events, and requests shutdown.
pub struct ServiceHandle {
    /// Raw inbound frames from the transport.
    pub frames_tx: mpsc::Sender<Vec<u8>>,
    /// Encoded outbound frames for the transport.
    pub outbound_rx: mpsc::Receiver<Vec<u8>>,
    /// Observable lifecycle events.
    pub events_rx: mpsc::Receiver<LifecycleEvent>,
    shutdown_tx: mpsc::Sender<()>,
}

impl ServiceHandle {
    /// Request a graceful stop of the service loop.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

struct Inner {
    config: ServiceConfig,
    state: RwLock<LifecycleState>,
    templates: RwLock<HashMap<Identifier, TaskTemplate>>,
    /// Candidate provider pool per task, fed by demand-offer messages.
    offers: RwLock<HashMap<Identifier, Vec<NodeId>>>,
    /// Per-subtask ownership tokens: result handling and timeout sweeps for
    /// the same subtask are mutually exclusive.
    locks: Mutex<HashMap<Identifier, Arc<Mutex<()>>>>,
    codec: MessageCodec,
    policy: TimingPolicy,
    engine: VerificationEngine,
    sandbox: Arc<dyn Sandbox>,
    store: Arc<dyn ResultStore>,
    metrics: LifecycleMetrics,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    events_tx: mpsc::Sender<LifecycleEvent>,
}

/// The orchestrator: consumes inbound frames and the tick timer, owns the
/// lifecycle state machine, and emits outbound frames and events.
pub struct OrchestratorService {
    inner: Arc<Inner>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl OrchestratorService {
    /// Create the service and its handle.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServiceConfig,
        lifecycle: LifecycleConfig,
        codec: MessageCodec,
        policy: TimingPolicy,
        verify: VerifyConfig,
        sandbox: Arc<dyn Sandbox>,
        store: Arc<dyn ResultStore>,
        metrics: LifecycleMetrics,
    ) -> (Self, ServiceHandle) {
        let (frames_tx, inbound_rx) = mpsc::channel(config.frame_buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.frame_buffer);
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let engine = VerificationEngine::new(verify, sandbox.clone());
        let inner = Arc::new(Inner {
            state: RwLock::new(LifecycleState::new(lifecycle)),
            templates: RwLock::new(HashMap::new()),
            offers: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            codec,
            policy,
            engine,
            sandbox,
            store,
            metrics,
            outbound_tx,
            events_tx,
            config,
        });

        let service = Self {
            inner,
            inbound_rx,
            shutdown_rx,
        };
        let handle = ServiceHandle {
            frames_tx,
            outbound_rx,
            events_rx,
            shutdown_tx,
        };
        (service, handle)
    }

    /// Register a task, its subtasks and its work-item template.
    pub async fn create_task(
        &self,
        owner_seed: &[u8],
        owner: NodeId,
        resources: ResultRef,
        max_price: u64,
        deadline_ms: u64,
        parts: usize,
        template: TaskTemplate,
    ) -> LifecycleResult<Identifier> {
        let task_id = self.inner.state.write().await.create_task(
            owner_seed,
            owner,
            resources,
            max_price,
            deadline_ms,
            parts,
        )?;
        self.inner.templates.write().await.insert(task_id, template);
        self.inner.offers.write().await.insert(task_id, Vec::new());
        Ok(task_id)
    }

    /// Cancel a task: running sandbox jobs are stopped cooperatively and
    /// in-flight verification work is discarded.
    pub async fn cancel_task(&self, task_id: Identifier) -> LifecycleResult<()> {
        let (running, events) = self.inner.state.write().await.cancel_task(&task_id)?;
        for subtask_id in running {
            if let Err(err) = self.inner.sandbox.cancel(&compute_job_name(&subtask_id)).await {
                warn!(subtask_id = %subtask_id, error = %err, "Sandbox cancel failed");
            }
        }
        self.inner.handle_events(events, unix_now_ms()).await;
        Ok(())
    }

    /// Resolve an escalated `NOT_SURE` subtask with an external decision.
    pub async fn resolve_escalation(
        &self,
        subtask_id: Identifier,
        accept: bool,
    ) -> LifecycleResult<()> {
        let events = self
            .inner
            .state
            .write()
            .await
            .resolve_escalation(&subtask_id, accept)?;
        self.inner.handle_events(events, unix_now_ms()).await;
        Ok(())
    }

    /// Run the timeout sweep once with an injected clock.
    pub async fn tick(&self, now_ms: u64) {
        self.inner.clone().on_tick(now_ms).await;
    }

    /// Run the service main loop until shutdown.
    pub async fn run(&mut self) {
        info!("Starting task orchestrator service");
        let mut tick = tokio::time::interval(self.inner.config.tick_interval);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Orchestrator stopping");
                    break;
                }

                Some(frame) = self.inbound_rx.recv() => {
                    let inner = self.inner.clone();
                    inner.handle_frame(frame, unix_now_ms()).await;
                }

                _ = tick.tick() => {
                    self.inner.clone().on_tick(unix_now_ms()).await;
                }
            }
        }
    }

    /// Feed one raw frame with an injected clock, for tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn inject_frame(&self, bytes: Vec<u8>, now_ms: u64) {
        self.inner.clone().handle_frame(bytes, now_ms).await;
    }

    /// Direct state access, for tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn state(&self) -> &RwLock<LifecycleState> {
        &self.inner.state
    }

    /// Run the provider-side compute flow inline, for tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn compute_inline(&self, assignment: TaskToCompute, now_ms: u64) {
        self.inner.clone().compute_assigned(assignment, now_ms).await;
    }
}

fn compute_job_name(subtask_id: &Identifier) -> String {
    format!("compute-{}", subtask_id)
}

impl Inner {
    async fn send(&self, body: MessageBody, now_ms: u64) {
        let message = Message::new(body, now_ms);
        match self.codec.encode(&message) {
            Ok(frame) => {
                if self.outbound_tx.send(frame).await.is_err() {
                    debug!("Outbound channel closed");
                }
            }
            Err(err) => error!(error = %err, "Outbound message encoding failed"),
        }
    }

    fn forward_event(&self, event: LifecycleEvent) {
        let _ = self.events_tx.try_send(event);
    }

    async fn subtask_lock(&self, subtask_id: &Identifier) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(*subtask_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Decode, staleness-filter and dispatch one inbound frame.
    async fn handle_frame(self: Arc<Self>, bytes: Vec<u8>, now_ms: u64) {
        let message = match self.codec.decode(&bytes) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "Dropping undecodable frame");
                self.metrics
                    .dropped_frames_total
                    .with_label_values(&["decode"])
                    .inc();
                return;
            }
        };

        if self.policy.is_stale_message(&message, now_ms) {
            debug!(kind = ?message.kind(), "Dropping stale message");
            self.metrics
                .dropped_frames_total
                .with_label_values(&["stale"])
                .inc();
            return;
        }

        match message.body {
            MessageBody::Hello(hello) => {
                self.state.write().await.nodes_mut().upsert(hello.node, now_ms);
            }
            MessageBody::Ping => {
                self.send(MessageBody::Pong, now_ms).await;
            }
            MessageBody::Pong => {
                // Liveness only; frames carry no peer identity to refresh.
            }
            MessageBody::GetPeers => {
                let peers = self.state.read().await.nodes().infos();
                self.send(
                    MessageBody::Peers(taskgrid_wire::Peers { peers }),
                    now_ms,
                )
                .await;
            }
            MessageBody::Peers(peers) => {
                let mut state = self.state.write().await;
                for info in peers.peers {
                    state.nodes_mut().upsert(info, now_ms);
                }
            }
            MessageBody::WantToCompute(offer) => {
                self.clone().on_offer(offer, now_ms).await;
            }
            MessageBody::TaskToCompute(assignment) => {
                // Provider side: execution is long-running; run it off the
                // dispatch path.
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.compute_assigned(assignment, now_ms).await;
                });
            }
            MessageBody::ReportComputedTask(report) => {
                self.clone()
                    .process_report(report.subtask_id, report.result, report.payload_hash, now_ms)
                    .await;
            }
            MessageBody::ForceReport(report) => {
                self.clone()
                    .process_report(report.subtask_id, report.result, report.payload_hash, now_ms)
                    .await;
            }
            MessageBody::ResultsAccepted(accepted) => {
                info!(
                    subtask_id = %accepted.subtask_id,
                    payment_eligible_at_ms = accepted.payment_eligible_at_ms,
                    "Results accepted by requestor"
                );
            }
            MessageBody::ResultsRejected(rejected) => {
                warn!(
                    subtask_id = %rejected.subtask_id,
                    reason = %rejected.reason,
                    "Results rejected by requestor"
                );
            }
            MessageBody::CannotAssign(refusal) => {
                debug!(task_id = %refusal.task_id, reason = %refusal.reason, "Assignment refused");
            }
        }
    }

    /// Handle a provider's demand-offer.
    async fn on_offer(self: Arc<Self>, offer: taskgrid_wire::WantToCompute, now_ms: u64) {
        let waiting = {
            let mut state = self.state.write().await;
            let task = match state.task(&offer.task_id) {
                Some(task) => task.clone(),
                None => {
                    drop(state);
                    self.send(
                        MessageBody::CannotAssign(CannotAssign {
                            task_id: offer.task_id,
                            reason: "unknown task".to_string(),
                        }),
                        now_ms,
                    )
                    .await;
                    return;
                }
            };

            if offer.price > task.max_price {
                drop(state);
                self.send(
                    MessageBody::CannotAssign(CannotAssign {
                        task_id: offer.task_id,
                        reason: "price above ceiling".to_string(),
                    }),
                    now_ms,
                )
                .await;
                return;
            }

            state.nodes_mut().upsert(
                NodeInfo {
                    id: offer.provider.clone(),
                    address: String::new(),
                    performance: offer.performance,
                },
                now_ms,
            );

            task.parts
                .iter()
                .copied()
                .find(|id| {
                    state
                        .subtask(id)
                        .map(|s| s.state.can_retry() && !s.abandoned)
                        .unwrap_or(false)
                })
        };

        {
            let mut offers = self.offers.write().await;
            let pool = offers.entry(offer.task_id).or_default();
            if !pool.contains(&offer.provider) {
                pool.push(offer.provider.clone());
            }
        }

        match waiting {
            Some(subtask_id) => {
                if !self.try_assign(subtask_id, now_ms).await {
                    self.send(
                        MessageBody::CannotAssign(CannotAssign {
                            task_id: offer.task_id,
                            reason: "no eligible provider".to_string(),
                        }),
                        now_ms,
                    )
                    .await;
                }
            }
            None => debug!(task_id = %offer.task_id, "Offer pooled; no subtask waiting"),
        }
    }

    /// Try to assign a waiting subtask from its task's offer pool and emit
    /// the assignment message on success.
    async fn try_assign(self: &Arc<Self>, subtask_id: Identifier, now_ms: u64) -> bool {
        let (task_id, part, parts_total, resources, max_price) = {
            let state = self.state.read().await;
            let subtask = match state.subtask(&subtask_id) {
                Some(subtask) => subtask,
                None => return false,
            };
            let task = match state.task(&subtask.task_id) {
                Some(task) => task,
                None => return false,
            };
            (
                task.id,
                subtask.part,
                task.parts.len(),
                task.resources.clone(),
                task.max_price,
            )
        };

        let pool = self
            .offers
            .read()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default();
        if pool.is_empty() {
            return false;
        }

        let budget = self.config.attempt_budget;
        let choice = {
            let mut state = self.state.write().await;
            match state.assign(&subtask_id, &pool, now_ms, budget) {
                Ok(choice) => choice,
                Err(LifecycleError::NoEligibleProvider(_)) => {
                    debug!(subtask_id = %subtask_id, "No eligible provider in the offer pool");
                    return false;
                }
                Err(err) => {
                    warn!(subtask_id = %subtask_id, error = %err, "Assignment failed");
                    return false;
                }
            }
        };
        self.metrics.assignments_total.inc();
        self.forward_event(LifecycleEvent::SubtaskAssigned {
            subtask_id,
            task_id,
            provider: choice.provider.clone(),
            deadline_ms: choice.deadline_ms,
        });

        let template = match self.templates.read().await.get(&task_id).cloned() {
            Some(template) => template,
            None => {
                warn!(task_id = %task_id, "No template registered for task");
                return false;
            }
        };

        let region = part_region(template.resolution, part, parts_total);
        let params = JobParams::new(
            template.workload.clone(),
            template.resolution,
            template.quality,
            template.frames.clone(),
            template.output_format,
            format!("part_{part}"),
        )
        .with_crop(region);

        let params = match serde_json::to_value(&params) {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, "Job params serialization failed");
                return false;
            }
        };

        self.send(
            MessageBody::TaskToCompute(TaskToCompute {
                task_id,
                subtask_id,
                resources,
                params,
                deadline_ms: choice.deadline_ms,
                price: max_price,
            }),
            now_ms,
        )
        .await;
        true
    }

    /// Provider side: execute an assigned subtask in the sandbox and report
    /// the result. Execution faults are not reported; the requestor's
    /// timeout sweep covers an unresponsive or crashed attempt.
    async fn compute_assigned(self: Arc<Self>, assignment: TaskToCompute, now_ms: u64) {
        let params: JobParams = match serde_json::from_value(assignment.params.clone()) {
            Ok(params) => params,
            Err(err) => {
                warn!(subtask_id = %assignment.subtask_id, error = %err, "Malformed job params");
                return;
            }
        };

        let budget_ms = assignment.deadline_ms.saturating_sub(now_ms);
        if budget_ms == 0 {
            warn!(subtask_id = %assignment.subtask_id, "Assignment already past its deadline");
            return;
        }

        let job_root = self
            .config
            .mount_root
            .join(assignment.subtask_id.to_string());
        let mounts = JobMounts::new(
            self.config
                .resources_root
                .join(assignment.task_id.to_string()),
            job_root.join("work"),
            job_root.join("output"),
        );
        for dir in [&mounts.resources_dir, &mounts.work_dir, &mounts.output_dir] {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                warn!(error = %err, "Could not create job mounts");
                return;
            }
        }

        let output_file = mounts.output_dir.join(format!(
            "{}.{}",
            params.output_basename,
            params.output_format.extension()
        ));
        let spec = JobSpec::new(
            compute_job_name(&assignment.subtask_id),
            self.config.job_image.clone(),
            self.config.job_entrypoint.clone(),
            params,
        );

        let outcome = match self
            .sandbox
            .run(&spec, &mounts, Duration::from_millis(budget_ms))
            .await
        {
            Ok(outcome) if outcome.succeeded() => outcome,
            Ok(outcome) => {
                warn!(
                    subtask_id = %assignment.subtask_id,
                    exit_code = outcome.exit_code,
                    "Job failed; no report will be sent"
                );
                return;
            }
            Err(err) => {
                warn!(subtask_id = %assignment.subtask_id, error = %err, "Job did not complete");
                return;
            }
        };

        let bytes = match tokio::fs::read(&output_file).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(subtask_id = %assignment.subtask_id, error = %err, "Job produced no output");
                return;
            }
        };

        let payload_hash = *blake3::hash(&bytes).as_bytes();
        let result = self.store.put(bytes).await;
        info!(
            subtask_id = %assignment.subtask_id,
            result = %result,
            duration_ms = outcome.duration.as_millis() as u64,
            "Reporting computed subtask"
        );
        self.send(
            MessageBody::ReportComputedTask(ReportComputedTask {
                subtask_id: assignment.subtask_id,
                result,
                payload_hash,
            }),
            now_ms,
        )
        .await;
    }

    /// Requestor side: validate, verify and settle a reported result.
    async fn process_report(
        self: Arc<Self>,
        subtask_id: Identifier,
        result: ResultRef,
        payload_hash: [u8; 32],
        arrival_ms: u64,
    ) {
        let lock = self.subtask_lock(&subtask_id).await;
        let _guard = lock.lock().await;

        let bytes = match self.store.fetch(&result).await {
            Some(bytes) => bytes,
            None => {
                debug!(subtask_id = %subtask_id, result = %result, "Result payload not found");
                self.metrics
                    .dropped_frames_total
                    .with_label_values(&["unknown-result"])
                    .inc();
                return;
            }
        };

        if blake3::hash(&bytes).as_bytes() != &payload_hash {
            warn!(subtask_id = %subtask_id, "Result payload hash mismatch");
            self.metrics
                .dropped_frames_total
                .with_label_values(&["hash-mismatch"])
                .inc();
            return;
        }

        let disposition = {
            let mut state = self.state.write().await;
            match state.on_result(&subtask_id, result, arrival_ms) {
                Ok(disposition) => disposition,
                Err(err) => {
                    debug!(subtask_id = %subtask_id, error = %err, "Report not actionable");
                    return;
                }
            }
        };

        let events = match disposition {
            ResultDisposition::Late(events) => {
                self.metrics.timeouts_total.inc();
                events
            }
            ResultDisposition::InWindow => {
                match self.verify_in_window(subtask_id, bytes, arrival_ms).await {
                    Some(events) => events,
                    None => return,
                }
            }
        };
        self.handle_events(events, arrival_ms).await;
    }

    /// Build the verification request for an in-window result and apply the
    /// verdict to the state machine.
    async fn verify_in_window(
        &self,
        subtask_id: Identifier,
        bytes: Vec<u8>,
        now_ms: u64,
    ) -> Option<Vec<LifecycleEvent>> {
        let (task_id, part, parts_total) = {
            let state = self.state.read().await;
            let subtask = state.subtask(&subtask_id)?;
            let task = state.task(&subtask.task_id)?;
            (task.id, subtask.part, task.parts.len())
        };
        let template = self.templates.read().await.get(&task_id).cloned()?;

        let region = part_region(template.resolution, part, parts_total);
        let payload = ResultPayload {
            resolution: Resolution::new(region.width, region.height),
            format: template.output_format,
            frames: template.frames.len() as u32,
            data: bytes,
        };
        let request = VerifyRequest {
            subtask_id,
            workload: template.workload.clone(),
            resolution: template.resolution,
            quality: template.quality,
            frames: template.frames.clone(),
            output_format: template.output_format,
            part: region,
            fragment_count: None,
            resources_dir: self.config.resources_root.join(task_id.to_string()),
            probe: template.probe,
        };

        let record = match self.engine.verify(&request, &payload, now_ms).await {
            Ok(record) => record,
            Err(err) => {
                warn!(subtask_id = %subtask_id, error = %err, "Verification request malformed");
                return None;
            }
        };

        let verdict_label = match record.verdict {
            Verdict::Accept => "accept",
            Verdict::Reject => "reject",
            Verdict::Inconclusive => "inconclusive",
        };
        self.metrics
            .verdicts_total
            .with_label_values(&[verdict_label])
            .inc();

        let mut state = self.state.write().await;
        match state.apply_verdict(&subtask_id, record.state) {
            Ok(events) => Some(events),
            Err(err) => {
                warn!(subtask_id = %subtask_id, error = %err, "Verdict could not be applied");
                None
            }
        }
    }

    /// Timeout sweep: expire in-progress attempts and retry them.
    async fn on_tick(self: Arc<Self>, now_ms: u64) {
        let events = {
            let mut state = self.state.write().await;
            state.on_tick(now_ms)
        };
        if !events.is_empty() {
            self.handle_events(events, now_ms).await;
        }
    }

    /// Turn lifecycle events into outbound messages, retries and metrics.
    /// Each event is forwarded to observers before any follow-up it
    /// triggers, so consumers see causes ahead of consequences.
    async fn handle_events(self: &Arc<Self>, events: Vec<LifecycleEvent>, now_ms: u64) {
        for event in events {
            self.forward_event(event.clone());
            match &event {
                LifecycleEvent::SubtaskVerified { subtask_id, .. } => {
                    let payment_eligible_at_ms = self
                        .policy
                        .deadline_for(taskgrid_wire::MessageKind::ResultsAccepted, now_ms);
                    self.send(
                        MessageBody::ResultsAccepted(ResultsAccepted {
                            subtask_id: *subtask_id,
                            payment_eligible_at_ms,
                        }),
                        now_ms,
                    )
                    .await;
                }
                LifecycleEvent::SubtaskRejected {
                    subtask_id,
                    replacement,
                    ..
                } => {
                    self.send(
                        MessageBody::ResultsRejected(ResultsRejected {
                            subtask_id: *subtask_id,
                            reason: FailureReason::Other("verification rejected".to_string()),
                        }),
                        now_ms,
                    )
                    .await;
                    if let Some(replacement) = replacement {
                        self.try_assign(*replacement, now_ms).await;
                    }
                }
                LifecycleEvent::SubtaskTimedOut { subtask_id, .. } => {
                    self.metrics.timeouts_total.inc();
                    self.try_assign(*subtask_id, now_ms).await;
                }
                LifecycleEvent::SubtaskAbandoned {
                    subtask_id,
                    attempts,
                    ..
                } => {
                    warn!(
                        subtask_id = %subtask_id,
                        attempts,
                        "Subtask permanently failed"
                    );
                }
                LifecycleEvent::SubtaskNotSure { subtask_id, .. } => {
                    info!(subtask_id = %subtask_id, "Verification inconclusive; awaiting escalation");
                }
                LifecycleEvent::TaskCompleted { task_id } => {
                    info!(task_id = %task_id, "All parts verified");
                }
                LifecycleEvent::TaskExpired { task_id } => {
                    warn!(task_id = %task_id, "Task expired before completion");
                    let parts = self
                        .state
                        .read()
                        .await
                        .task(task_id)
                        .map(|task| task.parts.clone())
                        .unwrap_or_default();
                    for subtask_id in parts {
                        let _ = self.sandbox.cancel(&compute_job_name(&subtask_id)).await;
                    }
                }
                LifecycleEvent::SubtaskAssigned { .. } | LifecycleEvent::TaskCancelled { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LifecycleConfig;
    use taskgrid_sandbox::{JobOutcome, SandboxResult};
    use taskgrid_timing::TimingConfig;
    use taskgrid_wire::{MessageKind, WantToCompute, WireConfig};

    const OWNER_SEED: &[u8] = b"\x11\x22\x33\x44\x55\x66-owner-key";
    const NOW: u64 = 1_700_000_000_000;

    /// Sandbox that writes `byte` into the expected output/reference file,
    /// standing in for both the provider job and the reference re-render.
    struct ScriptedJobSandbox {
        byte: u8,
    }

    #[async_trait]
    impl Sandbox for ScriptedJobSandbox {
        async fn run(
            &self,
            spec: &JobSpec,
            mounts: &JobMounts,
            _budget: Duration,
        ) -> SandboxResult<JobOutcome> {
            let region = spec
                .params
                .crop
                .expect("assignments and verifications carry a crop");
            let len = region.pixels() * spec.params.output_format.bytes_per_pixel();
            let path = mounts.output_dir.join(format!(
                "{}.{}",
                spec.params.output_basename,
                spec.params.output_format.extension()
            ));
            tokio::fs::create_dir_all(&mounts.output_dir).await.unwrap();
            tokio::fs::write(&path, vec![self.byte; len as usize])
                .await
                .unwrap();
            Ok(JobOutcome {
                exit_code: 0,
                output_dir: mounts.output_dir.clone(),
                duration: Duration::from_millis(3),
            })
        }

        async fn cancel(&self, _job_name: &str) -> SandboxResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        service: OrchestratorService,
        handle: ServiceHandle,
        store: Arc<InMemoryResultStore>,
        codec: MessageCodec,
        _root: tempfile::TempDir,
    }

    fn fixture(reference_byte: u8) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            mount_root: root.path().join("jobs"),
            resources_root: root.path().join("resources"),
            ..ServiceConfig::default()
        };
        let verify = VerifyConfig {
            work_root: root.path().join("verify"),
            ..VerifyConfig::default()
        };
        let store = Arc::new(InMemoryResultStore::new());
        let sandbox = Arc::new(ScriptedJobSandbox {
            byte: reference_byte,
        });
        let (service, handle) = OrchestratorService::new(
            config,
            LifecycleConfig::default(),
            MessageCodec::new(WireConfig::default()),
            TimingPolicy::new(TimingConfig::default()),
            verify,
            sandbox,
            store.clone(),
            LifecycleMetrics::new_unregistered(),
        );
        Fixture {
            service,
            handle,
            store,
            codec: MessageCodec::new(WireConfig::default()),
            _root: root,
        }
    }

    fn template() -> TaskTemplate {
        TaskTemplate {
            workload: ResultRef::new("scenes/main.blend"),
            resolution: Resolution::new(40, 40),
            quality: 8,
            frames: vec![1],
            output_format: OutputFormat::Bmp,
            probe: None,
        }
    }

    async fn create_task(fixture: &Fixture, parts: usize) -> Identifier {
        fixture
            .service
            .create_task(
                OWNER_SEED,
                NodeId::new("owner"),
                ResultRef::new("bundle-1"),
                100,
                NOW + 3_600_000,
                parts,
                template(),
            )
            .await
            .unwrap()
    }

    fn offer_frame(fixture: &Fixture, task_id: Identifier, provider: &str, performance: u64) -> Vec<u8> {
        let message = Message::new(
            MessageBody::WantToCompute(WantToCompute {
                provider: NodeId::new(provider),
                task_id,
                performance,
                price: 50,
            }),
            NOW,
        );
        fixture.codec.encode(&message).unwrap()
    }

    fn payload_bytes(byte: u8) -> Vec<u8> {
        // One 40x40 BMP part, one frame.
        vec![byte; 40 * 40 * 3]
    }

    async fn report_frame(fixture: &Fixture, subtask_id: Identifier, bytes: Vec<u8>, ts: u64) -> Vec<u8> {
        let payload_hash = *blake3::hash(&bytes).as_bytes();
        let result = fixture.store.put(bytes).await;
        let message = Message::new(
            MessageBody::ReportComputedTask(ReportComputedTask {
                subtask_id,
                result,
                payload_hash,
            }),
            ts,
        );
        fixture.codec.encode(&message).unwrap()
    }

    fn expect_outbound(fixture: &mut Fixture, kind: MessageKind) -> Message {
        loop {
            let frame = fixture
                .handle
                .outbound_rx
                .try_recv()
                .expect("expected an outbound frame");
            let message = fixture.codec.decode(&frame).unwrap();
            if message.kind() == kind {
                return message;
            }
        }
    }

    #[test]
    fn test_part_region_stripes() {
        let res = Resolution::new(100, 90);
        assert_eq!(part_region(res, 0, 3), CropRegion::new(0, 0, 100, 30));
        assert_eq!(part_region(res, 1, 3), CropRegion::new(0, 30, 100, 30));
        assert_eq!(part_region(res, 2, 3), CropRegion::new(0, 60, 100, 30));
        // Remainder rows go to the last part.
        let res = Resolution::new(100, 100);
        assert_eq!(part_region(res, 2, 3), CropRegion::new(0, 66, 100, 34));
    }

    #[tokio::test]
    async fn test_offer_assigns_and_emits_assignment() {
        let mut fixture = fixture(9);
        let task_id = create_task(&fixture, 1).await;

        let frame = offer_frame(&fixture, task_id, "aa", 500);
        fixture.service.inject_frame(frame, NOW).await;

        let message = expect_outbound(&mut fixture, MessageKind::TaskToCompute);
        let assignment = match message.body {
            MessageBody::TaskToCompute(assignment) => assignment,
            other => panic!("unexpected body {other:?}"),
        };
        assert_eq!(assignment.task_id, task_id);
        assert!(assignment.deadline_ms > NOW);

        let state = fixture.service.state().read().await;
        let subtask = state.subtask(&assignment.subtask_id).unwrap();
        assert_eq!(subtask.provider, Some(NodeId::new("aa")));
    }

    #[tokio::test]
    async fn test_offer_above_price_ceiling_refused() {
        let mut fixture = fixture(9);
        let task_id = create_task(&fixture, 1).await;

        let message = Message::new(
            MessageBody::WantToCompute(WantToCompute {
                provider: NodeId::new("aa"),
                task_id,
                performance: 500,
                price: 101,
            }),
            NOW,
        );
        let frame = fixture.codec.encode(&message).unwrap();
        fixture.service.inject_frame(frame, NOW).await;

        let reply = expect_outbound(&mut fixture, MessageKind::CannotAssign);
        assert!(matches!(reply.body, MessageBody::CannotAssign(_)));
    }

    #[tokio::test]
    async fn test_undecodable_and_stale_frames_are_dropped() {
        let fixture = fixture(9);
        let task_id = create_task(&fixture, 1).await;

        // Garbage bytes: no crash, no state change.
        fixture.service.inject_frame(vec![0xde, 0xad], NOW).await;

        // A well-formed but ancient offer: dropped by the timing policy.
        let frame = offer_frame(&fixture, task_id, "aa", 500);
        fixture
            .service
            .inject_frame(frame, NOW + 100 * 3_600_000)
            .await;

        let state = fixture.service.state().read().await;
        let subtask_id = state.task(&task_id).unwrap().parts[0];
        assert_eq!(
            state.subtask(&subtask_id).unwrap().state,
            taskgrid_types::SubtaskVerificationState::Waiting
        );
    }

    #[tokio::test]
    async fn test_good_report_verifies_and_accepts() {
        let mut fixture = fixture(9);
        let task_id = create_task(&fixture, 1).await;

        fixture
            .service
            .inject_frame(offer_frame(&fixture, task_id, "aa", 500), NOW)
            .await;
        let assignment = match expect_outbound(&mut fixture, MessageKind::TaskToCompute).body {
            MessageBody::TaskToCompute(assignment) => assignment,
            other => panic!("unexpected body {other:?}"),
        };

        // Provider returns the same bytes the reference render produces.
        let frame =
            report_frame(&fixture, assignment.subtask_id, payload_bytes(9), NOW + 1_000).await;
        fixture.service.inject_frame(frame, NOW + 1_000).await;

        let accepted = expect_outbound(&mut fixture, MessageKind::ResultsAccepted);
        match accepted.body {
            MessageBody::ResultsAccepted(accepted) => {
                assert_eq!(accepted.subtask_id, assignment.subtask_id);
                assert!(accepted.payment_eligible_at_ms > NOW + 1_000);
            }
            other => panic!("unexpected body {other:?}"),
        }

        let state = fixture.service.state().read().await;
        assert_eq!(
            state.subtask(&assignment.subtask_id).unwrap().state,
            taskgrid_types::SubtaskVerificationState::Verified
        );
    }

    #[tokio::test]
    async fn test_wrong_answer_rejects_and_reassigns_other_provider() {
        let mut fixture = fixture(9);
        let task_id = create_task(&fixture, 1).await;

        // Two offers; "aa" scores higher and is assigned first.
        fixture
            .service
            .inject_frame(offer_frame(&fixture, task_id, "aa", 900), NOW)
            .await;
        fixture
            .service
            .inject_frame(offer_frame(&fixture, task_id, "bb", 100), NOW)
            .await;
        let assignment = match expect_outbound(&mut fixture, MessageKind::TaskToCompute).body {
            MessageBody::TaskToCompute(assignment) => assignment,
            other => panic!("unexpected body {other:?}"),
        };

        // Structurally valid but content-wrong payload.
        let frame =
            report_frame(&fixture, assignment.subtask_id, payload_bytes(0), NOW + 1_000).await;
        fixture.service.inject_frame(frame, NOW + 1_000).await;

        let rejected = expect_outbound(&mut fixture, MessageKind::ResultsRejected);
        assert!(matches!(rejected.body, MessageBody::ResultsRejected(_)));

        // The replacement subtask goes to the other provider.
        let reassigned = match expect_outbound(&mut fixture, MessageKind::TaskToCompute).body {
            MessageBody::TaskToCompute(assignment) => assignment,
            other => panic!("unexpected body {other:?}"),
        };
        assert_ne!(reassigned.subtask_id, assignment.subtask_id);

        let state = fixture.service.state().read().await;
        assert_eq!(
            state.subtask(&reassigned.subtask_id).unwrap().provider,
            Some(NodeId::new("bb"))
        );
    }

    #[tokio::test]
    async fn test_timeout_sweep_penalizes_and_reassigns() {
        let mut fixture = fixture(9);
        let task_id = create_task(&fixture, 1).await;

        fixture
            .service
            .inject_frame(offer_frame(&fixture, task_id, "aa", 900), NOW)
            .await;
        fixture
            .service
            .inject_frame(offer_frame(&fixture, task_id, "bb", 100), NOW)
            .await;
        let assignment = match expect_outbound(&mut fixture, MessageKind::TaskToCompute).body {
            MessageBody::TaskToCompute(assignment) => assignment,
            other => panic!("unexpected body {other:?}"),
        };
        assert_eq!(
            fixture
                .service
                .state()
                .read()
                .await
                .subtask(&assignment.subtask_id)
                .unwrap()
                .provider,
            Some(NodeId::new("aa"))
        );

        // Provider never responds; sweep past the attempt deadline.
        fixture.service.tick(assignment.deadline_ms + 1).await;

        let state = fixture.service.state().read().await;
        let entry = state.nodes().get(&NodeId::new("aa")).unwrap();
        assert_eq!(entry.failed(), 1);
        assert_eq!(
            state.subtask(&assignment.subtask_id).unwrap().provider,
            Some(NodeId::new("bb"))
        );
        drop(state);

        let reassigned = expect_outbound(&mut fixture, MessageKind::TaskToCompute);
        assert!(matches!(reassigned.body, MessageBody::TaskToCompute(_)));
    }

    #[tokio::test]
    async fn test_hash_mismatch_dropped_without_state_change() {
        let mut fixture = fixture(9);
        let task_id = create_task(&fixture, 1).await;

        fixture
            .service
            .inject_frame(offer_frame(&fixture, task_id, "aa", 500), NOW)
            .await;
        let assignment = match expect_outbound(&mut fixture, MessageKind::TaskToCompute).body {
            MessageBody::TaskToCompute(assignment) => assignment,
            other => panic!("unexpected body {other:?}"),
        };

        let bytes = payload_bytes(9);
        let result = fixture.store.put(bytes).await;
        let message = Message::new(
            MessageBody::ReportComputedTask(ReportComputedTask {
                subtask_id: assignment.subtask_id,
                result,
                payload_hash: [0u8; 32],
            }),
            NOW + 1_000,
        );
        let frame = fixture.codec.encode(&message).unwrap();
        fixture.service.inject_frame(frame, NOW + 1_000).await;

        let state = fixture.service.state().read().await;
        assert_eq!(
            state.subtask(&assignment.subtask_id).unwrap().state,
            taskgrid_types::SubtaskVerificationState::InProgress
        );
    }

    #[tokio::test]
    async fn test_provider_compute_flow_reports_result() {
        let mut fixture = fixture(9);
        let task_id = create_task(&fixture, 1).await;

        fixture
            .service
            .inject_frame(offer_frame(&fixture, task_id, "aa", 500), NOW)
            .await;
        let assignment = match expect_outbound(&mut fixture, MessageKind::TaskToCompute).body {
            MessageBody::TaskToCompute(assignment) => assignment,
            other => panic!("unexpected body {other:?}"),
        };

        // Run the provider side inline; the scripted job writes its output
        // file, which is stored and reported.
        fixture
            .service
            .compute_inline(assignment.clone(), NOW + 1_000)
            .await;

        let report = expect_outbound(&mut fixture, MessageKind::ReportComputedTask);
        let report = match report.body {
            MessageBody::ReportComputedTask(report) => report,
            other => panic!("unexpected body {other:?}"),
        };
        assert_eq!(report.subtask_id, assignment.subtask_id);

        let bytes = fixture.store.fetch(&report.result).await.unwrap();
        assert_eq!(blake3::hash(&bytes).as_bytes(), &report.payload_hash);
    }

    #[tokio::test]
    async fn test_cancel_task_cancels_running_jobs() {
        let mut fixture = fixture(9);
        let task_id = create_task(&fixture, 1).await;

        fixture
            .service
            .inject_frame(offer_frame(&fixture, task_id, "aa", 500), NOW)
            .await;
        let assignment = match expect_outbound(&mut fixture, MessageKind::TaskToCompute).body {
            MessageBody::TaskToCompute(assignment) => assignment,
            other => panic!("unexpected body {other:?}"),
        };

        fixture.service.cancel_task(task_id).await.unwrap();

        let state = fixture.service.state().read().await;
        assert!(state.task(&task_id).unwrap().cancelled);
        assert_eq!(
            state.subtask(&assignment.subtask_id).unwrap().state,
            taskgrid_types::SubtaskVerificationState::Timeout
        );
    }
}
