//! Pure task/subtask lifecycle state machine.
//!
//! Owns tasks, their subtasks and the transition table over
//! [`SubtaskVerificationState`]. Everything here is synchronous and clock-
//! injected: `on_tick` is handed `now` by the caller, which is the only
//! place wall-clock time enters the machine. Network, sandbox and
//! verification I/O live in the service layer.

use crate::error::{LifecycleError, LifecycleResult};
use crate::registry::NodeCache;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use taskgrid_ident::{derive, generate, Identifier, InvalidIdentifierError};
use taskgrid_types::{NodeId, ResultRef, SubtaskVerificationState};
use tracing::{debug, info, warn};

use SubtaskVerificationState as State;

/// Lifecycle tuning, threaded into the constructor.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Maximum attempts per part before the subtask is permanently failed.
    pub attempt_ceiling: u32,
    /// Node cache capacity (least-recently-seen eviction beyond it).
    pub node_cache_capacity: usize,
    /// Attempt budget applied when the caller supplies none.
    pub default_time_budget: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            attempt_ceiling: 3,
            node_cache_capacity: 512,
            default_time_budget: Duration::from_secs(300),
        }
    }
}

/// A unit of requestor work, decomposed into subtasks.
#[derive(Debug, Clone)]
pub struct Task {
    /// Generation-bound task identifier.
    pub id: Identifier,
    /// Owning node.
    pub owner: NodeId,
    /// Resource bundle reference.
    pub resources: ResultRef,
    /// Price ceiling per subtask.
    pub max_price: u64,
    /// Task deadline, unix ms.
    pub deadline_ms: u64,
    /// Current subtask per part. Replacement after a wrong answer swaps the
    /// part's entry; superseded subtasks stay in the machine for audit.
    pub parts: Vec<Identifier>,
    /// Whether the task has been cancelled.
    pub cancelled: bool,
}

/// The atomic unit of dispatched work, owned by exactly one task.
#[derive(Debug, Clone)]
pub struct Subtask {
    /// Generation-bound subtask identifier, derived from the task id.
    pub id: Identifier,
    /// Owning task.
    pub task_id: Identifier,
    /// Part of the task this subtask covers.
    pub part: usize,
    /// Verification state.
    pub state: SubtaskVerificationState,
    /// Assigned provider for the active attempt, if any.
    pub provider: Option<NodeId>,
    /// Deadline of the active attempt, unix ms.
    pub attempt_deadline_ms: Option<u64>,
    /// Reported result reference, once one arrived in window.
    pub result: Option<ResultRef>,
    /// Attempts consumed across this part, carried over to replacements.
    pub attempts: u32,
    /// Permanently failed: attempt ceiling reached.
    pub abandoned: bool,
}

/// Assignment decision returned by [`LifecycleState::assign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderChoice {
    /// Selected provider.
    pub provider: NodeId,
    /// Attempt deadline, unix ms.
    pub deadline_ms: u64,
}

/// Disposition of an inbound result report.
#[derive(Debug)]
pub enum ResultDisposition {
    /// Arrived within the attempt window; verification may proceed.
    InWindow,
    /// Arrived past the recorded deadline; routed through the timeout
    /// transition instead of verification.
    Late(Vec<LifecycleEvent>),
}

/// Observable lifecycle outcomes, consumed by the service layer to emit
/// outbound messages and settlement decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    SubtaskAssigned {
        subtask_id: Identifier,
        task_id: Identifier,
        provider: NodeId,
        deadline_ms: u64,
    },
    SubtaskVerified {
        subtask_id: Identifier,
        task_id: Identifier,
        provider: NodeId,
    },
    /// Wrong answer; `replacement` holds the fresh subtask covering the
    /// same part when attempts remain.
    SubtaskRejected {
        subtask_id: Identifier,
        task_id: Identifier,
        provider: NodeId,
        replacement: Option<Identifier>,
    },
    /// Verification could not decide; awaiting escalation.
    SubtaskNotSure {
        subtask_id: Identifier,
        task_id: Identifier,
    },
    SubtaskTimedOut {
        subtask_id: Identifier,
        task_id: Identifier,
        provider: NodeId,
    },
    /// Attempt ceiling reached; permanently failed and surfaced to the
    /// task owner.
    SubtaskAbandoned {
        subtask_id: Identifier,
        task_id: Identifier,
        attempts: u32,
    },
    /// Every part reached `Verified`.
    TaskCompleted { task_id: Identifier },
    TaskCancelled { task_id: Identifier },
    /// The task deadline passed before all parts were verified.
    TaskExpired { task_id: Identifier },
}

/// The transition table. Exhaustive: any pair not listed is invalid.
///
/// `NotSure` resolves to a terminal state through the escalation path
/// (arbiter or manual decision), which is why its two outgoing edges are
/// part of the table.
pub fn is_valid_transition(from: State, to: State) -> bool {
    matches!(
        (from, to),
        (State::Unknown, State::Waiting)
            | (State::Waiting, State::InProgress)
            | (State::InProgress, State::Verified)
            | (State::InProgress, State::WrongAnswer)
            | (State::InProgress, State::NotSure)
            | (State::InProgress, State::Timeout)
            | (State::Timeout, State::Waiting)
            | (State::Timeout, State::InProgress)
            | (State::NotSure, State::Verified)
            | (State::NotSure, State::WrongAnswer)
    )
}

/// The lifecycle state machine: sole mutator of task and subtask state.
#[derive(Debug)]
pub struct LifecycleState {
    config: LifecycleConfig,
    tasks: HashMap<Identifier, Task>,
    subtasks: HashMap<Identifier, Subtask>,
    /// Providers penalized per task; never selected again for that task.
    penalized: HashMap<Identifier, HashSet<NodeId>>,
    nodes: NodeCache,
}

impl LifecycleState {
    /// Create an empty state machine.
    pub fn new(config: LifecycleConfig) -> Self {
        let capacity = config.node_cache_capacity;
        Self {
            config,
            tasks: HashMap::new(),
            subtasks: HashMap::new(),
            penalized: HashMap::new(),
            nodes: NodeCache::new(capacity),
        }
    }

    /// The configuration in effect.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Shared node cache.
    pub fn nodes(&self) -> &NodeCache {
        &self.nodes
    }

    /// Mutable node cache, for first-contact upserts.
    pub fn nodes_mut(&mut self) -> &mut NodeCache {
        &mut self.nodes
    }

    /// Look up a task.
    pub fn task(&self, id: &Identifier) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Look up a subtask.
    pub fn subtask(&self, id: &Identifier) -> Option<&Subtask> {
        self.subtasks.get(id)
    }

    /// Create a task and its initial subtasks, one per part, all offered
    /// (`Waiting`) immediately.
    ///
    /// Identifiers are generation-bound to `owner_seed`, so lineage can be
    /// confirmed later with [`taskgrid_ident::verify_generation`].
    pub fn create_task(
        &mut self,
        owner_seed: &[u8],
        owner: NodeId,
        resources: ResultRef,
        max_price: u64,
        deadline_ms: u64,
        parts: usize,
    ) -> Result<Identifier, InvalidIdentifierError> {
        let task_id = generate(owner_seed)?;
        let mut part_ids = Vec::with_capacity(parts);

        for part in 0..parts.max(1) {
            let subtask_id = derive(&task_id);
            let mut subtask = Subtask {
                id: subtask_id,
                task_id,
                part,
                state: State::Unknown,
                provider: None,
                attempt_deadline_ms: None,
                result: None,
                attempts: 0,
                abandoned: false,
            };
            subtask.state = State::Waiting;
            debug!(subtask_id = %subtask_id, task_id = %task_id, part, "Subtask offered");
            self.subtasks.insert(subtask_id, subtask);
            part_ids.push(subtask_id);
        }

        let task = Task {
            id: task_id,
            owner: owner.clone(),
            resources,
            max_price,
            deadline_ms,
            parts: part_ids,
            cancelled: false,
        };
        info!(task_id = %task_id, owner = %owner, parts = task.parts.len(), "Task created");
        self.tasks.insert(task_id, task);
        self.penalized.insert(task_id, HashSet::new());
        Ok(task_id)
    }

    /// Apply one edge of the transition table.
    fn transition(&mut self, subtask_id: &Identifier, to: State) -> LifecycleResult<()> {
        let subtask = self
            .subtasks
            .get_mut(subtask_id)
            .ok_or(LifecycleError::SubtaskNotFound(*subtask_id))?;

        let from = subtask.state;
        if !is_valid_transition(from, to) {
            return Err(LifecycleError::InvalidTransition { from, to });
        }

        info!(subtask_id = %subtask_id, from = %from, to = %to, "Subtask transition");
        subtask.state = to;
        Ok(())
    }

    /// Milliseconds of attempt budget currently in flight for a task.
    fn in_flight_budget_ms(&self, task: &Task, now_ms: u64) -> u64 {
        task.parts
            .iter()
            .filter_map(|id| self.subtasks.get(id))
            .filter(|s| s.state == State::InProgress)
            .filter_map(|s| s.attempt_deadline_ms)
            .map(|deadline| deadline.saturating_sub(now_ms))
            .sum()
    }

    /// Assign a subtask to the best eligible candidate.
    ///
    /// Selection prefers the highest effective score among cached providers
    /// not already penalized for this task, tie-broken by identifier order
    /// for determinism. Fails with [`LifecycleError::NoEligibleProvider`]
    /// when no candidate qualifies. Not retried internally, since retrying
    /// without new information cannot help.
    pub fn assign(
        &mut self,
        subtask_id: &Identifier,
        candidates: &[NodeId],
        now_ms: u64,
        budget: Duration,
    ) -> LifecycleResult<ProviderChoice> {
        let subtask = self
            .subtasks
            .get(subtask_id)
            .ok_or(LifecycleError::SubtaskNotFound(*subtask_id))?;
        let task = self
            .tasks
            .get(&subtask.task_id)
            .ok_or(LifecycleError::TaskNotFound(subtask.task_id))?;

        if task.cancelled {
            return Err(LifecycleError::TaskCancelled(task.id));
        }
        if subtask.abandoned {
            return Err(LifecycleError::AttemptsExhausted {
                id: *subtask_id,
                attempts: subtask.attempts,
            });
        }
        if !subtask.state.can_retry() {
            return Err(LifecycleError::RetryNotAllowed {
                id: *subtask_id,
                state: subtask.state,
            });
        }

        // The task deadline must cover every in-flight attempt budget plus
        // this one.
        let budget_ms = budget.as_millis() as u64;
        let committed = self.in_flight_budget_ms(task, now_ms);
        if now_ms.saturating_add(committed).saturating_add(budget_ms) > task.deadline_ms {
            return Err(LifecycleError::BudgetOverrun {
                budget_ms,
                deadline_ms: task.deadline_ms,
            });
        }

        let task_id = subtask.task_id;
        let penalized = self.penalized.get(&task_id).cloned().unwrap_or_default();

        let mut eligible: Vec<(u64, NodeId)> = Vec::new();
        let mut seen = HashSet::new();
        for candidate in candidates {
            if !seen.insert(candidate.clone()) || penalized.contains(candidate) {
                continue;
            }
            if let Some(entry) = self.nodes.get(candidate) {
                eligible.push((entry.effective_score(), candidate.clone()));
            }
        }

        // Highest score first; identifier order breaks ties.
        eligible.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let provider = eligible
            .into_iter()
            .map(|(_, id)| id)
            .next()
            .ok_or(LifecycleError::NoEligibleProvider(*subtask_id))?;

        self.transition(subtask_id, State::InProgress)?;
        let deadline_ms = now_ms + budget_ms;
        let subtask = self.subtasks.get_mut(subtask_id).expect("checked above");
        subtask.provider = Some(provider.clone());
        subtask.attempt_deadline_ms = Some(deadline_ms);
        subtask.attempts += 1;

        info!(
            subtask_id = %subtask_id,
            provider = %provider,
            attempt = subtask.attempts,
            deadline_ms,
            "Subtask assigned"
        );
        Ok(ProviderChoice {
            provider,
            deadline_ms,
        })
    }

    /// Record an inbound result report.
    ///
    /// A report arriving past the recorded attempt deadline never reaches
    /// verification; it is routed through the timeout transition, with the
    /// provider penalized exactly as if nothing had arrived.
    pub fn on_result(
        &mut self,
        subtask_id: &Identifier,
        result: ResultRef,
        arrival_ms: u64,
    ) -> LifecycleResult<ResultDisposition> {
        let subtask = self
            .subtasks
            .get(subtask_id)
            .ok_or(LifecycleError::SubtaskNotFound(*subtask_id))?;

        if subtask.state != State::InProgress {
            return Err(LifecycleError::InvalidTransition {
                from: subtask.state,
                to: State::Verified,
            });
        }

        let deadline = subtask.attempt_deadline_ms.unwrap_or(0);
        if arrival_ms > deadline {
            warn!(
                subtask_id = %subtask_id,
                arrival_ms,
                deadline_ms = deadline,
                "Late result routed through timeout"
            );
            let events = self.timeout_attempt(subtask_id)?;
            return Ok(ResultDisposition::Late(events));
        }

        let subtask = self.subtasks.get_mut(subtask_id).expect("checked above");
        subtask.result = Some(result);
        Ok(ResultDisposition::InWindow)
    }

    /// Finalize a verification verdict for an in-progress subtask.
    pub fn apply_verdict(
        &mut self,
        subtask_id: &Identifier,
        verdict_state: SubtaskVerificationState,
    ) -> LifecycleResult<Vec<LifecycleEvent>> {
        match verdict_state {
            State::Verified => self.finalize_verified(subtask_id),
            State::WrongAnswer => self.finalize_wrong_answer(subtask_id),
            State::NotSure => {
                self.transition(subtask_id, State::NotSure)?;
                let subtask = &self.subtasks[subtask_id];
                Ok(vec![LifecycleEvent::SubtaskNotSure {
                    subtask_id: *subtask_id,
                    task_id: subtask.task_id,
                }])
            }
            other => Err(LifecycleError::InvalidTransition {
                from: self
                    .subtasks
                    .get(subtask_id)
                    .map(|s| s.state)
                    .unwrap_or(State::Unknown),
                to: other,
            }),
        }
    }

    /// Resolve an escalated `NOT_SURE` outcome with an external decision
    /// (secondary reviewer or arbiter).
    pub fn resolve_escalation(
        &mut self,
        subtask_id: &Identifier,
        accept: bool,
    ) -> LifecycleResult<Vec<LifecycleEvent>> {
        if accept {
            self.finalize_verified(subtask_id)
        } else {
            self.finalize_wrong_answer(subtask_id)
        }
    }

    fn finalize_verified(&mut self, subtask_id: &Identifier) -> LifecycleResult<Vec<LifecycleEvent>> {
        self.transition(subtask_id, State::Verified)?;

        let subtask = &self.subtasks[subtask_id];
        let task_id = subtask.task_id;
        let provider = subtask.provider.clone().unwrap_or_else(|| NodeId::new(""));

        if let Some(entry) = self.nodes.get(&provider) {
            entry.record_completed();
        }

        let mut events = vec![LifecycleEvent::SubtaskVerified {
            subtask_id: *subtask_id,
            task_id,
            provider,
        }];

        if let Some(task) = self.tasks.get(&task_id) {
            let complete = task
                .parts
                .iter()
                .all(|id| self.subtasks.get(id).map(|s| s.state) == Some(State::Verified));
            if complete {
                info!(task_id = %task_id, "Task completed");
                events.push(LifecycleEvent::TaskCompleted { task_id });
            }
        }
        Ok(events)
    }

    fn finalize_wrong_answer(
        &mut self,
        subtask_id: &Identifier,
    ) -> LifecycleResult<Vec<LifecycleEvent>> {
        self.transition(subtask_id, State::WrongAnswer)?;

        let subtask = &self.subtasks[subtask_id];
        let task_id = subtask.task_id;
        let part = subtask.part;
        let attempts = subtask.attempts;
        let provider = subtask.provider.clone().unwrap_or_else(|| NodeId::new(""));

        self.penalize(&task_id, &provider);

        let task_cancelled = self.tasks.get(&task_id).map(|t| t.cancelled).unwrap_or(true);
        let mut events = Vec::new();

        let replacement = if attempts < self.config.attempt_ceiling && !task_cancelled {
            // Wrong answer is terminal for this subtask; a fresh subtask
            // covering the same part takes over, attempts carried.
            let replacement_id = derive(&task_id);
            let mut fresh = Subtask {
                id: replacement_id,
                task_id,
                part,
                state: State::Unknown,
                provider: None,
                attempt_deadline_ms: None,
                result: None,
                attempts,
                abandoned: false,
            };
            fresh.state = State::Waiting;
            self.subtasks.insert(replacement_id, fresh);
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.parts[part] = replacement_id;
            }
            debug!(
                subtask_id = %subtask_id,
                replacement = %replacement_id,
                "Rejected subtask superseded"
            );
            Some(replacement_id)
        } else {
            if let Some(s) = self.subtasks.get_mut(subtask_id) {
                s.abandoned = true;
            }
            events.push(LifecycleEvent::SubtaskAbandoned {
                subtask_id: *subtask_id,
                task_id,
                attempts,
            });
            None
        };

        events.insert(
            0,
            LifecycleEvent::SubtaskRejected {
                subtask_id: *subtask_id,
                task_id,
                provider,
                replacement,
            },
        );
        Ok(events)
    }

    fn penalize(&mut self, task_id: &Identifier, provider: &NodeId) {
        if provider.as_str().is_empty() {
            return;
        }
        if let Some(entry) = self.nodes.get(provider) {
            entry.record_failed();
        }
        self.penalized
            .entry(*task_id)
            .or_default()
            .insert(provider.clone());
    }

    /// Timeout path for the active attempt: penalize, return to `Waiting`
    /// (or abandon once the ceiling is reached).
    fn timeout_attempt(&mut self, subtask_id: &Identifier) -> LifecycleResult<Vec<LifecycleEvent>> {
        self.transition(subtask_id, State::Timeout)?;

        let subtask = &self.subtasks[subtask_id];
        let task_id = subtask.task_id;
        let attempts = subtask.attempts;
        let provider = subtask.provider.clone().unwrap_or_else(|| NodeId::new(""));

        self.penalize(&task_id, &provider);

        let mut events = vec![LifecycleEvent::SubtaskTimedOut {
            subtask_id: *subtask_id,
            task_id,
            provider,
        }];

        if attempts >= self.config.attempt_ceiling {
            let subtask = self.subtasks.get_mut(subtask_id).expect("checked above");
            subtask.abandoned = true;
            subtask.provider = None;
            subtask.attempt_deadline_ms = None;
            events.push(LifecycleEvent::SubtaskAbandoned {
                subtask_id: *subtask_id,
                task_id,
                attempts,
            });
        } else {
            self.transition(subtask_id, State::Waiting)?;
            let subtask = self.subtasks.get_mut(subtask_id).expect("checked above");
            subtask.provider = None;
            subtask.attempt_deadline_ms = None;
            subtask.result = None;
        }
        Ok(events)
    }

    /// Sweep in-progress subtasks for expired attempt deadlines.
    ///
    /// Only inspects stored deadlines and enqueues transitions, never
    /// blocks. This is the single wall-clock entry point of the machine;
    /// callers inject `now_ms`.
    pub fn on_tick(&mut self, now_ms: u64) -> Vec<LifecycleEvent> {
        let expired: Vec<Identifier> = self
            .subtasks
            .values()
            .filter(|s| s.state == State::InProgress)
            .filter(|s| s.attempt_deadline_ms.map(|d| now_ms > d).unwrap_or(false))
            .map(|s| s.id)
            .collect();

        let mut events = Vec::new();
        for subtask_id in expired {
            match self.timeout_attempt(&subtask_id) {
                Ok(mut batch) => events.append(&mut batch),
                Err(err) => warn!(subtask_id = %subtask_id, error = %err, "Timeout sweep failed"),
            }
        }

        // Tasks whose own deadline passed before completion terminate here.
        let expired_tasks: Vec<Identifier> = self
            .tasks
            .values()
            .filter(|task| !task.cancelled && now_ms > task.deadline_ms)
            .filter(|task| {
                task.parts
                    .iter()
                    .any(|id| self.subtasks.get(id).map(|s| s.state) != Some(State::Verified))
            })
            .map(|task| task.id)
            .collect();
        for task_id in expired_tasks {
            warn!(task_id = %task_id, "Task deadline expired");
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.cancelled = true;
            }
            let parts = self
                .tasks
                .get(&task_id)
                .map(|t| t.parts.clone())
                .unwrap_or_default();
            for subtask_id in parts {
                let running = self
                    .subtasks
                    .get(&subtask_id)
                    .map(|s| s.state == State::InProgress)
                    .unwrap_or(false);
                if running {
                    // Aborted, not failed: no provider penalty on expiry.
                    let _ = self.transition(&subtask_id, State::Timeout);
                    if let Some(subtask) = self.subtasks.get_mut(&subtask_id) {
                        subtask.provider = None;
                        subtask.attempt_deadline_ms = None;
                    }
                }
            }
            events.push(LifecycleEvent::TaskExpired { task_id });
        }
        events
    }

    /// Cancel a task: its in-progress subtasks leave the running set and
    /// the caller receives their ids so sandbox jobs can be cancelled
    /// cooperatively.
    pub fn cancel_task(
        &mut self,
        task_id: &Identifier,
    ) -> LifecycleResult<(Vec<Identifier>, Vec<LifecycleEvent>)> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or(LifecycleError::TaskNotFound(*task_id))?;
        if task.cancelled {
            return Err(LifecycleError::TaskCancelled(*task_id));
        }
        task.cancelled = true;
        let parts = task.parts.clone();

        let running: Vec<Identifier> = parts
            .iter()
            .filter_map(|id| self.subtasks.get(id))
            .filter(|s| s.state == State::InProgress)
            .map(|s| s.id)
            .collect();

        // The attempts are aborted, not failed: no provider penalty.
        for subtask_id in &running {
            self.transition(subtask_id, State::Timeout)?;
            if let Some(subtask) = self.subtasks.get_mut(subtask_id) {
                subtask.provider = None;
                subtask.attempt_deadline_ms = None;
            }
        }

        info!(task_id = %task_id, aborted = running.len(), "Task cancelled");
        Ok((running, vec![LifecycleEvent::TaskCancelled { task_id: *task_id }]))
    }
}
