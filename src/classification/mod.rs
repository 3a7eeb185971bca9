//! Classification loop over a crowd pool.
//!
//! Posts deduplicated tasks (reusing any already in the pool), then cycles:
//! fetch assignments, update worker statistics, apply control actions,
//! recompute aggregation and overlap from the full accepted vote set, and raise
//! overlap where more votes are needed. Stops once every task is resolved, the
//! pool stalls, the latency budget runs out, or cancellation is requested.

pub mod trace;
pub mod types;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::aggregation::{aggregate, most_probable, Vote};
use crate::config::ConfigError;
use crate::control::{Action, AssignmentRecord, RuleContext, RulesBuilder, WorkerStats};
use crate::labels::Label;
use crate::model::{label_checked, ModelContractError, ModelLabeler};
use crate::objects::{Objects, TaskId};
use crate::overlap::{OverlapController, TaskStatus};
use crate::platform::{
    AssignmentSolutions, AssignmentStatus, Platform, PlatformError, Solution, TaskDraft,
};

pub use trace::{
    now_epoch_ms, read_cycle_log, CycleTrace, CycleTraceSink, JsonlCycleLog, MemoryCycleLog,
    TraceError,
};
pub use types::{
    ClassificationMeta, ClassificationRequest, ClassificationResponse, ClassificationStopReason,
    ControlObject, TaskResult, WorkerSummary,
};

#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Model(#[from] ModelContractError),
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
    #[error("unexpected platform response: {0}")]
    UnexpectedResponse(String),
}

/// Expected careful-worker time for one task.
pub trait DurationEstimator: Send + Sync {
    fn estimate(&self, objects: &Objects) -> Duration;
}

/// Same estimate for every task.
#[derive(Debug, Clone, Copy)]
pub struct FixedDuration(pub Duration);

impl DurationEstimator for FixedDuration {
    fn estimate(&self, _objects: &Objects) -> Duration {
        self.0
    }
}

/// Encodes canonical tasks into the form shown to workers and decodes answers.
pub trait TaskPresenter: Send + Sync {
    fn present(&self, canonical: &Objects) -> Objects;

    /// Golden label as it reads on the presented objects.
    fn present_label(&self, canonical: &Objects, label: &Label) -> Label;

    /// Canonical label for an answer given on the presented objects.
    fn interpret(&self, canonical: &Objects, label: &Label) -> Label;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPresenter;

impl TaskPresenter for IdentityPresenter {
    fn present(&self, canonical: &Objects) -> Objects {
        canonical.clone()
    }

    fn present_label(&self, _canonical: &Objects, label: &Label) -> Label {
        label.clone()
    }

    fn interpret(&self, _canonical: &Objects, label: &Label) -> Label {
        label.clone()
    }
}

/// Optional collaborators for a run.
#[derive(Clone, Copy, Default)]
pub struct RunHooks<'a> {
    pub presenter: Option<&'a dyn TaskPresenter>,
    pub model: Option<&'a dyn ModelLabeler>,
    pub estimator: Option<&'a dyn DurationEstimator>,
    pub trace: Option<&'a dyn CycleTraceSink>,
    pub cancel_flag: Option<&'a AtomicBool>,
}

pub fn validate_classification_request(
    req: &ClassificationRequest,
) -> Result<(), ClassificationError> {
    req.pool.validate()?;
    if req.inputs.is_empty() {
        return Err(ClassificationError::InvalidRequest(
            "inputs must contain at least one object tuple".into(),
        ));
    }
    let expected = req.spec.kinds();
    for (idx, objects) in req.inputs.iter().enumerate() {
        if !req.spec.matches(objects) {
            return Err(ClassificationError::InvalidRequest(format!(
                "inputs[{idx}] has kinds {:?}, expected {:?}",
                objects.kinds(),
                expected
            )));
        }
    }
    let input_ids: HashSet<TaskId> = req.inputs.iter().map(Objects::task_id).collect();
    for (idx, control) in req.controls.iter().enumerate() {
        if !req.spec.matches(&control.objects) {
            return Err(ClassificationError::InvalidRequest(format!(
                "controls[{idx}] has kinds {:?}, expected {:?}",
                control.objects.kinds(),
                expected
            )));
        }
        if !req.spec.labels.contains(&control.golden) {
            return Err(ClassificationError::InvalidRequest(format!(
                "controls[{idx}] golden label '{}' is not one of [{}]",
                control.golden,
                req.spec.labels.describe()
            )));
        }
        if input_ids.contains(&control.objects.task_id()) {
            return Err(ClassificationError::InvalidRequest(format!(
                "controls[{idx}] duplicates an input task"
            )));
        }
    }
    Ok(())
}

struct Tracked {
    task_id: TaskId,
    objects: Objects,
    presented_id: TaskId,
    golden: Option<Label>,
    platform_id: Option<String>,
    requested: usize,
    status: TaskStatus,
    model_votes: Vec<Vote>,
}

/// Canonical tasks plus lookups from what the platform reports back.
struct TaskIndex {
    tasks: Vec<Tracked>,
    n_inputs: usize,
    by_platform_id: HashMap<String, usize>,
    by_presented: HashMap<TaskId, usize>,
}

impl TaskIndex {
    fn build(
        req: &ClassificationRequest,
        presenter: &dyn TaskPresenter,
    ) -> Result<Self, ClassificationError> {
        let mut tasks: Vec<Tracked> = Vec::new();
        let mut seen: HashSet<TaskId> = HashSet::new();
        let inputs = req.inputs.iter().map(|o| (o, None));
        let n_distinct_inputs = req
            .inputs
            .iter()
            .map(Objects::task_id)
            .collect::<HashSet<_>>()
            .len();
        let controls = req
            .controls
            .iter()
            .map(|c| (&c.objects, Some(c.golden.clone())));
        for (objects, golden) in inputs.chain(controls) {
            let task_id = objects.task_id();
            if !seen.insert(task_id.clone()) {
                continue;
            }
            tasks.push(Tracked {
                task_id,
                presented_id: presenter.present(objects).task_id(),
                objects: objects.clone(),
                golden,
                platform_id: None,
                requested: 0,
                status: TaskStatus::Collecting,
                model_votes: Vec::new(),
            });
        }
        if n_distinct_inputs < req.inputs.len() {
            debug!(
                duplicates = req.inputs.len() - n_distinct_inputs,
                "Dropped duplicate inputs"
            );
        }
        let mut by_presented: HashMap<TaskId, usize> = HashMap::with_capacity(tasks.len());
        for (idx, task) in tasks.iter().enumerate() {
            if let Some(prev) = by_presented.insert(task.presented_id.clone(), idx) {
                return Err(ClassificationError::InvalidRequest(format!(
                    "tasks {} and {} would be shown to workers as the same objects",
                    tasks[prev].task_id.short(),
                    task.task_id.short()
                )));
            }
        }
        Ok(Self {
            tasks,
            n_inputs: n_distinct_inputs,
            by_platform_id: HashMap::new(),
            by_presented,
        })
    }

    fn resolve(&self, solution: &Solution) -> Option<usize> {
        self.by_platform_id.get(&solution.task_id).copied()
    }

    fn is_control(&self, idx: usize) -> bool {
        idx >= self.n_inputs
    }

    fn inputs(&self) -> &[Tracked] {
        &self.tasks[..self.n_inputs]
    }

    fn resolved_inputs(&self) -> usize {
        self.inputs()
            .iter()
            .filter(|t| t.status.is_resolved())
            .count()
    }

    fn expected_secs_per_task(
        &self,
        asg: &AssignmentSolutions,
        estimator: &dyn DurationEstimator,
    ) -> Option<f64> {
        let estimates: Vec<f64> = asg
            .solutions
            .iter()
            .filter_map(|s| self.resolve(s))
            .map(|idx| estimator.estimate(&self.tasks[idx].objects).as_secs_f64())
            .collect();
        if estimates.is_empty() {
            None
        } else {
            Some(estimates.iter().sum::<f64>() / estimates.len() as f64)
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: usize,
    rejected: usize,
    rewards: usize,
    blocks: usize,
}

/// Run the classification loop for one pool.
pub async fn run_classification(
    platform: &dyn Platform,
    req: &ClassificationRequest,
    hooks: RunHooks<'_>,
) -> Result<ClassificationResponse, ClassificationError> {
    validate_classification_request(req)?;

    let pool = &req.pool;
    let pool_id = pool.pool_id.as_str();
    let space = &req.spec.labels;
    for advisory in pool.advisories(req.inputs.len()) {
        warn!(pool_id, %advisory, "Pool volume advisory");
    }

    let controller = OverlapController::new(pool.overlap);
    let engine = RulesBuilder::from_configs(&pool.rules).build();
    let identity = IdentityPresenter;
    let presenter: &dyn TaskPresenter = hooks.presenter.unwrap_or(&identity);
    let fixed = FixedDuration(pool.expected_task_duration());
    let estimator: &dyn DurationEstimator = hooks.estimator.unwrap_or(&fixed);

    let mut index = TaskIndex::build(req, presenter)?;
    let n_inputs = index.n_inputs;

    let mut model_votes = 0;
    if let Some(model) = hooks.model {
        let batch: Vec<Objects> = index.inputs().iter().map(|t| t.objects.clone()).collect();
        let labels = label_checked(model, space, &batch).await?;
        model_votes = labels.len();
        for (task, label) in index.tasks.iter_mut().zip(labels) {
            task.model_votes.push(Vote::new(label, model.worker_id()));
        }
    }

    platform.open_pool(pool_id, &pool.admission()).await?;

    // Reuse tasks already in the pool so a restarted run does not double-post.
    let mut tasks_reused = 0;
    for existing in platform.list_tasks(pool_id).await? {
        let Some(&idx) = index.by_presented.get(&existing.objects.task_id()) else {
            continue;
        };
        let task = &mut index.tasks[idx];
        if task.platform_id.is_none() {
            task.platform_id = Some(existing.id.clone());
            task.requested = existing.overlap;
            tasks_reused += 1;
        }
        index.by_platform_id.insert(existing.id, idx);
    }

    let mut drafts = Vec::new();
    let mut drafted: Vec<usize> = Vec::new();
    for (idx, task) in index.tasks.iter_mut().enumerate() {
        if task.platform_id.is_some() {
            continue;
        }
        let overlap = if idx < n_inputs {
            let result = aggregate(space, &task.model_votes, pool.aggregation, &req.weights);
            let state = controller.evaluate(result.as_ref());
            if state.status.is_resolved() {
                task.status = state.status;
                continue;
            }
            controller
                .desired_overlap(&state)
                .saturating_sub(task.model_votes.len())
                .max(1)
        } else {
            pool.control_overlap
        };
        task.requested = overlap;
        drafted.push(idx);
        drafts.push(TaskDraft {
            objects: presenter.present(&task.objects),
            golden: task
                .golden
                .as_ref()
                .map(|g| presenter.present_label(&task.objects, g)),
            overlap,
        });
    }
    let tasks_posted = drafts.len();
    if !drafts.is_empty() {
        let created = platform.create_tasks(pool_id, &drafts).await?;
        if created.len() != drafts.len() {
            return Err(ClassificationError::UnexpectedResponse(format!(
                "created {} tasks for {} drafts",
                created.len(),
                drafts.len()
            )));
        }
        for (idx, created) in drafted.into_iter().zip(created) {
            index.tasks[idx].platform_id = Some(created.id.clone());
            index.by_platform_id.insert(created.id, idx);
        }
    }
    info!(
        pool_id,
        inputs = n_inputs,
        controls = index.tasks.len() - n_inputs,
        posted = tasks_posted,
        reused = tasks_reused,
        "Pool tasks ready"
    );

    let start_time = Instant::now();
    let latency_budget = pool.latency_budget_ms.map(Duration::from_millis);
    let cap = controller.cap();

    let mut workers: BTreeMap<String, WorkerStats> = BTreeMap::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut decided: HashMap<String, AssignmentStatus> = HashMap::new();
    let mut final_votes: Vec<Vec<Vote>> = index
        .inputs()
        .iter()
        .map(|t| t.model_votes.iter().take(cap).cloned().collect())
        .collect();
    let mut counters = Counters::default();
    let mut cycles: usize = 0;
    let mut idle: usize = 0;

    let stop_reason = 'cycles: loop {
        if let Some(flag) = hooks.cancel_flag {
            if flag.load(AtomicOrdering::Relaxed) {
                break 'cycles ClassificationStopReason::Cancelled;
            }
        }
        if index.resolved_inputs() == n_inputs {
            break 'cycles ClassificationStopReason::AllResolved;
        }
        if let Some(limit) = latency_budget {
            if start_time.elapsed() >= limit {
                break 'cycles ClassificationStopReason::LatencyBudgetExceeded;
            }
        }
        cycles += 1;

        let mut assignments = platform
            .get_assignments(
                pool_id,
                &[AssignmentStatus::Submitted, AssignmentStatus::Accepted],
            )
            .await?;
        assignments.sort_by(|a, b| {
            a.assignment
                .submitted_at
                .cmp(&b.assignment.submitted_at)
                .then_with(|| a.assignment.id.cmp(&b.assignment.id))
        });
        let now = Utc::now();

        // Worker statistics.
        let mut new_assignments = 0;
        let mut pending: Vec<String> = Vec::new();
        let mut owner: HashMap<String, String> = HashMap::new();
        for asg in &assignments {
            let meta = &asg.assignment;
            let status = decided.get(&meta.id).copied().unwrap_or(meta.status);
            let is_pending = status == AssignmentStatus::Submitted;
            if is_pending {
                pending.push(meta.id.clone());
            }
            owner.insert(meta.id.clone(), meta.worker_id.clone());

            let stats = workers
                .entry(meta.worker_id.clone())
                .or_insert_with(|| WorkerStats::new(meta.worker_id.clone()));
            if seen.insert(meta.id.clone()) {
                new_assignments += 1;
                if status == AssignmentStatus::Accepted {
                    stats.accepted += 1;
                }
                for sol in &asg.solutions {
                    let Some(idx) = index.resolve(sol) else {
                        continue;
                    };
                    let task = &index.tasks[idx];
                    if let Some(golden) = &task.golden {
                        let answer = presenter.interpret(&task.objects, &sol.label);
                        stats.record_control(&answer == golden);
                    }
                }
            }
            stats.observe(AssignmentRecord {
                assignment_id: meta.id.clone(),
                submitted_at: meta.submitted_at,
                secs_per_task: asg.secs_per_task(),
                expected_secs_per_task: index.expected_secs_per_task(asg, estimator),
                pending: is_pending,
            });
        }
        if new_assignments == 0 {
            idle += 1;
        } else {
            idle = 0;
        }

        // Control decisions, then accept whatever was not rejected.
        let ctx = RuleContext {
            now,
            expected_task_duration: pool.expected_task_duration(),
        };
        let pending_set: HashSet<&str> = pending.iter().map(String::as_str).collect();
        let mut actions: Vec<Action> = engine
            .evaluate(&ctx, &workers)
            .into_iter()
            .filter(|a| match a {
                Action::Reject { assignment_id, .. } => {
                    pending_set.contains(assignment_id.as_str())
                }
                Action::Accept { .. } => false,
                _ => true,
            })
            .collect();
        // Work delivered after a block never reaches aggregation.
        for id in &pending {
            let blocked = owner
                .get(id)
                .and_then(|w| workers.get(w))
                .is_some_and(|stats| stats.is_blocked_at(now));
            let already = actions.iter().any(|a| {
                matches!(a, Action::Reject { assignment_id, .. } if assignment_id == id)
            });
            if blocked && !already {
                actions.push(Action::Reject {
                    assignment_id: id.clone(),
                    comment: "worker is blocked".to_string(),
                });
            }
        }
        let rejecting: HashSet<String> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Reject { assignment_id, .. } => Some(assignment_id.clone()),
                _ => None,
            })
            .collect();
        actions.extend(
            pending
                .iter()
                .filter(|id| !rejecting.contains(*id))
                .map(|id| Action::Accept {
                    assignment_id: id.clone(),
                }),
        );

        let outcomes = apply_actions(platform, &actions, pool.action_concurrency).await;
        let before = (counters.accepted, counters.rejected, counters.blocks, counters.rewards);
        for (action, outcome) in actions.iter().zip(outcomes) {
            if let Err(err) = outcome {
                warn!(pool_id, action = action.kind(), code = err.code(), error = %err, "Control action failed");
                return Err(err.into());
            }
            match action {
                Action::Accept { assignment_id } => {
                    decided.insert(assignment_id.clone(), AssignmentStatus::Accepted);
                    if let Some(stats) = owner.get(assignment_id).and_then(|w| workers.get_mut(w)) {
                        stats.accepted += 1;
                    }
                    counters.accepted += 1;
                }
                Action::Reject { assignment_id, comment } => {
                    decided.insert(assignment_id.clone(), AssignmentStatus::Rejected);
                    if let Some(stats) = owner.get(assignment_id).and_then(|w| workers.get_mut(w)) {
                        stats.rejected += 1;
                    }
                    debug!(pool_id, assignment = %assignment_id, %comment, "Assignment rejected");
                    counters.rejected += 1;
                }
                Action::Block { worker_id, until, reason } => {
                    if let Some(stats) = workers.get_mut(worker_id) {
                        stats.block(*until);
                    }
                    info!(pool_id, worker = %worker_id, until = ?until, %reason, "Worker blocked");
                    counters.blocks += 1;
                }
                Action::Reward { worker_id, amount, .. } => {
                    if let Some(stats) = workers.get_mut(worker_id) {
                        stats.rewarded = true;
                    }
                    info!(pool_id, worker = %worker_id, amount, "Bonus granted");
                    counters.rewards += 1;
                }
            }
        }

        // Full accepted vote set, in submission order.
        let mut human_votes: Vec<Vec<Vote>> = vec![Vec::new(); n_inputs];
        for asg in &assignments {
            let status = decided
                .get(&asg.assignment.id)
                .copied()
                .unwrap_or(asg.assignment.status);
            if status != AssignmentStatus::Accepted {
                continue;
            }
            for sol in &asg.solutions {
                let Some(idx) = index.resolve(sol) else {
                    debug!(pool_id, task = %sol.task_id, "Solution for unknown task");
                    continue;
                };
                if index.is_control(idx) {
                    continue;
                }
                let label = presenter.interpret(&index.tasks[idx].objects, &sol.label);
                if !space.contains(&label) {
                    warn!(pool_id, label = %label, worker = %asg.assignment.worker_id, "Ignoring label outside the label space");
                    continue;
                }
                human_votes[idx].push(Vote::new(label, asg.assignment.worker_id.clone()));
            }
        }

        let mut overlap_raised = 0;
        let mut newly_resolved: Vec<String> = Vec::new();
        for (idx, human) in human_votes.into_iter().enumerate() {
            let task = &mut index.tasks[idx];
            let votes: Vec<Vote> = task
                .model_votes
                .iter()
                .cloned()
                .chain(human)
                .take(cap)
                .collect();
            let result = aggregate(space, &votes, pool.aggregation, &req.weights);
            let state = controller.evaluate(result.as_ref());
            final_votes[idx] = votes;

            if task.status.is_resolved() {
                continue;
            }
            if state.status.is_resolved() {
                task.status = state.status;
                newly_resolved.push(task.task_id.short().to_string());
                debug!(
                    pool_id,
                    task = task.task_id.short(),
                    overlap = state.overlap,
                    confidence = state.confidence,
                    "Task resolved"
                );
                continue;
            }
            let desired = controller
                .desired_overlap(&state)
                .saturating_sub(task.model_votes.len());
            if desired > task.requested {
                if let Some(platform_id) = &task.platform_id {
                    platform.patch_task_overlap(platform_id, desired).await?;
                    task.requested = desired;
                    overlap_raised += 1;
                }
            }
        }

        let resolved = index.resolved_inputs();
        if let Some(sink) = hooks.trace {
            sink.record(&CycleTrace {
                timestamp_ms: now_epoch_ms(),
                pool_id: pool_id.to_string(),
                cycle: cycles,
                assignments_total: assignments.len(),
                new_assignments,
                accepted: counters.accepted - before.0,
                rejected: counters.rejected - before.1,
                blocked: counters.blocks - before.2,
                rewarded: counters.rewards - before.3,
                overlap_raised,
                resolved,
                collecting: n_inputs - resolved,
                newly_resolved,
            })?;
        }
        info!(
            pool_id,
            cycle = cycles,
            new_assignments,
            resolved,
            collecting = n_inputs - resolved,
            "Cycle complete"
        );

        if resolved == n_inputs {
            break 'cycles ClassificationStopReason::AllResolved;
        }
        if idle >= pool.max_idle_cycles {
            break 'cycles ClassificationStopReason::Stalled;
        }
        sleep(pool.poll_interval()).await;
    };

    let latency_ms = start_time.elapsed().as_millis();
    info!(pool_id, ?stop_reason, cycles, latency_ms = latency_ms as u64, "Classification finished");

    let tasks = index
        .inputs()
        .iter()
        .zip(final_votes)
        .map(|(task, votes)| {
            let result = aggregate(space, &votes, pool.aggregation, &req.weights);
            let (label, confidence) = match most_probable(result.as_ref()) {
                Some((label, p)) => (Some(label), p),
                None => (None, 0.0),
            };
            TaskResult {
                task_id: task.task_id.clone(),
                objects: task.objects.clone(),
                label,
                confidence,
                overlap: votes.len(),
                distribution: result.map(|r| r.distribution).unwrap_or_default(),
                votes,
                status: task.status,
            }
        })
        .collect();

    Ok(ClassificationResponse {
        tasks,
        workers: workers.values().map(WorkerSummary::from).collect(),
        meta: ClassificationMeta {
            pool_id: pool_id.to_string(),
            cycles,
            stop_reason,
            tasks_posted,
            tasks_reused,
            assignments_seen: seen.len(),
            accepted: counters.accepted,
            rejected: counters.rejected,
            rewards: counters.rewards,
            blocks: counters.blocks,
            model_votes,
            latency_ms,
        },
    })
}

/// Apply actions with bounded concurrency; results come back in action order.
async fn apply_actions(
    platform: &dyn Platform,
    actions: &[Action],
    concurrency: usize,
) -> Vec<Result<(), PlatformError>> {
    stream::iter(actions.iter())
        .map(|action| async move {
            match action {
                Action::Accept { assignment_id } => {
                    platform
                        .patch_assignment_status(assignment_id, AssignmentStatus::Accepted, None)
                        .await
                }
                Action::Reject {
                    assignment_id,
                    comment,
                } => {
                    platform
                        .patch_assignment_status(
                            assignment_id,
                            AssignmentStatus::Rejected,
                            Some(comment.as_str()),
                        )
                        .await
                }
                Action::Block {
                    worker_id,
                    until,
                    reason,
                } => platform.block_worker(worker_id, *until, reason).await,
                Action::Reward {
                    worker_id,
                    amount,
                    reason,
                } => platform.grant_bonus(worker_id, *amount, reason).await,
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}
