//! Request/response types for the classification loop.

use serde::{Deserialize, Serialize};

use crate::aggregation::{Vote, WorkerWeights};
use crate::config::PoolConfig;
use crate::control::WorkerStats;
use crate::datasource::TaskSpec;
use crate::labels::Label;
use crate::objects::{Objects, TaskId};
use crate::overlap::TaskStatus;

/// Objects with a known answer, mixed into the pool to measure workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlObject {
    pub objects: Objects,
    pub golden: Label,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub spec: TaskSpec,
    pub pool: PoolConfig,
    pub inputs: Vec<Objects>,
    #[serde(default)]
    pub controls: Vec<ControlObject>,
    #[serde(default)]
    pub weights: WorkerWeights,
}

impl ClassificationRequest {
    pub fn new(spec: TaskSpec, pool: PoolConfig, inputs: Vec<Objects>) -> Self {
        Self {
            spec,
            pool,
            inputs,
            controls: Vec::new(),
            weights: WorkerWeights::uniform(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationStopReason {
    /// Every input task reached a terminal overlap state.
    AllResolved,
    /// `max_idle_cycles` passed without a new assignment.
    Stalled,
    /// latency_budget_ms exceeded.
    LatencyBudgetExceeded,
    /// Cancellation requested.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub objects: Objects,
    /// Winning label; `None` when no votes arrived.
    pub label: Option<Label>,
    pub confidence: f64,
    pub overlap: usize,
    pub distribution: Vec<(Label, f64)>,
    pub votes: Vec<Vote>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub assignments: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub control_total: usize,
    pub control_correct: usize,
    pub control_accuracy: Option<f64>,
    pub mean_secs_per_task: f64,
    pub rewarded: bool,
    pub blocked: bool,
}

impl From<&WorkerStats> for WorkerSummary {
    fn from(stats: &WorkerStats) -> Self {
        let mean_secs_per_task = if stats.assignments.is_empty() {
            0.0
        } else {
            stats.assignments.iter().map(|a| a.secs_per_task).sum::<f64>()
                / stats.assignments.len() as f64
        };
        Self {
            worker_id: stats.worker_id.clone(),
            assignments: stats.assignments.len(),
            accepted: stats.accepted,
            rejected: stats.rejected,
            control_total: stats.control_total,
            control_correct: stats.control_correct,
            control_accuracy: stats.control_accuracy(),
            mean_secs_per_task,
            rewarded: stats.rewarded,
            blocked: stats.blocked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationMeta {
    pub pool_id: String,
    pub cycles: usize,
    pub stop_reason: ClassificationStopReason,
    pub tasks_posted: usize,
    pub tasks_reused: usize,
    pub assignments_seen: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub rewards: usize,
    pub blocks: usize,
    pub model_votes: usize,
    pub latency_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResponse {
    /// One entry per distinct input, in first-seen input order.
    pub tasks: Vec<TaskResult>,
    pub workers: Vec<WorkerSummary>,
    pub meta: ClassificationMeta,
}

impl ClassificationResponse {
    pub fn task(&self, task_id: &TaskId) -> Option<&TaskResult> {
        self.tasks.iter().find(|t| &t.task_id == task_id)
    }

    pub fn worker(&self, worker_id: &str) -> Option<&WorkerSummary> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }
}
