//! In-memory crowd platform with seeded synthetic workers.
//!
//! Every `get_assignments` call advances the simulation by one round: each
//! active worker picks up to `tasks_per_assignment` open tasks, answers them and
//! submits a single assignment.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::labels::{Label, LabelSpace};
use crate::objects::{Objects, TaskId};

use super::{
    AssignmentMeta, AssignmentSolutions, AssignmentStatus, Platform, PlatformError, PlatformTask,
    PoolAdmission, Solution, TaskDraft,
};

/// Maps the objects a worker sees to the correct answer, if known.
pub type Oracle = Arc<dyn Fn(&Objects) -> Option<Label> + Send + Sync>;

fn default_accuracy() -> f64 {
    0.9
}

fn default_secs_per_task() -> f64 {
    30.0
}

fn default_training_score() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimWorker {
    pub id: String,
    /// Probability of answering the true label.
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,
    #[serde(default = "default_secs_per_task")]
    pub secs_per_task: f64,
    /// Probability of picking the first label regardless of content.
    #[serde(default)]
    pub position_bias: f64,
    /// Percent scored on the pool's training tasks.
    #[serde(default = "default_training_score")]
    pub training_score: u32,
}

impl SimWorker {
    pub fn new(id: impl Into<String>, accuracy: f64, secs_per_task: f64) -> Self {
        Self {
            id: id.into(),
            accuracy,
            secs_per_task,
            position_bias: 0.0,
            training_score: default_training_score(),
        }
    }

    pub fn with_position_bias(mut self, bias: f64) -> Self {
        self.position_bias = bias;
        self
    }

    pub fn with_training_score(mut self, score: u32) -> Self {
        self.training_score = score;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bonus {
    pub worker_id: String,
    pub amount: f64,
    pub comment: String,
}

struct SimAssignment {
    pool_id: String,
    inner: AssignmentSolutions,
}

struct SimState {
    rng: StdRng,
    admission: HashMap<String, PoolAdmission>,
    tasks: Vec<PlatformTask>,
    assignments: Vec<SimAssignment>,
    blocked: HashMap<String, Option<DateTime<Utc>>>,
    /// Blocked workers still holding one in-flight assignment.
    in_flight: HashSet<String>,
    bonuses: Vec<Bonus>,
    rounds: u64,
    pending_failures: u32,
}

pub struct SimulatedPlatform {
    space: LabelSpace,
    workers: Vec<SimWorker>,
    oracle: Oracle,
    tasks_per_assignment: usize,
    late_submissions: bool,
    state: Mutex<SimState>,
}

impl SimulatedPlatform {
    pub fn new(space: LabelSpace, workers: Vec<SimWorker>, seed: u64) -> Self {
        Self {
            space,
            workers,
            oracle: Arc::new(|_| None),
            tasks_per_assignment: 1,
            late_submissions: false,
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                admission: HashMap::new(),
                tasks: Vec::new(),
                assignments: Vec::new(),
                blocked: HashMap::new(),
                in_flight: HashSet::new(),
                bonuses: Vec::new(),
                rounds: 0,
                pending_failures: 0,
            }),
        }
    }

    pub fn with_oracle<F>(mut self, oracle: F) -> Self
    where
        F: Fn(&Objects) -> Option<Label> + Send + Sync + 'static,
    {
        self.oracle = Arc::new(oracle);
        self
    }

    /// Ground truth keyed by the id of the objects as presented.
    pub fn with_truth(self, truth: HashMap<TaskId, Label>) -> Self {
        self.with_oracle(move |objects| truth.get(&objects.task_id()).cloned())
    }

    pub fn with_tasks_per_assignment(mut self, n: usize) -> Self {
        self.tasks_per_assignment = n.max(1);
        self
    }

    /// A worker blocked mid-round still submits the assignment it was working on.
    pub fn with_late_submissions(mut self) -> Self {
        self.late_submissions = true;
        self
    }

    /// Make the next `n` calls fail with a transient outage.
    pub fn fail_next(&self, n: u32) {
        self.lock().pending_failures = n;
    }

    pub fn bonuses(&self) -> Vec<Bonus> {
        self.lock().bonuses.clone()
    }

    pub fn blocked_workers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().blocked.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn assignment_status(&self, assignment_id: &str) -> Option<AssignmentStatus> {
        self.lock()
            .assignments
            .iter()
            .find(|a| a.inner.assignment.id == assignment_id)
            .map(|a| a.inner.assignment.status)
    }

    pub fn assignment_count(&self) -> usize {
        self.lock().assignments.len()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_outage(state: &mut SimState) -> Result<(), PlatformError> {
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(PlatformError::unavailable("simulated outage"));
        }
        Ok(())
    }

    fn answer(&self, worker: &SimWorker, task: &PlatformTask, rng: &mut StdRng) -> Label {
        let labels = self.space.labels();
        if worker.position_bias > 0.0 && rng.gen::<f64>() < worker.position_bias {
            return labels[0].clone();
        }
        let truth = task
            .golden
            .clone()
            .or_else(|| (self.oracle)(&task.objects));
        match truth {
            Some(truth) if rng.gen::<f64>() < worker.accuracy => truth,
            Some(truth) => {
                let others: Vec<&Label> = labels.iter().filter(|l| **l != truth).collect();
                if others.is_empty() {
                    truth
                } else {
                    others[rng.gen_range(0..others.len())].clone()
                }
            }
            None => labels[rng.gen_range(0..labels.len())].clone(),
        }
    }

    fn simulate_round(&self, state: &mut SimState, pool_id: &str) {
        let n = self.workers.len();
        if n == 0 {
            return;
        }
        let now = Utc::now();
        let offset = (state.rounds as usize) % n;
        state.rounds += 1;
        let admission = state.admission.get(pool_id).cloned().unwrap_or_default();

        for k in 0..n {
            let worker = &self.workers[(offset + k) % n];
            if !admission.admits(worker.training_score) {
                continue;
            }
            if is_blocked(state.blocked.get(&worker.id), now) && !state.in_flight.remove(&worker.id)
            {
                continue;
            }

            let mut load: HashMap<&str, usize> = HashMap::new();
            let mut seen: HashSet<&str> = HashSet::new();
            for asg in &state.assignments {
                let counts = !matches!(
                    asg.inner.assignment.status,
                    AssignmentStatus::Rejected | AssignmentStatus::Expired
                );
                for sol in &asg.inner.solutions {
                    if counts {
                        *load.entry(sol.task_id.as_str()).or_default() += 1;
                    }
                    if asg.inner.assignment.worker_id == worker.id {
                        seen.insert(sol.task_id.as_str());
                    }
                }
            }

            let mut open: Vec<(usize, usize)> = state
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.pool_id == pool_id && !seen.contains(t.id.as_str()))
                .map(|(idx, t)| (idx, load.get(t.id.as_str()).copied().unwrap_or(0)))
                .filter(|(idx, used)| *used < state.tasks[*idx].overlap)
                .collect();
            open.sort_by_key(|(idx, used)| (*used, *idx));
            open.truncate(self.tasks_per_assignment);
            if open.is_empty() {
                continue;
            }

            let solutions: Vec<Solution> = open
                .iter()
                .map(|(idx, _)| {
                    let task = &state.tasks[*idx];
                    Solution {
                        task_id: task.id.clone(),
                        objects: task.objects.clone(),
                        label: self.answer(worker, task, &mut state.rng),
                    }
                })
                .collect();

            let jitter: f64 = state.rng.gen_range(0.8..1.2);
            let spent = worker.secs_per_task * solutions.len() as f64 * jitter;
            let started_at = now - chrono::Duration::milliseconds((spent * 1000.0) as i64);
            let id = format!("asg-{}", state.assignments.len() + 1);
            state.assignments.push(SimAssignment {
                pool_id: pool_id.to_string(),
                inner: AssignmentSolutions {
                    assignment: AssignmentMeta {
                        id,
                        worker_id: worker.id.clone(),
                        status: AssignmentStatus::Submitted,
                        started_at,
                        submitted_at: now,
                    },
                    solutions,
                },
            });
        }
    }
}

fn is_blocked(entry: Option<&Option<DateTime<Utc>>>, now: DateTime<Utc>) -> bool {
    match entry {
        None => false,
        Some(None) => true,
        Some(Some(until)) => *until > now,
    }
}

#[async_trait::async_trait]
impl Platform for SimulatedPlatform {
    async fn open_pool(
        &self,
        pool_id: &str,
        admission: &PoolAdmission,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        state
            .admission
            .insert(pool_id.to_string(), admission.clone());
        Ok(())
    }

    async fn create_tasks(
        &self,
        pool_id: &str,
        drafts: &[TaskDraft],
    ) -> Result<Vec<PlatformTask>, PlatformError> {
        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        if let Some(bad) = drafts.iter().find(|d| d.overlap == 0) {
            return Err(PlatformError::invalid_request(format!(
                "task {} requested overlap 0",
                bad.objects.task_id().short()
            )));
        }
        let mut created = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let task = PlatformTask {
                id: format!("task-{}", state.tasks.len() + 1),
                pool_id: pool_id.to_string(),
                objects: draft.objects.clone(),
                golden: draft.golden.clone(),
                overlap: draft.overlap,
            };
            state.tasks.push(task.clone());
            created.push(task);
        }
        Ok(created)
    }

    async fn list_tasks(&self, pool_id: &str) -> Result<Vec<PlatformTask>, PlatformError> {
        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.pool_id == pool_id)
            .cloned()
            .collect())
    }

    async fn get_assignments(
        &self,
        pool_id: &str,
        statuses: &[AssignmentStatus],
    ) -> Result<Vec<AssignmentSolutions>, PlatformError> {
        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        self.simulate_round(&mut state, pool_id);
        Ok(state
            .assignments
            .iter()
            .filter(|a| a.pool_id == pool_id && statuses.contains(&a.inner.assignment.status))
            .map(|a| a.inner.clone())
            .collect())
    }

    async fn patch_assignment_status(
        &self,
        assignment_id: &str,
        status: AssignmentStatus,
        _comment: Option<&str>,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        let asg = state
            .assignments
            .iter_mut()
            .find(|a| a.inner.assignment.id == assignment_id)
            .ok_or_else(|| PlatformError::not_found(format!("assignment {assignment_id}")))?;
        let current = asg.inner.assignment.status;
        let allowed = current == AssignmentStatus::Submitted
            && matches!(status, AssignmentStatus::Accepted | AssignmentStatus::Rejected);
        if !allowed {
            return Err(PlatformError::invalid_request(format!(
                "assignment {assignment_id}: cannot move from {current:?} to {status:?}"
            )));
        }
        asg.inner.assignment.status = status;
        Ok(())
    }

    async fn patch_task_overlap(&self, task_id: &str, overlap: usize) -> Result<(), PlatformError> {
        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| PlatformError::not_found(format!("task {task_id}")))?;
        task.overlap = overlap;
        Ok(())
    }

    async fn grant_bonus(
        &self,
        worker_id: &str,
        amount: f64,
        comment: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        if amount <= 0.0 {
            return Err(PlatformError::invalid_request(format!(
                "bonus amount must be positive, got {amount}"
            )));
        }
        state.bonuses.push(Bonus {
            worker_id: worker_id.to_string(),
            amount,
            comment: comment.to_string(),
        });
        Ok(())
    }

    async fn block_worker(
        &self,
        worker_id: &str,
        until: Option<DateTime<Utc>>,
        _reason: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        if self.late_submissions && !state.blocked.contains_key(worker_id) {
            state.in_flight.insert(worker_id.to_string());
        }
        state.blocked.insert(worker_id.to_string(), until);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectValue;

    fn space() -> LabelSpace {
        LabelSpace::new(["cat", "dog"]).unwrap()
    }

    fn draft(name: &str, overlap: usize) -> TaskDraft {
        TaskDraft {
            objects: Objects::new(vec![ObjectValue::image(name)]),
            golden: None,
            overlap,
        }
    }

    const ALL: &[AssignmentStatus] = &[AssignmentStatus::Submitted, AssignmentStatus::Accepted];

    #[tokio::test]
    async fn perfect_workers_answer_the_oracle() {
        let platform = SimulatedPlatform::new(
            space(),
            vec![SimWorker::new("w1", 1.0, 10.0), SimWorker::new("w2", 1.0, 10.0)],
            7,
        )
        .with_oracle(|_| Some(Label::new("dog")));
        platform
            .create_tasks("p", &[draft("a.jpg", 2)])
            .await
            .unwrap();

        let got = platform.get_assignments("p", ALL).await.unwrap();
        assert_eq!(got.len(), 2);
        assert!(got
            .iter()
            .all(|a| a.solutions[0].label == Label::new("dog")));

        // Overlap reached; no further work appears.
        let again = platform.get_assignments("p", ALL).await.unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn rejected_assignment_frees_its_slot() {
        let platform = SimulatedPlatform::new(
            space(),
            vec![SimWorker::new("w1", 1.0, 10.0), SimWorker::new("w2", 1.0, 10.0)],
            1,
        );
        platform
            .create_tasks("p", &[draft("a.jpg", 1)])
            .await
            .unwrap();
        let first = platform.get_assignments("p", ALL).await.unwrap();
        assert_eq!(first.len(), 1);
        let id = first[0].assignment.id.clone();
        platform
            .patch_assignment_status(&id, AssignmentStatus::Rejected, Some("bad"))
            .await
            .unwrap();

        let second = platform.get_assignments("p", ALL).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].assignment.worker_id, first[0].assignment.worker_id);
    }

    #[tokio::test]
    async fn blocked_workers_receive_no_tasks() {
        let platform =
            SimulatedPlatform::new(space(), vec![SimWorker::new("w1", 1.0, 10.0)], 1);
        platform.block_worker("w1", None, "fraud").await.unwrap();
        platform
            .create_tasks("p", &[draft("a.jpg", 1)])
            .await
            .unwrap();
        assert!(platform.get_assignments("p", ALL).await.unwrap().is_empty());
        assert_eq!(platform.blocked_workers(), vec!["w1".to_string()]);
    }

    #[tokio::test]
    async fn workers_below_training_score_are_not_admitted() {
        let platform = SimulatedPlatform::new(
            space(),
            vec![
                SimWorker::new("novice", 1.0, 10.0).with_training_score(40),
                SimWorker::new("trained", 1.0, 10.0).with_training_score(90),
            ],
            1,
        );
        let admission = PoolAdmission {
            min_training_score: Some(70),
        };
        platform.open_pool("p", &admission).await.unwrap();
        platform
            .create_tasks("p", &[draft("a.jpg", 2)])
            .await
            .unwrap();
        let got = platform.get_assignments("p", ALL).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].assignment.worker_id, "trained");
    }

    #[tokio::test]
    async fn late_submission_arrives_once_after_block() {
        let platform = SimulatedPlatform::new(space(), vec![SimWorker::new("w1", 1.0, 10.0)], 1)
            .with_late_submissions();
        platform
            .create_tasks("p", &[draft("a.jpg", 3), draft("b.jpg", 3)])
            .await
            .unwrap();
        platform.block_worker("w1", None, "fraud").await.unwrap();
        assert_eq!(platform.get_assignments("p", ALL).await.unwrap().len(), 1);
        assert_eq!(platform.get_assignments("p", ALL).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_changes_only_from_submitted() {
        let platform =
            SimulatedPlatform::new(space(), vec![SimWorker::new("w1", 1.0, 10.0)], 1);
        platform
            .create_tasks("p", &[draft("a.jpg", 1)])
            .await
            .unwrap();
        let got = platform.get_assignments("p", ALL).await.unwrap();
        let id = &got[0].assignment.id;
        platform
            .patch_assignment_status(id, AssignmentStatus::Accepted, None)
            .await
            .unwrap();
        let err = platform
            .patch_assignment_status(id, AssignmentStatus::Rejected, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(
            platform.assignment_status(id),
            Some(AssignmentStatus::Accepted)
        );
    }

    #[tokio::test]
    async fn zero_overlap_is_rejected() {
        let platform = SimulatedPlatform::new(space(), vec![], 1);
        let err = platform
            .create_tasks("p", &[draft("a.jpg", 0)])
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
