//! Crowd platform abstraction.
//!
//! The classification loop only talks to a [`Platform`]. A real HTTP client lives
//! outside this crate; [`SimulatedPlatform`] is an in-memory stand-in with
//! configurable workers.

pub mod error;
pub mod simulated;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::labels::Label;
use crate::objects::Objects;

pub use error::PlatformError;
pub use simulated::{SimWorker, SimulatedPlatform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Submitted,
    Accepted,
    Rejected,
    Expired,
}

/// Who may take tasks from a pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolAdmission {
    /// Minimum training score, in percent.
    #[serde(default)]
    pub min_training_score: Option<u32>,
}

impl PoolAdmission {
    pub fn admits(&self, training_score: u32) -> bool {
        self.min_training_score
            .map_or(true, |min| training_score >= min)
    }
}

/// A task to post: its objects, an optional golden answer and the overlap to request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub objects: Objects,
    #[serde(default)]
    pub golden: Option<Label>,
    pub overlap: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformTask {
    pub id: String,
    pub pool_id: String,
    pub objects: Objects,
    #[serde(default)]
    pub golden: Option<Label>,
    pub overlap: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentMeta {
    pub id: String,
    pub worker_id: String,
    pub status: AssignmentStatus,
    pub started_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
}

impl AssignmentMeta {
    pub fn duration(&self) -> Duration {
        (self.submitted_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// One answered task inside an assignment, as presented to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub task_id: String,
    pub objects: Objects,
    pub label: Label,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentSolutions {
    pub assignment: AssignmentMeta,
    pub solutions: Vec<Solution>,
}

impl AssignmentSolutions {
    /// Seconds spent per task; 0 for an empty assignment.
    pub fn secs_per_task(&self) -> f64 {
        if self.solutions.is_empty() {
            return 0.0;
        }
        self.assignment.duration().as_secs_f64() / self.solutions.len() as f64
    }
}

#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    /// Apply admission settings before any task is posted or fetched.
    async fn open_pool(
        &self,
        pool_id: &str,
        admission: &PoolAdmission,
    ) -> Result<(), PlatformError>;

    /// Created tasks come back in draft order.
    async fn create_tasks(
        &self,
        pool_id: &str,
        drafts: &[TaskDraft],
    ) -> Result<Vec<PlatformTask>, PlatformError>;

    async fn list_tasks(&self, pool_id: &str) -> Result<Vec<PlatformTask>, PlatformError>;

    async fn get_assignments(
        &self,
        pool_id: &str,
        statuses: &[AssignmentStatus],
    ) -> Result<Vec<AssignmentSolutions>, PlatformError>;

    async fn patch_assignment_status(
        &self,
        assignment_id: &str,
        status: AssignmentStatus,
        comment: Option<&str>,
    ) -> Result<(), PlatformError>;

    /// Set the total number of assignments the task should collect.
    async fn patch_task_overlap(&self, task_id: &str, overlap: usize) -> Result<(), PlatformError>;

    async fn grant_bonus(
        &self,
        worker_id: &str,
        amount: f64,
        comment: &str,
    ) -> Result<(), PlatformError>;

    /// `until: None` blocks permanently.
    async fn block_worker(
        &self,
        worker_id: &str,
        until: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<(), PlatformError>;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Retries transient platform errors with exponential backoff.
pub struct RetryingPlatform<P: Platform> {
    inner: P,
    config: RetryConfig,
}

impl<P: Platform> RetryingPlatform<P> {
    pub fn new(inner: P) -> Self {
        Self::with_config(inner, RetryConfig::default())
    }

    pub fn with_config(inner: P, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, PlatformError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    let delay = backoff_delay(self.config.retry_base_delay, attempt)
                        .max(err.retry_after().unwrap_or(Duration::ZERO));
                    warn!(
                        op,
                        attempt,
                        code = err.code(),
                        delay_ms = delay.as_millis() as u64,
                        "Transient platform error; retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<P: Platform> Platform for RetryingPlatform<P> {
    async fn open_pool(
        &self,
        pool_id: &str,
        admission: &PoolAdmission,
    ) -> Result<(), PlatformError> {
        let inner = &self.inner;
        self.retry("open_pool", move || inner.open_pool(pool_id, admission))
            .await
    }

    async fn create_tasks(
        &self,
        pool_id: &str,
        drafts: &[TaskDraft],
    ) -> Result<Vec<PlatformTask>, PlatformError> {
        let inner = &self.inner;
        self.retry("create_tasks", move || inner.create_tasks(pool_id, drafts))
            .await
    }

    async fn list_tasks(&self, pool_id: &str) -> Result<Vec<PlatformTask>, PlatformError> {
        let inner = &self.inner;
        self.retry("list_tasks", move || inner.list_tasks(pool_id))
            .await
    }

    async fn get_assignments(
        &self,
        pool_id: &str,
        statuses: &[AssignmentStatus],
    ) -> Result<Vec<AssignmentSolutions>, PlatformError> {
        let inner = &self.inner;
        self.retry("get_assignments", move || {
            inner.get_assignments(pool_id, statuses)
        })
        .await
    }

    async fn patch_assignment_status(
        &self,
        assignment_id: &str,
        status: AssignmentStatus,
        comment: Option<&str>,
    ) -> Result<(), PlatformError> {
        let inner = &self.inner;
        self.retry("patch_assignment_status", move || {
            inner.patch_assignment_status(assignment_id, status, comment)
        })
        .await
    }

    async fn patch_task_overlap(&self, task_id: &str, overlap: usize) -> Result<(), PlatformError> {
        let inner = &self.inner;
        self.retry("patch_task_overlap", move || {
            inner.patch_task_overlap(task_id, overlap)
        })
        .await
    }

    async fn grant_bonus(
        &self,
        worker_id: &str,
        amount: f64,
        comment: &str,
    ) -> Result<(), PlatformError> {
        let inner = &self.inner;
        self.retry("grant_bonus", move || {
            inner.grant_bonus(worker_id, amount, comment)
        })
        .await
    }

    async fn block_worker(
        &self,
        worker_id: &str,
        until: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<(), PlatformError> {
        let inner = &self.inner;
        self.retry("block_worker", move || {
            inner.block_worker(worker_id, until, reason)
        })
        .await
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}
