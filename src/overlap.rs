//! Overlap control: how many independent votes a task needs.

use serde::{Deserialize, Serialize};

use crate::aggregation::AggregationResult;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Fixed number of votes per task.
    Static { overlap: usize },
    /// Keep collecting until the winning label reaches `confidence`, between
    /// `min_overlap` and `max_overlap` votes.
    Dynamic {
        min_overlap: usize,
        max_overlap: usize,
        confidence: f64,
    },
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        OverlapPolicy::Dynamic {
            min_overlap: 1,
            max_overlap: 3,
            confidence: 0.85,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveReason {
    ConfidenceReached,
    MaxOverlapReached,
    TargetReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TaskStatus {
    Collecting,
    Resolved(ResolveReason),
}

impl TaskStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, TaskStatus::Resolved(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlapState {
    /// Votes currently counted for the task.
    pub overlap: usize,
    /// Probability of the winning label, 0 without votes.
    pub confidence: f64,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapController {
    policy: OverlapPolicy,
}

impl OverlapController {
    pub fn new(policy: OverlapPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    /// Upper bound on votes per task.
    pub fn cap(&self) -> usize {
        match self.policy {
            OverlapPolicy::Static { overlap } => overlap,
            OverlapPolicy::Dynamic { max_overlap, .. } => max_overlap,
        }
    }

    /// Overlap requested when a task is first posted.
    pub fn initial_overlap(&self) -> usize {
        match self.policy {
            OverlapPolicy::Static { overlap } => overlap,
            OverlapPolicy::Dynamic { min_overlap, .. } => min_overlap,
        }
    }

    pub fn evaluate(&self, result: Option<&AggregationResult>) -> OverlapState {
        let overlap = result.map(AggregationResult::overlap).unwrap_or(0);
        let confidence = result
            .and_then(AggregationResult::most_probable)
            .map(|(_, p)| p)
            .unwrap_or(0.0);

        let status = match self.policy {
            OverlapPolicy::Static { overlap: target } => {
                if overlap >= target {
                    TaskStatus::Resolved(ResolveReason::TargetReached)
                } else {
                    TaskStatus::Collecting
                }
            }
            OverlapPolicy::Dynamic {
                min_overlap,
                max_overlap,
                confidence: threshold,
            } => {
                if overlap > 0 && overlap >= min_overlap && confidence >= threshold {
                    TaskStatus::Resolved(ResolveReason::ConfidenceReached)
                } else if overlap >= max_overlap {
                    TaskStatus::Resolved(ResolveReason::MaxOverlapReached)
                } else {
                    TaskStatus::Collecting
                }
            }
        };

        OverlapState {
            overlap,
            confidence,
            status,
        }
    }

    pub fn needs_more(&self, state: &OverlapState) -> bool {
        !state.status.is_resolved() && state.overlap < self.cap()
    }

    /// Total overlap the task should have on the platform after this cycle.
    pub fn desired_overlap(&self, state: &OverlapState) -> usize {
        let cap = self.cap();
        match self.policy {
            OverlapPolicy::Static { overlap } => overlap,
            OverlapPolicy::Dynamic { min_overlap, .. } => {
                if state.status.is_resolved() {
                    state.overlap.min(cap)
                } else {
                    (state.overlap + 1).max(min_overlap).min(cap)
                }
            }
        }
    }
}
