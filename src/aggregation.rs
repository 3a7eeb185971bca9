//! Vote aggregation: majority vote and weighted maximum likelihood.
//!
//! Both algorithms return a distribution over the whole label space. Labels
//! that received no support get probability 0 (majority vote) or whatever mass
//! the likelihood model leaves them (maximum likelihood). A task without votes
//! yields `None`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::labels::{Label, LabelSpace};
use crate::objects::TaskId;

/// One worker's label for one task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    pub label: Label,
    pub worker_id: String,
}

impl Vote {
    pub fn new(label: impl Into<Label>, worker_id: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            worker_id: worker_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationAlgorithm {
    #[default]
    MajorityVote,
    MaxLikelihood,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WeightError {
    #[error("worker weight for '{worker_id}' must be within [0, 1], got {weight}")]
    OutOfRange { worker_id: String, weight: f64 },
    #[error("default worker weight must be within [0, 1], got {0}")]
    DefaultOutOfRange(f64),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WorkerWeightsRaw {
    #[serde(default)]
    weights: HashMap<String, f64>,
    #[serde(default)]
    default: Option<f64>,
}

/// Externally supplied per-worker trust scores, each in [0, 1].
///
/// Workers without an explicit weight fall back to `default`, or to `1/K`
/// for a K-label space when no default is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "WorkerWeightsRaw")]
pub struct WorkerWeights {
    weights: HashMap<String, f64>,
    default: Option<f64>,
}

impl TryFrom<WorkerWeightsRaw> for WorkerWeights {
    type Error = WeightError;

    fn try_from(raw: WorkerWeightsRaw) -> Result<Self, Self::Error> {
        let mut out = match raw.default {
            Some(d) => WorkerWeights::with_default(d)?,
            None => WorkerWeights::uniform(),
        };
        for (worker_id, weight) in raw.weights {
            out.insert(worker_id, weight)?;
        }
        Ok(out)
    }
}

impl WorkerWeights {
    /// No explicit weights; every worker gets `1/K`.
    pub fn uniform() -> Self {
        Self::default()
    }

    pub fn with_default(default: f64) -> Result<Self, WeightError> {
        if !(0.0..=1.0).contains(&default) {
            return Err(WeightError::DefaultOutOfRange(default));
        }
        Ok(Self {
            weights: HashMap::new(),
            default: Some(default),
        })
    }

    pub fn insert(&mut self, worker_id: impl Into<String>, weight: f64) -> Result<(), WeightError> {
        let worker_id = worker_id.into();
        if !(0.0..=1.0).contains(&weight) {
            return Err(WeightError::OutOfRange { worker_id, weight });
        }
        self.weights.insert(worker_id, weight);
        Ok(())
    }

    pub fn explicit(&self, worker_id: &str) -> Option<f64> {
        self.weights.get(worker_id).copied()
    }

    /// Weight used for `worker_id` in a space of `k` labels.
    pub fn weight_for(&self, worker_id: &str, k: usize) -> f64 {
        self.explicit(worker_id)
            .or(self.default)
            .unwrap_or(1.0 / k.max(1) as f64)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Per-task label distribution and the votes it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Probabilities in label-space order.
    pub distribution: Vec<(Label, f64)>,
    pub votes: Vec<Vote>,
}

impl AggregationResult {
    pub fn probability(&self, label: &Label) -> f64 {
        self.distribution
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, p)| *p)
            .unwrap_or(0.0)
    }

    /// Winning label; ties go to the label listed first in the space.
    pub fn most_probable(&self) -> Option<(&Label, f64)> {
        let mut best: Option<(&Label, f64)> = None;
        for (label, p) in &self.distribution {
            match best {
                Some((_, bp)) if *p <= bp => {}
                _ => best = Some((label, *p)),
            }
        }
        best
    }

    pub fn overlap(&self) -> usize {
        self.votes.len()
    }
}

/// Reduce a distribution to `(label, probability)` of its winner.
pub fn most_probable(result: Option<&AggregationResult>) -> Option<(Label, f64)> {
    result
        .and_then(AggregationResult::most_probable)
        .map(|(l, p)| (l.clone(), p))
}

/// Aggregate one task's votes.
pub fn aggregate(
    space: &LabelSpace,
    votes: &[Vote],
    algorithm: AggregationAlgorithm,
    weights: &WorkerWeights,
) -> Option<AggregationResult> {
    let known: Vec<Vote> = votes
        .iter()
        .filter(|v| {
            let ok = space.contains(&v.label);
            if !ok {
                warn!(label = %v.label, worker_id = %v.worker_id, "Ignoring vote outside label space");
            }
            ok
        })
        .cloned()
        .collect();
    if known.is_empty() {
        return None;
    }

    let probs = match algorithm {
        AggregationAlgorithm::MajorityVote => vote_shares(space, &known),
        AggregationAlgorithm::MaxLikelihood => max_likelihood(space, &known, weights),
    };

    Some(AggregationResult {
        distribution: space.labels().iter().cloned().zip(probs).collect(),
        votes: known,
    })
}

/// Aggregate every task in a vote table.
pub fn aggregate_all(
    space: &LabelSpace,
    votes_by_task: &HashMap<TaskId, Vec<Vote>>,
    algorithm: AggregationAlgorithm,
    weights: &WorkerWeights,
) -> HashMap<TaskId, Option<AggregationResult>> {
    votes_by_task
        .iter()
        .map(|(task_id, votes)| {
            (
                task_id.clone(),
                aggregate(space, votes, algorithm, weights),
            )
        })
        .collect()
}

fn vote_shares(space: &LabelSpace, votes: &[Vote]) -> Vec<f64> {
    let mut counts = vec![0usize; space.len()];
    for v in votes {
        if let Some(idx) = space.index_of(&v.label) {
            counts[idx] += 1;
        }
    }
    let total = votes.len() as f64;
    counts.into_iter().map(|c| c as f64 / total).collect()
}

fn max_likelihood(space: &LabelSpace, votes: &[Vote], weights: &WorkerWeights) -> Vec<f64> {
    let k = space.len();
    if k == 1 {
        return vec![1.0];
    }

    // Log-space product of per-vote factors for every candidate label.
    let mut log_scores = vec![0.0f64; k];
    for v in votes {
        let Some(voted) = space.index_of(&v.label) else {
            continue;
        };
        let w = weights.weight_for(&v.worker_id, k).clamp(0.0, 1.0);
        let hit = w.ln();
        let miss = ((1.0 - w) / (k - 1) as f64).ln();
        for (idx, score) in log_scores.iter_mut().enumerate() {
            *score += if idx == voted { hit } else { miss };
        }
    }

    let max = log_scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        // Fully trusted workers disagree: every candidate has zero likelihood.
        warn!("Likelihood degenerate for all labels; falling back to vote shares");
        return vote_shares(space, votes);
    }

    let unnorm: Vec<f64> = log_scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = unnorm.iter().sum();
    unnorm.into_iter().map(|u| u / total).collect()
}
