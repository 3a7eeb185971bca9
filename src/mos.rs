//! Mean opinion score estimation.
//!
//! Workers rate items on an ordinal scale. Whole workers are rejected when
//! they are implausibly fast or disagree with their peers; the remaining
//! ratings give a mean and Student-t confidence interval per group.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::labels::Label;
use crate::objects::TaskId;
use crate::platform::{AssignmentSolutions, AssignmentStatus};

pub const DEFAULT_GROUP: &str = "default";

fn default_scale() -> BTreeMap<String, f64> {
    (1..=5).map(|s| (s.to_string(), s as f64)).collect()
}

fn default_expected_task_secs() -> f64 {
    10.0
}

fn default_fast_ratio() -> f64 {
    0.3
}

fn default_min_correlation() -> f64 {
    0.3
}

fn default_min_qualifying_assignments() -> usize {
    2
}

fn default_confidence_level() -> f64 {
    0.95
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosConfig {
    /// Label to numeric score.
    #[serde(default = "default_scale")]
    pub scale: BTreeMap<String, f64>,
    #[serde(default = "default_expected_task_secs")]
    pub expected_task_secs: f64,
    /// Workers whose mean per-task time is below `fast_ratio * expected` are rejected.
    #[serde(default = "default_fast_ratio")]
    pub fast_ratio: f64,
    #[serde(default = "default_min_correlation")]
    pub min_correlation: f64,
    /// Assignments touching peer-rated items needed for a real correlation.
    #[serde(default = "default_min_qualifying_assignments")]
    pub min_qualifying_assignments: usize,
    /// Correlation assumed for workers with too little overlap with peers.
    #[serde(default)]
    pub stub_correlation: f64,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
}

impl Default for MosConfig {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            expected_task_secs: default_expected_task_secs(),
            fast_ratio: default_fast_ratio(),
            min_correlation: default_min_correlation(),
            min_qualifying_assignments: default_min_qualifying_assignments(),
            stub_correlation: 0.0,
            confidence_level: default_confidence_level(),
        }
    }
}

impl MosConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scale.is_empty() {
            return Err(ConfigError::Missing("scale"));
        }
        if !(self.expected_task_secs > 0.0) {
            return Err(ConfigError::out_of_range(
                "expected_task_secs",
                "> 0",
                self.expected_task_secs,
            ));
        }
        if !(0.0..=1.0).contains(&self.fast_ratio) {
            return Err(ConfigError::out_of_range(
                "fast_ratio",
                "within [0, 1]",
                self.fast_ratio,
            ));
        }
        if !(-1.0..=1.0).contains(&self.min_correlation) {
            return Err(ConfigError::out_of_range(
                "min_correlation",
                "within [-1, 1]",
                self.min_correlation,
            ));
        }
        if !(-1.0..=1.0).contains(&self.stub_correlation) {
            return Err(ConfigError::out_of_range(
                "stub_correlation",
                "within [-1, 1]",
                self.stub_correlation,
            ));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(ConfigError::out_of_range(
                "confidence_level",
                "within (0, 1)",
                self.confidence_level,
            ));
        }
        Ok(())
    }

    fn score(&self, label: &Label) -> Option<f64> {
        self.scale.get(label.as_str()).copied()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MosError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("label '{label}' in assignment {assignment_id} has no score on the scale")]
    UnscoredLabel { label: String, assignment_id: String },
    #[error("rated item {0} is missing from the group metadata")]
    MissingMetadata(TaskId),
    #[error("no ratings survived outlier rejection")]
    NoRatings,
    #[error("statistics error: {0}")]
    Statistics(String),
}

/// Mean and confidence-interval half-width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MosCi {
    pub mean: f64,
    pub ci: f64,
    pub n: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    TooFast { mean_secs_per_task: f64 },
    LowCorrelation { correlation: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedWorker {
    pub worker_id: String,
    #[serde(flatten)]
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosReport {
    pub groups: BTreeMap<String, MosCi>,
    /// Estimate over every surviving rating, ignoring groups.
    pub overall: MosCi,
    pub rejected: Vec<RejectedWorker>,
    /// Correlation with peer consensus per worker (stub value where applied).
    pub correlations: BTreeMap<String, f64>,
    pub ratings_total: usize,
    pub ratings_used: usize,
}

impl MosReport {
    pub fn is_rejected(&self, worker_id: &str) -> bool {
        self.rejected.iter().any(|r| r.worker_id == worker_id)
    }
}

#[derive(Debug, Clone)]
struct Rating {
    worker_id: String,
    assignment_id: String,
    item: TaskId,
    score: f64,
}

/// Reject outlier workers, group the rest and estimate MOS with CIs.
///
/// `metadata` maps rated items to group keys; when absent every rating falls
/// into [`DEFAULT_GROUP`].
pub fn evaluate_mos(
    assignments: &[AssignmentSolutions],
    metadata: Option<&HashMap<TaskId, String>>,
    config: &MosConfig,
) -> Result<MosReport, MosError> {
    config.validate()?;

    let live: Vec<&AssignmentSolutions> = assignments
        .iter()
        .filter(|a| {
            matches!(
                a.assignment.status,
                AssignmentStatus::Submitted | AssignmentStatus::Accepted
            )
        })
        .collect();

    let mut ratings = Vec::new();
    for asg in &live {
        for sol in &asg.solutions {
            let score = config
                .score(&sol.label)
                .ok_or_else(|| MosError::UnscoredLabel {
                    label: sol.label.to_string(),
                    assignment_id: asg.assignment.id.clone(),
                })?;
            ratings.push(Rating {
                worker_id: asg.assignment.worker_id.clone(),
                assignment_id: asg.assignment.id.clone(),
                item: sol.objects.task_id(),
                score,
            });
        }
    }

    let (rejected, correlations) = reject_outliers(&live, &ratings, config);
    for r in &rejected {
        debug!(worker = %r.worker_id, reason = ?r.reason, "MOS worker rejected");
    }

    let surviving: Vec<&Rating> = ratings
        .iter()
        .filter(|r| !rejected.iter().any(|x| x.worker_id == r.worker_id))
        .collect();
    if surviving.is_empty() {
        return Err(MosError::NoRatings);
    }

    let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for rating in &surviving {
        let key = match metadata {
            Some(meta) => meta
                .get(&rating.item)
                .cloned()
                .ok_or_else(|| MosError::MissingMetadata(rating.item.clone()))?,
            None => DEFAULT_GROUP.to_string(),
        };
        grouped.entry(key).or_default().push(rating.score);
    }

    let mut groups = BTreeMap::new();
    for (key, scores) in &grouped {
        groups.insert(key.clone(), mean_ci(scores, config.confidence_level)?);
    }
    let all: Vec<f64> = surviving.iter().map(|r| r.score).collect();
    let overall = mean_ci(&all, config.confidence_level)?;

    info!(
        ratings = ratings.len(),
        used = surviving.len(),
        rejected_workers = rejected.len(),
        groups = groups.len(),
        "MOS estimated"
    );

    Ok(MosReport {
        groups,
        overall,
        rejected,
        correlations,
        ratings_total: ratings.len(),
        ratings_used: surviving.len(),
    })
}

fn reject_outliers(
    assignments: &[&AssignmentSolutions],
    ratings: &[Rating],
    config: &MosConfig,
) -> (Vec<RejectedWorker>, BTreeMap<String, f64>) {
    // Per-item scores by worker, over the full pool before any rejection.
    let mut by_item: HashMap<&TaskId, Vec<(&str, f64)>> = HashMap::new();
    for r in ratings {
        by_item
            .entry(&r.item)
            .or_default()
            .push((r.worker_id.as_str(), r.score));
    }

    let mut time_by_worker: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for asg in assignments {
        let entry = time_by_worker
            .entry(asg.assignment.worker_id.as_str())
            .or_default();
        entry.0 += asg.assignment.duration().as_secs_f64();
        entry.1 += asg.solutions.len();
    }

    let mut rejected = Vec::new();
    let mut correlations = BTreeMap::new();
    for (&worker, &(secs, tasks)) in &time_by_worker {
        // Worker's own ratings paired with the mean of everyone else's.
        let mut own = Vec::new();
        let mut peers = Vec::new();
        let mut qualifying: Vec<&str> = Vec::new();
        for r in ratings.iter().filter(|r| r.worker_id == worker) {
            let others: Vec<f64> = by_item
                .get(&r.item)
                .map(|v| {
                    v.iter()
                        .filter(|(w, _)| *w != worker)
                        .map(|(_, s)| *s)
                        .collect()
                })
                .unwrap_or_default();
            if others.is_empty() {
                continue;
            }
            own.push(r.score);
            peers.push(mean(&others));
            if !qualifying.contains(&r.assignment_id.as_str()) {
                qualifying.push(r.assignment_id.as_str());
            }
        }
        let correlation = if qualifying.len() < config.min_qualifying_assignments {
            config.stub_correlation
        } else {
            pearson(&own, &peers)
        };
        correlations.insert(worker.to_string(), correlation);

        let mean_secs_per_task = if tasks == 0 { 0.0 } else { secs / tasks as f64 };
        let reason = if mean_secs_per_task < config.fast_ratio * config.expected_task_secs {
            Some(RejectReason::TooFast { mean_secs_per_task })
        } else if correlation < config.min_correlation {
            Some(RejectReason::LowCorrelation { correlation })
        } else {
            None
        };
        if let Some(reason) = reason {
            rejected.push(RejectedWorker {
                worker_id: worker.to_string(),
                reason,
            });
        }
    }
    (rejected, correlations)
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Pearson correlation; 0 when either side has no variance.
fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let (mx, my) = (mean(&xs[..n]), mean(&ys[..n]));
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (x, y) in xs.iter().zip(ys).take(n) {
        sxy += (x - mx) * (y - my);
        sxx += (x - mx).powi(2);
        syy += (y - my).powi(2);
    }
    if sxx <= f64::EPSILON || syy <= f64::EPSILON {
        return 0.0;
    }
    sxy / (sxx.sqrt() * syy.sqrt())
}

/// Sample mean and Student-t half-width; a single rating has CI 0.
pub fn mean_ci(scores: &[f64], confidence_level: f64) -> Result<MosCi, MosError> {
    let n = scores.len();
    if n == 0 {
        return Err(MosError::NoRatings);
    }
    let m = mean(scores);
    if n < 2 {
        return Ok(MosCi { mean: m, ci: 0.0, n });
    }
    let var = scores.iter().map(|s| (s - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    let dist = StudentsT::new(0.0, 1.0, (n - 1) as f64)
        .map_err(|e| MosError::Statistics(e.to_string()))?;
    let t = dist.inverse_cdf(0.5 + confidence_level / 2.0);
    Ok(MosCi {
        mean: m,
        ci: t * (var / n as f64).sqrt(),
        n,
    })
}
