//! Pool configuration, validation and soft advisories.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregation::{AggregationAlgorithm, WeightError};
use crate::control::RuleConfig;
use crate::labels::LabelError;
use crate::overlap::OverlapPolicy;
use crate::platform::PoolAdmission;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be {bound}, got {actual}")]
    OutOfRange {
        field: String,
        bound: String,
        actual: String,
    },
    #[error("missing required field: {0}")]
    Missing(&'static str),
    #[error(transparent)]
    Weights(#[from] WeightError),
    #[error(transparent)]
    Labels(#[from] LabelError),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn out_of_range(
        field: impl Into<String>,
        bound: impl Into<String>,
        actual: impl fmt::Display,
    ) -> Self {
        Self::OutOfRange {
            field: field.into(),
            bound: bound.into(),
            actual: actual.to_string(),
        }
    }
}

/// Soft condition worth a confirmation prompt but not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "advisory", rename_all = "snake_case")]
pub enum Advisory {
    TooFewObjects { count: usize, recommended_min: usize },
    TooManyObjects { count: usize, recommended_max: usize },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::TooFewObjects {
                count,
                recommended_min,
            } => write!(
                f,
                "only {count} objects; at least {recommended_min} are recommended for stable estimates"
            ),
            Advisory::TooManyObjects {
                count,
                recommended_max,
            } => write!(
                f,
                "{count} objects exceeds the recommended maximum of {recommended_max} per pool"
            ),
        }
    }
}

fn default_recommended_min() -> usize {
    1
}

fn default_recommended_max() -> usize {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeLimits {
    #[serde(default = "default_recommended_min")]
    pub recommended_min: usize,
    #[serde(default = "default_recommended_max")]
    pub recommended_max: usize,
}

impl Default for VolumeLimits {
    fn default() -> Self {
        Self {
            recommended_min: default_recommended_min(),
            recommended_max: default_recommended_max(),
        }
    }
}

impl VolumeLimits {
    pub fn check(&self, count: usize) -> Vec<Advisory> {
        let mut out = Vec::new();
        if count < self.recommended_min {
            out.push(Advisory::TooFewObjects {
                count,
                recommended_min: self.recommended_min,
            });
        }
        if count > self.recommended_max {
            out.push(Advisory::TooManyObjects {
                count,
                recommended_max: self.recommended_max,
            });
        }
        out
    }
}

fn default_task_duration_secs() -> f64 {
    30.0
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

fn default_max_idle_cycles() -> usize {
    30
}

fn default_action_concurrency() -> usize {
    8
}

fn default_control_overlap() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub pool_id: String,
    #[serde(default)]
    pub overlap: OverlapPolicy,
    #[serde(default)]
    pub aggregation: AggregationAlgorithm,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Expected time a careful worker spends on one task.
    #[serde(default = "default_task_duration_secs")]
    pub task_duration_secs: f64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive cycles without new assignments before the loop gives up.
    #[serde(default = "default_max_idle_cycles")]
    pub max_idle_cycles: usize,
    #[serde(default)]
    pub latency_budget_ms: Option<u64>,
    /// Percentage a worker must score on training to take tasks from the pool.
    #[serde(default)]
    pub min_training_score: Option<u32>,
    #[serde(default)]
    pub volume: VolumeLimits,
    #[serde(default = "default_action_concurrency")]
    pub action_concurrency: usize,
    /// Assignments requested for each control task.
    #[serde(default = "default_control_overlap")]
    pub control_overlap: usize,
}

impl PoolConfig {
    pub fn new(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            overlap: OverlapPolicy::default(),
            aggregation: AggregationAlgorithm::default(),
            rules: Vec::new(),
            task_duration_secs: default_task_duration_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_idle_cycles: default_max_idle_cycles(),
            latency_budget_ms: None,
            min_training_score: None,
            volume: VolumeLimits::default(),
            action_concurrency: default_action_concurrency(),
            control_overlap: default_control_overlap(),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: PoolConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn expected_task_duration(&self) -> Duration {
        Duration::from_secs_f64(self.task_duration_secs.max(0.0))
    }

    pub fn admission(&self) -> PoolAdmission {
        PoolAdmission {
            min_training_score: self.min_training_score,
        }
    }

    pub fn advisories(&self, object_count: usize) -> Vec<Advisory> {
        self.volume.check(object_count)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_id.trim().is_empty() {
            return Err(ConfigError::Missing("pool_id"));
        }
        validate_overlap(&self.overlap)?;
        if !(self.task_duration_secs > 0.0) || !self.task_duration_secs.is_finite() {
            return Err(ConfigError::out_of_range(
                "task_duration_secs",
                "a positive number of seconds",
                self.task_duration_secs,
            ));
        }
        if self.max_idle_cycles == 0 {
            return Err(ConfigError::out_of_range("max_idle_cycles", ">= 1", 0));
        }
        if self.action_concurrency == 0 {
            return Err(ConfigError::out_of_range("action_concurrency", ">= 1", 0));
        }
        if self.control_overlap == 0 {
            return Err(ConfigError::out_of_range("control_overlap", ">= 1", 0));
        }
        if let Some(score) = self.min_training_score {
            if score > 100 {
                return Err(ConfigError::out_of_range(
                    "min_training_score",
                    "<= 100",
                    score,
                ));
            }
        }
        if self.volume.recommended_min > self.volume.recommended_max {
            return Err(ConfigError::out_of_range(
                "volume.recommended_min",
                format!("<= volume.recommended_max ({})", self.volume.recommended_max),
                self.volume.recommended_min,
            ));
        }
        for (idx, rule) in self.rules.iter().enumerate() {
            validate_rule(idx, rule)?;
        }
        Ok(())
    }
}

fn validate_overlap(policy: &OverlapPolicy) -> Result<(), ConfigError> {
    match *policy {
        OverlapPolicy::Static { overlap } => {
            if overlap == 0 {
                return Err(ConfigError::out_of_range("overlap.overlap", ">= 1", overlap));
            }
        }
        OverlapPolicy::Dynamic {
            min_overlap,
            max_overlap,
            confidence,
        } => {
            if min_overlap == 0 {
                return Err(ConfigError::out_of_range(
                    "overlap.min_overlap",
                    ">= 1",
                    min_overlap,
                ));
            }
            if max_overlap < min_overlap {
                return Err(ConfigError::out_of_range(
                    "overlap.max_overlap",
                    format!(">= min_overlap ({min_overlap})"),
                    max_overlap,
                ));
            }
            if !(confidence > 0.0 && confidence <= 1.0) {
                return Err(ConfigError::out_of_range(
                    "overlap.confidence",
                    "within (0, 1]",
                    confidence,
                ));
            }
        }
    }
    Ok(())
}

fn check_unit(field: String, value: f64, open_low: bool) -> Result<(), ConfigError> {
    let ok = if open_low {
        value > 0.0 && value <= 1.0
    } else {
        (0.0..=1.0).contains(&value)
    };
    if ok {
        Ok(())
    } else {
        let bound = if open_low { "within (0, 1]" } else { "within [0, 1]" };
        Err(ConfigError::out_of_range(field, bound, value))
    }
}

fn validate_rule(idx: usize, rule: &RuleConfig) -> Result<(), ConfigError> {
    let field = |name: &str| format!("rules[{idx}].{name}");
    match rule {
        RuleConfig::StaticReward(r) => {
            if !(r.amount > 0.0) {
                return Err(ConfigError::out_of_range(field("amount"), "> 0", r.amount));
            }
        }
        RuleConfig::SpeedControl(r) => {
            check_unit(field("ratio_threshold"), r.ratio_threshold, true)?;
            check_unit(field("min_fast_share"), r.min_fast_share, true)?;
            if r.window_secs == 0 {
                return Err(ConfigError::out_of_range(field("window_secs"), ">= 1", 0));
            }
        }
        RuleConfig::AccuracyControl(r) => {
            check_unit(field("min_accuracy"), r.min_accuracy, false)?;
            if r.min_control_tasks == 0 {
                return Err(ConfigError::out_of_range(
                    field("min_control_tasks"),
                    ">= 1",
                    0,
                ));
            }
        }
    }
    Ok(())
}
