//! Worker quality control.
//!
//! Rules are pure functions from rolling per-worker statistics to actions.
//! The engine only decides; the classification loop applies the actions
//! through the platform.

pub mod rules;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use rules::{AccuracyControl, StaticReward, SpeedControl};

/// One assignment as seen by the rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub assignment_id: String,
    pub submitted_at: DateTime<Utc>,
    /// Wall time spent divided by the number of tasks in the assignment.
    pub secs_per_task: f64,
    /// Per-task estimate for this assignment's objects; the rule context
    /// default applies when unset.
    #[serde(default)]
    pub expected_secs_per_task: Option<f64>,
    /// Submitted but neither accepted nor rejected yet.
    pub pending: bool,
}

/// Rolling statistics for one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub assignments: Vec<AssignmentRecord>,
    pub accepted: usize,
    pub rejected: usize,
    pub control_total: usize,
    pub control_correct: usize,
    pub rewarded: bool,
    pub blocked: bool,
    /// End of a temporary block; unset with `blocked` means permanent.
    #[serde(default)]
    pub blocked_until: Option<DateTime<Utc>>,
}

impl WorkerStats {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    /// Record an assignment once; later calls only refresh the pending flag.
    pub fn observe(&mut self, record: AssignmentRecord) {
        match self
            .assignments
            .iter_mut()
            .find(|a| a.assignment_id == record.assignment_id)
        {
            Some(existing) => existing.pending = record.pending,
            None => self.assignments.push(record),
        }
    }

    pub fn record_control(&mut self, correct: bool) {
        self.control_total += 1;
        if correct {
            self.control_correct += 1;
        }
    }

    pub fn block(&mut self, until: Option<DateTime<Utc>>) {
        self.blocked = true;
        self.blocked_until = until;
    }

    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        self.blocked && self.blocked_until.map_or(true, |until| until > now)
    }

    pub fn control_accuracy(&self) -> Option<f64> {
        if self.control_total == 0 {
            None
        } else {
            Some(self.control_correct as f64 / self.control_total as f64)
        }
    }

    /// Assignments submitted within `span` before `now`.
    pub fn window(&self, now: DateTime<Utc>, span: Duration) -> Vec<&AssignmentRecord> {
        let span = chrono::Duration::from_std(span).unwrap_or(chrono::Duration::MAX);
        let start = now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.assignments
            .iter()
            .filter(|a| a.submitted_at > start && a.submitted_at <= now)
            .collect()
    }
}

/// Shared inputs every rule sees.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext {
    pub now: DateTime<Utc>,
    /// Expected time a careful worker spends on one task.
    pub expected_task_duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Accept {
        assignment_id: String,
    },
    Reject {
        assignment_id: String,
        comment: String,
    },
    /// `until: None` blocks permanently.
    Block {
        worker_id: String,
        until: Option<DateTime<Utc>>,
        reason: String,
    },
    Reward {
        worker_id: String,
        amount: f64,
        reason: String,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Accept { .. } => "accept",
            Action::Reject { .. } => "reject",
            Action::Block { .. } => "block",
            Action::Reward { .. } => "reward",
        }
    }
}

pub trait ControlRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, ctx: &RuleContext, stats: &WorkerStats) -> Vec<Action>;
}

/// Serialized rule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleConfig {
    StaticReward(StaticReward),
    SpeedControl(SpeedControl),
    AccuracyControl(AccuracyControl),
}

impl RuleConfig {
    pub fn name(&self) -> &'static str {
        match self {
            RuleConfig::StaticReward(r) => r.name(),
            RuleConfig::SpeedControl(r) => r.name(),
            RuleConfig::AccuracyControl(r) => r.name(),
        }
    }
}

#[derive(Default)]
pub struct RulesBuilder {
    rules: Vec<Box<dyn ControlRule>>,
}

impl RulesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn static_reward(self, rule: StaticReward) -> Self {
        self.rule(rule)
    }

    pub fn speed_control(self, rule: SpeedControl) -> Self {
        self.rule(rule)
    }

    pub fn accuracy_control(self, rule: AccuracyControl) -> Self {
        self.rule(rule)
    }

    pub fn rule(mut self, rule: impl ControlRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn from_configs(configs: &[RuleConfig]) -> Self {
        configs
            .iter()
            .cloned()
            .fold(Self::new(), |builder, cfg| match cfg {
                RuleConfig::StaticReward(r) => builder.static_reward(r),
                RuleConfig::SpeedControl(r) => builder.speed_control(r),
                RuleConfig::AccuracyControl(r) => builder.accuracy_control(r),
            })
    }

    pub fn build(self) -> RuleEngine {
        RuleEngine { rules: self.rules }
    }
}

pub struct RuleEngine {
    rules: Vec<Box<dyn ControlRule>>,
}

impl RuleEngine {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Run every rule over every worker; duplicate actions are emitted once.
    pub fn evaluate(
        &self,
        ctx: &RuleContext,
        workers: &BTreeMap<String, WorkerStats>,
    ) -> Vec<Action> {
        let mut actions: Vec<Action> = Vec::new();
        for stats in workers.values() {
            for rule in &self.rules {
                for action in rule.evaluate(ctx, stats) {
                    if !actions.contains(&action) {
                        actions.push(action);
                    }
                }
            }
        }
        actions
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rule_names())
            .finish()
    }
}
