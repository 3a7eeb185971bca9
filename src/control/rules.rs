//! Built-in control rules.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Action, ControlRule, RuleContext, WorkerStats};

fn default_reward_reason() -> String {
    "bonus for accepted work".to_string()
}

/// One-time bonus once a worker has enough accepted assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticReward {
    pub min_accepted: usize,
    pub amount: f64,
    #[serde(default = "default_reward_reason")]
    pub reason: String,
}

impl StaticReward {
    pub fn new(min_accepted: usize, amount: f64) -> Self {
        Self {
            min_accepted,
            amount,
            reason: default_reward_reason(),
        }
    }
}

impl ControlRule for StaticReward {
    fn name(&self) -> &'static str {
        "static_reward"
    }

    fn evaluate(&self, _ctx: &RuleContext, stats: &WorkerStats) -> Vec<Action> {
        if stats.rewarded || stats.blocked || stats.accepted < self.min_accepted {
            return Vec::new();
        }
        vec![Action::Reward {
            worker_id: stats.worker_id.clone(),
            amount: self.amount,
            reason: self.reason.clone(),
        }]
    }
}

/// End of a block lasting `block_secs`; a span past the calendar range is permanent.
fn block_deadline(now: DateTime<Utc>, block_secs: Option<u64>) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(block_secs?).ok()?;
    now.checked_add_signed(chrono::Duration::try_seconds(secs)?)
}

fn default_window_secs() -> u64 {
    2 * 24 * 3600
}

fn default_min_fast_share() -> f64 {
    0.5
}

fn default_min_assignments() -> usize {
    3
}

fn default_reject_fast() -> bool {
    true
}

/// Blocks workers who submit too many assignments faster than plausible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedControl {
    /// Per-task time below `ratio_threshold * expected` counts as fast.
    pub ratio_threshold: f64,
    #[serde(default = "default_min_fast_share")]
    pub min_fast_share: f64,
    #[serde(default = "default_min_assignments")]
    pub min_assignments: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// `None` blocks permanently.
    #[serde(default)]
    pub block_secs: Option<u64>,
    #[serde(default = "default_reject_fast")]
    pub reject_fast: bool,
}

impl SpeedControl {
    pub fn new(ratio_threshold: f64) -> Self {
        Self {
            ratio_threshold,
            min_fast_share: default_min_fast_share(),
            min_assignments: default_min_assignments(),
            window_secs: default_window_secs(),
            block_secs: None,
            reject_fast: default_reject_fast(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl ControlRule for SpeedControl {
    fn name(&self) -> &'static str {
        "speed_control"
    }

    fn evaluate(&self, ctx: &RuleContext, stats: &WorkerStats) -> Vec<Action> {
        if stats.is_blocked_at(ctx.now) {
            return Vec::new();
        }
        let window = stats.window(ctx.now, self.window());
        if window.is_empty() || window.len() < self.min_assignments {
            return Vec::new();
        }

        let default_expected = ctx.expected_task_duration.as_secs_f64();
        let fast: Vec<_> = window
            .iter()
            .filter(|a| {
                let expected = a.expected_secs_per_task.unwrap_or(default_expected);
                expected > 0.0 && a.secs_per_task / expected < self.ratio_threshold
            })
            .collect();
        let share = fast.len() as f64 / window.len() as f64;
        if share < self.min_fast_share {
            return Vec::new();
        }

        let until = block_deadline(ctx.now, self.block_secs);
        let mut actions = vec![Action::Block {
            worker_id: stats.worker_id.clone(),
            until,
            reason: format!(
                "{} of {} recent assignments were submitted too fast",
                fast.len(),
                window.len()
            ),
        }];
        if self.reject_fast {
            actions.extend(fast.iter().filter(|a| a.pending).map(|a| Action::Reject {
                assignment_id: a.assignment_id.clone(),
                comment: "submitted too fast".to_string(),
            }));
        }
        actions
    }
}

/// Blocks workers whose answers on control tasks are too often wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyControl {
    pub min_accuracy: f64,
    #[serde(default = "default_min_assignments")]
    pub min_control_tasks: usize,
    #[serde(default)]
    pub block_secs: Option<u64>,
}

impl AccuracyControl {
    pub fn new(min_accuracy: f64, min_control_tasks: usize) -> Self {
        Self {
            min_accuracy,
            min_control_tasks,
            block_secs: None,
        }
    }
}

impl ControlRule for AccuracyControl {
    fn name(&self) -> &'static str {
        "accuracy_control"
    }

    fn evaluate(&self, ctx: &RuleContext, stats: &WorkerStats) -> Vec<Action> {
        if stats.is_blocked_at(ctx.now) || stats.control_total < self.min_control_tasks {
            return Vec::new();
        }
        let Some(accuracy) = stats.control_accuracy() else {
            return Vec::new();
        };
        if accuracy >= self.min_accuracy {
            return Vec::new();
        }
        let until = block_deadline(ctx.now, self.block_secs);
        vec![Action::Block {
            worker_id: stats.worker_id.clone(),
            until,
            reason: format!(
                "control accuracy {:.2} below {:.2} over {} tasks",
                accuracy, self.min_accuracy, stats.control_total
            ),
        }]
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::control::AssignmentRecord;

    fn ctx() -> RuleContext {
        RuleContext {
            now: Utc::now(),
            expected_task_duration: Duration::from_secs(20),
        }
    }

    fn stats_with(times: &[f64], pending: bool) -> WorkerStats {
        let now = Utc::now();
        let mut stats = WorkerStats::new("w");
        for (i, t) in times.iter().enumerate() {
            stats.observe(AssignmentRecord {
                assignment_id: format!("a{i}"),
                submitted_at: now - chrono::Duration::minutes(i as i64 + 1),
                secs_per_task: *t,
                expected_secs_per_task: None,
                pending,
            });
        }
        stats
    }

    #[test]
    fn static_reward_is_granted_once() {
        let rule = StaticReward::new(2, 1.0);
        let mut stats = WorkerStats::new("w");
        stats.accepted = 1;
        assert!(rule.evaluate(&ctx(), &stats).is_empty());
        stats.accepted = 2;
        assert_eq!(rule.evaluate(&ctx(), &stats).len(), 1);
        stats.rewarded = true;
        assert!(rule.evaluate(&ctx(), &stats).is_empty());
    }

    #[test]
    fn speed_control_blocks_and_rejects_fast_workers() {
        let rule = SpeedControl::new(0.3);
        // 2s per task against 20s expected is a ratio of 0.1.
        let stats = stats_with(&[2.0, 2.0, 25.0], true);
        let actions = rule.evaluate(&ctx(), &stats);

        assert!(matches!(
            &actions[0],
            Action::Block { worker_id, until: None, .. } if worker_id == "w"
        ));
        let rejected: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Reject { assignment_id, .. } => Some(assignment_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(rejected, vec!["a0", "a1"]);
    }

    #[test]
    fn speed_control_needs_enough_assignments() {
        let rule = SpeedControl::new(0.3);
        let stats = stats_with(&[1.0, 1.0], true);
        assert!(rule.evaluate(&ctx(), &stats).is_empty());
    }

    #[test]
    fn speed_control_ignores_careful_workers() {
        let rule = SpeedControl::new(0.3);
        let stats = stats_with(&[18.0, 25.0, 2.0], false);
        assert!(rule.evaluate(&ctx(), &stats).is_empty());
    }

    #[test]
    fn speed_control_temporary_block_has_deadline() {
        let mut rule = SpeedControl::new(0.5);
        rule.block_secs = Some(3600);
        rule.reject_fast = false;
        let c = ctx();
        let stats = stats_with(&[1.0, 1.0, 1.0], true);
        let actions = rule.evaluate(&c, &stats);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Block { until: Some(until), .. } => {
                assert_eq!(*until, c.now + chrono::Duration::hours(1));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn accuracy_control_blocks_after_enough_control_answers() {
        let rule = AccuracyControl::new(0.6, 3);
        let mut stats = WorkerStats::new("w");
        stats.record_control(false);
        stats.record_control(false);
        assert!(rule.evaluate(&ctx(), &stats).is_empty());
        stats.record_control(true);
        let actions = rule.evaluate(&ctx(), &stats);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), "block");

        stats.block(None);
        assert!(rule.evaluate(&ctx(), &stats).is_empty());
    }

    #[test]
    fn expired_block_lets_rules_decide_again() {
        let rule = AccuracyControl::new(0.6, 1);
        let c = ctx();
        let mut stats = WorkerStats::new("w");
        stats.record_control(false);
        stats.block(Some(c.now - chrono::Duration::minutes(5)));
        assert_eq!(rule.evaluate(&c, &stats).len(), 1);
    }

    #[test]
    fn oversized_block_span_is_permanent() {
        let mut rule = SpeedControl::new(0.5);
        rule.block_secs = Some(u64::MAX);
        rule.reject_fast = false;
        let stats = stats_with(&[1.0, 1.0, 1.0], true);
        let actions = rule.evaluate(&ctx(), &stats);
        assert!(matches!(&actions[0], Action::Block { until: None, .. }));

        let now = ctx().now;
        assert_eq!(block_deadline(now, Some(i64::MAX as u64)), None);
        assert_eq!(
            block_deadline(now, Some(60)),
            Some(now + chrono::Duration::minutes(1))
        );
        assert_eq!(block_deadline(now, None), None);
    }
}
