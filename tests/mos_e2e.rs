use std::collections::HashMap;

use chrono::{Duration, TimeZone, Utc};
use crowd_harness::labels::Label;
use crowd_harness::mos::{evaluate_mos, MosConfig, MosError, RejectReason, DEFAULT_GROUP};
use crowd_harness::objects::{ObjectValue, Objects, TaskId};
use crowd_harness::platform::{AssignmentMeta, AssignmentSolutions, AssignmentStatus, Solution};

fn clip(name: &str) -> Objects {
    Objects::new(vec![ObjectValue::audio(format!("{name}.wav"))])
}

fn assignment(
    id: &str,
    worker: &str,
    secs: i64,
    clips: &[&str],
    scores: &[u8],
) -> AssignmentSolutions {
    let submitted_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    AssignmentSolutions {
        assignment: AssignmentMeta {
            id: id.to_string(),
            worker_id: worker.to_string(),
            status: AssignmentStatus::Submitted,
            started_at: submitted_at - Duration::seconds(secs),
            submitted_at,
        },
        solutions: clips
            .iter()
            .zip(scores)
            .map(|(name, score)| Solution {
                task_id: format!("task-{name}"),
                objects: clip(name),
                label: Label::new(score.to_string()),
            })
            .collect(),
    }
}

const GROUP_A: [&str; 3] = ["c1", "c2", "c3"];
const GROUP_B: [&str; 3] = ["c4", "c5", "c6"];

/// Seven raters: three careful ones, two far too fast, one inverted and one
/// with a single assignment.
fn ratings() -> Vec<AssignmentSolutions> {
    let mut out = Vec::new();
    let mut push = |worker: &str, secs: i64, a: [u8; 3], b: [u8; 3]| {
        let n = out.len();
        out.push(assignment(&format!("asg-{}", n + 1), worker, secs, &GROUP_A, &a));
        out.push(assignment(&format!("asg-{}", n + 2), worker, secs, &GROUP_B, &b));
    };
    push("w1", 60, [5, 5, 4], [2, 1, 1]);
    push("w2", 60, [4, 5, 5], [1, 2, 1]);
    push("w3", 60, [5, 4, 5], [1, 1, 2]);
    push("w4", 6, [3, 3, 3], [3, 3, 3]);
    push("w5", 6, [1, 5, 1], [5, 1, 5]);
    push("w6", 60, [2, 1, 2], [4, 5, 4]);
    out.push(assignment("asg-13", "w7", 60, &GROUP_A, &[4, 4, 5]));
    out
}

fn metadata() -> HashMap<TaskId, String> {
    GROUP_A
        .iter()
        .map(|c| (clip(c).task_id(), "alg_a".to_string()))
        .chain(GROUP_B.iter().map(|c| (clip(c).task_id(), "alg_b".to_string())))
        .collect()
}

fn config() -> MosConfig {
    MosConfig {
        expected_task_secs: 10.0,
        fast_ratio: 0.3,
        min_correlation: 0.3,
        min_qualifying_assignments: 2,
        stub_correlation: 0.0,
        confidence_level: 0.95,
        ..MosConfig::default()
    }
}

#[test]
fn seven_worker_pool_rejects_outliers_and_groups_estimates() {
    let meta = metadata();
    let report = evaluate_mos(&ratings(), Some(&meta), &config()).unwrap();

    let mut rejected: Vec<&str> = report.rejected.iter().map(|r| r.worker_id.as_str()).collect();
    rejected.sort();
    assert_eq!(rejected, vec!["w4", "w5", "w6", "w7"]);
    for r in &report.rejected {
        match r.worker_id.as_str() {
            "w4" | "w5" => assert!(
                matches!(r.reason, RejectReason::TooFast { mean_secs_per_task } if (mean_secs_per_task - 2.0).abs() < 1e-9)
            ),
            "w6" => assert!(
                matches!(r.reason, RejectReason::LowCorrelation { correlation } if correlation < 0.0)
            ),
            "w7" => assert_eq!(r.reason, RejectReason::LowCorrelation { correlation: 0.0 }),
            other => panic!("unexpected rejection of {other}"),
        }
    }
    for worker in ["w1", "w2", "w3"] {
        assert!(report.correlations[worker] > 0.6, "{worker}: {}", report.correlations[worker]);
        assert!(!report.is_rejected(worker));
    }

    assert_eq!(report.groups.len(), 2);
    let a = report.groups["alg_a"];
    let b = report.groups["alg_b"];
    assert_eq!(a.n, 9);
    assert_eq!(b.n, 9);
    assert!((a.mean - 42.0 / 9.0).abs() < 1e-9);
    assert!((b.mean - 12.0 / 9.0).abs() < 1e-9);
    // t(0.975, 8) * 0.5 / 3
    assert!((a.ci - 0.3843).abs() < 1e-3, "{}", a.ci);
    assert!((b.ci - 0.3843).abs() < 1e-3, "{}", b.ci);

    assert_eq!(report.overall.n, 18);
    assert!((report.overall.mean - 3.0).abs() < 1e-9);
    // t(0.975, 17) * sqrt(54 / 17) / sqrt(18)
    assert!((report.overall.ci - 0.8863).abs() < 1e-3, "{}", report.overall.ci);
    assert!(a.mean != report.overall.mean && b.mean != report.overall.mean);
    assert!(a.ci < report.overall.ci);

    assert_eq!(report.ratings_total, 39);
    assert_eq!(report.ratings_used, 18);
}

#[test]
fn without_metadata_everything_lands_in_the_default_group() {
    let report = evaluate_mos(&ratings(), None, &config()).unwrap();
    assert_eq!(report.groups.len(), 1);
    let default = report.groups[DEFAULT_GROUP];
    assert_eq!(default, report.overall);
}

#[test]
fn rejected_and_expired_assignments_are_ignored() {
    let mut ratings = ratings();
    for asg in ratings.iter_mut().filter(|a| a.assignment.worker_id == "w6") {
        asg.assignment.status = AssignmentStatus::Rejected;
    }
    let report = evaluate_mos(&ratings, None, &config()).unwrap();
    assert!(!report.correlations.contains_key("w6"));
    assert_eq!(report.ratings_total, 33);

    // Dropping an outlier leaves every other verdict unchanged.
    let mut rejected: Vec<&str> = report.rejected.iter().map(|r| r.worker_id.as_str()).collect();
    rejected.sort();
    assert_eq!(rejected, vec!["w4", "w5", "w7"]);
    assert_eq!(report.ratings_used, 18);
}

#[test]
fn rated_item_missing_from_metadata_is_an_error() {
    let mut meta = metadata();
    meta.remove(&clip("c5").task_id());
    let err = evaluate_mos(&ratings(), Some(&meta), &config()).unwrap_err();
    assert!(matches!(err, MosError::MissingMetadata(id) if id == clip("c5").task_id()));
}

#[test]
fn label_off_the_scale_is_rejected() {
    let mut ratings = ratings();
    ratings[0].solutions[0].label = Label::new("excellent");
    let err = evaluate_mos(&ratings, None, &config()).unwrap_err();
    assert!(matches!(err, MosError::UnscoredLabel { .. }), "{err}");
}
