use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crowd_harness::classification::{
    run_classification, ClassificationError, ClassificationRequest, ClassificationStopReason,
    RunHooks,
};
use crowd_harness::config::PoolConfig;
use crowd_harness::control::{RuleConfig, SpeedControl, StaticReward};
use crowd_harness::datasource::{FieldSpec, TaskSpec};
use crowd_harness::labels::{Label, LabelSpace};
use crowd_harness::model::{ModelContractError, ModelLabeler};
use crowd_harness::objects::{ObjectKind, ObjectValue, Objects, TaskId};
use crowd_harness::overlap::{OverlapPolicy, ResolveReason, TaskStatus};
use crowd_harness::platform::simulated::{SimWorker, SimulatedPlatform};
use crowd_harness::platform::{Platform, PlatformError, RetryConfig, RetryingPlatform};

fn space() -> LabelSpace {
    LabelSpace::new(["cat", "dog"]).unwrap()
}

fn spec() -> TaskSpec {
    TaskSpec::new(vec![FieldSpec::new("image", ObjectKind::Image)], space())
}

fn image(name: &str) -> Objects {
    Objects::new(vec![ObjectValue::image(name)])
}

/// Images named `cat-N` are cats, everything else is a dog.
fn truth_of(objects: &Objects) -> Label {
    match objects.get(0) {
        Some(ObjectValue::Image(name)) if name.starts_with("cat") => Label::new("cat"),
        _ => Label::new("dog"),
    }
}

fn inputs(n: usize) -> Vec<Objects> {
    (0..n)
        .map(|i| {
            if i % 2 == 0 {
                image(&format!("cat-{i}.jpg"))
            } else {
                image(&format!("dog-{i}.jpg"))
            }
        })
        .collect()
}

fn truth(inputs: &[Objects]) -> HashMap<TaskId, Label> {
    inputs.iter().map(|o| (o.task_id(), truth_of(o))).collect()
}

fn pool(policy: OverlapPolicy) -> PoolConfig {
    let mut pool = PoolConfig::new("pool-1");
    pool.overlap = policy;
    pool.poll_interval_ms = 0;
    pool.max_idle_cycles = 3;
    pool
}

#[tokio::test]
async fn accurate_workers_resolve_every_task_with_one_vote() {
    let inputs = inputs(10);
    let platform = SimulatedPlatform::new(
        space(),
        vec![
            SimWorker::new("w1", 1.0, 30.0),
            SimWorker::new("w2", 1.0, 30.0),
            SimWorker::new("w3", 1.0, 30.0),
        ],
        7,
    )
    .with_truth(truth(&inputs));
    let req = ClassificationRequest::new(spec(), pool(OverlapPolicy::default()), inputs.clone());

    let resp = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap();

    assert_eq!(resp.meta.stop_reason, ClassificationStopReason::AllResolved);
    assert_eq!(resp.tasks.len(), 10);
    assert_eq!(resp.meta.tasks_posted, 10);
    assert_eq!(resp.meta.rejected, 0);
    for (task, objects) in resp.tasks.iter().zip(&inputs) {
        assert_eq!(task.task_id, objects.task_id());
        assert_eq!(task.label.as_ref(), Some(&truth_of(objects)));
        assert_eq!(task.overlap, 1);
        assert_eq!(
            task.status,
            TaskStatus::Resolved(ResolveReason::ConfidenceReached)
        );
    }
    assert_eq!(platform.assignment_count(), 10);
}

#[tokio::test]
async fn disagreement_raises_overlap_up_to_the_cap() {
    let inputs = vec![image("cat-0.jpg")];
    let platform = SimulatedPlatform::new(
        space(),
        vec![
            SimWorker::new("careful", 1.0, 30.0),
            SimWorker::new("contrary", 0.0, 30.0),
            SimWorker::new("late", 1.0, 30.0),
            SimWorker::new("extra", 1.0, 30.0),
        ],
        3,
    )
    .with_truth(truth(&inputs));
    let policy = OverlapPolicy::Dynamic {
        min_overlap: 2,
        max_overlap: 3,
        confidence: 0.85,
    };
    let req = ClassificationRequest::new(spec(), pool(policy), inputs);

    let resp = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap();

    let task = &resp.tasks[0];
    assert_eq!(task.overlap, 3);
    assert_eq!(task.votes.len(), 3);
    assert_eq!(task.label, Some(Label::new("cat")));
    assert!((task.confidence - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(
        task.status,
        TaskStatus::Resolved(ResolveReason::MaxOverlapReached)
    );
    // The pool never hands out more than the cap.
    assert_eq!(platform.assignment_count(), 3);
}

#[tokio::test]
async fn speed_control_blocks_fast_worker_and_rejects_its_answers() {
    let inputs = inputs(6);
    let platform = RetryingPlatform::new(
        SimulatedPlatform::new(
            space(),
            vec![
                SimWorker::new("speedy", 0.0, 1.0),
                SimWorker::new("w1", 1.0, 30.0),
                SimWorker::new("w2", 1.0, 30.0),
            ],
            11,
        )
        .with_truth(truth(&inputs)),
    );
    let mut pool = pool(OverlapPolicy::default());
    pool.rules = vec![RuleConfig::SpeedControl(SpeedControl {
        min_assignments: 1,
        ..SpeedControl::new(0.3)
    })];
    let req = ClassificationRequest::new(spec(), pool, inputs.clone());

    let resp = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap();

    assert_eq!(resp.meta.stop_reason, ClassificationStopReason::AllResolved);
    assert_eq!(platform.inner().blocked_workers(), vec!["speedy".to_string()]);
    assert_eq!(resp.meta.blocks, 1);
    assert_eq!(resp.meta.rejected, 1);
    let speedy = resp.worker("speedy").unwrap();
    assert!(speedy.blocked);
    assert_eq!(speedy.rejected, 1);
    assert_eq!(speedy.accepted, 0);
    for (task, objects) in resp.tasks.iter().zip(&inputs) {
        assert_eq!(task.label.as_ref(), Some(&truth_of(objects)));
        assert!(task.votes.iter().all(|v| v.worker_id != "speedy"));
    }
}

#[tokio::test]
async fn work_delivered_after_a_block_is_rejected() {
    let inputs = inputs(6);
    let platform = SimulatedPlatform::new(
        space(),
        vec![
            SimWorker::new("speedy", 0.0, 1.0),
            SimWorker::new("w1", 1.0, 30.0),
            SimWorker::new("w2", 1.0, 30.0),
        ],
        11,
    )
    .with_truth(truth(&inputs))
    .with_late_submissions();
    let mut pool = pool(OverlapPolicy::default());
    pool.rules = vec![RuleConfig::SpeedControl(SpeedControl {
        min_assignments: 1,
        ..SpeedControl::new(0.3)
    })];
    let req = ClassificationRequest::new(spec(), pool, inputs.clone());

    let resp = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap();

    assert_eq!(resp.meta.stop_reason, ClassificationStopReason::AllResolved);
    assert_eq!(resp.meta.blocks, 1);
    // One rejection from the speed rule, one for the in-flight assignment.
    assert_eq!(resp.meta.rejected, 2);
    let speedy = resp.worker("speedy").unwrap();
    assert_eq!(speedy.rejected, 2);
    assert_eq!(speedy.accepted, 0);
    for (task, objects) in resp.tasks.iter().zip(&inputs) {
        assert_eq!(task.label.as_ref(), Some(&truth_of(objects)));
        assert!(task.votes.iter().all(|v| v.worker_id != "speedy"));
    }
}

#[tokio::test]
async fn workers_below_training_score_never_vote() {
    let inputs = inputs(6);
    let platform = SimulatedPlatform::new(
        space(),
        vec![
            SimWorker::new("novice", 0.0, 30.0).with_training_score(40),
            SimWorker::new("w1", 1.0, 30.0).with_training_score(90),
            SimWorker::new("w2", 1.0, 30.0),
        ],
        13,
    )
    .with_truth(truth(&inputs));
    let mut pool = pool(OverlapPolicy::default());
    pool.min_training_score = Some(70);
    let req = ClassificationRequest::new(spec(), pool, inputs.clone());

    let resp = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap();

    assert_eq!(resp.meta.stop_reason, ClassificationStopReason::AllResolved);
    assert!(resp.worker("novice").is_none());
    assert_eq!(platform.assignment_count(), 6);
    for (task, objects) in resp.tasks.iter().zip(&inputs) {
        assert_eq!(task.label.as_ref(), Some(&truth_of(objects)));
    }
}

#[tokio::test]
async fn static_reward_pays_each_worker_once() {
    let inputs = inputs(6);
    let platform = SimulatedPlatform::new(
        space(),
        vec![SimWorker::new("w1", 1.0, 30.0), SimWorker::new("w2", 1.0, 30.0)],
        5,
    )
    .with_truth(truth(&inputs));
    let mut pool = pool(OverlapPolicy::Static { overlap: 1 });
    pool.rules = vec![RuleConfig::StaticReward(StaticReward::new(2, 0.5))];
    let req = ClassificationRequest::new(spec(), pool, inputs);

    let resp = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap();

    let bonuses = platform.bonuses();
    assert_eq!(bonuses.len(), 2);
    assert!(bonuses.iter().all(|b| (b.amount - 0.5).abs() < 1e-12));
    assert_eq!(resp.meta.rewards, 2);
    assert!(resp.workers.iter().all(|w| w.rewarded));
}

#[tokio::test]
async fn restarted_run_reuses_posted_tasks() {
    let inputs = inputs(4);
    let platform = SimulatedPlatform::new(
        space(),
        vec![SimWorker::new("w1", 1.0, 30.0), SimWorker::new("w2", 1.0, 30.0)],
        9,
    )
    .with_truth(truth(&inputs));
    let req = ClassificationRequest::new(spec(), pool(OverlapPolicy::default()), inputs);

    let cancel = AtomicBool::new(true);
    let first = run_classification(
        &platform,
        &req,
        RunHooks {
            cancel_flag: Some(&cancel),
            ..RunHooks::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(first.meta.stop_reason, ClassificationStopReason::Cancelled);
    assert_eq!(first.meta.cycles, 0);
    assert_eq!(first.meta.tasks_posted, 4);
    assert!(first.tasks.iter().all(|t| t.label.is_none()));

    let second = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap();
    assert_eq!(second.meta.tasks_posted, 0);
    assert_eq!(second.meta.tasks_reused, 4);
    assert_eq!(second.meta.stop_reason, ClassificationStopReason::AllResolved);
    assert_eq!(platform.list_tasks("pool-1").await.unwrap().len(), 4);
}

#[tokio::test]
async fn duplicate_inputs_are_posted_once() {
    let mut inputs = inputs(3);
    inputs.push(inputs[0].clone());
    let platform = SimulatedPlatform::new(space(), vec![SimWorker::new("w1", 1.0, 30.0)], 1)
        .with_truth(truth(&inputs));
    let req = ClassificationRequest::new(spec(), pool(OverlapPolicy::default()), inputs);

    let resp = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap();

    assert_eq!(resp.meta.tasks_posted, 3);
    assert_eq!(resp.tasks.len(), 3);
}

#[tokio::test]
async fn transient_outages_are_retried() {
    let inputs = inputs(2);
    let platform = RetryingPlatform::with_config(
        SimulatedPlatform::new(space(), vec![SimWorker::new("w1", 1.0, 30.0)], 2)
            .with_truth(truth(&inputs)),
        RetryConfig {
            max_retries: 2,
            retry_base_delay: Duration::ZERO,
        },
    );
    platform.inner().fail_next(2);
    let req = ClassificationRequest::new(spec(), pool(OverlapPolicy::default()), inputs);

    let resp = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap();
    assert_eq!(resp.meta.stop_reason, ClassificationStopReason::AllResolved);
}

#[tokio::test]
async fn persistent_outage_surfaces_platform_error() {
    let platform = RetryingPlatform::with_config(
        SimulatedPlatform::new(space(), vec![SimWorker::new("w1", 1.0, 30.0)], 2),
        RetryConfig {
            max_retries: 1,
            retry_base_delay: Duration::ZERO,
        },
    );
    platform.inner().fail_next(5);
    let req = ClassificationRequest::new(spec(), pool(OverlapPolicy::default()), inputs(2));

    let err = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap_err();
    match err {
        ClassificationError::Platform(inner) => {
            assert!(matches!(inner, PlatformError::Unavailable(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn invalid_config_fails_before_any_platform_call() {
    let platform = SimulatedPlatform::new(space(), vec![SimWorker::new("w1", 1.0, 30.0)], 2);
    let mut pool = pool(OverlapPolicy::default());
    pool.action_concurrency = 0;
    let req = ClassificationRequest::new(spec(), pool, inputs(2));

    let err = run_classification(&platform, &req, RunHooks::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClassificationError::Config(_)), "{err}");
    assert!(platform.list_tasks("pool-1").await.unwrap().is_empty());
}

struct Oracle;

#[async_trait::async_trait]
impl ModelLabeler for Oracle {
    fn worker_id(&self) -> &str {
        "model"
    }

    async fn label(&self, batch: &[Objects]) -> Result<Vec<Label>, ModelContractError> {
        Ok(batch.iter().map(truth_of).collect())
    }
}

#[tokio::test]
async fn confident_model_votes_resolve_tasks_without_posting() {
    let inputs = inputs(4);
    let platform = SimulatedPlatform::new(space(), vec![SimWorker::new("w1", 1.0, 30.0)], 4);
    let req = ClassificationRequest::new(spec(), pool(OverlapPolicy::default()), inputs.clone());

    let resp = run_classification(
        &platform,
        &req,
        RunHooks {
            model: Some(&Oracle),
            ..RunHooks::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(resp.meta.stop_reason, ClassificationStopReason::AllResolved);
    assert_eq!(resp.meta.tasks_posted, 0);
    assert_eq!(resp.meta.model_votes, 4);
    assert_eq!(resp.meta.cycles, 0);
    for (task, objects) in resp.tasks.iter().zip(&inputs) {
        assert_eq!(task.label.as_ref(), Some(&truth_of(objects)));
        assert_eq!(task.votes[0].worker_id, "model");
    }
}
