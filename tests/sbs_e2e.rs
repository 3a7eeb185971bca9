use crowd_harness::classification::{ClassificationStopReason, RunHooks};
use crowd_harness::config::PoolConfig;
use crowd_harness::datasource::FieldSpec;
use crowd_harness::objects::{ObjectKind, ObjectValue, Objects};
use crowd_harness::platform::simulated::{SimWorker, SimulatedPlatform};
use crowd_harness::labels::Label;
use crowd_harness::sbs::{
    run_sbs, sbs_label_space, SbsChoice, SbsError, SbsLayout, SbsRequest, SwapTable, CHOICE_A,
    CHOICE_B,
};

fn pair(i: usize) -> Objects {
    Objects::new(vec![
        ObjectValue::audio(format!("baseline-{i}.wav")),
        ObjectValue::audio(format!("candidate-{i}.wav")),
    ])
}

fn request(inputs: Vec<Objects>) -> SbsRequest {
    let mut pool = PoolConfig::new("sbs-pool");
    pool.poll_interval_ms = 0;
    pool.max_idle_cycles = 3;
    SbsRequest {
        fields: vec![
            FieldSpec::new("left", ObjectKind::Audio),
            FieldSpec::new("right", ObjectKind::Audio),
        ],
        pool,
        inputs,
        controls: Vec::new(),
        layout: SbsLayout::default(),
        seed: 42,
        weights: Default::default(),
    }
}

#[tokio::test]
async fn swapping_cancels_pure_position_bias() {
    let inputs: Vec<Objects> = (0..40).map(pair).collect();
    let space = sbs_label_space().unwrap();
    assert_eq!(space.labels()[0].as_str(), CHOICE_A);

    // Workers who always pick whatever is shown first.
    let workers = (0..4)
        .map(|i| SimWorker::new(format!("w{i}"), 0.5, 30.0).with_position_bias(1.0))
        .collect();
    let platform = SimulatedPlatform::new(space, workers, 17);
    let req = request(inputs);

    let resp = run_sbs(&platform, &req, RunHooks::default()).await.unwrap();

    assert_eq!(resp.tasks.len(), 40);
    let swapped = resp.tasks.iter().filter(|t| t.swapped).count();
    assert!(swapped > 0 && swapped < 40, "swapped {swapped} of 40");
    for task in &resp.tasks {
        let expected = if task.swapped { SbsChoice::B } else { SbsChoice::A };
        assert_eq!(task.winner, Some(expected), "task {}", task.task_id);
        assert!((task.p_a + task.p_b - 1.0).abs() < 1e-9);
    }
    let unswapped_share = (40 - swapped) as f64 / 40.0;
    assert!((resp.a_win_rate() - unswapped_share).abs() < 1e-12);
}

fn audio_pair(left: &str, right: &str) -> Objects {
    Objects::new(vec![ObjectValue::audio(left), ObjectValue::audio(right)])
}

/// Workers prefer the lexically smaller clip, wherever it is shown.
fn prefers_smaller(objects: &Objects) -> Option<Label> {
    match (objects.get(0), objects.get(1)) {
        (Some(ObjectValue::Audio(a)), Some(ObjectValue::Audio(b))) => {
            Some(Label::new(if a <= b { CHOICE_A } else { CHOICE_B }))
        }
        _ => None,
    }
}

#[tokio::test]
async fn mirrored_pairs_each_collect_their_own_votes() {
    let inputs: Vec<Objects> = (0..16)
        .flat_map(|i| {
            let (x, y) = (format!("x{i:02}.wav"), format!("y{i:02}.wav"));
            [audio_pair(&x, &y), audio_pair(&y, &x)]
        })
        .collect();
    let plain = SwapTable::assign(&inputs, 42);
    assert!(inputs
        .chunks(2)
        .any(|m| plain.is_swapped(&m[0].task_id()) != plain.is_swapped(&m[1].task_id())));

    let workers = (0..4)
        .map(|i| SimWorker::new(format!("w{i}"), 1.0, 30.0))
        .collect();
    let platform =
        SimulatedPlatform::new(sbs_label_space().unwrap(), workers, 5).with_oracle(prefers_smaller);
    let resp = run_sbs(&platform, &request(inputs.clone()), RunHooks::default())
        .await
        .unwrap();

    assert_eq!(
        resp.classification.meta.stop_reason,
        ClassificationStopReason::AllResolved
    );
    assert_eq!(resp.classification.meta.tasks_posted, 32);
    for (task, mirror) in resp.tasks.chunks(2).map(|m| (&m[0], &m[1])) {
        assert_eq!(task.swapped, mirror.swapped);
        assert!(task.overlap > 0 && mirror.overlap > 0);
        assert_eq!(task.winner, Some(SbsChoice::A), "task {}", task.task_id);
        assert_eq!(mirror.winner, Some(SbsChoice::B), "task {}", mirror.task_id);
    }
}

#[tokio::test]
async fn results_are_reported_in_canonical_positions() {
    let inputs: Vec<Objects> = (0..10).map(pair).collect();
    let platform = SimulatedPlatform::new(
        sbs_label_space().unwrap(),
        vec![SimWorker::new("w1", 1.0, 30.0)],
        1,
    );
    let req = request(inputs.clone());

    let resp = run_sbs(&platform, &req, RunHooks::default()).await.unwrap();

    for (task, objects) in resp.tasks.iter().zip(&inputs) {
        assert_eq!(&task.objects, objects);
        assert_eq!(task.task_id, objects.task_id());
    }
}

#[tokio::test]
async fn layout_must_name_two_distinct_fields() {
    let platform = SimulatedPlatform::new(sbs_label_space().unwrap(), Vec::new(), 1);
    let mut req = request(vec![pair(0)]);
    req.layout = SbsLayout {
        a_index: 1,
        b_index: 1,
    };

    let err = run_sbs(&platform, &req, RunHooks::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SbsError::InvalidRequest(_)), "{err}");
}
