//! Side-by-side comparison with position-bias correction.
//!
//! Each task shows two options, A and B. A seeded, per-task swap flag decides
//! whether the options are exchanged on screen; answers are decoded back into
//! canonical positions before aggregation.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::aggregation::WorkerWeights;
use crate::classification::{
    run_classification, ClassificationError, ClassificationRequest, ClassificationResponse,
    ControlObject, RunHooks, TaskPresenter,
};
use crate::config::PoolConfig;
use crate::datasource::{FieldSpec, TaskSpec};
use crate::labels::{Label, LabelError, LabelSpace};
use crate::objects::{Objects, TaskId};
use crate::overlap::TaskStatus;
use crate::platform::Platform;

pub const CHOICE_A: &str = "a";
pub const CHOICE_B: &str = "b";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SbsChoice {
    A,
    B,
}

impl SbsChoice {
    pub fn label(self) -> Label {
        match self {
            SbsChoice::A => Label::new(CHOICE_A),
            SbsChoice::B => Label::new(CHOICE_B),
        }
    }

    pub fn from_label(label: &Label) -> Option<Self> {
        match label.as_str() {
            CHOICE_A => Some(SbsChoice::A),
            CHOICE_B => Some(SbsChoice::B),
            _ => None,
        }
    }

    pub fn flip(self) -> Self {
        match self {
            SbsChoice::A => SbsChoice::B,
            SbsChoice::B => SbsChoice::A,
        }
    }
}

pub fn sbs_label_space() -> Result<LabelSpace, LabelError> {
    LabelSpace::new([CHOICE_A, CHOICE_B])
}

/// Positions of options A and B inside the objects tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbsLayout {
    pub a_index: usize,
    pub b_index: usize,
}

impl Default for SbsLayout {
    fn default() -> Self {
        Self {
            a_index: 0,
            b_index: 1,
        }
    }
}

/// Objects as shown to the worker.
pub fn present(objects: &Objects, layout: SbsLayout, swap: bool) -> Objects {
    if swap {
        objects.with_swapped(layout.a_index, layout.b_index)
    } else {
        objects.clone()
    }
}

/// Canonical choice for an answer given on presented objects.
pub fn interpret(choice: SbsChoice, swap: bool) -> SbsChoice {
    if swap {
        choice.flip()
    } else {
        choice
    }
}

/// Per-task swap flags, fixed for the life of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapTable {
    swaps: HashMap<TaskId, bool>,
}

impl SwapTable {
    /// Draw one independent coin per distinct task. The flag depends only on
    /// `seed` and the task id, so input order and restarts do not change it.
    pub fn assign(tasks: &[Objects], seed: u64) -> Self {
        let mut swaps = HashMap::with_capacity(tasks.len());
        for objects in tasks {
            let task_id = objects.task_id();
            if swaps.contains_key(&task_id) {
                continue;
            }
            let digest = blake3::hash(task_id.as_str().as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest.as_bytes()[..8]);
            let mut rng = StdRng::seed_from_u64(seed ^ u64::from_le_bytes(bytes));
            swaps.insert(task_id, rng.gen_bool(0.5));
        }
        Self { swaps }
    }

    /// Like [`SwapTable::assign`], but a task and its mirror (A and B
    /// exchanged) share one flag, taken from whichever has the smaller id.
    /// Differing flags would show both tasks to workers as the same objects.
    pub fn assign_for_layout(tasks: &[Objects], seed: u64, layout: SbsLayout) -> Self {
        let mut table = Self::assign(tasks, seed);
        for objects in tasks {
            let task_id = objects.task_id();
            let mirror_id = objects
                .with_swapped(layout.a_index, layout.b_index)
                .task_id();
            if mirror_id >= task_id {
                continue;
            }
            if let Some(&flag) = table.swaps.get(&mirror_id) {
                table.swaps.insert(task_id, flag);
            }
        }
        table
    }

    pub fn is_swapped(&self, task_id: &TaskId) -> bool {
        self.swaps.get(task_id).copied().unwrap_or(false)
    }

    pub fn swapped_count(&self) -> usize {
        self.swaps.values().filter(|s| **s).count()
    }

    pub fn len(&self) -> usize {
        self.swaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swaps.is_empty()
    }
}

pub struct SbsPresenter {
    table: SwapTable,
    layout: SbsLayout,
}

impl SbsPresenter {
    pub fn new(table: SwapTable, layout: SbsLayout) -> Self {
        Self { table, layout }
    }

    pub fn table(&self) -> &SwapTable {
        &self.table
    }

    fn translate(&self, canonical: &Objects, label: &Label) -> Label {
        let swap = self.table.is_swapped(&canonical.task_id());
        match SbsChoice::from_label(label) {
            Some(choice) => interpret(choice, swap).label(),
            None => label.clone(),
        }
    }
}

impl TaskPresenter for SbsPresenter {
    fn present(&self, canonical: &Objects) -> Objects {
        present(
            canonical,
            self.layout,
            self.table.is_swapped(&canonical.task_id()),
        )
    }

    fn present_label(&self, canonical: &Objects, label: &Label) -> Label {
        self.translate(canonical, label)
    }

    fn interpret(&self, canonical: &Objects, label: &Label) -> Label {
        self.translate(canonical, label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SbsError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Labels(#[from] LabelError),
    #[error(transparent)]
    Classification(#[from] ClassificationError),
}

fn default_seed() -> u64 {
    42
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbsRequest {
    pub fields: Vec<FieldSpec>,
    pub pool: PoolConfig,
    pub inputs: Vec<Objects>,
    /// Goldens are given in canonical positions.
    #[serde(default)]
    pub controls: Vec<ControlObject>,
    #[serde(default)]
    pub layout: SbsLayout,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub weights: WorkerWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbsTaskResult {
    pub task_id: TaskId,
    pub objects: Objects,
    pub swapped: bool,
    pub p_a: f64,
    pub p_b: f64,
    pub winner: Option<SbsChoice>,
    pub overlap: usize,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbsResponse {
    pub tasks: Vec<SbsTaskResult>,
    pub classification: ClassificationResponse,
}

impl SbsResponse {
    /// Share of tasks whose canonical winner is A.
    pub fn a_win_rate(&self) -> f64 {
        let decided: Vec<SbsChoice> = self.tasks.iter().filter_map(|t| t.winner).collect();
        if decided.is_empty() {
            return 0.0;
        }
        decided.iter().filter(|c| **c == SbsChoice::A).count() as f64 / decided.len() as f64
    }
}

pub fn validate_sbs_request(req: &SbsRequest) -> Result<(), SbsError> {
    let n = req.fields.len();
    let SbsLayout { a_index, b_index } = req.layout;
    if a_index == b_index || a_index >= n || b_index >= n {
        return Err(SbsError::InvalidRequest(format!(
            "layout positions ({a_index}, {b_index}) must be distinct and below {n}"
        )));
    }
    Ok(())
}

/// Run a side-by-side pool; results are reported in canonical positions.
pub async fn run_sbs(
    platform: &dyn Platform,
    req: &SbsRequest,
    hooks: RunHooks<'_>,
) -> Result<SbsResponse, SbsError> {
    validate_sbs_request(req)?;

    let mut all: Vec<Objects> = req.inputs.clone();
    all.extend(req.controls.iter().map(|c| c.objects.clone()));
    let presenter = SbsPresenter::new(
        SwapTable::assign_for_layout(&all, req.seed, req.layout),
        req.layout,
    );
    tracing::info!(
        pool_id = %req.pool.pool_id,
        tasks = presenter.table().len(),
        swapped = presenter.table().swapped_count(),
        "Swap table assigned"
    );

    let classification_req = ClassificationRequest {
        spec: TaskSpec::new(req.fields.clone(), sbs_label_space()?),
        pool: req.pool.clone(),
        inputs: req.inputs.clone(),
        controls: req.controls.clone(),
        weights: req.weights.clone(),
    };
    let hooks = RunHooks {
        presenter: Some(&presenter),
        ..hooks
    };
    let classification = run_classification(platform, &classification_req, hooks).await?;

    let a = SbsChoice::A.label();
    let b = SbsChoice::B.label();
    let tasks = classification
        .tasks
        .iter()
        .map(|t| {
            let p = |label: &Label| {
                t.distribution
                    .iter()
                    .find(|(l, _)| l == label)
                    .map(|(_, p)| *p)
                    .unwrap_or(0.0)
            };
            SbsTaskResult {
                task_id: t.task_id.clone(),
                objects: t.objects.clone(),
                swapped: presenter.table().is_swapped(&t.task_id),
                p_a: p(&a),
                p_b: p(&b),
                winner: t.label.as_ref().and_then(SbsChoice::from_label),
                overlap: t.overlap,
                status: t.status,
            }
        })
        .collect();

    Ok(SbsResponse {
        tasks,
        classification,
    })
}
