#![forbid(unsafe_code)]

//! # crowd-harness
//!
//! Turn noisy crowd answers into labels you can trust.
//!
//! Tasks (tuples of text, audio or image objects) are posted to a crowd pool
//! with a small initial overlap. Each cycle the harness pulls submitted
//! assignments, applies worker control rules (speed, control-task accuracy,
//! rewards), aggregates the accepted votes by majority or max-likelihood and
//! raises overlap only where confidence is still short of the target.
//!
//! Two evaluation strategies sit on top of the loop: side-by-side comparison
//! with seeded position swapping, and MOS estimation with worker-level outlier
//! rejection and Student-t confidence intervals.

pub mod aggregation;
pub mod classification;
pub mod config;
pub mod control;
pub mod datasource;
pub mod labels;
pub mod model;
pub mod mos;
pub mod objects;
pub mod overlap;
pub mod platform;
pub mod sbs;
pub mod store;

pub use aggregation::{
    aggregate, most_probable, AggregationAlgorithm, AggregationResult, Vote, WorkerWeights,
};
pub use classification::{
    run_classification, ClassificationError, ClassificationRequest, ClassificationResponse,
    ClassificationStopReason, ControlObject, CycleTrace, CycleTraceSink, JsonlCycleLog,
    MemoryCycleLog, RunHooks, TaskResult,
};
pub use config::{Advisory, ConfigError, PoolConfig};
pub use labels::{Label, LabelSpace};
pub use mos::{evaluate_mos, MosConfig, MosReport};
pub use objects::{ObjectKind, ObjectValue, Objects, TaskId};
pub use overlap::{OverlapController, OverlapPolicy, TaskStatus};
pub use platform::{Platform, PlatformError, RetryingPlatform, SimulatedPlatform};
pub use sbs::{run_sbs, SbsRequest, SbsResponse};
pub use store::SqliteResultStore;
