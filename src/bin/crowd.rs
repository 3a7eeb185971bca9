#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crowd_harness::classification::{
    run_classification, ClassificationRequest, ControlObject, CycleTraceSink, JsonlCycleLog,
    RunHooks,
};
use crowd_harness::config::{Advisory, PoolConfig};
use crowd_harness::datasource::{read_rows, TaskSpec};
use crowd_harness::labels::Label;
use crowd_harness::mos::{evaluate_mos, MosConfig};
use crowd_harness::objects::{Objects, TaskId};
use crowd_harness::platform::{
    AssignmentSolutions, RetryingPlatform, SimWorker, SimulatedPlatform,
};
use crowd_harness::store::SqliteResultStore;

#[derive(Parser)]
#[command(name = "crowd", version, about = "Crowd annotation harness CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a classification pool against simulated workers
    Simulate {
        /// Task spec JSON (input fields and label space)
        #[arg(long)]
        spec: PathBuf,
        /// Pool config JSON
        #[arg(long)]
        pool: PathBuf,
        /// JSONL rows; labelled rows drive the simulated workers' answers
        #[arg(long)]
        data: PathBuf,
        /// JSONL control rows, each with a golden label
        #[arg(long)]
        controls: Option<PathBuf>,
        /// JSON array of simulated workers; overrides --workers/--accuracy/--secs-per-task
        #[arg(long)]
        workers_file: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        workers: usize,
        #[arg(long, default_value_t = 0.85)]
        accuracy: f64,
        #[arg(long, default_value_t = 30.0)]
        secs_per_task: f64,
        #[arg(long, default_value_t = 1)]
        tasks_per_assignment: usize,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Poll interval override; the simulated pool advances one round per poll
        #[arg(long, default_value_t = 0)]
        poll_ms: u64,
        /// Write the classification response JSON here
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write per-cycle JSONL trace records here
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Persist task results into this SQLite store
        #[arg(long)]
        store: Option<PathBuf>,
        /// Proceed past volume advisories without asking
        #[arg(long)]
        yes: bool,
    },
    /// Estimate MOS from rating assignments
    Mos {
        /// JSON array of assignments with their solutions
        #[arg(long)]
        assignments: PathBuf,
        /// MOS config JSON
        #[arg(long)]
        config: Option<PathBuf>,
        /// JSON array of {"objects": [...], "group": "..."} entries
        #[arg(long)]
        metadata: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate a pool config (and optionally a data file) without running
    Validate {
        #[arg(long)]
        pool: PathBuf,
        #[arg(long, requires = "data")]
        spec: Option<PathBuf>,
        #[arg(long, requires = "spec")]
        data: Option<PathBuf>,
    },
    /// Export the result store to JSONL
    ResultsExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        pool_id: Option<String>,
    },
    /// Prune the result store (by age and/or size)
    ResultsPrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[derive(serde::Deserialize)]
struct GroupEntry {
    objects: Objects,
    group: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            spec,
            pool,
            data,
            controls,
            workers_file,
            workers,
            accuracy,
            secs_per_task,
            tasks_per_assignment,
            seed,
            poll_ms,
            out,
            trace,
            store,
            yes,
        } => {
            let spec: TaskSpec = read_json(&spec)?;
            let mut pool = PoolConfig::from_json_file(&pool)?;
            pool.poll_interval_ms = poll_ms;

            let rows = read_rows(&spec, &data)?;
            let controls = match controls {
                Some(path) => read_controls(&spec, &path)?,
                None => Vec::new(),
            };
            let truth: HashMap<TaskId, Label> = rows
                .iter()
                .filter_map(|r| r.label.clone().map(|l| (r.objects.task_id(), l)))
                .chain(
                    controls
                        .iter()
                        .map(|c| (c.objects.task_id(), c.golden.clone())),
                )
                .collect();
            let inputs: Vec<Objects> = rows.into_iter().map(|r| r.objects).collect();

            if !confirm_advisories(&pool.advisories(inputs.len()), yes)? {
                return Err("aborted at volume advisory".into());
            }

            let sim_workers: Vec<SimWorker> = match workers_file {
                Some(path) => read_json(&path)?,
                None => (1..=workers)
                    .map(|i| SimWorker::new(format!("w{i}"), accuracy, secs_per_task))
                    .collect(),
            };
            let platform = RetryingPlatform::new(
                SimulatedPlatform::new(spec.labels.clone(), sim_workers, seed)
                    .with_truth(truth)
                    .with_tasks_per_assignment(tasks_per_assignment),
            );

            let mut req = ClassificationRequest::new(spec, pool, inputs);
            req.controls = controls;

            let cycle_log = trace.map(JsonlCycleLog::create).transpose()?;
            let hooks = RunHooks {
                trace: cycle_log.as_ref().map(|log| log as &dyn CycleTraceSink),
                ..RunHooks::default()
            };
            let resp = run_classification(&platform, &req, hooks).await?;

            if let Some(db) = store {
                let store = SqliteResultStore::new(db)?;
                let _lock = store.lock_exclusive()?;
                let written = store.upsert(&resp.meta.pool_id, &resp.tasks).await?;
                eprintln!("stored {written} task results in {}", store.path().display());
            }

            let resolved = resp.tasks.iter().filter(|t| t.status.is_resolved()).count();
            println!(
                "pool {}: {resolved}/{} tasks resolved after {} cycles ({:?}); {} accepted, {} rejected, {} blocks",
                resp.meta.pool_id,
                resp.tasks.len(),
                resp.meta.cycles,
                resp.meta.stop_reason,
                resp.meta.accepted,
                resp.meta.rejected,
                resp.meta.blocks,
            );
            if let Some(out) = out {
                write_json(&out, &resp)?;
            }
        }
        Commands::Mos {
            assignments,
            config,
            metadata,
            out,
        } => {
            let assignments: Vec<AssignmentSolutions> = read_json(&assignments)?;
            let config = match config {
                Some(path) => read_json(&path)?,
                None => MosConfig::default(),
            };
            let metadata = match metadata {
                Some(path) => {
                    let entries: Vec<GroupEntry> = read_json(&path)?;
                    Some(
                        entries
                            .into_iter()
                            .map(|e| (e.objects.task_id(), e.group))
                            .collect::<HashMap<_, _>>(),
                    )
                }
                None => None,
            };
            let report = evaluate_mos(&assignments, metadata.as_ref(), &config)?;
            for (group, ci) in &report.groups {
                println!("{group}: {:.3} ± {:.3} (n={})", ci.mean, ci.ci, ci.n);
            }
            println!(
                "overall: {:.3} ± {:.3} (n={}); {} workers rejected",
                report.overall.mean,
                report.overall.ci,
                report.overall.n,
                report.rejected.len()
            );
            if let Some(out) = out {
                write_json(&out, &report)?;
            }
        }
        Commands::Validate { pool, spec, data } => {
            let pool = PoolConfig::from_json_file(&pool)?;
            if let (Some(spec), Some(data)) = (spec, data) {
                let spec: TaskSpec = read_json(&spec)?;
                let rows = read_rows(&spec, &data)?;
                let labelled = rows.iter().filter(|r| r.label.is_some()).count();
                println!("{} rows ({labelled} labelled) match {}", rows.len(), spec.schema());
                for advisory in pool.advisories(rows.len()) {
                    println!("advisory: {advisory}");
                }
            }
            println!("pool {} is valid", pool.pool_id);
        }
        Commands::ResultsExport { db, out, pool_id } => {
            let path = db.unwrap_or_else(SqliteResultStore::default_path);
            let store = SqliteResultStore::new(path)?;
            let written = store.export_jsonl(out, pool_id.as_deref()).await?;
            println!("exported {written} rows");
        }
        Commands::ResultsPrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("results-prune requires --max-age-days and/or --max-rows".into());
            }
            let path = db.unwrap_or_else(SqliteResultStore::default_path);
            let store = SqliteResultStore::new(path)?;
            let _lock = store.lock_exclusive()?;
            let stats = store.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}

fn read_controls(
    spec: &TaskSpec,
    path: &PathBuf,
) -> Result<Vec<ControlObject>, Box<dyn std::error::Error>> {
    let mut controls = Vec::new();
    for (idx, row) in read_rows(spec, path)?.into_iter().enumerate() {
        let golden = row
            .label
            .ok_or_else(|| format!("control row {} has no '{}' field", idx + 1, spec.label_field))?;
        controls.push(ControlObject {
            objects: row.objects,
            golden,
        });
    }
    Ok(controls)
}

/// Returns whether to proceed. Non-interactive runs proceed after logging.
fn confirm_advisories(advisories: &[Advisory], yes: bool) -> Result<bool, io::Error> {
    if advisories.is_empty() {
        return Ok(true);
    }
    for advisory in advisories {
        eprintln!("warning: {advisory}");
    }
    if yes || !io::stdin().is_terminal() {
        return Ok(true);
    }
    eprint!("proceed anyway? [y/N] ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &PathBuf,
) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
