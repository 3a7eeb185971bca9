//! Per-cycle log of a classification run.
//!
//! One JSON line per finished cycle. Each line is flushed when written, so a
//! killed run keeps every completed cycle and a resumed run can append to the
//! same file.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleTrace {
    pub timestamp_ms: i64,
    pub pool_id: String,
    pub cycle: usize,
    pub assignments_total: usize,
    pub new_assignments: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub blocked: usize,
    pub rewarded: usize,
    pub overlap_raised: usize,
    pub resolved: usize,
    pub collecting: usize,
    /// Short ids of tasks that resolved during this cycle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub newly_resolved: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{path}:{line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("cycle log lock poisoned")]
    Poisoned,
}

pub trait CycleTraceSink: Send + Sync {
    fn record(&self, event: &CycleTrace) -> Result<(), TraceError>;
}

pub struct JsonlCycleLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlCycleLog {
    /// Start a fresh log, truncating any existing file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let file = File::create(path.as_ref())?;
        Ok(Self::from_file(path.as_ref(), file))
    }

    /// Continue an existing log, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::from_file(path.as_ref(), file))
    }

    fn from_file(path: &Path, file: File) -> Self {
        Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CycleTraceSink for JsonlCycleLog {
    fn record(&self, event: &CycleTrace) -> Result<(), TraceError> {
        let mut writer = self.writer.lock().map_err(|_| TraceError::Poisoned)?;
        serde_json::to_writer(&mut *writer, event)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Keeps cycles in memory.
#[derive(Debug, Default)]
pub struct MemoryCycleLog {
    records: Mutex<Vec<CycleTrace>>,
}

impl MemoryCycleLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CycleTrace> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CycleTraceSink for MemoryCycleLog {
    fn record(&self, event: &CycleTrace) -> Result<(), TraceError> {
        self.records
            .lock()
            .map_err(|_| TraceError::Poisoned)?
            .push(event.clone());
        Ok(())
    }
}

/// Read a cycle log back; blank lines are skipped.
pub fn read_cycle_log(path: impl AsRef<Path>) -> Result<Vec<CycleTrace>, TraceError> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|source| TraceError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        out.push(event);
    }
    Ok(out)
}

pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
