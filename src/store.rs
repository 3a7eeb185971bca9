//! SQLite-backed store for aggregated task results.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::classification::TaskResult;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// One persisted row, as returned by [`SqliteResultStore::get`] and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub pool_id: String,
    pub task_id: String,
    pub label: Option<String>,
    pub confidence: f64,
    pub overlap: usize,
    pub resolved: bool,
    /// Full [`TaskResult`] as JSON.
    pub result: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

#[derive(Clone)]
pub struct SqliteResultStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResultStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=NORMAL; \
             CREATE TABLE IF NOT EXISTS task_results ( \
               pool_id TEXT NOT NULL, \
               task_id TEXT NOT NULL, \
               label TEXT, \
               confidence REAL NOT NULL, \
               overlap INTEGER NOT NULL, \
               resolved INTEGER NOT NULL, \
               result_json TEXT NOT NULL, \
               created_at INTEGER NOT NULL, \
               updated_at INTEGER NOT NULL, \
               PRIMARY KEY (pool_id, task_id) \
             );",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("CROWD_RESULTS_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".crowd_results.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        StoreLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    /// Insert or replace results for a pool; `created_at` survives updates.
    pub async fn upsert(&self, pool_id: &str, results: &[TaskResult]) -> Result<usize, StoreError> {
        let mut rows = Vec::with_capacity(results.len());
        for r in results {
            let json = serde_json::to_string(r).map_err(|e| StoreError::Serde(e.to_string()))?;
            rows.push((
                r.task_id.as_str().to_string(),
                r.label.as_ref().map(|l| l.as_str().to_string()),
                r.confidence,
                r.overlap as i64,
                r.status.is_resolved(),
                json,
            ));
        }
        let pool_id = pool_id.to_string();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = chrono::Utc::now().timestamp();
                let tx = conn.unchecked_transaction()?;
                for (task_id, label, confidence, overlap, resolved, json) in &rows {
                    tx.execute(
                        "INSERT INTO task_results ( \
                            pool_id, task_id, label, confidence, overlap, resolved, result_json, \
                            created_at, updated_at \
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                         ON CONFLICT(pool_id, task_id) DO UPDATE SET \
                            label = excluded.label, \
                            confidence = excluded.confidence, \
                            overlap = excluded.overlap, \
                            resolved = excluded.resolved, \
                            result_json = excluded.result_json, \
                            updated_at = excluded.updated_at",
                        params![
                            pool_id,
                            task_id,
                            label,
                            confidence,
                            overlap,
                            if *resolved { 1 } else { 0 },
                            json,
                            now,
                            now,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(rows.len())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn get(&self, pool_id: &str, task_id: &str) -> Result<Option<StoredResult>, StoreError> {
        let pool_id = pool_id.to_string();
        let task_id = task_id.to_string();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE pool_id = ?1 AND task_id = ?2"
                ))?;
                let mut rows = stmt.query(params![pool_id, task_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(read_row(row)?)),
                    None => Ok(None),
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM task_results", [], |row| row.get(0))?;
                Ok(n.max(0) as usize)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Write every row (optionally one pool) as JSONL, newest first.
    pub async fn export_jsonl(
        &self,
        path: impl AsRef<Path>,
        pool_id: Option<&str>,
    ) -> Result<usize, StoreError> {
        let path = path.as_ref().to_path_buf();
        let pool_id = pool_id.map(str::to_string);
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE (?1 IS NULL OR pool_id = ?1) \
                     ORDER BY updated_at DESC, pool_id, task_id"
                ))?;
                let mut rows = stmt.query(params![pool_id])?;
                let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
                let mut written = 0;
                while let Some(row) = rows.next()? {
                    let record = read_row(row)?;
                    let line = serde_json::to_string(&record)
                        .map_err(|e| StoreError::Serde(e.to_string()))?;
                    writeln!(file, "{line}")?;
                    written += 1;
                }
                file.flush()?;
                Ok(written)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<PruneStats, StoreError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if let Some(days) = max_age_days {
                    let cutoff = chrono::Utc::now()
                        .timestamp()
                        .saturating_sub((days as i64).saturating_mul(86_400));
                    deleted += conn.execute(
                        "DELETE FROM task_results WHERE updated_at < ?1",
                        params![cutoff],
                    )?;
                }
                if let Some(max_rows) = max_rows {
                    deleted += conn.execute(
                        "DELETE FROM task_results WHERE rowid IN ( \
                            SELECT rowid FROM task_results \
                            ORDER BY updated_at DESC, rowid DESC LIMIT -1 OFFSET ?1 \
                         )",
                        params![max_rows as i64],
                    )?;
                }
                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM task_results", [], |row| row.get(0))?;
                Ok(PruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

const SELECT_COLUMNS: &str = "SELECT pool_id, task_id, label, confidence, overlap, resolved, \
     result_json, created_at, updated_at FROM task_results";

fn read_row(row: &rusqlite::Row<'_>) -> Result<StoredResult, StoreError> {
    let json: String = row.get(6)?;
    Ok(StoredResult {
        pool_id: row.get(0)?,
        task_id: row.get(1)?,
        label: row.get(2)?,
        confidence: row.get(3)?,
        overlap: row.get::<_, i64>(4)?.max(0) as usize,
        resolved: row.get::<_, i64>(5)? != 0,
        result: serde_json::from_str(&json).map_err(|e| StoreError::Serde(e.to_string()))?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Advisory exclusive lock on `<db>.lock`, held until dropped.
#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    fn new(db_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}
