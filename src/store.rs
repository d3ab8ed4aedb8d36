//! SQLite persistence for benchmark records and category overrides.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::benchmark::BenchmarkRecord;
use crate::category::CategoryOverride;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("task join error: {0}")]
    Join(String),
    #[error("store closed")]
    Closed,
}

/// Append-only benchmark history plus read-only override configuration.
#[async_trait]
pub trait BenchmarkStore: Send + Sync {
    async fn append(&self, records: &[BenchmarkRecord]) -> Result<usize, StoreError>;

    /// Raw rows recorded at or after `since`, oldest first.
    async fn query(
        &self,
        since: DateTime<Utc>,
        category: Option<&str>,
    ) -> Result<Vec<BenchmarkRecord>, StoreError>;

    async fn load_overrides(&self) -> Result<Vec<CategoryOverride>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteBenchmarkStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    /// One blocking task waits on the connection at a time.
    sem: Arc<Semaphore>,
}

impl SqliteBenchmarkStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;\
             CREATE TABLE IF NOT EXISTS benchmark_records (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               provider_id TEXT NOT NULL,\
               category TEXT NOT NULL,\
               price_error_percent REAL NOT NULL,\
               decision_correct INTEGER NOT NULL,\
               predicted_value REAL NOT NULL DEFAULT 0,\
               actual_value REAL NOT NULL DEFAULT 0,\
               valuation_id TEXT,\
               recorded_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_benchmark_recorded_at ON benchmark_records(recorded_at);\
             CREATE INDEX IF NOT EXISTS idx_benchmark_category ON benchmark_records(category, recorded_at);\
             CREATE TABLE IF NOT EXISTS category_overrides (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               category TEXT NOT NULL,\
               patterns TEXT NOT NULL,\
               priority INTEGER NOT NULL DEFAULT 0\
             );",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("APPRAISER_BENCHMARK_DB") {
            return PathBuf::from(path);
        }
        PathBuf::from(".appraiser_benchmarks.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError>,
    {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Replace the whole override table.
    pub async fn replace_overrides(&self, overrides: &[CategoryOverride]) -> Result<usize, StoreError> {
        let overrides = overrides.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM category_overrides", [])?;
            for o in &overrides {
                let patterns =
                    serde_json::to_string(&o.patterns).map_err(|e| StoreError::Serde(e.to_string()))?;
                tx.execute(
                    "INSERT INTO category_overrides (category, patterns, priority) VALUES (?1, ?2, ?3)",
                    params![o.category, patterns, o.priority],
                )?;
            }
            tx.commit()?;
            Ok(overrides.len())
        })
        .await
    }

    /// Write every benchmark record as one JSON line, newest first.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            let records = select_records(conn, None, None, "DESC")?;
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            for record in &records {
                let line = serde_json::to_string(record).map_err(|e| StoreError::Serde(e.to_string()))?;
                writeln!(file, "{line}")?;
            }
            file.flush()?;
            Ok(records.len())
        })
        .await
    }
}

#[async_trait]
impl BenchmarkStore for SqliteBenchmarkStore {
    async fn append(&self, records: &[BenchmarkRecord]) -> Result<usize, StoreError> {
        let records = records.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO benchmark_records (\
                        provider_id, category, price_error_percent, decision_correct,\
                        predicted_value, actual_value, valuation_id, recorded_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for r in &records {
                    stmt.execute(params![
                        r.provider_id,
                        r.category,
                        r.price_error_percent,
                        if r.decision_correct { 1 } else { 0 },
                        r.predicted_value,
                        r.actual_value,
                        r.valuation_id.map(|id| id.to_string()),
                        r.recorded_at.timestamp_millis(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(records.len())
        })
        .await
    }

    async fn query(
        &self,
        since: DateTime<Utc>,
        category: Option<&str>,
    ) -> Result<Vec<BenchmarkRecord>, StoreError> {
        let category = category.map(str::to_string);
        self.blocking(move |conn| select_records(conn, Some(since), category.as_deref(), "ASC"))
            .await
    }

    async fn load_overrides(&self) -> Result<Vec<CategoryOverride>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT category, patterns, priority FROM category_overrides ORDER BY priority DESC, id ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let patterns: String = row.get(1)?;
                out.push(CategoryOverride {
                    category: row.get(0)?,
                    patterns: serde_json::from_str(&patterns)
                        .map_err(|e| StoreError::Serde(e.to_string()))?,
                    priority: row.get(2)?,
                });
            }
            Ok(out)
        })
        .await
    }
}

fn select_records(
    conn: &Connection,
    since: Option<DateTime<Utc>>,
    category: Option<&str>,
    order: &'static str,
) -> Result<Vec<BenchmarkRecord>, StoreError> {
    let sql = format!(
        "SELECT provider_id, category, price_error_percent, decision_correct, \
                predicted_value, actual_value, valuation_id, recorded_at \
         FROM benchmark_records \
         WHERE recorded_at >= ?1 AND (?2 IS NULL OR category = ?2) \
         ORDER BY recorded_at {order}, id {order}"
    );
    let since_ms = since.map_or(i64::MIN, |s| s.timestamp_millis());
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![since_ms, category])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let valuation_id: Option<String> = row.get(6)?;
        let recorded_ms: i64 = row.get(7)?;
        out.push(BenchmarkRecord {
            provider_id: row.get(0)?,
            category: row.get(1)?,
            price_error_percent: row.get(2)?,
            decision_correct: row.get::<_, i64>(3)? != 0,
            predicted_value: row.get(4)?,
            actual_value: row.get(5)?,
            valuation_id: valuation_id.and_then(|s| Uuid::parse_str(&s).ok()),
            recorded_at: Utc
                .timestamp_millis_opt(recorded_ms)
                .single()
                .unwrap_or_default(),
        });
    }
    Ok(out)
}
