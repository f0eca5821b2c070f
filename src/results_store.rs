//! SQLite store for evaluation runs.
//!
//! Scores are written as REALs exactly as computed; display rounding never
//! reaches this layer.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::info;

use crate::model::{BatchResult, RunMetadata};

const RESULTS_SCHEMA_VERSION: &str = "1";
const RUN_COLUMNS: &str = "run_id, started_at, finished_at, k, scoring_method, query_filter, \
    search_database, search_collection, search_index, pipeline_path, pipeline_sha256, \
    mean_ndcg, evaluated, skipped, failed";

/// Destination for the results of a completed batch.
pub trait ResultSink {
    fn persist(&mut self, run: &RunMetadata, batch: &BatchResult) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRun {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub k: usize,
    pub scoring_method: String,
    pub query_filter: String,
    pub search_database: String,
    pub search_collection: String,
    pub search_index: String,
    pub pipeline_path: String,
    pub pipeline_sha256: String,
    /// `None` when the run evaluated no queries.
    pub mean_ndcg: Option<f64>,
    pub evaluated: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredQueryResult {
    pub position: usize,
    pub query_id: String,
    pub k: usize,
    pub scoring_method: String,
    pub dcg: f64,
    pub idcg: f64,
    pub ndcg: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFailure {
    pub query_id: String,
    pub reason: String,
}

pub struct SqliteResultStore {
    connection: Connection,
}

impl SqliteResultStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }

        let connection = Connection::open(path)
            .with_context(|| format!("failed to open results store: {}", path.display()))?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to set journal_mode=WAL")?;
        connection
            .pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous=NORMAL")?;

        Self::with_connection(connection)
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("failed to open results store read-only: {}", path.display()))?;
        Ok(Self { connection })
    }

    pub fn with_connection(connection: Connection) -> Result<Self> {
        ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<StoredRun>> {
        let mut statement = self.connection.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, run_id DESC LIMIT ?1"
        ))?;

        let mut rows = statement.query(params![limit as i64])?;
        let mut runs = Vec::<StoredRun>::new();
        while let Some(row) = rows.next()? {
            runs.push(stored_run(row)?);
        }

        Ok(runs)
    }

    pub fn find_run(&self, run_id: &str) -> Result<Option<StoredRun>> {
        let run = self
            .connection
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                stored_run,
            )
            .optional()
            .with_context(|| format!("failed to look up run {run_id}"))?;
        Ok(run)
    }

    pub fn query_results(&self, run_id: &str) -> Result<Vec<StoredQueryResult>> {
        let mut statement = self.connection.prepare(
            "
            SELECT position, query_id, k, scoring_method, dcg, idcg, ndcg
            FROM query_results
            WHERE run_id = ?1
            ORDER BY position ASC
            ",
        )?;

        let mut rows = statement.query(params![run_id])?;
        let mut out = Vec::<StoredQueryResult>::new();
        while let Some(row) = rows.next()? {
            out.push(StoredQueryResult {
                position: row.get::<_, i64>(0)? as usize,
                query_id: row.get(1)?,
                k: row.get::<_, i64>(2)? as usize,
                scoring_method: row.get(3)?,
                dcg: row.get(4)?,
                idcg: row.get(5)?,
                ndcg: row.get(6)?,
            });
        }

        Ok(out)
    }

    pub fn query_failures(&self, run_id: &str) -> Result<Vec<StoredFailure>> {
        let mut statement = self.connection.prepare(
            "
            SELECT query_id, reason
            FROM query_failures
            WHERE run_id = ?1
            ORDER BY failure_seq ASC
            ",
        )?;

        let mut rows = statement.query(params![run_id])?;
        let mut out = Vec::<StoredFailure>::new();
        while let Some(row) = rows.next()? {
            out.push(StoredFailure {
                query_id: row.get(0)?,
                reason: row.get(1)?,
            });
        }

        Ok(out)
    }
}

impl ResultSink for SqliteResultStore {
    fn persist(&mut self, run: &RunMetadata, batch: &BatchResult) -> Result<()> {
        let tx = self
            .connection
            .transaction()
            .context("failed to start results transaction")?;

        let mean_ndcg = batch.has_successes().then_some(batch.mean_ndcg);
        tx.execute(
            "
            INSERT INTO runs(
              run_id, started_at, finished_at, k, scoring_method, query_filter,
              search_database, search_collection, search_index, pipeline_path,
              pipeline_sha256, mean_ndcg, evaluated, skipped, failed
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ",
            params![
                run.run_id,
                run.started_at,
                run.finished_at,
                run.k as i64,
                run.scoring_method.as_str(),
                run.query_filter,
                run.search_database,
                run.search_collection,
                run.search_index,
                run.pipeline_path,
                run.pipeline_sha256,
                mean_ndcg,
                batch.evaluated as i64,
                batch.skipped as i64,
                batch.failures.len() as i64,
            ],
        )
        .with_context(|| format!("failed to insert run {}", run.run_id))?;

        {
            let mut insert_result = tx.prepare(
                "
                INSERT INTO query_results(run_id, position, query_id, k, scoring_method, dcg, idcg, ndcg)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )?;
            for (position, result) in batch.per_query.iter().enumerate() {
                insert_result.execute(params![
                    run.run_id,
                    position as i64,
                    result.query_id,
                    result.k as i64,
                    result.scoring_method.as_str(),
                    result.dcg,
                    result.idcg,
                    result.ndcg,
                ])?;
            }

            let mut insert_failure = tx.prepare(
                "
                INSERT INTO query_failures(run_id, failure_seq, query_id, reason)
                VALUES(?1, ?2, ?3, ?4)
                ",
            )?;
            for (seq, failure) in batch.failures.iter().enumerate() {
                insert_failure.execute(params![run.run_id, seq as i64, failure.query_id, failure.reason])?;
            }
        }

        tx.commit().context("failed to commit results transaction")?;
        info!(
            run_id = %run.run_id,
            results = batch.per_query.len(),
            failures = batch.failures.len(),
            "persisted evaluation run"
        );
        Ok(())
    }
}

fn stored_run(row: &Row<'_>) -> rusqlite::Result<StoredRun> {
    Ok(StoredRun {
        run_id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        k: row.get::<_, i64>(3)? as usize,
        scoring_method: row.get(4)?,
        query_filter: row.get(5)?,
        search_database: row.get(6)?,
        search_collection: row.get(7)?,
        search_index: row.get(8)?,
        pipeline_path: row.get(9)?,
        pipeline_sha256: row.get(10)?,
        mean_ndcg: row.get(11)?,
        evaluated: row.get::<_, i64>(12)? as usize,
        skipped: row.get::<_, i64>(13)? as usize,
        failed: row.get::<_, i64>(14)? as usize,
    })
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
              run_id TEXT PRIMARY KEY,
              started_at TEXT NOT NULL,
              finished_at TEXT NOT NULL,
              k INTEGER NOT NULL,
              scoring_method TEXT NOT NULL,
              query_filter TEXT NOT NULL,
              search_database TEXT NOT NULL,
              search_collection TEXT NOT NULL,
              search_index TEXT NOT NULL,
              pipeline_path TEXT NOT NULL,
              pipeline_sha256 TEXT NOT NULL,
              mean_ndcg REAL,
              evaluated INTEGER NOT NULL,
              skipped INTEGER NOT NULL,
              failed INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS query_results (
              run_id TEXT NOT NULL,
              position INTEGER NOT NULL,
              query_id TEXT NOT NULL,
              k INTEGER NOT NULL,
              scoring_method TEXT NOT NULL,
              dcg REAL NOT NULL,
              idcg REAL NOT NULL,
              ndcg REAL NOT NULL,
              PRIMARY KEY(run_id, query_id),
              FOREIGN KEY(run_id) REFERENCES runs(run_id)
            );

            CREATE TABLE IF NOT EXISTS query_failures (
              run_id TEXT NOT NULL,
              failure_seq INTEGER NOT NULL,
              query_id TEXT NOT NULL,
              reason TEXT NOT NULL,
              PRIMARY KEY(run_id, failure_seq),
              FOREIGN KEY(run_id) REFERENCES runs(run_id)
            );
            ",
        )
        .context("failed to create results schema")?;

    connection.execute(
        "
        INSERT INTO metadata(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value=excluded.value
        ",
        params![RESULTS_SCHEMA_VERSION],
    )?;

    Ok(())
}
