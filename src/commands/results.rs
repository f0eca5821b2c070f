use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use crate::cli::ResultsArgs;
use crate::results_store::{SqliteResultStore, StoredFailure, StoredQueryResult, StoredRun};

#[derive(Debug, Serialize)]
struct RunDetail {
    run: StoredRun,
    per_query: Vec<StoredQueryResult>,
    failures: Vec<StoredFailure>,
}

pub fn run(args: ResultsArgs) -> Result<()> {
    if !args.results_db.exists() {
        bail!("results store not found: {}", args.results_db.display());
    }

    info!(path = %args.results_db.display(), "results requested");
    let store = SqliteResultStore::open_read_only(&args.results_db)?;
    let mut output = io::BufWriter::new(io::stdout().lock());

    match &args.run_id {
        Some(run_id) => write_run_detail(&store, run_id, args.json, &mut output)?,
        None => write_run_list(&store, args.limit, args.json, &mut output)?,
    }

    output.flush()?;
    Ok(())
}

fn write_run_list(store: &SqliteResultStore, limit: usize, json: bool, out: &mut dyn Write) -> Result<()> {
    let runs = store.list_runs(limit)?;

    if json {
        serde_json::to_writer_pretty(&mut *out, &runs).context("failed to serialize run list")?;
        writeln!(out)?;
        return Ok(());
    }

    if runs.is_empty() {
        writeln!(out, "No evaluation runs recorded")?;
        return Ok(());
    }

    for run in &runs {
        writeln!(
            out,
            "{}  {}  k={} scoring={} mean={} evaluated={} skipped={} failed={}",
            run.run_id,
            run.started_at,
            run.k,
            run.scoring_method,
            format_mean(run.mean_ndcg),
            run.evaluated,
            run.skipped,
            run.failed
        )?;
    }
    Ok(())
}

fn write_run_detail(store: &SqliteResultStore, run_id: &str, json: bool, out: &mut dyn Write) -> Result<()> {
    let Some(run) = store.find_run(run_id)? else {
        bail!("no evaluation run with id {run_id}");
    };

    let detail = RunDetail {
        per_query: store.query_results(run_id)?,
        failures: store.query_failures(run_id)?,
        run,
    };

    if json {
        serde_json::to_writer_pretty(&mut *out, &detail).context("failed to serialize run detail")?;
        writeln!(out)?;
        return Ok(());
    }

    let run = &detail.run;
    writeln!(out, "Run: {}", run.run_id)?;
    writeln!(out, "Started: {}  Finished: {}", run.started_at, run.finished_at)?;
    writeln!(
        out,
        "Search: {}.{} index={} filter={}",
        run.search_database, run.search_collection, run.search_index, run.query_filter
    )?;
    writeln!(out, "Pipeline: {} sha256={}", run.pipeline_path, run.pipeline_sha256)?;
    writeln!(out, "NDCG@{} ({}): {}", run.k, run.scoring_method, format_mean(run.mean_ndcg))?;

    for row in &detail.per_query {
        writeln!(
            out,
            "  {:<24} ndcg={:.4} dcg={:.4} idcg={:.4}",
            row.query_id, row.ndcg, row.dcg, row.idcg
        )?;
    }
    for failure in &detail.failures {
        writeln!(out, "  {:<24} FAILED {}", failure.query_id, failure.reason)?;
    }
    Ok(())
}

fn format_mean(mean: Option<f64>) -> String {
    match mean {
        Some(mean) => format!("{mean:.4}"),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::cli::ScoringMethod;
    use crate::model::{BatchResult, NdcgResult, QueryFailure, RunMetadata};
    use crate::results_store::ResultSink;

    fn seeded_store() -> SqliteResultStore {
        let mut store = SqliteResultStore::with_connection(Connection::open_in_memory().unwrap()).unwrap();
        let run = RunMetadata {
            run_id: "eval-20260101T000000Z".to_string(),
            started_at: "2026-01-01T00:00:00.000Z".to_string(),
            finished_at: "2026-01-01T00:00:02.000Z".to_string(),
            k: 3,
            scoring_method: ScoringMethod::Binary,
            query_filter: r#"{"type":"text"}"#.to_string(),
            search_database: "search_evaluation".to_string(),
            search_collection: "documents".to_string(),
            search_index: "text_search_index".to_string(),
            pipeline_path: "pipeline.json".to_string(),
            pipeline_sha256: "ab".repeat(32),
        };
        let batch = BatchResult::from_parts(
            vec![NdcgResult {
                query_id: "q1".to_string(),
                k: 3,
                scoring_method: ScoringMethod::Binary,
                dcg: 1.5,
                idcg: 2.130_929_753_571_457,
                ndcg: 0.703_918_296_454_121_7,
            }],
            0,
            vec![QueryFailure {
                query_id: "q2".to_string(),
                reason: "execution error: pipeline timed out".to_string(),
            }],
        );
        store.persist(&run, &batch).unwrap();
        store
    }

    #[test]
    fn run_list_shows_rounded_means() {
        let store = seeded_store();
        let mut out = Vec::new();
        write_run_list(&store, 10, false, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("eval-20260101T000000Z"), "{text}");
        assert!(text.contains("mean=0.7039"), "{text}");
        assert!(text.contains("failed=1"), "{text}");
    }

    #[test]
    fn run_detail_json_keeps_stored_precision() {
        let store = seeded_store();
        let mut out = Vec::new();
        write_run_detail(&store, "eval-20260101T000000Z", true, &mut out).unwrap();
        let detail: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(detail["per_query"][0]["ndcg"], serde_json::json!(0.703_918_296_454_121_7));
        assert_eq!(detail["failures"][0]["query_id"], "q2");
        assert_eq!(detail["run"]["scoring_method"], "binary");
    }

    #[test]
    fn unknown_run_id_is_an_error() {
        let store = seeded_store();
        let mut out = Vec::new();
        let error = write_run_detail(&store, "eval-missing", false, &mut out).unwrap_err();
        assert!(error.to_string().contains("eval-missing"));
    }

    #[test]
    fn empty_store_reports_no_runs() {
        let store = SqliteResultStore::with_connection(Connection::open_in_memory().unwrap()).unwrap();
        let mut out = Vec::new();
        write_run_list(&store, 5, false, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "No evaluation runs recorded\n");
    }
}
