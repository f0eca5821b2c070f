use std::io::{self, Write};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::info;

use super::batch::BatchEvaluator;
use super::report::ReportEmitter;
use crate::cli::EvaluateArgs;
use crate::config::EvalConfig;
use crate::model::{BatchResult, RunMetadata};
use crate::mongo::MongoBackend;
use crate::pipeline::{QueryExecutor, load_pipeline};
use crate::rankings::{JsonFileRankingStore, RankingRecord, RankingStore};
use crate::results_store::{ResultSink, SqliteResultStore};
use crate::util::{fingerprint_file, now_utc_string, run_id_for};

pub fn run(args: EvaluateArgs) -> Result<()> {
    let config = EvalConfig::from_args(&args).context("invalid evaluation configuration")?;
    let started = Utc::now();

    info!(
        pipeline = %config.pipeline_path.display(),
        k = config.k,
        scoring = %config.scoring,
        filter = %config.query_filter.to_json_string(),
        concurrency = config.concurrency,
        debug = config.debug,
        "evaluation requested"
    );

    let template = load_pipeline(&config.pipeline_path)?;
    let pipeline_sha256 = fingerprint_file(&config.pipeline_path)?;

    let backend = MongoBackend::connect(&config.uri)?;
    backend.ping(&config.eval_database)?;
    info!(database = %config.eval_database, "connected to document store");

    let records = match &config.rankings_path {
        Some(path) => JsonFileRankingStore::new(path).fetch_rankings(&config.query_filter)?,
        None => backend
            .ranking_store(&config.eval_database, &config.rankings_collection)
            .fetch_rankings(&config.query_filter)?,
    };
    let executor = backend.executor(&config.search);

    let mut store = config
        .results_db
        .as_deref()
        .map(SqliteResultStore::open)
        .transpose()?;

    let evaluation = Evaluation {
        config: &config,
        template: &template,
        run_id: run_id_for(started),
        started_at: now_utc_string(),
        pipeline_sha256,
    };
    let mut output = io::BufWriter::new(io::stdout().lock());
    evaluation.execute(
        &records,
        &executor,
        store.as_mut().map(|store| store as &mut dyn ResultSink),
        &mut output,
    )?;
    output.flush()?;
    Ok(())
}

/// One evaluation run over already-fetched ranking records.
pub(super) struct Evaluation<'a> {
    pub(super) config: &'a EvalConfig,
    pub(super) template: &'a [Value],
    pub(super) run_id: String,
    pub(super) started_at: String,
    pub(super) pipeline_sha256: String,
}

impl Evaluation<'_> {
    /// Nothing is reported or persisted when the batch aborts.
    pub(super) fn execute(
        self,
        records: &[RankingRecord],
        executor: &dyn QueryExecutor,
        sink: Option<&mut dyn ResultSink>,
        out: &mut dyn Write,
    ) -> Result<BatchResult> {
        let evaluator = BatchEvaluator::new(self.config, self.template, executor)?;
        let batch = evaluator
            .run(records)
            .with_context(|| format!("evaluation run {} aborted", self.run_id))?;

        let run = RunMetadata {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: now_utc_string(),
            k: self.config.k,
            scoring_method: self.config.scoring,
            query_filter: self.config.query_filter.to_json_string(),
            search_database: self.config.search.database.clone(),
            search_collection: self.config.search.collection.clone(),
            search_index: self.config.search.index.clone(),
            pipeline_path: self.config.pipeline_path.display().to_string(),
            pipeline_sha256: self.pipeline_sha256,
        };

        let emitter = ReportEmitter::new(&run, &batch);
        emitter.log_summary();
        if self.config.print {
            emitter
                .render_text(out)
                .context("failed to write evaluation report to stdout")?;
        }
        if let Some(path) = &self.config.report_path {
            emitter.write_json(path)?;
        }
        if let Some(sink) = sink {
            emitter
                .persist(sink)
                .with_context(|| format!("failed to persist evaluation run {}", run.run_id))?;
        }

        Ok(batch)
    }
}
