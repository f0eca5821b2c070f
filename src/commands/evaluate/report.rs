use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::model::{BatchResult, NdcgResult, QueryFailure, RunMetadata};
use crate::results_store::ResultSink;
use crate::util::write_json_pretty;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum PerformanceBand {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl PerformanceBand {
    pub(crate) const ALL: [Self; 4] = [Self::Excellent, Self::Good, Self::Fair, Self::Poor];

    pub(crate) fn for_score(ndcg: f64) -> Self {
        if ndcg >= 0.8 {
            Self::Excellent
        } else if ndcg >= 0.6 {
            Self::Good
        } else if ndcg >= 0.4 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }

    fn assessment(self) -> &'static str {
        match self {
            Self::Excellent => "search results closely follow the ideal rankings",
            Self::Good => "search results mostly follow the ideal rankings",
            Self::Fair => "search results partially follow the ideal rankings",
            Self::Poor => "search results diverge from the ideal rankings",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct BandCount {
    pub(crate) band: PerformanceBand,
    pub(crate) queries: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct EvaluationReport<'a> {
    pub(crate) run: &'a RunMetadata,
    /// Absent when no query was evaluated.
    pub(crate) mean_ndcg: Option<f64>,
    pub(crate) performance: Option<PerformanceBand>,
    pub(crate) evaluated: usize,
    pub(crate) skipped: usize,
    pub(crate) failed: usize,
    pub(crate) bands: Vec<BandCount>,
    pub(crate) per_query: &'a [NdcgResult],
    pub(crate) failures: &'a [QueryFailure],
}

/// Presents one finished batch. Rounding happens only in `render_text`; the
/// JSON report and the result sink receive the values as computed.
pub(crate) struct ReportEmitter<'a> {
    run: &'a RunMetadata,
    batch: &'a BatchResult,
}

impl<'a> ReportEmitter<'a> {
    pub(crate) fn new(run: &'a RunMetadata, batch: &'a BatchResult) -> Self {
        Self { run, batch }
    }

    pub(crate) fn band_counts(&self) -> Vec<BandCount> {
        PerformanceBand::ALL
            .into_iter()
            .map(|band| BandCount {
                band,
                queries: self
                    .batch
                    .per_query
                    .iter()
                    .filter(|result| PerformanceBand::for_score(result.ndcg) == band)
                    .count(),
            })
            .collect()
    }

    pub(crate) fn report(&self) -> EvaluationReport<'a> {
        let mean_ndcg = self.batch.has_successes().then_some(self.batch.mean_ndcg);
        EvaluationReport {
            run: self.run,
            mean_ndcg,
            performance: mean_ndcg.map(PerformanceBand::for_score),
            evaluated: self.batch.evaluated,
            skipped: self.batch.skipped,
            failed: self.batch.failures.len(),
            bands: self.band_counts(),
            per_query: &self.batch.per_query,
            failures: &self.batch.failures,
        }
    }

    pub(crate) fn log_summary(&self) {
        if self.batch.has_successes() {
            info!(
                run_id = %self.run.run_id,
                k = self.run.k,
                scoring = %self.run.scoring_method,
                mean_ndcg = self.batch.mean_ndcg,
                evaluated = self.batch.evaluated,
                skipped = self.batch.skipped,
                failed = self.batch.failures.len(),
                performance = PerformanceBand::for_score(self.batch.mean_ndcg).as_str(),
                "evaluation complete"
            );
        } else {
            info!(
                run_id = %self.run.run_id,
                skipped = self.batch.skipped,
                failed = self.batch.failures.len(),
                "evaluation complete; no queries evaluated"
            );
        }
    }

    pub(crate) fn render_text(&self, out: &mut dyn Write) -> io::Result<()> {
        let k = self.run.k;
        writeln!(
            out,
            "NDCG@{k} evaluation ({}) run={}",
            self.run.scoring_method, self.run.run_id
        )?;
        writeln!(
            out,
            "Search: {}.{} index={} filter={}",
            self.run.search_database,
            self.run.search_collection,
            self.run.search_index,
            self.run.query_filter
        )?;

        if !self.batch.per_query.is_empty() {
            let width = self
                .batch
                .per_query
                .iter()
                .map(|result| result.query_id.len())
                .max()
                .unwrap_or(0)
                .max("query_id".len());
            writeln!(out)?;
            writeln!(out, "{:<width$}  {:>8}  {:>8}  {:>8}", "query_id", "ndcg", "dcg", "idcg")?;
            for result in &self.batch.per_query {
                writeln!(
                    out,
                    "{:<width$}  {:>8.4}  {:>8.4}  {:>8.4}",
                    result.query_id, result.ndcg, result.dcg, result.idcg
                )?;
            }
        }

        if !self.batch.failures.is_empty() {
            writeln!(out)?;
            writeln!(out, "Failures: {}", self.batch.failures.len())?;
            for failure in &self.batch.failures {
                writeln!(out, "  {}: {}", failure.query_id, failure.reason)?;
            }
        }

        writeln!(out)?;
        writeln!(
            out,
            "Queries: evaluated={} skipped={} failed={}",
            self.batch.evaluated,
            self.batch.skipped,
            self.batch.failures.len()
        )?;

        if !self.batch.has_successes() {
            writeln!(out, "No queries evaluated; mean NDCG@{k} is undefined for this run")?;
            return Ok(());
        }

        let bands = self
            .band_counts()
            .iter()
            .map(|count| format!("{}={}", count.band.as_str(), count.queries))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(out, "Bands: {bands}")?;

        let band = PerformanceBand::for_score(self.batch.mean_ndcg);
        writeln!(
            out,
            "Mean NDCG@{k}: {:.4} ({}: {})",
            self.batch.mean_ndcg,
            band.as_str(),
            band.assessment()
        )?;
        Ok(())
    }

    pub(crate) fn write_json(&self, path: &Path) -> Result<()> {
        write_json_pretty(path, &self.report())
            .with_context(|| format!("failed to write evaluation report {}", path.display()))?;
        info!(path = %path.display(), "wrote evaluation report");
        Ok(())
    }

    pub(crate) fn persist(&self, sink: &mut dyn ResultSink) -> Result<()> {
        sink.persist(self.run, self.batch)
    }
}
