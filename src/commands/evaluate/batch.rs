use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::EvalConfig;
use crate::error::{EvalError, EvalResult};
use crate::model::{BatchResult, EvaluationCase, IdealRanking, QueryFailure};
use crate::ndcg::NdcgCalculator;
use crate::pipeline::{PipelineRunner, QueryExecutor};
use crate::rankings::RankingRecord;
use crate::scoring::ScoringEngine;

#[derive(Debug)]
enum QueryOutcome {
    Collected(Vec<String>),
    Failed(QueryFailure),
    Fatal(EvalError),
}

struct Job {
    position: usize,
    case: EvaluationCase,
}

/// Runs every participating query through the pipeline and scores it.
///
/// Pipeline execution is spread over a bounded pool of scoped threads.
/// Outcomes carry their input position; once every worker has joined, the
/// collected result lists are scored together and reassembled in
/// evaluation-set order.
pub(crate) struct BatchEvaluator<'a> {
    config: &'a EvalConfig,
    runner: PipelineRunner<'a>,
    calculator: NdcgCalculator,
}

impl<'a> BatchEvaluator<'a> {
    pub(crate) fn new(
        config: &'a EvalConfig,
        template: &'a [Value],
        executor: &'a dyn QueryExecutor,
    ) -> EvalResult<Self> {
        let runner = PipelineRunner::new(executor, template, &config.search.index, &config.id_field)?;
        Ok(Self {
            config,
            runner,
            calculator: NdcgCalculator::new(
                ScoringEngine::new(config.decay_scaling_factor)
                    .with_click_threshold(config.click_threshold),
            ),
        })
    }

    pub(crate) fn run(&self, records: &[RankingRecord]) -> EvalResult<BatchResult> {
        let mut outcomes = Vec::<(usize, QueryOutcome)>::new();
        let mut jobs = Vec::<Job>::new();
        let mut seen_ids = HashSet::<String>::new();
        let mut skipped = 0usize;

        for record in records {
            if !record.matches(&self.config.query_filter) {
                skipped += 1;
                warn!(query = %record.label(), "ranking record does not satisfy the query filter; skipped");
                continue;
            }

            let case = match record.to_case() {
                Ok(case) => case,
                Err(error) => {
                    outcomes.push((record.position(), failed(record.label(), &error)));
                    continue;
                }
            };

            if !seen_ids.insert(case.query.query_id.clone()) {
                let error = EvalError::data(format!("duplicate query_id in batch: {}", case.query.query_id));
                outcomes.push((record.position(), failed(case.query.query_id, &error)));
                continue;
            }

            jobs.push(Job {
                position: record.position(),
                case,
            });
        }

        info!(
            queries = jobs.len(),
            skipped,
            rejected = outcomes.len(),
            workers = self.config.concurrency.min(jobs.len().max(1)),
            "evaluating queries"
        );

        outcomes.extend(self.evaluate_jobs(&jobs));
        outcomes.sort_by_key(|(position, _)| *position);

        let jobs_by_position = jobs
            .iter()
            .map(|job| (job.position, &job.case))
            .collect::<HashMap<_, _>>();
        let mut collected = BTreeMap::<String, Vec<String>>::new();
        let mut failures = Vec::<(usize, QueryFailure)>::new();
        let mut fatal = None;
        for (position, outcome) in outcomes {
            match outcome {
                QueryOutcome::Collected(results) => {
                    if let Some(case) = jobs_by_position.get(&position) {
                        collected.insert(case.query.query_id.clone(), results);
                    }
                }
                QueryOutcome::Failed(failure) => failures.push((position, failure)),
                QueryOutcome::Fatal(error) => {
                    fatal.get_or_insert(error);
                }
            }
        }

        if let Some(error) = fatal {
            return Err(EvalError::BatchAborted {
                completed: collected.len(),
                source: Box::new(error),
            });
        }

        let rankings = jobs
            .iter()
            .filter(|job| collected.contains_key(&job.case.query.query_id))
            .map(|job| (job.case.query.query_id.clone(), job.case.ideal_ranking.clone()))
            .collect::<BTreeMap<String, IdealRanking>>();
        let positions = jobs
            .iter()
            .map(|job| (job.case.query.query_id.as_str(), job.position))
            .collect::<HashMap<_, _>>();
        let position_of = |query_id: &str| positions.get(query_id).copied().unwrap_or(usize::MAX);

        let scored =
            self.calculator
                .batch_evaluate_ndcg(&collected, &rankings, self.config.k, self.config.scoring);
        if !scored.unmatched.is_empty() {
            warn!(unmatched = ?scored.unmatched, "queries without both results and a ranking");
        }
        for failure in scored.failures {
            warn!(query_id = %failure.query_id, reason = %failure.reason, "query evaluation failed");
            failures.push((position_of(&failure.query_id), failure));
        }

        let mut per_query = scored
            .per_query
            .into_values()
            .map(|result| (position_of(&result.query_id), result))
            .collect::<Vec<_>>();
        per_query.sort_by_key(|(position, _)| *position);
        failures.sort_by_key(|(position, _)| *position);

        let batch = BatchResult::from_parts(
            per_query.into_iter().map(|(_, result)| result).collect(),
            skipped,
            failures.into_iter().map(|(_, failure)| failure).collect(),
        );
        info!(
            evaluated = batch.evaluated,
            failed = batch.failures.len(),
            mean_ndcg = scored.mean_ndcg,
            "queries scored"
        );
        warn_zero_scores(&jobs, &batch, &collected);

        Ok(batch)
    }

    fn evaluate_jobs(&self, jobs: &[Job]) -> Vec<(usize, QueryOutcome)> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let next = AtomicUsize::new(0);
        let cancelled = AtomicBool::new(false);
        let (sender, receiver) = mpsc::channel::<(usize, QueryOutcome)>();
        let workers = self.config.concurrency.clamp(1, jobs.len());

        thread::scope(|scope| {
            for _ in 0..workers {
                let sender = sender.clone();
                let next = &next;
                let cancelled = &cancelled;
                scope.spawn(move || {
                    while !cancelled.load(Ordering::Acquire) {
                        let Some(job) = jobs.get(next.fetch_add(1, Ordering::AcqRel)) else {
                            break;
                        };
                        let outcome = self.evaluate_case(&job.case);
                        if matches!(outcome, QueryOutcome::Fatal(_)) {
                            cancelled.store(true, Ordering::Release);
                        }
                        if sender.send((job.position, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(sender);

        receiver.into_iter().collect()
    }

    fn evaluate_case(&self, case: &EvaluationCase) -> QueryOutcome {
        match self.runner.run(&case.query.query) {
            Ok(ids) => QueryOutcome::Collected(ids),
            Err(error) => classify(&case.query.query_id, error),
        }
    }
}

fn warn_zero_scores(jobs: &[Job], batch: &BatchResult, collected: &BTreeMap<String, Vec<String>>) {
    for Job { case, .. } in jobs {
        let query_id = case.query.query_id.as_str();
        let Some(result) = batch.get(query_id) else {
            continue;
        };
        if result.ndcg != 0.0 {
            continue;
        }
        let attributes = Value::Object(case.query.attributes.clone());
        let returned = collected.get(query_id).map_or(0, Vec::len);
        warn!(
            query_id,
            query = %case.query.query,
            attributes = %attributes,
            returned,
            "query scored zero; no relevant document in the top k"
        );
    }
}

fn classify(query_id: &str, error: EvalError) -> QueryOutcome {
    if error.is_per_query() {
        failed(query_id.to_string(), &error)
    } else {
        warn!(query_id, error = %error, "fatal error; cancelling remaining queries");
        QueryOutcome::Fatal(error)
    }
}

fn failed(query_id: String, error: &EvalError) -> QueryOutcome {
    warn!(query_id = %query_id, reason = %error, "query evaluation failed");
    QueryOutcome::Failed(QueryFailure {
        query_id,
        reason: error.to_string(),
    })
}
