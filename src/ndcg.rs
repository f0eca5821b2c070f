//! NDCG@k for one query, and the keyed batch form.
//!
//! ```text
//! DCG@k  = sum_{i=1..min(k, |results|)} rel(results[i]) / log2(i + 1)
//! IDCG@k = same sum over the ideal ordering of the relevance map
//! NDCG@k = DCG@k / IDCG@k, or 0 when IDCG@k is 0
//! ```
//!
//! Click-based scoring has no ideal list of its own: its IDCG is taken over
//! the observed top-k relevances re-sorted in descending order.

use std::collections::{BTreeMap, HashSet};

use tracing::{Level, debug};

use crate::cli::ScoringMethod;
use crate::error::EvalResult;
use crate::model::{IdealRanking, NdcgResult, QueryFailure};
use crate::scoring::{RelevanceMap, ScoringEngine};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNdcg {
    pub per_query: BTreeMap<String, NdcgResult>,
    pub mean_ndcg: f64,
    /// Query ids present in only one of the two inputs.
    pub unmatched: Vec<String>,
    pub failures: Vec<QueryFailure>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NdcgCalculator {
    engine: ScoringEngine,
}

impl NdcgCalculator {
    pub fn new(engine: ScoringEngine) -> Self {
        Self { engine }
    }

    pub fn compute_ndcg(
        &self,
        query_id: &str,
        ranking: &IdealRanking,
        search_results: &[String],
        k: usize,
        method: ScoringMethod,
    ) -> EvalResult<NdcgResult> {
        let relevance = self.engine.compute_scores(ranking, method)?;
        Ok(score_results(query_id, &relevance, search_results, k, method))
    }

    /// Keyed form over already-collected results; query ids present on only
    /// one side are reported in `unmatched` and left out of the mean.
        pub fn batch_evaluate_ndcg(
        &self,
        search_results: &BTreeMap<String, Vec<String>>,
        rankings: &BTreeMap<String, IdealRanking>,
        k: usize,
        method: ScoringMethod,
    ) -> BatchNdcg {
        let mut per_query = BTreeMap::new();
        let mut failures = Vec::new();

        for (query_id, results) in search_results {
            let Some(ranking) = rankings.get(query_id) else {
                continue;
            };
            match self.compute_ndcg(query_id, ranking, results, k, method) {
                Ok(result) => {
                    per_query.insert(query_id.clone(), result);
                }
                Err(error) => failures.push(QueryFailure {
                    query_id: query_id.clone(),
                    reason: error.to_string(),
                }),
            }
        }

        let unmatched = search_results
            .keys()
            .filter(|query_id| !rankings.contains_key(*query_id))
            .chain(
                rankings
                    .keys()
                    .filter(|query_id| !search_results.contains_key(*query_id)),
            )
            .cloned()
            .collect::<Vec<_>>();

        let mean_ndcg = if per_query.is_empty() {
            0.0
        } else {
            per_query.values().map(|result| result.ndcg).sum::<f64>() / per_query.len() as f64
        };

        BatchNdcg {
            per_query,
            mean_ndcg,
            unmatched,
            failures,
        }
    }
}

/// Positional discount for a 1-based rank: `log2(rank + 1)`.
pub fn discount(rank: usize) -> f64 {
    (rank as f64 + 1.0).log2()
}

/// Sum of discounted gains over the first `k` relevance values.
pub fn dcg_at_k(relevances: impl IntoIterator<Item = f64>, k: usize) -> f64 {
    relevances
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(index, relevance)| relevance / discount(index + 1))
        .sum()
}

/// Scores an observed result list against a relevance map.
///
/// A document repeated in the results only earns relevance at its first
/// position; later copies still occupy their rank.
pub fn score_results(
    query_id: &str,
    relevance: &RelevanceMap,
    search_results: &[String],
    k: usize,
    method: ScoringMethod,
) -> NdcgResult {
    let mut seen = HashSet::<&str>::new();
    let observed = search_results
        .iter()
        .take(k)
        .map(|doc_id| {
            if seen.insert(doc_id.as_str()) {
                relevance.get(doc_id)
            } else {
                0.0
            }
        })
        .collect::<Vec<f64>>();

    let ideal = if method == ScoringMethod::Clicks {
        let mut resorted = observed.clone();
        resorted.sort_by(|left, right| right.total_cmp(left));
        resorted
    } else {
        relevance
            .ideal_ordering()
            .into_iter()
            .map(|(_, score)| score)
            .collect::<Vec<f64>>()
    };

    let dcg = dcg_at_k(observed.iter().copied(), k);
    let idcg = dcg_at_k(ideal.iter().copied(), k);
    // Summation drift must not push a perfect ordering above 1.
    let ndcg = if idcg > 0.0 { (dcg / idcg).min(1.0) } else { 0.0 };

    if tracing::enabled!(Level::DEBUG) {
        if relevance.is_empty() {
            debug!(query_id, "no relevance judgements, ndcg is zero");
        } else {
            debug!(query_id, judged = relevance.len(), "relevance judgements loaded");
        }
        trace_calculation(query_id, relevance, search_results, &observed, &ideal, k);
        debug!(query_id, k, dcg, idcg, ndcg, "ndcg computed");
    }

    NdcgResult {
        query_id: query_id.to_string(),
        k,
        scoring_method: method,
        dcg,
        idcg,
        ndcg,
    }
}

fn trace_calculation(
    query_id: &str,
    relevance: &RelevanceMap,
    search_results: &[String],
    observed: &[f64],
    ideal: &[f64],
    k: usize,
) {
    let ideal_ids = relevance.ideal_ordering();
    let mut running = 0.0;
    for (index, gain_source) in observed.iter().enumerate() {
        let rank = index + 1;
        let gain = gain_source / discount(rank);
        running += gain;
        debug!(
            query_id,
            rank,
            doc_id = %search_results[index],
            ideal_doc_id = ideal_ids.get(index).map_or("<empty>", |(doc_id, _)| *doc_id),
            relevant = relevance.contains(&search_results[index]),
            relevance = gain_source,
            discount = discount(rank),
            gain,
            dcg_so_far = running,
            "dcg term"
        );
    }

    let mut running = 0.0;
    for (index, score) in ideal.iter().take(k).enumerate() {
        let rank = index + 1;
        let gain = score / discount(rank);
        running += gain;
        debug!(query_id, rank, relevance = score, gain, idcg_so_far = running, "idcg term");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClickCount, ScoredDoc};

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn calculator() -> NdcgCalculator {
        NdcgCalculator::default()
    }

    #[test]
    fn binary_example_matches_hand_computation() {
        let ranking = IdealRanking::Implicit(ids(&["doc1", "doc3", "doc5"]));
        let result = calculator()
            .compute_ndcg(
                "q",
                &ranking,
                &ids(&["doc1", "doc2", "doc3"]),
                3,
                ScoringMethod::Binary,
            )
            .unwrap();

        assert!((result.dcg - 1.5).abs() < 1e-12);
        let expected_idcg = 1.0 + 1.0 / 3f64.log2() + 0.5;
        assert!((result.idcg - expected_idcg).abs() < 1e-12);
        assert!((result.ndcg - 0.7039).abs() < 1e-3, "{}", result.ndcg);
        assert_eq!(result.k, 3);
        assert_eq!(result.scoring_method, ScoringMethod::Binary);
    }

    #[test]
    fn ideal_order_scores_one() {
        let ranking = IdealRanking::Implicit(ids(&["a", "b", "c", "d"]));
        for method in [ScoringMethod::Binary, ScoringMethod::InverseRank, ScoringMethod::Decay] {
            let result = calculator()
                .compute_ndcg(
                    "q",
                    &ranking,
                    &ids(&["a", "b", "c", "d", "x"]),
                    4,
                    method,
                )
                .unwrap();
            assert_eq!(result.ndcg, 1.0, "{method:?}");
        }
    }

    #[test]
    fn explicit_ideal_order_follows_scores_not_declaration() {
        let ranking = IdealRanking::Explicit(vec![
            ScoredDoc {
                doc_id: "b".into(),
                score: 3.0,
            },
            ScoredDoc {
                doc_id: "a".into(),
                score: 5.0,
            },
        ]);
        let perfect = calculator()
            .compute_ndcg(
                "q",
                &ranking,
                &ids(&["a", "b"]),
                2,
                ScoringMethod::ExplicitScore,
            )
            .unwrap();
        assert_eq!(perfect.ndcg, 1.0);

        let swapped = calculator()
            .compute_ndcg(
                "q",
                &ranking,
                &ids(&["b", "a"]),
                2,
                ScoringMethod::ExplicitScore,
            )
            .unwrap();
        assert!(swapped.ndcg < 1.0 && swapped.ndcg > 0.0);
    }

    #[test]
    fn no_relevant_results_or_empty_relevance_score_zero() {
        let ranking = IdealRanking::Implicit(ids(&["a", "b"]));
        let miss = calculator()
            .compute_ndcg(
                "q",
                &ranking,
                &ids(&["x", "y", "z"]),
                3,
                ScoringMethod::InverseRank,
            )
            .unwrap();
        assert_eq!(miss.ndcg, 0.0);
        assert_eq!(miss.dcg, 0.0);

        let empty = IdealRanking::Implicit(Vec::new());
        let result = calculator()
            .compute_ndcg(
                "q",
                &empty,
                &ids(&["a"]),
                3,
                ScoringMethod::Binary,
            )
            .unwrap();
        assert_eq!(result.idcg, 0.0);
        assert_eq!(result.ndcg, 0.0);
    }

    #[test]
    fn irrelevant_documents_keep_their_positional_discount() {
        let ranking = IdealRanking::Implicit(ids(&["a"]));
        let result = calculator()
            .compute_ndcg(
                "q",
                &ranking,
                &ids(&["x", "a"]),
                2,
                ScoringMethod::Binary,
            )
            .unwrap();
        assert!((result.dcg - 1.0 / 3f64.log2()).abs() < 1e-12);
        assert_eq!(result.idcg, 1.0);
    }

    #[test]
    fn only_top_k_results_contribute() {
        let ranking = IdealRanking::Implicit(ids(&["doc1", "doc3", "doc5", "doc7", "doc9"]));
        let results = (1..=10).map(|n| format!("doc{n}")).collect::<Vec<_>>();

        let at_one = calculator()
            .compute_ndcg("q", &ranking, &results, 1, ScoringMethod::Binary)
            .unwrap();
        assert_eq!(at_one.ndcg, 1.0);

        let at_three = calculator()
            .compute_ndcg("q", &ranking, &results, 3, ScoringMethod::Binary)
            .unwrap();
        assert!((at_three.ndcg - 0.7039).abs() < 1e-3, "{}", at_three.ndcg);
    }

    #[test]
    fn short_result_lists_are_not_padded_into_the_ideal() {
        let ranking = IdealRanking::Implicit(ids(&["doc1", "doc3"]));
        let result = calculator()
            .compute_ndcg(
                "q",
                &ranking,
                &ids(&["doc1", "doc2", "doc3"]),
                10,
                ScoringMethod::Binary,
            )
            .unwrap();
        let expected = (1.0 + 0.5) / (1.0 + 1.0 / 3f64.log2());
        assert!((result.ndcg - expected).abs() < 1e-12);
    }

    #[test]
    fn repeated_result_documents_cannot_exceed_one() {
        let ranking = IdealRanking::Implicit(ids(&["a", "b"]));
        let result = calculator()
            .compute_ndcg(
                "q",
                &ranking,
                &ids(&["a", "a", "a"]),
                3,
                ScoringMethod::Binary,
            )
            .unwrap();
        assert!(result.ndcg <= 1.0);
        assert_eq!(result.dcg, 1.0);
    }

    #[test]
    fn ndcg_stays_within_unit_interval_across_orderings() {
        let ranking = IdealRanking::Implicit(ids(&["a", "b", "c", "d", "e"]));
        let orderings = [
            ids(&["e", "d", "c", "b", "a"]),
            ids(&["x", "a", "y", "b"]),
            ids(&["c"]),
            Vec::new(),
        ];
        for method in [ScoringMethod::Binary, ScoringMethod::InverseRank, ScoringMethod::Decay] {
            for ordering in &orderings {
                let result = calculator()
                    .compute_ndcg("q", &ranking, ordering, 5, method)
                    .unwrap();
                assert!((0.0..=1.0).contains(&result.ndcg), "{method:?} {ordering:?}");
            }
        }
    }

    fn click_log() -> IdealRanking {
        let counts = [
            ("doc1", 10),
            ("doc2", 2),
            ("doc3", 8),
            ("doc4", 0),
            ("doc5", 15),
            ("doc6", 1),
            ("doc7", 7),
            ("doc8", 3),
            ("doc9", 12),
            ("doc10", 0),
        ];
        IdealRanking::Clicks(
            counts
                .iter()
                .map(|(doc_id, clicks)| ClickCount {
                    doc_id: doc_id.to_string(),
                    clicks: *clicks,
                })
                .collect(),
        )
    }

    #[test]
    fn click_relevance_is_normalised_against_the_resorted_top_k() {
        let results = (1..=10).map(|n| format!("doc{n}")).collect::<Vec<_>>();
        let clicks = click_log();

        // top 3 at threshold 5: [1, 0, 1] against [1, 1, 0]
        let at_three = calculator()
            .compute_ndcg("q", &clicks, &results, 3, ScoringMethod::Clicks)
            .unwrap();
        assert!((at_three.dcg - 1.5).abs() < 1e-12);
        assert!((at_three.idcg - (1.0 + 1.0 / 3f64.log2())).abs() < 1e-12);
        assert!((at_three.ndcg - 0.9197).abs() < 1e-3, "{}", at_three.ndcg);

        // top 5 at threshold 5: [1, 0, 1, 0, 1]
        let at_five = calculator()
            .compute_ndcg("q", &clicks, &results, 5, ScoringMethod::Clicks)
            .unwrap();
        assert!((at_five.ndcg - 0.8855).abs() < 1e-3, "{}", at_five.ndcg);

        for k in [3, 5, 8, 10] {
            for threshold in [5, 7] {
                let strict = NdcgCalculator::new(
                    ScoringEngine::default().with_click_threshold(threshold),
                );
                let result = strict
                    .compute_ndcg("q", &clicks, &results, k, ScoringMethod::Clicks)
                    .unwrap();
                assert!((0.0..=1.0).contains(&result.ndcg), "k={k} threshold={threshold}");
            }
        }
    }

    #[test]
    fn click_scoring_without_clicks_or_results_is_zero() {
        let results = ids(&["doc1", "doc2"]);
        let none = calculator()
            .compute_ndcg("q", &IdealRanking::Clicks(Vec::new()), &results, 3, ScoringMethod::Clicks)
            .unwrap();
        assert_eq!(none.ndcg, 0.0);

        let no_results = calculator()
            .compute_ndcg("q", &click_log(), &[], 3, ScoringMethod::Clicks)
            .unwrap();
        assert_eq!(no_results.ndcg, 0.0);
    }

    #[test]
    fn batch_mean_covers_shared_queries_and_reports_the_rest() {
        let mut results = BTreeMap::new();
        results.insert("query1".to_string(), ids(&["doc1", "doc2", "doc3"]));
        results.insert("query2".to_string(), ids(&["doc11", "doc12"]));
        results.insert("orphan".to_string(), ids(&["doc1"]));

        let mut rankings = BTreeMap::new();
        rankings.insert("query1".to_string(), IdealRanking::Implicit(ids(&["doc1", "doc2", "doc3"])));
        rankings.insert("query2".to_string(), IdealRanking::Implicit(ids(&["doc99"])));
        rankings.insert("unsearched".to_string(), IdealRanking::Implicit(ids(&["doc1"])));

        let batch = calculator().batch_evaluate_ndcg(&results, &rankings, 3, ScoringMethod::Binary);

        assert_eq!(batch.per_query.len(), 2);
        assert_eq!(batch.per_query["query1"].ndcg, 1.0);
        assert_eq!(batch.per_query["query2"].ndcg, 0.0);
        assert!((batch.mean_ndcg - 0.5).abs() < 1e-12);
        assert_eq!(batch.unmatched, vec!["orphan".to_string(), "unsearched".to_string()]);
        assert!(batch.failures.is_empty());
    }

    #[test]
    fn batch_records_malformed_rankings_as_failures() {
        let mut results = BTreeMap::new();
        results.insert("dup".to_string(), ids(&["a"]));
        results.insert("ok".to_string(), ids(&["a"]));

        let mut rankings = BTreeMap::new();
        rankings.insert("dup".to_string(), IdealRanking::Implicit(ids(&["a", "a"])));
        rankings.insert("ok".to_string(), IdealRanking::Implicit(ids(&["a"])));

        let batch = calculator().batch_evaluate_ndcg(&results, &rankings, 10, ScoringMethod::Binary);
        assert_eq!(batch.per_query.len(), 1);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].query_id, "dup");
        assert_eq!(batch.mean_ndcg, 1.0);
    }
}
