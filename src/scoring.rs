//! Relevance weighting for ideal rankings.
//!
//! Each scoring method turns one [`IdealRanking`] into a [`RelevanceMap`]:
//!
//! - `binary`: every listed document scores 1.
//! - `inverse_rank`: position `i` (0-based) scores `1 / (i + 1)`.
//! - `decay`: position `i` scores `2^(base - i)` with
//!   `base = max(1, scaling_factor * log2(n) + 1)`, and 0 once the exponent
//!   reaches zero. Longer rankings get a larger top score.
//! - `score`: explicit `{doc_id, score}` pairs are used verbatim.
//! - `clicks`: a document scores 1 when its click count reaches the
//!   threshold, otherwise 0.

use std::collections::HashMap;

use crate::cli::ScoringMethod;
use crate::error::{EvalError, EvalResult};
use crate::model::IdealRanking;

pub const DEFAULT_DECAY_SCALING_FACTOR: f64 = 1.0;
pub const DEFAULT_CLICK_THRESHOLD: u64 = 5;

/// Document id to relevance score, remembering insertion order so ties in the
/// ideal ordering resolve to the order the ranking declared them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelevanceMap {
    entries: Vec<(String, f64)>,
    positions: HashMap<String, usize>,
}

impl RelevanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a document; a repeated id is a data error.
    pub fn insert(&mut self, doc_id: &str, score: f64) -> EvalResult<()> {
        if self.positions.contains_key(doc_id) {
            return Err(EvalError::data(format!(
                "duplicate document id in ideal ranking: {doc_id}"
            )));
        }
        self.positions.insert(doc_id.to_string(), self.entries.len());
        self.entries.push((doc_id.to_string(), score));
        Ok(())
    }

    /// Relevance of `doc_id`; absent documents score 0.
    pub fn get(&self, doc_id: &str) -> f64 {
        self.positions
            .get(doc_id)
            .map_or(0.0, |&position| self.entries[position].1)
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.positions.contains_key(doc_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries
            .iter()
            .map(|(doc_id, score)| (doc_id.as_str(), *score))
    }

    /// Documents by descending relevance, stable on declaration order.
    pub fn ideal_ordering(&self) -> Vec<(&str, f64)> {
        let mut ordering = self.iter().collect::<Vec<_>>();
        ordering.sort_by(|left, right| right.1.total_cmp(&left.1));
        ordering
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringEngine {
    decay_scaling_factor: f64,
    click_threshold: u64,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY_SCALING_FACTOR)
    }
}

impl ScoringEngine {
    pub fn new(decay_scaling_factor: f64) -> Self {
        Self {
            decay_scaling_factor,
            click_threshold: DEFAULT_CLICK_THRESHOLD,
        }
    }

    pub fn with_click_threshold(mut self, click_threshold: u64) -> Self {
        self.click_threshold = click_threshold;
        self
    }

    pub fn compute_scores(
        &self,
        ranking: &IdealRanking,
        method: ScoringMethod,
    ) -> EvalResult<RelevanceMap> {
        match (method, ranking) {
            (ScoringMethod::Binary, IdealRanking::Implicit(ids)) => {
                positional_scores(ids, |_| 1.0)
            }
            (ScoringMethod::InverseRank, IdealRanking::Implicit(ids)) => {
                positional_scores(ids, |index| 1.0 / (index as f64 + 1.0))
            }
            (ScoringMethod::Decay, IdealRanking::Implicit(ids)) => {
                let base = decay_base(ids.len(), self.decay_scaling_factor);
                positional_scores(ids, |index| decay_score(base, index))
            }
            (ScoringMethod::ExplicitScore, IdealRanking::Explicit(entries)) => {
                let mut relevance = RelevanceMap::new();
                for entry in entries {
                    if !entry.score.is_finite() || entry.score < 0.0 {
                        return Err(EvalError::data(format!(
                            "score for {} must be a non-negative number, got {}",
                            entry.doc_id, entry.score
                        )));
                    }
                    relevance.insert(&entry.doc_id, entry.score)?;
                }
                Ok(relevance)
            }
            (ScoringMethod::Clicks, IdealRanking::Clicks(counts)) => {
                let mut relevance = RelevanceMap::new();
                for count in counts {
                    let clicked = count.clicks >= self.click_threshold;
                    relevance.insert(&count.doc_id, if clicked { 1.0 } else { 0.0 })?;
                }
                Ok(relevance)
            }
            (_, ranking) if ranking.is_empty() => Ok(RelevanceMap::new()),
            (method, ranking) => Err(EvalError::data(format!(
                "{} scoring cannot use a ranking of {}",
                method.as_str(),
                ranking.shape()
            ))),
        }
    }
}

fn positional_scores(ids: &[String], score_at: impl Fn(usize) -> f64) -> EvalResult<RelevanceMap> {
    let mut relevance = RelevanceMap::new();
    for (index, doc_id) in ids.iter().enumerate() {
        relevance.insert(doc_id, score_at(index))?;
    }
    Ok(relevance)
}

pub fn decay_base(ranking_len: usize, scaling_factor: f64) -> f64 {
    if ranking_len == 0 {
        return 1.0;
    }
    (scaling_factor * (ranking_len as f64).log2() + 1.0).max(1.0)
}

pub fn decay_score(base: f64, index: usize) -> f64 {
    let exponent = (base - index as f64).max(0.0);
    if exponent > 0.0 { exponent.exp2() } else { 0.0 }
}
