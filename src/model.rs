use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cli::ScoringMethod;
use crate::error::{EvalError, EvalResult};

/// Literal query handed to the search pipeline. Vector queries are injected
/// as arrays when a field consists solely of the query placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Text(String),
    Vector(Vec<f64>),
}

impl QueryValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Vector(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Vector(values) => Value::Array(values.iter().copied().map(Value::from).collect()),
        }
    }
}

impl fmt::Display for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Vector(values) => write!(f, "<vector dim={}>", values.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub query_id: String,
    pub query: QueryValue,
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDoc {
    pub doc_id: String,
    pub score: f64,
}

/// Observed click count for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickCount {
    pub doc_id: String,
    pub clicks: u64,
}

/// Reference ranking for one query, discriminated once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum IdealRanking {
    /// Document ids, most relevant first.
    Implicit(Vec<String>),
    /// Unordered `{doc_id, score}` pairs.
    Explicit(Vec<ScoredDoc>),
    /// Click-through counts keyed by document id.
    Clicks(Vec<ClickCount>),
}

impl IdealRanking {
    pub fn len(&self) -> usize {
        match self {
            Self::Implicit(ids) => ids.len(),
            Self::Explicit(entries) => entries.len(),
            Self::Clicks(counts) => counts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::Implicit(_) => "document ids",
            Self::Explicit(_) => "scored entries",
            Self::Clicks(_) => "click counts",
        }
    }

    /// Parses the `ideal_ranking` field of a ranking record.
    ///
    /// An array holds either document ids or `{doc_id, score}` entries; ids
    /// are normalised with [`id_string`]. An object maps document ids to click
    /// counts, given as a number or as `{"clicks": n}`. An empty array is an
    /// empty implicit ranking.
    pub fn from_value(value: &Value) -> EvalResult<Self> {
        match value {
            Value::Array(items) => Self::from_items(items),
            Value::Object(counts) => Self::from_click_counts(counts),
            other => Err(EvalError::data(format!(
                "ideal_ranking must be an array or an object of click counts, got {}",
                json_kind(other)
            ))),
        }
    }

    fn from_items(items: &[Value]) -> EvalResult<Self> {
        let ids = items.iter().map(id_string).collect::<Option<Vec<_>>>();
        if let Some(ids) = ids {
            return Ok(Self::Implicit(ids));
        }

        if items.iter().all(|item| item.get("doc_id").is_some()) {
            let mut entries = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let doc_id = item.get("doc_id").and_then(id_string).ok_or_else(|| {
                    EvalError::data(format!(
                        "ideal_ranking[{index}] has a doc_id that is not a string, number or ObjectId"
                    ))
                })?;
                let score = item.get("score").and_then(Value::as_f64).ok_or_else(|| {
                    EvalError::data(format!("ideal_ranking[{index}] is missing a numeric score"))
                })?;
                entries.push(ScoredDoc { doc_id, score });
            }
            return Ok(Self::Explicit(entries));
        }

        Err(EvalError::data(
            "ideal_ranking entries must be all document ids or all {doc_id, score} entries",
        ))
    }

    fn from_click_counts(counts: &Map<String, Value>) -> EvalResult<Self> {
        let mut entries = Vec::with_capacity(counts.len());
        for (doc_id, count) in counts {
            let clicks = match count {
                Value::Object(metrics) => metrics.get("clicks").and_then(Value::as_u64),
                other => other.as_u64(),
            }
            .ok_or_else(|| {
                EvalError::data(format!("click count for {doc_id} must be a non-negative integer"))
            })?;
            entries.push(ClickCount {
                doc_id: doc_id.clone(),
                clicks,
            });
        }
        Ok(Self::Clicks(entries))
    }
}

/// Canonical string form of a document identifier: strings verbatim, numbers
/// in decimal, extended-JSON ObjectIds (`{"$oid": hex}`) as their hex.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Object(fields) if fields.len() == 1 => {
            fields.get("$oid").and_then(Value::as_str).map(str::to_string)
        }
        _ => None,
    }
}

/// One evaluation unit: a query and the ranking it is judged against.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationCase {
    pub query: Query,
    pub ideal_ranking: IdealRanking,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NdcgResult {
    pub query_id: String,
    pub k: usize,
    pub scoring_method: ScoringMethod,
    pub dcg: f64,
    pub idcg: f64,
    pub ndcg: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryFailure {
    pub query_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    /// Successful results in evaluation-set order.
    pub per_query: Vec<NdcgResult>,
    /// Mean over `per_query`; 0 when nothing was evaluated.
    pub mean_ndcg: f64,
    pub evaluated: usize,
    pub skipped: usize,
    pub failures: Vec<QueryFailure>,
}

impl BatchResult {
    pub fn from_parts(per_query: Vec<NdcgResult>, skipped: usize, failures: Vec<QueryFailure>) -> Self {
        let evaluated = per_query.len();
        let mean_ndcg = if evaluated == 0 {
            0.0
        } else {
            per_query.iter().map(|result| result.ndcg).sum::<f64>() / evaluated as f64
        };

        Self {
            per_query,
            mean_ndcg,
            evaluated,
            skipped,
            failures,
        }
    }

    pub fn get(&self, query_id: &str) -> Option<&NdcgResult> {
        self.per_query
            .iter()
            .find(|result| result.query_id == query_id)
    }

    pub fn has_successes(&self) -> bool {
        self.evaluated > 0
    }
}

/// Provenance of one evaluation run, persisted next to its results.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub k: usize,
    pub scoring_method: ScoringMethod,
    pub query_filter: String,
    pub search_database: String,
    pub search_collection: String,
    pub search_index: String,
    pub pipeline_path: String,
    pub pipeline_sha256: String,
}

pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ideal_ranking_parses_implicit_ids() {
        let ranking = IdealRanking::from_value(&json!(["doc1", "doc3", "doc5"]))
            .expect("implicit ranking should parse");
        assert_eq!(
            ranking,
            IdealRanking::Implicit(vec!["doc1".into(), "doc3".into(), "doc5".into()])
        );
    }

    #[test]
    fn ideal_ranking_parses_explicit_scores() {
        let ranking = IdealRanking::from_value(&json!([
            {"doc_id": "a", "score": 5},
            {"doc_id": "b", "score": 2.5}
        ]))
        .expect("explicit ranking should parse");
        let IdealRanking::Explicit(entries) = ranking else {
            panic!("expected explicit ranking");
        };
        assert_eq!(entries[0].doc_id, "a");
        assert_eq!(entries[0].score, 5.0);
        assert_eq!(entries[1].score, 2.5);
    }

    #[test]
    fn ideal_ranking_rejects_mixed_and_non_array_shapes() {
        let mixed = IdealRanking::from_value(&json!(["a", {"doc_id": "b", "score": 1}]));
        assert!(matches!(mixed, Err(EvalError::Data(_))));

        let scalar = IdealRanking::from_value(&json!("doc1"));
        assert!(matches!(scalar, Err(EvalError::Data(message)) if message.contains("string")));

        let missing_score = IdealRanking::from_value(&json!([{"doc_id": "a"}]));
        assert!(matches!(missing_score, Err(EvalError::Data(_))));
    }

    #[test]
    fn ideal_ranking_normalises_object_ids_and_numbers() {
        let oid = "65a1f0c2e4b0a1b2c3d4e5f6";
        let implicit = IdealRanking::from_value(&json!([{"$oid": oid}, 42, "doc3"])).unwrap();
        assert_eq!(
            implicit,
            IdealRanking::Implicit(vec![oid.into(), "42".into(), "doc3".into()])
        );

        let explicit = IdealRanking::from_value(&json!([
            {"doc_id": {"$oid": oid}, "score": 3},
            {"doc_id": 7, "score": 1}
        ]))
        .unwrap();
        let IdealRanking::Explicit(entries) = explicit else {
            panic!("expected explicit ranking");
        };
        assert_eq!(entries[0].doc_id, oid);
        assert_eq!(entries[1].doc_id, "7");

        let document = json!({"_id": {"$oid": oid}});
        assert_eq!(
            crate::pipeline::document_id(&document, "_id").as_deref(),
            Some(oid)
        );
    }

    #[test]
    fn ideal_ranking_parses_click_counts() {
        let ranking = IdealRanking::from_value(&json!({
            "doc1": {"clicks": 10, "impressions": 40},
            "doc2": 2
        }))
        .unwrap();
        assert_eq!(
            ranking,
            IdealRanking::Clicks(vec![
                ClickCount { doc_id: "doc1".into(), clicks: 10 },
                ClickCount { doc_id: "doc2".into(), clicks: 2 },
            ])
        );

        let negative = IdealRanking::from_value(&json!({"doc1": -3}));
        assert!(matches!(negative, Err(EvalError::Data(message)) if message.contains("doc1")));
    }

    #[test]
    fn query_value_accepts_text_and_vectors() {
        let text: QueryValue = serde_json::from_value(json!("machine learning")).unwrap();
        assert_eq!(text.as_text(), Some("machine learning"));

        let vector: QueryValue = serde_json::from_value(json!([0.25, -1.0])).unwrap();
        assert_eq!(vector.to_json(), json!([0.25, -1.0]));
        assert_eq!(vector.to_string(), "<vector dim=2>");
    }

    #[test]
    fn batch_result_mean_covers_successes_only() {
        let result = |query_id: &str, ndcg: f64| NdcgResult {
            query_id: query_id.to_string(),
            k: 10,
            scoring_method: ScoringMethod::Binary,
            dcg: ndcg,
            idcg: 1.0,
            ndcg,
        };
        let batch = BatchResult::from_parts(
            vec![result("q1", 1.0), result("q3", 0.5)],
            0,
            vec![QueryFailure {
                query_id: "q2".into(),
                reason: "boom".into(),
            }],
        );
        assert_eq!(batch.evaluated, 2);
        assert!((batch.mean_ndcg - 0.75).abs() < 1e-12);
        assert_eq!(batch.get("q3").map(|row| row.ndcg), Some(0.5));

        let empty = BatchResult::from_parts(Vec::new(), 4, Vec::new());
        assert!(!empty.has_successes());
        assert_eq!(empty.mean_ndcg, 0.0);
    }
}
