//! Ideal-ranking records and the stores that supply them.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::info;

use crate::config::QueryFilter;
use crate::error::{EvalError, EvalResult};
use crate::model::{EvaluationCase, IdealRanking, Query, QueryValue, json_kind};

const RESERVED_FIELDS: [&str; 4] = ["_id", "query_id", "query", "ideal_ranking"];

/// Source of ranking records, one per query.
pub trait RankingStore {
    fn fetch_rankings(&self, filter: &QueryFilter) -> EvalResult<Vec<RankingRecord>>;
}

/// A ranking record as stored, before it is checked for shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingRecord {
    position: usize,
    raw: Value,
}

impl RankingRecord {
    pub fn new(position: usize, raw: Value) -> Self {
        Self { position, raw }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// The record's `query_id`, or `record#<position>` when it has none.
    pub fn label(&self) -> String {
        self.raw
            .get("query_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("record#{}", self.position))
    }

    pub fn matches(&self, filter: &QueryFilter) -> bool {
        match &self.raw {
            Value::Object(fields) => filter.matches(fields),
            _ => filter.fields().is_empty(),
        }
    }

    pub fn to_case(&self) -> EvalResult<EvaluationCase> {
        let Value::Object(fields) = &self.raw else {
            return Err(EvalError::data(format!(
                "ranking record must be an object, got {}",
                json_kind(&self.raw)
            )));
        };

        let query_id = match fields.get("query_id") {
            Some(Value::String(query_id)) if !query_id.trim().is_empty() => query_id.clone(),
            Some(_) => return Err(EvalError::data("query_id must be a non-empty string")),
            None => return Err(EvalError::data("ranking record is missing query_id")),
        };

        let query = match fields.get("query") {
            Some(Value::String(text)) if text.trim().is_empty() => {
                return Err(EvalError::data("query must not be empty"));
            }
            Some(value) => serde_json::from_value::<QueryValue>(value.clone()).map_err(|_| {
                EvalError::data(format!(
                    "query must be a string or an array of numbers, got {}",
                    json_kind(value)
                ))
            })?,
            None => return Err(EvalError::data("ranking record is missing query")),
        };

        let ideal_ranking = fields
            .get("ideal_ranking")
            .ok_or_else(|| EvalError::data("ranking record is missing ideal_ranking"))
            .and_then(IdealRanking::from_value)?;

        let attributes = fields
            .iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<Map<String, Value>>();

        Ok(EvaluationCase {
            query: Query {
                query_id,
                query,
                attributes,
            },
            ideal_ranking,
        })
    }
}

pub fn records_from_values(values: Vec<Value>) -> Vec<RankingRecord> {
    values
        .into_iter()
        .enumerate()
        .map(|(position, raw)| RankingRecord::new(position, raw))
        .collect()
}

/// Ranking records kept in a JSON file: an array, or `{"rankings": [...]}`.
#[derive(Debug, Clone)]
pub struct JsonFileRankingStore {
    path: PathBuf,
}

impl JsonFileRankingStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl RankingStore for JsonFileRankingStore {
    fn fetch_rankings(&self, filter: &QueryFilter) -> EvalResult<Vec<RankingRecord>> {
        let raw = fs::read(&self.path).map_err(|err| {
            EvalError::configuration(format!(
                "failed to read rankings file {}: {err}",
                self.path.display()
            ))
        })?;
        let value: Value = serde_json::from_slice(&raw).map_err(|err| {
            EvalError::configuration(format!(
                "failed to parse rankings file {}: {err}",
                self.path.display()
            ))
        })?;

        let values = match value {
            Value::Array(values) => values,
            Value::Object(mut wrapper) => match wrapper.remove("rankings") {
                Some(Value::Array(values)) => values,
                _ => {
                    return Err(EvalError::configuration(format!(
                        "rankings file {} must hold an array or a 'rankings' array",
                        self.path.display()
                    )));
                }
            },
            other => {
                return Err(EvalError::configuration(format!(
                    "rankings file {} must hold an array, got {}",
                    self.path.display(),
                    json_kind(&other)
                )));
            }
        };

        let records = records_from_values(values)
            .into_iter()
            .filter(|record| record.matches(filter))
            .collect::<Vec<_>>();
        info!(
            path = %self.path.display(),
            records = records.len(),
            "loaded ranking records from file"
        );
        Ok(records)
    }
}
