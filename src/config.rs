use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::cli::{EvaluateArgs, ScoringMethod};
use crate::error::{EvalError, EvalResult};
use crate::model::json_kind;

pub const MIN_K: usize = 1;
pub const MAX_K: usize = 10;

/// Conjunctive equality filter over ranking record fields, read the way the
/// ranking collection's `find` reads it: dotted keys are paths into nested
/// documents, and an array field matches when it equals or contains the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    fields: Map<String, Value>,
}

impl QueryFilter {
    pub fn parse(raw: &str) -> EvalResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| EvalError::configuration(format!("invalid query filter JSON: {err}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> EvalResult<Self> {
        let Value::Object(fields) = value else {
            return Err(EvalError::configuration(format!(
                "query filter must be a JSON object, got {}",
                json_kind(&value)
            )));
        };

        let operator = fields.iter().find_map(|(key, value)| {
            if key.starts_with('$') {
                return Some(key.as_str());
            }
            value
                .as_object()
                .and_then(|nested| nested.keys().find(|nested_key| nested_key.starts_with('$')))
                .map(String::as_str)
        });
        if let Some(key) = operator {
            return Err(EvalError::configuration(format!(
                "query filter supports equality matches only, found operator '{key}'"
            )));
        }

        Ok(Self { fields })
    }

    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        self.fields.iter().all(|(path, expected)| {
            lookup_path(record, path).is_some_and(|actual| {
                actual == expected
                    || actual
                        .as_array()
                        .is_some_and(|items| items.contains(expected))
            })
        })
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_json_string(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }
}

fn lookup_path<'v>(record: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTarget {
    pub database: String,
    pub collection: String,
    pub index: String,
}

/// Settings for one evaluation run, validated once at the entry point.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub pipeline_path: PathBuf,
    pub k: usize,
    pub scoring: ScoringMethod,
    pub decay_scaling_factor: f64,
    pub click_threshold: u64,
    pub query_filter: QueryFilter,
    pub uri: String,
    pub eval_database: String,
    pub rankings_collection: String,
    pub search: SearchTarget,
    pub id_field: String,
    pub concurrency: usize,
    pub rankings_path: Option<PathBuf>,
    pub results_db: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub debug: bool,
    pub print: bool,
}

impl EvalConfig {
    pub fn from_args(args: &EvaluateArgs) -> EvalResult<Self> {
        validate_k(args.k)?;

        if !args.decay_scaling_factor.is_finite() || args.decay_scaling_factor < 0.0 {
            return Err(EvalError::configuration(format!(
                "decay scaling factor must be a non-negative number, got {}",
                args.decay_scaling_factor
            )));
        }
        if args.concurrency == 0 {
            return Err(EvalError::configuration("concurrency must be at least 1"));
        }
        if args.id_field.trim().is_empty() {
            return Err(EvalError::configuration("id field must not be empty"));
        }

        Ok(Self {
            pipeline_path: args.pipeline.clone(),
            k: args.k,
            scoring: args.scoring,
            decay_scaling_factor: args.decay_scaling_factor,
            click_threshold: args.click_threshold,
            query_filter: QueryFilter::parse(&args.query_filter)?,
            uri: args.uri.clone(),
            eval_database: args.eval_database.clone(),
            rankings_collection: args.rankings_collection.clone(),
            search: SearchTarget {
                database: args.search_database.clone(),
                collection: args.search_collection.clone(),
                index: args.search_index.clone(),
            },
            id_field: args.id_field.clone(),
            concurrency: args.concurrency,
            rankings_path: args.rankings_path.clone(),
            results_db: args.results_db.clone(),
            report_path: args.report_path.clone(),
            debug: args.debug,
            print: args.print,
        })
    }
}

pub fn validate_k(k: usize) -> EvalResult<usize> {
    if !(MIN_K..=MAX_K).contains(&k) {
        return Err(EvalError::configuration(format!(
            "k must be between {MIN_K} and {MAX_K}, got {k}"
        )));
    }
    Ok(k)
}
