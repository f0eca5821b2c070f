//! Aggregation pipeline templates and the query executor contract.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{EvalError, EvalResult};
use crate::model::{QueryValue, id_string, json_kind};

pub const QUERY_PLACEHOLDER: &str = "{{QUERY}}";
pub const INDEX_PLACEHOLDER: &str = "{{INDEX_NAME}}";

/// Runs an aggregation-style pipeline and returns documents in rank order.
pub trait QueryExecutor: Send + Sync {
    /// Failures are `Execution` for a bad pipeline or a transient fault, and
    /// `Connectivity` when the store itself cannot be reached.
    fn execute(&self, pipeline: &[Value]) -> EvalResult<Vec<Value>>;
}

pub fn load_pipeline(path: &Path) -> EvalResult<Vec<Value>> {
    if !path.exists() {
        return Err(EvalError::configuration(format!(
            "pipeline file not found: {}",
            path.display()
        )));
    }

    let raw = fs::read(path).map_err(|err| {
        EvalError::configuration(format!("failed to read pipeline {}: {err}", path.display()))
    })?;
    let value: Value = serde_json::from_slice(&raw).map_err(|err| {
        EvalError::configuration(format!("failed to parse pipeline {}: {err}", path.display()))
    })?;

    parse_pipeline(value)
}

/// Accepts a bare stage array or an object wrapping it under `pipeline`.
pub fn parse_pipeline(value: Value) -> EvalResult<Vec<Value>> {
    match value {
        Value::Array(stages) => Ok(stages),
        Value::Object(mut wrapper) => match wrapper.remove("pipeline") {
            Some(Value::Array(stages)) => Ok(stages),
            Some(other) => Err(EvalError::configuration(format!(
                "pipeline key must hold an array, got {}",
                json_kind(&other)
            ))),
            None => Err(EvalError::configuration(
                "invalid pipeline file format: expected an array or an object with a 'pipeline' key",
            )),
        },
        other => Err(EvalError::configuration(format!(
            "invalid pipeline file format: expected an array, got {}",
            json_kind(&other)
        ))),
    }
}

/// Substitutes the query and index placeholders in every string value.
///
/// A string that is exactly `{{QUERY}}` becomes the query value itself, so
/// vector queries land as arrays. Keys and non-string values are untouched.
pub fn inject_query(pipeline: &[Value], query: &QueryValue, index_name: &str) -> Vec<Value> {
    pipeline
        .iter()
        .map(|stage| substitute(stage, query, index_name))
        .collect()
}

fn substitute(value: &Value, query: &QueryValue, index_name: &str) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, field)| (key.clone(), substitute(field, query, index_name)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, query, index_name))
                .collect(),
        ),
        Value::String(text) if text == QUERY_PLACEHOLDER => query.to_json(),
        Value::String(text) => {
            let mut replaced = text.replace(INDEX_PLACEHOLDER, index_name);
            if let Some(query_text) = query.as_text() {
                replaced = replaced.replace(QUERY_PLACEHOLDER, query_text);
            }
            Value::String(replaced)
        }
        other => other.clone(),
    }
}

pub fn placeholder_regex() -> EvalResult<Regex> {
    Regex::new(r"\{\{[A-Za-z0-9_]+\}\}")
        .map_err(|err| EvalError::configuration(format!("failed to compile placeholder regex: {err}")))
}

/// Placeholder tokens in string values, sorted and deduplicated.
pub fn placeholders_in(pattern: &Regex, pipeline: &[Value]) -> Vec<String> {
    let mut found = BTreeSet::new();
    for stage in pipeline {
        collect_placeholders(pattern, stage, &mut found);
    }
    found.into_iter().collect()
}

fn collect_placeholders(pattern: &Regex, value: &Value, found: &mut BTreeSet<String>) {
    match value {
        Value::Object(fields) => fields
            .values()
            .for_each(|field| collect_placeholders(pattern, field, found)),
        Value::Array(items) => items
            .iter()
            .for_each(|item| collect_placeholders(pattern, item, found)),
        Value::String(text) => {
            for token in pattern.find_iter(text) {
                found.insert(token.as_str().to_string());
            }
        }
        _ => {}
    }
}

/// Normalises a document's identifier field with [`id_string`]; other
/// structured ids fall back to their compact JSON text.
pub fn document_id(document: &Value, id_field: &str) -> Option<String> {
    match document.get(id_field)? {
        Value::Null => None,
        other => Some(id_string(other).unwrap_or_else(|| other.to_string())),
    }
}

/// Materialises the template for one query and returns ranked document ids.
pub struct PipelineRunner<'a> {
    executor: &'a dyn QueryExecutor,
    template: &'a [Value],
    index_name: &'a str,
    id_field: &'a str,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(
        executor: &'a dyn QueryExecutor,
        template: &'a [Value],
        index_name: &'a str,
        id_field: &'a str,
    ) -> EvalResult<Self> {
        let pattern = placeholder_regex()?;
        let placeholders = placeholders_in(&pattern, template);
        if !placeholders.iter().any(|token| token == QUERY_PLACEHOLDER) {
            warn!(
                placeholder = QUERY_PLACEHOLDER,
                "pipeline template never references the query; every query runs the same pipeline"
            );
        }
        let unknown = placeholders
            .iter()
            .filter(|token| *token != QUERY_PLACEHOLDER && *token != INDEX_PLACEHOLDER)
            .cloned()
            .collect::<Vec<_>>();
        if !unknown.is_empty() {
            warn!(placeholders = ?unknown, "pipeline template contains placeholders that are never substituted");
        }

        Ok(Self {
            executor,
            template,
            index_name,
            id_field,
        })
    }

    pub fn run(&self, query: &QueryValue) -> EvalResult<Vec<String>> {
        let pipeline = inject_query(self.template, query, self.index_name);
        let documents = self.executor.execute(&pipeline)?;

        let mut ids = Vec::with_capacity(documents.len());
        for (rank, document) in documents.iter().enumerate() {
            match document_id(document, self.id_field) {
                Some(id) => ids.push(id),
                None => debug!(rank = rank + 1, id_field = self.id_field, "result document has no id; skipped"),
            }
        }
        Ok(ids)
    }
}
