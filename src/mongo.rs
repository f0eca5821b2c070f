//! MongoDB-backed query executor and ideal-ranking store.
//!
//! Both sit on the synchronous driver client. Pipeline stages and ranking
//! filters cross the boundary as extended JSON; returned documents come back
//! as relaxed extended JSON, so ObjectIds read as `{"$oid": hex}`.

use mongodb::bson::{Bson, Document, doc};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::sync::{Client, Collection};
use serde_json::Value;
use tracing::info;

use crate::config::{QueryFilter, SearchTarget};
use crate::error::{EvalError, EvalResult};
use crate::model::json_kind;
use crate::pipeline::QueryExecutor;
use crate::rankings::{RankingRecord, RankingStore, records_from_values};

pub struct MongoBackend {
    client: Client,
}

impl MongoBackend {
    pub fn connect(uri: &str) -> EvalResult<Self> {
        let client = Client::with_uri_str(uri).map_err(|err| match err.kind.as_ref() {
            ErrorKind::InvalidArgument { .. } => {
                EvalError::configuration(format!("invalid MongoDB connection string: {err}"))
            }
            _ => classify_error("failed to create MongoDB client", &err),
        })?;
        Ok(Self { client })
    }

    /// Round-trips a `ping` so an unreachable store fails before any query runs.
    pub fn ping(&self, database: &str) -> EvalResult<()> {
        self.client
            .database(database)
            .run_command(doc! { "ping": 1 })
            .run()
            .map_err(|err| EvalError::connectivity(format!("ping against '{database}' failed: {err}")))?;
        Ok(())
    }

    pub fn executor(&self, target: &SearchTarget) -> MongoExecutor {
        MongoExecutor {
            collection: self
                .client
                .database(&target.database)
                .collection::<Document>(&target.collection),
        }
    }

    pub fn ranking_store(&self, database: &str, collection: &str) -> MongoRankingStore {
        MongoRankingStore {
            collection: self.client.database(database).collection::<Document>(collection),
        }
    }
}

pub struct MongoExecutor {
    collection: Collection<Document>,
}

impl QueryExecutor for MongoExecutor {
    fn execute(&self, pipeline: &[Value]) -> EvalResult<Vec<Value>> {
        let stages = stages_to_documents(pipeline)?;
        let cursor = self
            .collection
            .aggregate(stages)
            .run()
            .map_err(|err| classify_error("aggregation failed", &err))?;

        let mut documents = Vec::new();
        for document in cursor {
            let document = document.map_err(|err| classify_error("reading aggregation results failed", &err))?;
            documents.push(Bson::Document(document).into_relaxed_extjson());
        }
        Ok(documents)
    }
}

pub struct MongoRankingStore {
    collection: Collection<Document>,
}

impl RankingStore for MongoRankingStore {
    fn fetch_rankings(&self, filter: &QueryFilter) -> EvalResult<Vec<RankingRecord>> {
        let filter_document = json_to_document(&Value::Object(filter.fields().clone()))
            .map_err(|err| EvalError::configuration(format!("query filter is not valid BSON: {err}")))?;

        let cursor = self
            .collection
            .find(filter_document)
            .run()
            .map_err(|err| classify_error("ranking lookup failed", &err))?;

        let mut values = Vec::new();
        for document in cursor {
            let document = document.map_err(|err| classify_error("reading ranking records failed", &err))?;
            values.push(Bson::Document(document).into_relaxed_extjson());
        }

        info!(
            collection = %self.collection.name(),
            records = values.len(),
            "retrieved ranking records"
        );
        Ok(records_from_values(values))
    }
}

/// Converts JSON stages to BSON documents; a non-object stage is an execution error.
pub fn stages_to_documents(pipeline: &[Value]) -> EvalResult<Vec<Document>> {
    pipeline
        .iter()
        .enumerate()
        .map(|(index, stage)| {
            json_to_document(stage).map_err(|err| {
                EvalError::execution(format!("pipeline stage {index} is not a valid document: {err}"))
            })
        })
        .collect()
}

fn json_to_document(value: &Value) -> Result<Document, String> {
    match Bson::try_from(value.clone()).map_err(|err| err.to_string())? {
        Bson::Document(document) => Ok(document),
        _ => Err(format!("expected an object, got {}", json_kind(value))),
    }
}

/// Store-unreachable failures are fatal for a batch; everything else is
/// attributed to the single pipeline run that hit it.
fn classify_error(context: &str, err: &MongoError) -> EvalError {
    let message = format!("{context}: {err}");
    match err.kind.as_ref() {
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::DnsResolve { .. }
        | ErrorKind::Authentication { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => EvalError::Connectivity(message),
        _ => EvalError::Execution(message),
    }
}
