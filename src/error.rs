use thiserror::Error;

/// Failures raised while evaluating a batch of queries.
///
/// `Data` and `Execution` are local to one query and are recorded as batch
/// failures. `Configuration` and `Connectivity` abort the run.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("data error: {0}")]
    Data(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("connectivity error: {0}")]
    Connectivity(String),
    #[error("batch aborted after {completed} completed queries: {source}")]
    BatchAborted {
        completed: usize,
        #[source]
        source: Box<EvalError>,
    },
}

impl EvalError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    /// True for errors that only invalidate the query that raised them.
    pub fn is_per_query(&self) -> bool {
        matches!(self, Self::Data(_) | Self::Execution(_))
    }
}

pub type EvalResult<T> = std::result::Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::EvalError;

    #[test]
    fn per_query_errors_are_data_and_execution_only() {
        assert!(EvalError::data("dup").is_per_query());
        assert!(EvalError::execution("bad stage").is_per_query());
        assert!(!EvalError::configuration("k").is_per_query());
        assert!(!EvalError::connectivity("down").is_per_query());
    }

    #[test]
    fn batch_aborted_message_carries_completed_count_and_cause() {
        let error = EvalError::BatchAborted {
            completed: 3,
            source: Box::new(EvalError::connectivity("server selection timeout")),
        };
        let message = error.to_string();
        assert!(message.contains("after 3 completed queries"), "{message}");
        assert!(message.contains("server selection timeout"), "{message}");
    }
}
