//! Error types for the sort pipeline.

use terasort_common::{CommonError, Diagnose};
use thiserror::Error;

use crate::types::TaskId;

/// Errors raised by the sort pipeline.
#[derive(Error, Debug)]
pub enum SortError {
    #[error("Corrupt shard {location}: {reason}")]
    CorruptShard { location: String, reason: String },

    #[error("Map task {map_id} did not complete: {reason}")]
    MissingMapResult { map_id: u32, reason: String },

    #[error("Partition configuration error: {0}")]
    PartitionConfigError(String),

    #[error("Object store unavailable during {operation}")]
    StoreUnavailable {
        operation: String,
        #[source]
        source: CommonError,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Row count mismatch: {expected} rows read by map tasks, {actual} rows written")]
    RowCountMismatch { expected: u64, actual: u64 },

    #[error("Task {task_id} failed")]
    TaskFailed {
        task_id: TaskId,
        #[source]
        source: Box<SortError>,
    },

    #[error("Task {task_id} panicked: {message}")]
    TaskPanicked { task_id: TaskId, message: String },

    #[error("Task {task_id} aborted: {reason}")]
    TaskAborted { task_id: TaskId, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for sort operations.
pub type SortResult<T> = Result<T, SortError>;

impl SortError {
    /// Wrap a storage failure with the operation that hit it.
    pub fn store<S: Into<String>>(operation: S, source: CommonError) -> Self {
        SortError::StoreUnavailable {
            operation: operation.into(),
            source,
        }
    }

    /// Stable name of the error kind, used in job failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SortError::CorruptShard { .. } => "CorruptShard",
            SortError::MissingMapResult { .. } => "MissingMapResult",
            SortError::PartitionConfigError(_) => "PartitionConfigError",
            SortError::StoreUnavailable { .. } => "StoreUnavailable",
            SortError::InvalidConfig(_) => "InvalidConfig",
            SortError::InvalidInput(_) => "InvalidInput",
            SortError::RowCountMismatch { .. } => "RowCountMismatch",
            SortError::TaskFailed { source, .. } => source.kind(),
            SortError::TaskPanicked { .. } => "TaskPanicked",
            SortError::TaskAborted { .. } => "TaskAborted",
            SortError::Serialization(_) => "Serialization",
        }
    }

    /// Id of the task that failed, if this error came from one.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            SortError::TaskFailed { task_id, .. }
            | SortError::TaskPanicked { task_id, .. }
            | SortError::TaskAborted { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// The storage failure at the root of this error, if any.
    pub fn store_source(&self) -> Option<&CommonError> {
        match self {
            SortError::StoreUnavailable { source, .. } => Some(source),
            SortError::TaskFailed { source, .. } => source.store_source(),
            _ => None,
        }
    }

    /// Whether an executor may re-run the task that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SortError::StoreUnavailable { source, .. } => source.is_retryable(),
            SortError::TaskFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// This error and all of its sources, joined with `": "`.
    pub fn chain(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}

impl From<serde_json::Error> for SortError {
    fn from(error: serde_json::Error) -> Self {
        SortError::Serialization(error.to_string())
    }
}
