//! Error taxonomy shared by the query path and the export pipeline

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown view: {0}")]
    UnknownView(String),

    #[error("column '{column}' is not allowed for view '{view}'")]
    InvalidColumn { view: String, column: String },

    #[error("column '{0}' has no field type classification")]
    InvalidFieldType(String),

    #[error("invalid geometry filter: {0}")]
    InvalidGeometry(String),

    #[error("invalid filter value for '{column}': {reason}")]
    InvalidFilterValue { column: String, reason: String },

    #[error("no data found")]
    EmptyResult,

    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    QueueError(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("worker failure: {0}")]
    WorkerFailure(String),

    /// Static configuration is inconsistent (detected once at startup).
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Validation errors are raised before any database call and are never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownView(_)
                | Error::InvalidColumn { .. }
                | Error::InvalidFieldType(_)
                | Error::InvalidGeometry(_)
                | Error::InvalidFilterValue { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::EmptyResult | Error::JobNotFound(_))
    }

    pub(crate) fn invalid_value(column: &str, reason: impl Into<String>) -> Self {
        Error::InvalidFilterValue {
            column: column.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Self {
        Error::Format(e.to_string())
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Error::Format(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Format(e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Format(e.to_string())
    }
}
