//! Error types for the query pipeline.

use std::time::Duration;
use thiserror::Error;

use crate::db::DbError;
use crate::vault::VaultError;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, QueryError>;

/// Errors surfaced to callers of the pipeline.
///
/// Every variant is terminal for the current call; nothing is retried.
#[derive(Error, Debug)]
pub enum QueryError {
    /// Connection id did not resolve to a record
    #[error("Database connection not found: {0}")]
    NotFound(String),

    /// Candidate SQL was rejected by the validator
    #[error("Invalid SQL query: {0}")]
    InvalidQuery(String),

    /// Ciphertext malformed or key misconfigured
    #[error("Credential error: {0}")]
    Credential(String),

    /// Record names an engine other than PostgreSQL
    #[error("Only PostgreSQL connections are currently supported (got '{0}')")]
    UnsupportedEngine(String),

    /// Catalog query failed
    #[error("Schema introspection failed for connectionId {connection_id}: {message}")]
    SchemaIntrospection {
        connection_id: String,
        message: String,
    },

    /// The validated statement failed at the database
    #[error("Failed to execute query: {0}")]
    Execution(String),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Query was cancelled")]
    Cancelled,

    /// The SQL-generating model collaborator failed
    #[error("Model error: {0}")]
    Model(String),

    /// Connection store could not be read
    #[error("Connection store error: {0}")]
    Storage(String),
}

impl QueryError {
    /// Stable machine-readable code for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::NotFound(_) => "NOT_FOUND",
            QueryError::InvalidQuery(_) => "INVALID_QUERY",
            QueryError::Credential(_) => "CREDENTIAL_ERROR",
            QueryError::UnsupportedEngine(_) => "UNSUPPORTED_ENGINE",
            QueryError::SchemaIntrospection { .. } => "SCHEMA_INTROSPECTION_ERROR",
            QueryError::Execution(_) | QueryError::Timeout(_) | QueryError::Cancelled => {
                "EXECUTION_ERROR"
            }
            QueryError::Model(_) => "MODEL_ERROR",
            QueryError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// HTTP-style status a presentation layer can map the error onto.
    pub fn status_code(&self) -> u16 {
        match self {
            QueryError::NotFound(_) => 404,
            QueryError::InvalidQuery(_) | QueryError::UnsupportedEngine(_) => 400,
            QueryError::Timeout(_) => 504,
            QueryError::Cancelled => 499,
            QueryError::Model(_) => 502,
            _ => 500,
        }
    }

    /// Whether the SQL reached the database (or was about to).
    ///
    /// Validation failures never count as an attempt.
    pub fn sql_was_attempted(&self) -> bool {
        matches!(
            self,
            QueryError::Execution(_) | QueryError::Timeout(_) | QueryError::Cancelled
        )
    }
}

impl From<VaultError> for QueryError {
    fn from(err: VaultError) -> Self {
        QueryError::Credential(err.to_string())
    }
}

impl From<DbError> for QueryError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::AcquireTimeout(waited) => QueryError::Timeout(waited),
            other => QueryError::Execution(other.to_string()),
        }
    }
}
