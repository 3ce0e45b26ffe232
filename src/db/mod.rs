use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::{CatalogRow, RawResult};

pub mod postgres;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("{0}")]
    Query(String),

    #[error("Timed out acquiring a connection after {0:?}")]
    AcquireTimeout(Duration),
}

/// Pool sizing and session settings applied to every new driver.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Server-side `statement_timeout`; `None` leaves the server default.
    pub statement_timeout: Option<Duration>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(3),
            statement_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// A connected, pooled handle to one target database.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Runs a single read statement; column names come from the result descriptor.
    ///
    /// Each call runs in its own read-only transaction. `timeout`, when set,
    /// becomes the server-side `statement_timeout` for that transaction.
    async fn query(&self, sql: &str, timeout: Option<Duration>) -> Result<RawResult, DbError>;
    /// Columns of every table in the public schema, ordered by table then position.
    async fn catalog(&self) -> Result<Vec<CatalogRow>, DbError>;
    async fn ping(&self) -> Result<(), DbError>;
    /// Closes all pooled connections. Idempotent.
    async fn close(&self);
}

/// Opens drivers from a DSN.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, dsn: &str) -> Result<Arc<dyn DatabaseDriver>, DbError>;
}
