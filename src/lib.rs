pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod schema;
pub mod shape;
pub mod state;
pub mod storage;
pub mod validator;
pub mod vault;

pub use commands::{ask, execute_query, get_schema, ExecuteOptions, SqlGenerator};
pub use config::Config;
pub use error::{QueryError, Result};
pub use state::AppState;

use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
