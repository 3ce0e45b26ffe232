use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{QueryError, Result};
use crate::models::{
    ConnectionRecord, Engine, OutputType, QueryResponse, QueryResult, SchemaSnapshot, TableData,
    VisualizationHint,
};
use crate::schema::schema_prompt;
use crate::shape;
use crate::state::AppState;
use crate::validator::{extract_sql, validate};
use crate::vault::scrub_dsn_password;

const DEFAULT_PORT: u16 = 5432;
const FALLBACK_EXPLANATION: &str =
    "I'm sorry, I don't see how to turn that into a database query. Could you rephrase?";

/// Per-call limits for [`execute_query`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Overrides the configured query timeout.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl ExecuteOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// Validates and runs `sql` against the database behind `connection_id`.
pub async fn execute_query(
    state: &AppState,
    connection_id: &str,
    sql: &str,
    options: &ExecuteOptions,
) -> Result<QueryResult> {
    let record = find_connection(state, connection_id).await?;

    let validation = validate(sql);
    if !validation.valid {
        let reason = validation.reason.unwrap_or_default();
        tracing::warn!(connection_id, %reason, "Rejected SQL");
        return Err(QueryError::InvalidQuery(reason));
    }

    let dsn = resolve_dsn(state, &record)?;
    let timeout = options.timeout.unwrap_or(state.query_timeout);

    let run = async {
        let driver = state.pools.acquire(connection_id, &dsn).await?;
        driver.query(sql, Some(timeout)).await
    };

    let start = Instant::now();
    let raw = tokio::select! {
        _ = options.cancel.cancelled() => {
            tracing::info!(connection_id, "Query cancelled by caller");
            return Err(QueryError::Cancelled);
        }
        outcome = tokio::time::timeout(timeout, run) => match outcome {
            Err(_) => {
                tracing::warn!(connection_id, timeout_ms = timeout.as_millis() as u64, "Query timed out");
                return Err(QueryError::Timeout(timeout));
            }
            Ok(result) => result.map_err(|e| {
                let err = QueryError::from(e);
                match err {
                    QueryError::Execution(message) => {
                        QueryError::Execution(scrub_dsn_password(&message, &dsn))
                    }
                    other => other,
                }
            }),
        },
    };
    let raw = match raw {
        Ok(raw) => raw,
        Err(err) => {
            tracing::error!(connection_id, error = %err, "Error executing query");
            return Err(err);
        }
    };
    let elapsed_ms = start.elapsed().as_micros() as f64 / 1000.0;

    let visualization_hint = shape::visualization_hint(&raw.rows, &raw.columns);
    let title = Some(shape::title(sql));

    tracing::info!(connection_id, rows = raw.rows.len(), elapsed_ms, "SQL executed");

    Ok(QueryResult {
        rows: raw.rows,
        columns: raw.columns,
        executed_sql: sql.to_string(),
        visualization_hint,
        title,
        elapsed_ms,
    })
}

/// Cached schema for `connection_id`.
pub async fn get_schema(state: &AppState, connection_id: &str) -> Result<Arc<SchemaSnapshot>> {
    let record = find_connection(state, connection_id).await?;
    let dsn = resolve_dsn(state, &record)?;
    state.schemas.introspect(&dsn, connection_id).await
}

/// Cached schema rendered for a model prompt.
pub async fn get_schema_prompt(state: &AppState, connection_id: &str) -> Result<String> {
    let schema = get_schema(state, connection_id).await?;
    Ok(schema_prompt(&schema))
}

/// Opens (or reuses) the pool for a connection and round-trips a ping.
pub async fn test_connection(state: &AppState, connection_id: &str) -> Result<()> {
    let record = find_connection(state, connection_id).await?;
    let dsn = resolve_dsn(state, &record)?;
    let driver = state.pools.acquire(connection_id, &dsn).await?;
    driver
        .ping()
        .await
        .map_err(|e| QueryError::Execution(scrub_dsn_password(&e.to_string(), &dsn)))?;
    tracing::info!(connection_id, "Connection OK");
    Ok(())
}

/// Clears one connection's cached schema, or all of them.
pub async fn clear_schema_cache(state: &AppState, connection_id: Option<&str>) {
    state.schemas.clear(connection_id).await;
}

/// Drops the pool and cached schema for one connection.
pub async fn disconnect(state: &AppState, connection_id: &str) {
    state.pools.remove(connection_id).await;
    state.schemas.clear(Some(connection_id)).await;
}

async fn find_connection(state: &AppState, connection_id: &str) -> Result<ConnectionRecord> {
    state
        .store
        .get(connection_id)
        .await?
        .ok_or_else(|| QueryError::NotFound(connection_id.to_string()))
}

/// Produces the plaintext DSN for a record.
///
/// An encrypted DSN wins; otherwise host/port/database are combined with the
/// process-wide legacy credentials.
pub fn resolve_dsn(state: &AppState, record: &ConnectionRecord) -> Result<String> {
    if record.engine != Engine::Postgresql {
        return Err(QueryError::UnsupportedEngine(record.engine.as_str().to_string()));
    }

    if let Some(ciphertext) = &record.encrypted_dsn {
        return Ok(state.vault.decrypt(ciphertext)?);
    }

    match (&record.host, &record.database) {
        (Some(host), Some(database)) => {
            tracing::warn!(
                connection_id = %record.id,
                "No encrypted DSN stored; using process credentials"
            );
            let creds = &state.legacy_credentials;
            Ok(format!(
                "postgresql://{}:{}@{}:{}/{}",
                utf8_percent_encode(&creds.username, NON_ALPHANUMERIC),
                utf8_percent_encode(&creds.password, NON_ALPHANUMERIC),
                host,
                record.port.unwrap_or(DEFAULT_PORT),
                utf8_percent_encode(database, NON_ALPHANUMERIC)
            ))
        }
        _ => Err(QueryError::Credential(format!(
            "connection {} has neither an encrypted DSN nor host and database",
            record.id
        ))),
    }
}

/// Chart directive from the model.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ChartSpec {
    #[serde(rename = "type", default)]
    pub chart_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// The model's JSON envelope. Nothing in it is trusted.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelOutput {
    #[serde(default)]
    pub output_type: Option<OutputType>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub chart_spec: Option<ChartSpec>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
}

/// Parses model text, falling back to SQL extraction when it is not JSON.
pub fn parse_model_output(text: &str) -> ModelOutput {
    if let Ok(output) = serde_json::from_str::<ModelOutput>(text.trim()) {
        return output;
    }

    match extract_sql(text) {
        Some(sql) => ModelOutput {
            output_type: Some(OutputType::Table),
            sql: Some(sql),
            ..Default::default()
        },
        None => ModelOutput {
            output_type: Some(OutputType::Text),
            explanation: Some(text.trim().to_string()).filter(|s| !s.is_empty()),
            ..Default::default()
        },
    }
}

/// Turns a model envelope into a response, executing its SQL if any.
pub async fn respond(
    state: &AppState,
    connection_id: &str,
    output: ModelOutput,
    options: &ExecuteOptions,
) -> QueryResponse {
    let sql = output
        .sql
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let output_type = output.output_type.unwrap_or(match sql {
        Some(_) => OutputType::Table,
        None => OutputType::Text,
    });

    let sql = match (sql, output_type) {
        (Some(sql), OutputType::Table | OutputType::Chart) => sql,
        _ => {
            return QueryResponse {
                output_type: OutputType::Text,
                explanation: Some(
                    output
                        .explanation
                        .or(output.answer)
                        .unwrap_or_else(|| FALLBACK_EXPLANATION.to_string()),
                ),
                ..Default::default()
            }
        }
    };

    let mut result = match execute_query(state, connection_id, sql, options).await {
        Ok(result) => result,
        Err(err) => return error_response(&err, Some(sql)),
    };

    if output_type == OutputType::Chart {
        if let Some(spec) = &output.chart_spec {
            result.visualization_hint = match spec.chart_type.as_deref() {
                Some("bar") => VisualizationHint::Bar,
                _ => VisualizationHint::Line,
            };
            result.title = Some(
                spec.title
                    .clone()
                    .unwrap_or_else(|| "Query Results".to_string()),
            );
        }
    }

    QueryResponse {
        output_type,
        sql: Some(result.executed_sql),
        data: Some(TableData {
            columns: result.columns,
            rows: result.rows,
        }),
        visualization_hint: Some(result.visualization_hint),
        title: result.title,
        explanation: Some(
            output
                .explanation
                .unwrap_or_else(|| "Query executed successfully".to_string()),
        ),
        error: None,
    }
}

/// Envelope for a failed call: `error` set, no data, attempted SQL echoed.
pub fn error_response(err: &QueryError, sql: Option<&str>) -> QueryResponse {
    QueryResponse {
        output_type: OutputType::Table,
        sql: sql.map(str::to_string),
        data: None,
        visualization_hint: None,
        title: None,
        explanation: None,
        error: Some(err.to_string()),
    }
}

/// Produces SQL for a question. Implemented outside this crate.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// Returns raw model text, ideally a JSON [`ModelOutput`] envelope.
    async fn generate(&self, question: &str, schema_prompt: &str) -> Result<String>;
}

/// Full round trip: schema, model, validation, execution, shaping.
pub async fn ask(
    state: &AppState,
    generator: &dyn SqlGenerator,
    connection_id: &str,
    question: &str,
    options: &ExecuteOptions,
) -> QueryResponse {
    tracing::info!(connection_id, "Fetching schema");
    let prompt = match get_schema_prompt(state, connection_id).await {
        Ok(prompt) => prompt,
        Err(err) => {
            tracing::error!(connection_id, error = %err, "Error getting database schema");
            return error_response(&err, None);
        }
    };

    let text = match generator.generate(question, &prompt).await {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(connection_id, error = %err, "Model call failed");
            return error_response(&err, None);
        }
    };

    respond(state, connection_id, parse_model_output(&text), options).await
}
