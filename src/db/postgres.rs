use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgRow, PgValueFormat};
use sqlx::{Column, Connection, Executor, Row, Statement, TypeInfo};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::{Connector, DatabaseDriver, DbError, DriverOptions};
use crate::models::{CatalogRow, RawResult, Row as JsonRow};
use crate::vault::{redact_dsn, scrub_dsn_password};

const CATALOG_SQL: &str = r#"
    SELECT
        table_name::text AS table_name,
        column_name::text AS column_name,
        data_type::text AS data_type,
        is_nullable::text AS is_nullable
    FROM information_schema.columns
    WHERE table_schema = 'public'
    ORDER BY table_name, ordinal_position
"#;

pub struct PostgresDriver {
    pool: sqlx::PgPool,
    connect_options: PgConnectOptions,
    statement_timeout: Option<Duration>,
}

impl PostgresDriver {
    pub async fn connect(dsn: &str, options: &DriverOptions) -> Result<Self, DbError> {
        let mut connect_options = PgConnectOptions::from_str(dsn)
            .map_err(|e| DbError::Connect(scrub_dsn_password(&e.to_string(), dsn)))?;

        // Session defaults only. Every query also pins its own transaction,
        // because a session setting can be changed by the statement itself.
        let mut session = vec![("default_transaction_read_only", "on".to_string())];
        if let Some(timeout) = options.statement_timeout {
            session.push(("statement_timeout", timeout.as_millis().to_string()));
        }
        connect_options = connect_options.options(session);

        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect_options.clone())
            .await
            .map_err(|e| match e {
                sqlx::Error::PoolTimedOut => DbError::AcquireTimeout(options.acquire_timeout),
                other => DbError::Connect(scrub_dsn_password(&other.to_string(), dsn)),
            })?;

        tracing::debug!(dsn = %redact_dsn(dsn), "Opened PostgreSQL pool");
        Ok(Self {
            pool,
            connect_options,
            statement_timeout: options.statement_timeout,
        })
    }
}

/// Cancels the backend's running statement if dropped while armed.
///
/// Dropping a query future (deadline, caller cancellation) only stops the
/// client; the server keeps executing until told otherwise.
struct BackendCancel {
    connect_options: PgConnectOptions,
    pid: i32,
    armed: bool,
}

impl BackendCancel {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BackendCancel {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(pid = self.pid, "No runtime to cancel abandoned query");
            return;
        };
        let options = self.connect_options.clone();
        let pid = self.pid;
        handle.spawn(async move {
            // A separate connection: the pooled one is busy until the statement ends.
            let outcome = async {
                let mut conn = PgConnection::connect_with(&options).await?;
                let cancelled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
                    .bind(pid)
                    .fetch_one(&mut conn)
                    .await?;
                conn.close().await?;
                Ok::<_, sqlx::Error>(cancelled)
            }
            .await;
            match outcome {
                Ok(cancelled) => tracing::debug!(pid, cancelled, "Cancelled abandoned query"),
                Err(e) => tracing::warn!(pid, error = %e, "Failed to cancel abandoned query"),
            }
        });
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    async fn query(&self, sql: &str, timeout: Option<Duration>) -> Result<RawResult, DbError> {
        use futures::TryStreamExt;

        // Scoped acquisition: the transaction (and its connection) is rolled
        // back and returned to the pool when `tx` drops, on every exit path.
        let mut tx = self.pool.begin().await.map_err(map_query_error)?;

        // Rolled back at the end, so session-level changes made by the
        // statement (`set_config(.., false)`) do not outlive it.
        (&mut *tx)
            .execute("SET TRANSACTION READ ONLY")
            .await
            .map_err(map_query_error)?;
        if let Some(timeout) = timeout.or(self.statement_timeout) {
            (&mut *tx)
                .execute(statement_timeout_sql(timeout).as_str())
                .await
                .map_err(map_query_error)?;
        }

        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *tx)
            .await
            .map_err(map_query_error)?;
        let mut cancel_guard = BackendCancel {
            connect_options: self.connect_options.clone(),
            pid,
            armed: true,
        };

        let start = Instant::now();
        let mut columns = Vec::new();
        let mut rows = Vec::new();

        let fetched: Result<(), DbError> = async {
            let mut stream = sqlx::query(sql).fetch(&mut *tx);
            while let Some(row) = stream.try_next().await.map_err(map_query_error)? {
                if columns.is_empty() {
                    columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                rows.push(row_to_object(&row));
            }
            Ok(())
        }
        .await;
        // The server has finished with the statement, successfully or not.
        cancel_guard.disarm();
        fetched?;

        // No rows means no row-level metadata; take the names from the
        // prepared statement's descriptor instead.
        if columns.is_empty() {
            let statement = (&mut *tx).prepare(sql).await.map_err(map_query_error)?;
            columns = statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
        }

        tx.rollback().await.map_err(map_query_error)?;

        tracing::trace!(
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "PostgreSQL query finished"
        );

        Ok(RawResult { columns, rows })
    }

    async fn catalog(&self) -> Result<Vec<CatalogRow>, DbError> {
        let rows = sqlx::query(CATALOG_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(map_query_error)?;

        rows.iter()
            .map(|row| {
                let is_nullable: String = row.try_get("is_nullable").map_err(map_query_error)?;
                Ok(CatalogRow {
                    table_name: row.try_get("table_name").map_err(map_query_error)?,
                    column_name: row.try_get("column_name").map_err(map_query_error)?,
                    data_type: row.try_get("data_type").map_err(map_query_error)?,
                    is_nullable: is_nullable == "YES",
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_query_error)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Opens [`PostgresDriver`]s with fixed pool options.
#[derive(Debug, Clone, Default)]
pub struct PostgresConnector {
    options: DriverOptions,
}

impl PostgresConnector {
    pub fn new(options: DriverOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self, dsn: &str) -> Result<Arc<dyn DatabaseDriver>, DbError> {
        let driver = PostgresDriver::connect(dsn, &self.options).await?;
        Ok(Arc::new(driver))
    }
}

/// `SET LOCAL` takes no bind parameters; the value is an integer we format.
fn statement_timeout_sql(timeout: Duration) -> String {
    // 0 would disable the limit server-side.
    format!("SET LOCAL statement_timeout = {}", timeout.as_millis().max(1))
}

fn map_query_error(e: sqlx::Error) -> DbError {
    match e {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => DbError::Query(format!("{} (SQLSTATE {})", db.message(), code)),
            None => DbError::Query(db.message().to_string()),
        },
        other => DbError::Query(other.to_string()),
    }
}

fn row_to_object(row: &PgRow) -> JsonRow {
    let mut object = JsonRow::new();
    for (i, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), map_postgres_value(row, i));
    }
    object
}

fn map_postgres_value(row: &PgRow, index: usize) -> serde_json::Value {
    use sqlx::ValueRef;
    let value_ref = match row.try_get_raw(index) {
        Ok(v) => v,
        Err(_) => return serde_json::Value::Null,
    };

    if value_ref.is_null() {
        return serde_json::Value::Null;
    }

    let type_info = value_ref.type_info();
    let type_name = type_info.name();

    match type_name {
        "BOOL" => {
            let v: Option<bool> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "INT2" => {
            let v: Option<i16> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "INT4" => {
            let v: Option<i32> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "INT8" => {
            let v: Option<i64> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "FLOAT4" => {
            let v: Option<f32> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "FLOAT8" => {
            let v: Option<f64> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "BPCHAR" => {
            let v: Option<String> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "UUID" => {
            let v: Option<uuid::Uuid> = row.try_get(index).ok();
            serde_json::json!(v.map(|u| u.to_string()))
        }
        "TIMESTAMPTZ" => {
            let v: Option<DateTime<Utc>> = row.try_get(index).ok();
            serde_json::json!(v.map(|t| t.to_rfc3339()))
        }
        "TIMESTAMP" => {
            let v: Option<NaiveDateTime> = row.try_get(index).ok();
            serde_json::json!(v.map(|t| t.to_string()))
        }
        "DATE" => {
            let v: Option<NaiveDate> = row.try_get(index).ok();
            serde_json::json!(v.map(|d| d.to_string()))
        }
        "TIME" => {
            let v: Option<NaiveTime> = row.try_get(index).ok();
            serde_json::json!(v.map(|t| t.to_string()))
        }
        "NUMERIC" => {
            // Kept as a string: NUMERIC can exceed f64 precision.
            let v: Option<sqlx::types::BigDecimal> = row.try_get(index).ok();
            serde_json::json!(v.map(|d| d.to_string()))
        }
        "MONEY" => {
            // MONEY is a 64-bit integer count of cents on the wire.
            match value_ref.as_bytes() {
                Ok(bytes) if bytes.len() == 8 => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(bytes);
                    let cents = i64::from_be_bytes(buf);
                    serde_json::Value::String(format!("${:.2}", cents as f64 / 100.0))
                }
                _ => serde_json::Value::Null,
            }
        }
        "INET" | "CIDR" => {
            let v: Option<ipnetwork::IpNetwork> = row.try_get(index).ok();
            serde_json::json!(v.map(|n| n.to_string()))
        }
        "MACADDR" => {
            let v: Option<mac_address::MacAddress> = row.try_get(index).ok();
            serde_json::json!(v.map(|m| m.to_string()))
        }
        "JSON" | "JSONB" => {
            let v: Option<serde_json::Value> = row.try_get(index).ok();
            v.unwrap_or(serde_json::Value::Null)
        }
        "TEXT[]" | "VARCHAR[]" | "CHAR[]" | "NAME[]" => {
            let v: Option<Vec<String>> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "INT2[]" => {
            let v: Option<Vec<i16>> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "INT4[]" => {
            let v: Option<Vec<i32>> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "INT8[]" => {
            let v: Option<Vec<i64>> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "FLOAT4[]" => {
            let v: Option<Vec<f32>> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "FLOAT8[]" => {
            let v: Option<Vec<f64>> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "BOOL[]" => {
            let v: Option<Vec<bool>> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "JSON[]" | "JSONB[]" => {
            let v: Option<Vec<serde_json::Value>> = row.try_get(index).ok();
            serde_json::json!(v)
        }
        "OID" => {
            let v: Option<Oid> = row.try_get(index).ok();
            serde_json::json!(v.map(|o| o.0))
        }
        "INTERVAL" => {
            let v: Option<PgInterval> = row.try_get(index).ok();
            serde_json::json!(v.as_ref().map(render_interval))
        }
        "BYTEA" => {
            let v: Option<Vec<u8>> = row.try_get(index).ok();
            serde_json::json!(v.map(|b| STANDARD.encode(b)))
        }
        "\"CHAR\"" => {
            let v: Option<i8> = row.try_get(index).ok();
            serde_json::json!(v.map(|c| char::from(c as u8).to_string()))
        }
        "NUMERIC[]" => {
            let v: Option<Vec<sqlx::types::BigDecimal>> = row.try_get(index).ok();
            serde_json::json!(v.map(|ds| ds.iter().map(ToString::to_string).collect::<Vec<_>>()))
        }
        _ => {
            if let Ok(s) = row.try_get::<String, _>(index) {
                return serde_json::Value::String(s);
            }
            fallback_value(type_name, value_ref.format(), value_ref.as_bytes().ok())
        }
    }
}

/// Unknown types: only a text-format payload is readable as-is.
fn fallback_value(type_name: &str, format: PgValueFormat, bytes: Option<&[u8]>) -> serde_json::Value {
    match (format, bytes.map(std::str::from_utf8)) {
        (PgValueFormat::Text, Some(Ok(s))) => serde_json::Value::String(s.to_string()),
        _ => serde_json::Value::String(format!("<{}>", type_name)),
    }
}

/// Renders an interval the way `psql` does for the common cases,
/// e.g. `1 mon 2 days 03:04:05.5`.
fn render_interval(interval: &PgInterval) -> String {
    let mut parts = Vec::new();
    let years = interval.months / 12;
    let months = interval.months % 12;
    let plural = |n: i32, unit: &str| {
        if n.abs() == 1 {
            format!("{} {}", n, unit)
        } else {
            format!("{} {}s", n, unit)
        }
    };
    if years != 0 {
        parts.push(plural(years, "year"));
    }
    if months != 0 {
        parts.push(if months.abs() == 1 {
            format!("{} mon", months)
        } else {
            format!("{} mons", months)
        });
    }
    if interval.days != 0 {
        parts.push(plural(interval.days, "day"));
    }

    let micros = interval.microseconds;
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let micros = micros.unsigned_abs();
        let secs = micros / 1_000_000;
        let frac = micros % 1_000_000;
        let mut clock = format!("{}{:02}:{:02}:{:02}", sign, secs / 3600, (secs / 60) % 60, secs % 60);
        if frac != 0 {
            let digits = format!("{:06}", frac);
            clock.push('.');
            clock.push_str(digits.trim_end_matches('0'));
        }
        parts.push(clock);
    }
    parts.join(" ")
}
