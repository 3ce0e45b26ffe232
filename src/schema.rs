//! Schema introspection with a per-connection TTL cache.
//!
//! Snapshots are shared as `Arc<SchemaSnapshot>` and swapped in whole, so a
//! reader sees either the old snapshot or the new one, never a partial write.
//! Concurrent misses on the same connection id wait on one in-flight
//! introspection instead of issuing duplicate catalog queries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::db::Connector;
use crate::error::{QueryError, Result};
use crate::models::{CatalogRow, ColumnInfo, SchemaSnapshot, TableInfo};
use crate::vault::redact_dsn;

pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(3600);

/// Time source for cache expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.origin + offset
    }
}

struct CachedSchema {
    schema: Arc<SchemaSnapshot>,
    expires: Instant,
}

pub struct SchemaCache {
    connector: Arc<dyn Connector>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CachedSchema>>,
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SchemaCache {
    pub fn new(connector: Arc<dyn Connector>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            connector,
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults(connector: Arc<dyn Connector>) -> Self {
        Self::new(connector, DEFAULT_SCHEMA_TTL, Arc::new(SystemClock))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the schema for `connection_id`, introspecting `dsn` on a miss.
    pub async fn introspect(&self, dsn: &str, connection_id: &str) -> Result<Arc<SchemaSnapshot>> {
        if let Some(schema) = self.cached(connection_id).await {
            tracing::trace!(connection_id, "Schema cache hit");
            return Ok(schema);
        }

        let gate = self.gate(connection_id);
        let _guard = gate.lock().await;

        // Another task may have filled the entry while we waited.
        if let Some(schema) = self.cached(connection_id).await {
            self.release_gate(connection_id, &gate);
            return Ok(schema);
        }

        tracing::debug!(connection_id, dsn = %redact_dsn(dsn), "Introspecting schema");
        let result = self.load(dsn, connection_id).await;

        if let Ok(schema) = &result {
            let expires = self.clock.now() + self.ttl;
            self.entries.write().await.insert(
                connection_id.to_string(),
                CachedSchema {
                    schema: Arc::clone(schema),
                    expires,
                },
            );
            tracing::info!(connection_id, tables = schema.len(), "Cached schema");
        }

        self.release_gate(connection_id, &gate);
        result
    }

    /// Evicts one entry, or every entry when `connection_id` is `None`.
    pub async fn clear(&self, connection_id: Option<&str>) {
        let mut entries = self.entries.write().await;
        match connection_id {
            Some(id) => {
                entries.remove(id);
            }
            None => entries.clear(),
        }
    }

    /// Number of stored entries, expired ones included until replaced.
    pub async fn size(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn cached(&self, connection_id: &str) -> Option<Arc<SchemaSnapshot>> {
        let entries = self.entries.read().await;
        entries
            .get(connection_id)
            .filter(|entry| entry.expires > self.clock.now())
            .map(|entry| Arc::clone(&entry.schema))
    }

    async fn load(&self, dsn: &str, connection_id: &str) -> Result<Arc<SchemaSnapshot>> {
        let wrap = |message: String| QueryError::SchemaIntrospection {
            connection_id: connection_id.to_string(),
            message,
        };

        let driver = self
            .connector
            .connect(dsn)
            .await
            .map_err(|e| wrap(e.to_string()))?;

        let rows = driver.catalog().await;
        // Short-lived connection: closed whether or not the catalog query worked.
        driver.close().await;

        let rows = rows.map_err(|e| wrap(e.to_string()))?;
        Ok(Arc::new(group_catalog_rows(rows)))
    }

    fn gate(&self, connection_id: &str) -> Arc<AsyncMutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            in_flight
                .entry(connection_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn release_gate(&self, connection_id: &str, gate: &Arc<AsyncMutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // Two references: the map's and ours. Anything more means someone is queued.
        if Arc::strong_count(gate) <= 2 {
            in_flight.remove(connection_id);
        }
    }
}

/// Groups catalog rows into tables in a single pass.
///
/// Rows must already be ordered by table then column position.
pub fn group_catalog_rows(rows: Vec<CatalogRow>) -> SchemaSnapshot {
    let mut tables: SchemaSnapshot = Vec::new();
    for row in rows {
        let column = ColumnInfo {
            name: row.column_name,
            data_type: row.data_type,
            nullable: row.is_nullable,
        };
        match tables.last_mut() {
            Some(table) if table.name == row.table_name => table.columns.push(column),
            _ => tables.push(TableInfo {
                name: row.table_name,
                columns: vec![column],
            }),
        }
    }
    tables
}

/// Renders a schema as plain text for a model prompt.
pub fn schema_prompt(schema: &SchemaSnapshot) -> String {
    schema
        .iter()
        .map(|table| {
            let columns = table
                .columns
                .iter()
                .map(|col| {
                    format!(
                        "    - {} ({}{})",
                        col.name,
                        col.data_type,
                        if col.nullable { ", nullable" } else { "" }
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("Table: {}\nColumns:\n{}", table.name, columns)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseDriver, DbError};
    use crate::models::RawResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn row(table: &str, column: &str, data_type: &str, nullable: bool) -> CatalogRow {
        CatalogRow {
            table_name: table.into(),
            column_name: column.into(),
            data_type: data_type.into(),
            is_nullable: nullable,
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        catalog_calls: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail: bool,
    }

    struct CountingDriver {
        catalog_calls: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl DatabaseDriver for CountingDriver {
        async fn query(
            &self,
            _sql: &str,
            _timeout: Option<Duration>,
        ) -> std::result::Result<RawResult, DbError> {
            Ok(RawResult::default())
        }

        async fn catalog(&self) -> std::result::Result<Vec<CatalogRow>, DbError> {
            self.catalog_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                return Err(DbError::Query("permission denied for schema public".into()));
            }
            Ok(vec![
                row("users", "id", "text", false),
                row("users", "email", "text", false),
            ])
        }

        async fn ping(&self) -> std::result::Result<(), DbError> {
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, _dsn: &str) -> std::result::Result<Arc<dyn DatabaseDriver>, DbError> {
            Ok(Arc::new(CountingDriver {
                catalog_calls: Arc::clone(&self.catalog_calls),
                closes: Arc::clone(&self.closes),
                fail: self.fail,
            }))
        }
    }

    fn cache_with(connector: CountingConnector) -> (SchemaCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = SchemaCache::new(Arc::new(connector), DEFAULT_SCHEMA_TTL, clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_group_catalog_rows() {
        let schema = group_catalog_rows(vec![
            row("orders", "id", "integer", false),
            row("orders", "note", "text", true),
            row("users", "id", "text", false),
        ]);
        assert_eq!(schema.len(), 2);
        assert_eq!(schema[0].name, "orders");
        assert_eq!(schema[0].columns.len(), 2);
        assert!(schema[0].columns[1].nullable);
        assert_eq!(schema[1].columns[0].name, "id");
        assert!(group_catalog_rows(Vec::new()).is_empty());
    }

    #[test]
    fn test_schema_prompt() {
        let schema = group_catalog_rows(vec![
            row("orders", "id", "integer", false),
            row("orders", "note", "text", true),
            row("users", "id", "text", false),
        ]);
        assert_eq!(
            schema_prompt(&schema),
            "Table: orders\nColumns:\n    - id (integer)\n    - note (text, nullable)\n\n\
             Table: users\nColumns:\n    - id (text)"
        );
    }

    #[tokio::test]
    async fn test_introspect_single_table() {
        let (cache, _clock) = cache_with(CountingConnector::default());
        let schema = cache.introspect("postgres://db/app", "c1").await.unwrap();
        assert_eq!(
            *schema,
            vec![TableInfo {
                name: "users".into(),
                columns: vec![
                    ColumnInfo {
                        name: "id".into(),
                        data_type: "text".into(),
                        nullable: false
                    },
                    ColumnInfo {
                        name: "email".into(),
                        data_type: "text".into(),
                        nullable: false
                    },
                ],
            }]
        );
    }

    #[tokio::test]
    async fn test_hit_within_ttl_skips_catalog() {
        let connector = CountingConnector::default();
        let calls = Arc::clone(&connector.catalog_calls);
        let closes = Arc::clone(&connector.closes);
        let (cache, clock) = cache_with(connector);

        let first = cache.introspect("dsn", "c1").await.unwrap();
        clock.advance(Duration::from_secs(3599));
        let second = cache.introspect("dsn", "c1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.size().await, 1);
    }

    #[tokio::test]
    async fn test_expiry_triggers_new_catalog_query() {
        let connector = CountingConnector::default();
        let calls = Arc::clone(&connector.catalog_calls);
        let (cache, clock) = cache_with(connector);

        cache.introspect("dsn", "c1").await.unwrap();
        clock.advance(Duration::from_secs(3600));
        cache.introspect("dsn", "c1").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.size().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let connector = CountingConnector::default();
        let calls = Arc::clone(&connector.catalog_calls);
        let (cache, _clock) = cache_with(connector);
        let cache = Arc::new(cache);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.introspect("dsn", "shared").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_one_or_all() {
        let (cache, _clock) = cache_with(CountingConnector::default());
        cache.introspect("dsn", "a").await.unwrap();
        cache.introspect("dsn", "b").await.unwrap();
        assert_eq!(cache.size().await, 2);

        cache.clear(Some("a")).await;
        assert_eq!(cache.size().await, 1);

        cache.clear(None).await;
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_failure_wraps_connection_id_and_closes() {
        let connector = CountingConnector {
            fail: true,
            ..Default::default()
        };
        let closes = Arc::clone(&connector.closes);
        let (cache, _clock) = cache_with(connector);

        let err = cache.introspect("dsn", "broken").await.unwrap_err();
        match err {
            QueryError::SchemaIntrospection {
                connection_id,
                message,
            } => {
                assert_eq!(connection_id, "broken");
                assert!(message.contains("permission denied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.size().await, 0);
    }
}
