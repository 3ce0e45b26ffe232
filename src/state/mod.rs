use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, LegacyCredentials};
use crate::db::postgres::PostgresConnector;
use crate::db::{Connector, DatabaseDriver, DbError};
use crate::schema::{Clock, SchemaCache, SystemClock};
use crate::storage::{ConnectionStore, JsonFileStore};
use crate::vault::Vault;

struct PoolEntry {
    driver: Arc<dyn DatabaseDriver>,
    fingerprint: [u8; 32],
    last_used: Instant,
}

/// Long-lived driver pools keyed by connection id.
///
/// Pools are created on first use, rebuilt when the DSN for an id changes, and
/// closed once idle for longer than `idle_timeout`.
pub struct PoolManager {
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    connect_timeout: Duration,
    pools: Mutex<HashMap<String, PoolEntry>>,
}

impl PoolManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
        idle_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            clock,
            idle_timeout,
            connect_timeout,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pool for `connection_id`, connecting if needed.
    pub async fn acquire(
        &self,
        connection_id: &str,
        dsn: &str,
    ) -> Result<Arc<dyn DatabaseDriver>, DbError> {
        let fingerprint: [u8; 32] = Sha256::digest(dsn.as_bytes()).into();
        let now = self.clock.now();

        let stale = {
            let mut pools = self.pools.lock().await;
            if let Some(entry) = pools.get_mut(connection_id) {
                if entry.fingerprint == fingerprint {
                    entry.last_used = now;
                    return Ok(Arc::clone(&entry.driver));
                }
            }
            pools.remove(connection_id)
        };
        if let Some(entry) = stale {
            tracing::info!(connection_id, "DSN changed, replacing pool");
            entry.driver.close().await;
        }

        let driver = tokio::time::timeout(self.connect_timeout, self.connector.connect(dsn))
            .await
            .map_err(|_| DbError::AcquireTimeout(self.connect_timeout))??;

        let mut pools = self.pools.lock().await;
        // A concurrent caller may have connected first; keep theirs.
        if let Some(existing) = pools.get_mut(connection_id) {
            if existing.fingerprint == fingerprint {
                existing.last_used = now;
                let winner = Arc::clone(&existing.driver);
                drop(pools);
                driver.close().await;
                return Ok(winner);
            }
        }
        pools.insert(
            connection_id.to_string(),
            PoolEntry {
                driver: Arc::clone(&driver),
                fingerprint,
                last_used: now,
            },
        );
        tracing::debug!(connection_id, "Created connection pool");
        Ok(driver)
    }

    /// Closes pools idle past the timeout. Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let evicted: Vec<(String, PoolEntry)> = {
            let mut pools = self.pools.lock().await;
            let idle: Vec<String> = pools
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.last_used) >= self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            idle.into_iter()
                .filter_map(|id| pools.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in &evicted {
            tracing::debug!(connection_id = %id, "Closing idle pool");
            entry.driver.close().await;
        }
        evicted.len()
    }

    pub async fn remove(&self, connection_id: &str) -> bool {
        let entry = self.pools.lock().await.remove(connection_id);
        match entry {
            Some(entry) => {
                entry.driver.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<PoolEntry> = self.pools.lock().await.drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.driver.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.pools.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Runs [`evict_idle`](Self::evict_idle) on an interval until `token` is cancelled.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        every: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = manager.evict_idle().await;
                        if closed > 0 {
                            tracing::info!(closed, "Evicted idle pools");
                        }
                    }
                }
            }
            manager.close_all().await;
        })
    }
}

/// Composition root shared by every pipeline call.
///
/// Construction starts the idle-pool reaper on the current tokio runtime;
/// [`shutdown`](Self::shutdown) stops it and closes every pool.
pub struct AppState {
    pub vault: Vault,
    pub store: Arc<dyn ConnectionStore>,
    pub schemas: SchemaCache,
    pub pools: Arc<PoolManager>,
    pub legacy_credentials: LegacyCredentials,
    pub query_timeout: Duration,
    shutdown: CancellationToken,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Wires the PostgreSQL connector and the JSON file store from config.
    pub fn new(config: &Config) -> Self {
        let connector: Arc<dyn Connector> =
            Arc::new(PostgresConnector::new(config.driver_options()));
        let store = Arc::new(JsonFileStore::new(config.connections_file.clone()));
        Self::with_parts(config, store, connector, Arc::new(SystemClock))
    }

    /// Wires caller-supplied collaborators.
    pub fn with_parts(
        config: &Config,
        store: Arc<dyn ConnectionStore>,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let schemas = SchemaCache::new(Arc::clone(&connector), config.schema_ttl, Arc::clone(&clock));
        let pools = Arc::new(PoolManager::new(
            connector,
            clock,
            config.pool_idle_timeout,
            config.pool_acquire_timeout,
        ));

        let shutdown = CancellationToken::new();
        let reaper = match tokio::runtime::Handle::try_current() {
            Ok(_) => Some(pools.spawn_reaper(config.pool_reap_interval, shutdown.clone())),
            Err(_) => {
                tracing::warn!("No tokio runtime; idle pools will not be reaped");
                None
            }
        };

        Self {
            vault: Vault::new(&config.encryption_key),
            store,
            schemas,
            pools,
            legacy_credentials: config.legacy_credentials.clone(),
            query_timeout: config.query_timeout,
            shutdown,
            reaper: std::sync::Mutex::new(reaper),
        }
    }

    /// Stops the reaper and closes every pool. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match reaper {
            // The reaper closes all pools on its way out.
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "Pool reaper ended abnormally");
                    self.pools.close_all().await;
                }
            }
            None => self.pools.close_all().await,
        }
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
