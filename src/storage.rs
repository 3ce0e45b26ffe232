use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{QueryError, Result};
use crate::models::ConnectionRecord;

/// Lookup of connection metadata. The pipeline only reads through it.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ConnectionRecord>>;
}

/// Records kept in a JSON array on disk.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load_connections(&self) -> Result<Vec<ConnectionRecord>> {
        if fs::metadata(&self.path).await.is_err() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).await.map_err(storage_err)?;
        let connections: Vec<ConnectionRecord> =
            serde_json::from_str(&content).map_err(storage_err)?;
        Ok(connections)
    }

    pub async fn save_connections(&self, connections: &[ConnectionRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(storage_err)?;
        }
        let content = serde_json::to_string_pretty(connections).map_err(storage_err)?;
        fs::write(&self.path, content).await.map_err(storage_err)?;
        Ok(())
    }

    /// Replaces the record with the same id, or appends it.
    pub async fn add_connection(&self, connection: ConnectionRecord) -> Result<()> {
        let mut connections = self.load_connections().await?;
        if let Some(pos) = connections.iter().position(|c| c.id == connection.id) {
            connections[pos] = connection;
        } else {
            connections.push(connection);
        }
        self.save_connections(&connections).await
    }

    pub async fn delete_connection(&self, id: &str) -> Result<()> {
        let mut connections = self.load_connections().await?;
        connections.retain(|c| c.id != id);
        self.save_connections(&connections).await
    }
}

#[async_trait]
impl ConnectionStore for JsonFileStore {
    async fn get(&self, id: &str) -> Result<Option<ConnectionRecord>> {
        let connections = self.load_connections().await?;
        Ok(connections.into_iter().find(|c| c.id == id))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ConnectionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: ConnectionRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn remove(&self, id: &str) -> Option<ConnectionRecord> {
        self.records.write().await.remove(id)
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<ConnectionRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }
}

fn storage_err(e: impl std::fmt::Display) -> QueryError {
    QueryError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Engine;

    fn record(id: &str, host: &str) -> ConnectionRecord {
        ConnectionRecord {
            id: id.into(),
            name: Some(format!("{id} db")),
            engine: Engine::Postgresql,
            encrypted_dsn: None,
            host: Some(host.into()),
            port: Some(5432),
            database: Some("app".into()),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("connections.json"));
        assert!(store.load_connections().await.unwrap().is_empty());
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_replace_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("connections.json"));

        store.add_connection(record("a", "one")).await.unwrap();
        store.add_connection(record("b", "two")).await.unwrap();
        store.add_connection(record("a", "three")).await.unwrap();

        let all = store.load_connections().await.unwrap();
        assert_eq!(all.len(), 2);
        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.host.as_deref(), Some("three"));

        store.delete_connection("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        std::fs::write(&path, "not json").unwrap();
        let err = JsonFileStore::new(path).get("a").await.unwrap_err();
        assert_eq!(err.kind(), "STORAGE_ERROR");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.insert(record("x", "h")).await;
        assert!(store.get("x").await.unwrap().is_some());
        assert!(store.remove("x").await.is_some());
        assert!(store.get("x").await.unwrap().is_none());
    }
}
