use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::errors::{OracleError, OracleResult};

/// Logical namespaces in the keyed store.
pub const TASKS_NS: &str = "oracle_tasks";
pub const EXECUTIONS_NS: &str = "task_executions";
pub const WINDOWS_NS: &str = "maintenance_windows";
pub const NODES_NS: &str = "scheduler_nodes";
pub const CLAIMS_NS: &str = "task_claims";

/// Durable keyed storage with hash-map semantics over `namespace/key`.
///
/// Used for task definitions, execution records, maintenance windows, node
/// heartbeats and task claims; any node may read or clean up entries
/// written by another.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn put(&self, namespace: &str, key: &str, value: String) -> OracleResult<()>;
    async fn get(&self, namespace: &str, key: &str) -> OracleResult<Option<String>>;
    async fn delete(&self, namespace: &str, key: &str) -> OracleResult<()>;
    async fn entries(&self, namespace: &str) -> OracleResult<Vec<(String, String)>>;
}

/// Serialize and store a record.
pub async fn put_json<T: Serialize>(
    store: &dyn KeyedStore,
    namespace: &str,
    key: &str,
    value: &T,
) -> OracleResult<()> {
    let encoded = serde_json::to_string(value)?;
    store.put(namespace, key, encoded).await
}

/// Load and deserialize a record.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyedStore,
    namespace: &str,
    key: &str,
) -> OracleResult<Option<T>> {
    match store.get(namespace, key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// In-memory store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn put(&self, namespace: &str, key: &str, value: String) -> OracleResult<()> {
        let mut data = self.data.write().await;
        data.entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> OracleResult<Option<String>> {
        let data = self.data.read().await;
        Ok(data
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn delete(&self, namespace: &str, key: &str) -> OracleResult<()> {
        let mut data = self.data.write().await;
        if let Some(ns) = data.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn entries(&self, namespace: &str) -> OracleResult<Vec<(String, String)>> {
        let data = self.data.read().await;
        Ok(data
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// File-backed store: one JSON file per entry under
/// `{root}/{namespace}/{key}.json`. Durable across restarts.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, namespace: &str, key: &str) -> OracleResult<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(OracleError::Storage(format!("Invalid store key: {}", key)));
        }
        Ok(self.root.join(namespace).join(format!("{}.json", key)))
    }
}

#[async_trait]
impl KeyedStore for FileStore {
    async fn put(&self, namespace: &str, key: &str, value: String) -> OracleResult<()> {
        let path = self.entry_path(namespace, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OracleError::Storage(e.to_string()))?;
        }
        tokio::fs::write(&path, value)
            .await
            .map_err(|e| OracleError::Storage(e.to_string()))
    }

    async fn get(&self, namespace: &str, key: &str) -> OracleResult<Option<String>> {
        let path = self.entry_path(namespace, key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OracleError::Storage(e.to_string())),
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> OracleResult<()> {
        let path = self.entry_path(namespace, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OracleError::Storage(e.to_string())),
        }
    }

    async fn entries(&self, namespace: &str) -> OracleResult<Vec<(String, String)>> {
        let dir = self.root.join(namespace);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OracleError::Storage(e.to_string())),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| OracleError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let key = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| OracleError::Storage(e.to_string()))?;
            entries.push((key, content));
        }
        Ok(entries)
    }
}
