use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("data not found for key '{0}'")]
    NotFound(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// A single named key/value store.
///
/// Reads and writes are atomic at the key level; no cross-key transactions
/// are assumed by any caller in this crate.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// Opens named stores. Each subsystem owns its own namespace
/// (`messenger_store`, `didexchange_connections`, `outbox`, ...).
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn open_store(&self, name: &str) -> Result<Arc<dyn Store>, StorageError>;
}

/// In-memory reference implementation backing the tests and ephemeral agents.
#[derive(Default)]
pub struct MemoryStorageProvider {
    stores: RwLock<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn open_store(&self, name: &str) -> Result<Arc<dyn Store>, StorageError> {
        let mut stores = self
            .stores
            .write()
            .map_err(|_| StorageError::Backend("store registry lock poisoned".into()))?;

        let store = stores.entry(name.to_string()).or_default();

        Ok(store.clone() as Arc<dyn Store>)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>, StorageError> {
        self.entries
            .read()
            .map_err(|_| StorageError::Backend("store lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>, StorageError> {
        self.entries
            .write()
            .map_err(|_| StorageError::Backend("store lock poisoned".into()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.read()?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.write()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.write()?.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .read()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn get_put_delete() {
        let provider = MemoryStorageProvider::new();
        let store = provider.open_store("test").await.unwrap();

        assert!(store.get("missing").await.unwrap_err().is_not_found());

        store.put("a", b"1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), b"1");

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn stores_are_isolated_by_name() {
        let provider = MemoryStorageProvider::new();
        let left = provider.open_store("left").await.unwrap();
        let right = provider.open_store("right").await.unwrap();

        left.put("key", b"left").await.unwrap();
        assert!(right.get("key").await.unwrap_err().is_not_found());

        // reopening yields the same store
        let left_again = provider.open_store("left").await.unwrap();
        assert_eq!(left_again.get("key").await.unwrap(), b"left");
    }

    #[tokio::test]
    async fn prefix_scan() {
        let provider = MemoryStorageProvider::new();
        let store = provider.open_store("test").await.unwrap();

        store.put("conn_my|t1", b"a").await.unwrap();
        store.put("conn_my|t2", b"b").await.unwrap();
        store.put("conn_their|t1", b"c").await.unwrap();

        let hits = store.scan_prefix("conn_my|").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "conn_my|t1");
    }
}
