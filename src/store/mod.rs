//! Keyed byte storage behind the relay: named columns of `key -> bytes`
//! with batched writes and tag-serialized transactions. Persistence engines
//! live behind [`KeyStoreBackend`]; the relay only sees this surface.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub use memory::MemoryStore;

/// Column names used by the relay core.
pub mod columns {
    pub const SESSION: &str = "session";
    pub const PRE_KEY: &str = "pre-key";
    pub const SENDER_KEY: &str = "sender-key";
    pub const SENDER_KEY_MEMORY: &str = "sender-key-memory";
    pub const LID_MAPPING: &str = "lid-mapping";
    pub const DEVICE_LIST: &str = "device-list";
    pub const TC_TOKEN: &str = "tctoken";
}

/// Persisted per-user device id list, stored in the device-list column as
/// JSON. Device ids are kept as strings, in the order the server reported
/// them.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DeviceListRecord {
    pub devices: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// `column -> key -> value`, where `None` deletes the key on commit.
pub type ColumnWrites = HashMap<String, HashMap<String, Option<Vec<u8>>>>;

#[async_trait]
pub trait KeyStoreBackend: Send + Sync {
    async fn get(
        &self,
        column: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>>;

    /// Apply a batch of writes atomically.
    async fn set(&self, writes: ColumnWrites) -> Result<()>;
}

/// Handle over a backend adding per-tag serialization. Operations sharing a
/// transaction tag never interleave; distinct tags proceed concurrently.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn KeyStoreBackend>,
    tag_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn KeyStoreBackend>) -> Self {
        Self {
            backend,
            tag_locks: Arc::new(DashMap::new()),
        }
    }

    pub async fn get(
        &self,
        column: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>> {
        self.backend.get(column, keys).await
    }

    pub async fn get_one(&self, column: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let mut map = self.backend.get(column, &[key.to_string()]).await?;
        Ok(map.remove(key).flatten())
    }

    pub async fn set(&self, writes: ColumnWrites) -> Result<()> {
        self.backend.set(writes).await
    }

    /// Open a transaction. The returned handle holds the tag lock until it
    /// is committed or dropped; writes buffer locally and reads see the
    /// buffered state overlaid on the backend.
    pub async fn transaction(&self, tag: impl Into<String>) -> Transaction {
        let tag = tag.into();
        let lock = self
            .tag_locks
            .entry(tag.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        Transaction {
            _guard: guard,
            tag,
            backend: self.backend.clone(),
            pending: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

/// An open transaction. Dropping without [`Transaction::commit`] discards
/// the buffered writes.
pub struct Transaction {
    _guard: OwnedMutexGuard<()>,
    tag: String,
    backend: Arc<dyn KeyStoreBackend>,
    pending: std::sync::Mutex<ColumnWrites>,
}

impl Transaction {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn get(
        &self,
        column: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>> {
        let mut missing = Vec::new();
        let mut out = HashMap::with_capacity(keys.len());
        {
            let pending = self.pending.lock().expect("transaction buffer poisoned");
            let column_writes = pending.get(column);
            for key in keys {
                match column_writes.and_then(|c| c.get(key)) {
                    Some(value) => {
                        out.insert(key.clone(), value.clone());
                    }
                    None => missing.push(key.clone()),
                }
            }
        }
        if !missing.is_empty() {
            let fetched = self.backend.get(column, &missing).await?;
            out.extend(fetched);
        }
        Ok(out)
    }

    pub async fn get_one(&self, column: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let mut map = self.get(column, std::slice::from_ref(&key.to_string())).await?;
        Ok(map.remove(key).flatten())
    }

    pub fn set(&self, column: &str, key: impl Into<String>, value: Option<Vec<u8>>) {
        let mut pending = self.pending.lock().expect("transaction buffer poisoned");
        pending
            .entry(column.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    /// Flush all buffered writes as one backend batch.
    pub async fn commit(self) -> Result<()> {
        let writes = {
            let mut pending = self.pending.lock().expect("transaction buffer poisoned");
            std::mem::take(&mut *pending)
        };
        if writes.is_empty() {
            return Ok(());
        }
        self.backend.set(writes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store() -> KeyStore {
        KeyStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let store = store();
        let mut writes: ColumnWrites = HashMap::new();
        writes
            .entry(columns::SESSION.into())
            .or_default()
            .insert("a.0".into(), Some(b"record".to_vec()));
        store.set(writes).await.unwrap();

        assert_eq!(
            store.get_one(columns::SESSION, "a.0").await.unwrap(),
            Some(b"record".to_vec())
        );
        assert_eq!(store.get_one(columns::SESSION, "b.0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn transaction_reads_overlay_buffered_writes() {
        let store = store();
        let tx = store.transaction("t1").await;
        tx.set(columns::SESSION, "a.0", Some(b"new".to_vec()));

        // Visible inside the transaction, not outside until commit.
        assert_eq!(
            tx.get_one(columns::SESSION, "a.0").await.unwrap(),
            Some(b"new".to_vec())
        );
        assert_eq!(store.get_one(columns::SESSION, "a.0").await.unwrap(), None);

        tx.commit().await.unwrap();
        assert_eq!(
            store.get_one(columns::SESSION, "a.0").await.unwrap(),
            Some(b"new".to_vec())
        );
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = store();
        {
            let tx = store.transaction("t1").await;
            tx.set(columns::SESSION, "a.0", Some(b"lost".to_vec()));
        }
        assert_eq!(store.get_one(columns::SESSION, "a.0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn none_value_deletes_on_commit() {
        let store = store();
        let tx = store.transaction("t1").await;
        tx.set(columns::SESSION, "a.0", Some(b"record".to_vec()));
        tx.commit().await.unwrap();

        let tx = store.transaction("t1").await;
        tx.set(columns::SESSION, "a.0", None);
        tx.commit().await.unwrap();
        assert_eq!(store.get_one(columns::SESSION, "a.0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn same_tag_serializes_distinct_tags_do_not() {
        let store = store();

        let tx_a = store.transaction("same").await;
        // A second transaction under the same tag must wait for tx_a.
        let blocked = {
            let store = store.clone();
            tokio::spawn(async move {
                let tx = store.transaction("same").await;
                tx.commit().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // A distinct tag proceeds immediately.
        let other = store.transaction("other").await;
        other.commit().await.unwrap();

        tx_a.commit().await.unwrap();
        blocked.await.unwrap();
    }
}
