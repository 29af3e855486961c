use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ColumnWrites, KeyStoreBackend, Result};

/// Heap-backed [`KeyStoreBackend`]. The default store for tests and for
/// hosts that handle persistence elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStoreBackend for MemoryStore {
    async fn get(
        &self,
        column: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>> {
        let columns = self.columns.read().await;
        let data = columns.get(column);
        Ok(keys
            .iter()
            .map(|key| {
                let value = data.and_then(|c| c.get(key)).cloned();
                (key.clone(), value)
            })
            .collect())
    }

    async fn set(&self, writes: ColumnWrites) -> Result<()> {
        let mut columns = self.columns.write().await;
        for (column, entries) in writes {
            let data = columns.entry(column).or_default();
            for (key, value) in entries {
                match value {
                    Some(bytes) => {
                        data.insert(key, bytes);
                    }
                    None => {
                        data.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
