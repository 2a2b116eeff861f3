//! Durable local key-value storage port.
//!
//! Holds the device identity and the offline queue across restarts.

pub mod sqlite;

pub use sqlite::SqliteKvStore;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// Volatile store; contents vanish with the process.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryKvStore::new();
        assert!(store.get("k").await.unwrap().is_none());
        store.set("k", b"v1").await.unwrap();
        store.set("k", b"v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"v2"[..]));
    }
}
