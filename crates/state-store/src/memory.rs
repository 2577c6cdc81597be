//! In-process state store
//!
//! Same contract as `FileStateStore` without touching disk. Counts writes so
//! tests can assert that an operation persisted exactly as often as expected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::{StateStore, StoreFuture};

#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<HashMap<String, serde_json::Value>>,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set_state` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStateStore {
    fn get_state<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<serde_json::Value>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set_state<'a>(&'a self, key: &'a str, value: serde_json::Value) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().await.insert(key.to_string(), value);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let store = MemoryStateStore::new();
        assert!(store.get_state("usage_ledger").await.unwrap().is_none());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn set_then_get_and_count_writes() {
        let store = MemoryStateStore::new();
        store
            .set_state("credential_pool_state", serde_json::json!({"active_index": 1}))
            .await
            .unwrap();
        store
            .set_state("credential_pool_state", serde_json::json!({"active_index": 2}))
            .await
            .unwrap();
        let value = store.get_state("credential_pool_state").await.unwrap().unwrap();
        assert_eq!(value["active_index"], 2);
        assert_eq!(store.writes(), 2);
    }
}
