//! Durable key/value storage for named JSON blobs
//!
//! The pool managers and the usage ledger persist their state through the
//! `StateStore` trait. Each blob is owned by exactly one component; the store
//! itself knows nothing about the contents.
//!
//! Keys in use:
//! - `credential_pool_state`: `{ "active_index": n }`
//! - `identity_pool_state`: `{ "active_index": n }`
//! - `usage_ledger`: `{ "month": "YYYY-MM", "usage_by_account": { id: n } }`

pub mod error;
pub mod file;
pub mod memory;

pub use error::{Error, Result};
pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by `StateStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Key/value store for JSON blobs.
///
/// Uses `Pin<Box<dyn Future>>` return types so stores can be shared as
/// `Arc<dyn StateStore>`.
pub trait StateStore: Send + Sync {
    /// Fetch the blob stored under `key`, or `None` if it was never written.
    fn get_state<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<serde_json::Value>>;

    /// Insert or replace the blob under `key`.
    fn set_state<'a>(&'a self, key: &'a str, value: serde_json::Value) -> StoreFuture<'a, ()>;
}
