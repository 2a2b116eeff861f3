//! Remote synchronized store port.
//!
//! Values are JSON documents addressed by slash-separated paths
//! (`buses/7/tracker`). The single write primitive is an atomic
//! transaction: the store hands the current value and its own server
//! timestamp to an update function and commits the result only if no
//! other writer touched the path in between. Every lease mutation goes
//! through it; there is no unconditional `set`.

pub mod memory;

pub use memory::MemoryRemoteStore;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::StoreError;

/// What a transaction update function wants done with the path.
#[derive(Debug, Clone, PartialEq)]
pub enum Transaction {
    /// Leave the value untouched and report `committed = false`.
    Abort,
    /// Replace the value.
    Write(Value),
    /// Remove the value.
    Delete,
}

/// Result of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    /// Whether the update function's write or delete was applied.
    pub committed: bool,
    /// Value at the path after the transaction.
    pub snapshot: Option<Value>,
}

/// Update function: `(current value, server time in epoch ms) -> decision`.
///
/// May be invoked more than once if the store retries on contention, so
/// it must be a pure function of its inputs.
pub type UpdateFn<'a> = &'a (dyn Fn(Option<&Value>, i64) -> Transaction + Send + Sync);

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// One-shot read of the value at `path`.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Atomic read-modify-write at `path`.
    async fn transaction(
        &self,
        path: &str,
        update: UpdateFn<'_>,
    ) -> Result<TransactionResult, StoreError>;

    /// Change feed for `path`. The receiver holds the latest known value
    /// and is notified on every change.
    fn subscribe(&self, path: &str) -> watch::Receiver<Option<Value>>;

    /// Whether the store currently has a live connection.
    async fn is_connected(&self) -> bool;
}
