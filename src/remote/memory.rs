//! In-process [`RemoteStore`] used for simulation and tests.
//!
//! Transactions run under a single lock, which is exactly the atomicity a
//! real backend's conditional write provides. Connectivity can be toggled
//! to exercise the offline paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::{RemoteStore, Transaction, TransactionResult, UpdateFn};
use crate::clock::Clock;
use crate::error::StoreError;

#[derive(Default)]
struct StoreState {
    values: HashMap<String, Value>,
    feeds: HashMap<String, watch::Sender<Option<Value>>>,
}

impl StoreState {
    fn publish(&mut self, path: &str) {
        if let Some(feed) = self.feeds.get(path) {
            feed.send_replace(self.values.get(path).cloned());
        }
    }
}

/// Shared in-memory store. Clone the `Arc` to give several simulated
/// devices the same backend.
pub struct MemoryRemoteStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    connected: AtomicBool,
    commits: AtomicU64,
}

impl MemoryRemoteStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            connected: AtomicBool::new(true),
            commits: AtomicU64::new(0),
        }
    }

    /// Simulate losing or regaining the network.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of committed writes and deletes (for diagnostics).
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Read a value regardless of connectivity, the way an admin console
    /// would see the backend.
    pub fn peek(&self, path: &str) -> Option<Value> {
        self.state.lock().values.get(path).cloned()
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("no connection to remote store".into()))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_connected()?;
        Ok(self.state.lock().values.get(path).cloned())
    }

    async fn transaction(
        &self,
        path: &str,
        update: UpdateFn<'_>,
    ) -> Result<TransactionResult, StoreError> {
        self.ensure_connected()?;

        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let decision = update(state.values.get(path), now);

        let committed = match decision {
            Transaction::Abort => false,
            Transaction::Write(value) => {
                state.values.insert(path.to_string(), value);
                true
            }
            Transaction::Delete => {
                state.values.remove(path);
                true
            }
        };

        if committed {
            self.commits.fetch_add(1, Ordering::SeqCst);
            state.publish(path);
        }

        Ok(TransactionResult {
            committed,
            snapshot: state.values.get(path).cloned(),
        })
    }

    fn subscribe(&self, path: &str) -> watch::Receiver<Option<Value>> {
        let mut state = self.state.lock();
        let current = state.values.get(path).cloned();
        state
            .feeds
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
