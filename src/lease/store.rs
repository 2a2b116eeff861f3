//! Lease store adapter: become/renew/heartbeat/release against the
//! remote store, with the expiry rule applied on every read.
//!
//! Every write is an ownership-conditional transaction. Result shape:
//!
//! - `Ok(true)`: the write was applied.
//! - `Ok(false)`: the stored lease is not ours (or is gone); nothing changed.
//! - `Err(StoreError::Unavailable)`: the store could not be reached.
//!
//! Callers rely on the last two never being conflated: a network blip
//! must not look like losing the lease.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{lease_path, ttl_millis, Lease, DEFAULT_LEASE_TTL};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::model::{BusId, Location};
use crate::remote::{RemoteStore, Transaction};

/// Why an acquisition was granted or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireReason {
    /// No lease existed.
    Vacant,
    /// A lease existed but had expired; it was replaced.
    TookOverExpired,
    /// Another device holds a live lease.
    AlreadyTracked,
}

/// Result of [`LeaseStore::try_acquire`].
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireOutcome {
    pub granted: bool,
    pub reason: AcquireReason,
    /// The live lease that blocked us, when denied.
    pub holder: Option<Lease>,
}

impl AcquireOutcome {
    /// User-facing description of the outcome.
    pub fn message(&self, bus: BusId) -> String {
        if self.granted {
            format!("You are now tracking Bus {bus}")
        } else {
            format!("Bus {bus} is already being tracked")
        }
    }
}

/// Adapter over a [`RemoteStore`] holding one lease per bus.
#[derive(Clone)]
pub struct LeaseStore {
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
}

impl LeaseStore {
    /// Create an adapter with the default 90 second TTL.
    pub fn new(remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(remote, clock, DEFAULT_LEASE_TTL)
    }

    pub fn with_ttl(remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            remote,
            clock,
            ttl_ms: ttl_millis(ttl),
        }
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether `lease` is live right now.
    pub fn is_live(&self, lease: &Lease) -> bool {
        !lease.is_expired(self.clock.now_ms(), self.ttl_ms)
    }

    /// Connectivity signal of the underlying store.
    pub async fn is_connected(&self) -> bool {
        self.remote.is_connected().await
    }

    /// Atomically become the tracker for `bus`.
    ///
    /// Granted iff there is no lease or the existing one is expired. On
    /// grant, both timestamps are the server's.
    pub async fn try_acquire(
        &self,
        bus: BusId,
        location: &Location,
        owner_id: &str,
    ) -> Result<AcquireOutcome, StoreError> {
        let path = lease_path(bus);
        let ttl_ms = self.ttl_ms;
        let took_over = AtomicBool::new(false);

        let result = self
            .remote
            .transaction(&path, &|current, now| {
                let existing = current.and_then(Lease::from_value);
                took_over.store(existing.is_some(), Ordering::SeqCst);
                match existing {
                    Some(lease) if !lease.is_expired(now, ttl_ms) => Transaction::Abort,
                    _ => encode(&Lease {
                        owner_id: owner_id.to_string(),
                        location: *location,
                        last_update: now,
                        last_heartbeat: now,
                    }),
                }
            })
            .await?;

        if result.committed {
            let reason = if took_over.load(Ordering::SeqCst) {
                AcquireReason::TookOverExpired
            } else {
                AcquireReason::Vacant
            };
            tracing::info!(bus = %bus, owner = owner_id, ?reason, "Lease acquired");
            return Ok(AcquireOutcome {
                granted: true,
                reason,
                holder: None,
            });
        }

        let holder = result.snapshot.as_ref().and_then(Lease::from_value);
        match holder {
            Some(holder) => {
                tracing::debug!(bus = %bus, holder = %holder.owner_id, "Lease denied, bus already tracked");
                Ok(AcquireOutcome {
                    granted: false,
                    reason: AcquireReason::AlreadyTracked,
                    holder: Some(holder),
                })
            }
            // Only an encode failure aborts without a live holder.
            None => Err(encode_error(&path)),
        }
    }

    /// Overwrite the location and both timestamps, if we still own the lease.
    pub async fn renew_location(
        &self,
        bus: BusId,
        owner_id: &str,
        location: &Location,
    ) -> Result<bool, StoreError> {
        let committed = self
            .update_owned(bus, owner_id, |lease, now| {
                lease.location = *location;
                lease.last_update = now;
                lease.last_heartbeat = now;
            })
            .await?;
        if !committed {
            tracing::warn!(bus = %bus, owner = owner_id, "Location renew refused, no longer the tracker");
        }
        Ok(committed)
    }

    /// Refresh only `last_heartbeat`, if we still own the lease.
    pub async fn heartbeat(&self, bus: BusId, owner_id: &str) -> Result<bool, StoreError> {
        let committed = self
            .update_owned(bus, owner_id, |lease, now| {
                lease.last_heartbeat = now;
            })
            .await?;
        if !committed {
            tracing::warn!(bus = %bus, owner = owner_id, "Heartbeat refused, no longer the tracker");
        }
        Ok(committed)
    }

    /// Compare-and-delete: remove the lease only if `owner_id` holds it.
    pub async fn release(&self, bus: BusId, owner_id: &str) -> Result<bool, StoreError> {
        let result = self
            .remote
            .transaction(&lease_path(bus), &|current, _| {
                match current.and_then(Lease::from_value) {
                    Some(lease) if lease.is_owned_by(owner_id) => Transaction::Delete,
                    _ => Transaction::Abort,
                }
            })
            .await?;
        if result.committed {
            tracing::info!(bus = %bus, owner = owner_id, "Lease released");
        }
        Ok(result.committed)
    }

    /// Current live lease for `bus`, or `None` if absent or expired.
    ///
    /// An expired lease is cleaned up on a best-effort basis.
    pub async fn read(&self, bus: BusId) -> Result<Option<Lease>, StoreError> {
        let value = self.remote.get(&lease_path(bus)).await?;
        Ok(self.live_lease(bus, value.as_ref()).await)
    }

    /// Deliver the live lease for `bus` to `on_change` now and after every
    /// change, with the same expiry rule as [`read`](Self::read).
    pub fn subscribe<F>(&self, bus: BusId, on_change: F) -> Subscription
    where
        F: Fn(Option<Lease>) + Send + Sync + 'static,
    {
        let mut feed = self.remote.subscribe(&lease_path(bus));
        let store = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let snapshot = feed.borrow_and_update().clone();
                let lease = store.live_lease(bus, snapshot.as_ref()).await;
                on_change(lease);
                if feed.changed().await.is_err() {
                    break;
                }
            }
        });
        Subscription { task }
    }

    /// Remove the lease for `bus` if, at commit time, it is still expired.
    pub async fn cleanup_expired(&self, bus: BusId) -> Result<bool, StoreError> {
        let ttl_ms = self.ttl_ms;
        let result = self
            .remote
            .transaction(&lease_path(bus), &|current, now| {
                match current.map(|v| (v, Lease::from_value(v))) {
                    Some((_, Some(lease))) if !lease.is_expired(now, ttl_ms) => Transaction::Abort,
                    Some(_) => Transaction::Delete,
                    None => Transaction::Abort,
                }
            })
            .await?;
        if result.committed {
            tracing::info!(bus = %bus, "Removed expired lease");
        }
        Ok(result.committed)
    }

    async fn live_lease(&self, bus: BusId, value: Option<&Value>) -> Option<Lease> {
        let value = value?;
        if let Some(lease) = Lease::from_value(value) {
            if self.is_live(&lease) {
                return Some(lease);
            }
        }
        if let Err(e) = self.cleanup_expired(bus).await {
            tracing::debug!(bus = %bus, "Expired lease cleanup failed: {e}");
        }
        None
    }

    async fn update_owned<F>(&self, bus: BusId, owner_id: &str, apply: F) -> Result<bool, StoreError>
    where
        F: Fn(&mut Lease, i64) + Send + Sync,
    {
        let path = lease_path(bus);
        let result = self
            .remote
            .transaction(&path, &|current, now| match current.and_then(Lease::from_value) {
                Some(mut lease) if lease.is_owned_by(owner_id) => {
                    apply(&mut lease, now);
                    encode(&lease)
                }
                _ => Transaction::Abort,
            })
            .await?;

        if !result.committed {
            let still_ours = result
                .snapshot
                .as_ref()
                .and_then(Lease::from_value)
                .is_some_and(|lease| lease.is_owned_by(owner_id));
            if still_ours {
                return Err(encode_error(&path));
            }
        }
        Ok(result.committed)
    }
}

/// Handle to a live lease subscription. Dropping it unsubscribes.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn encode(lease: &Lease) -> Transaction {
    match serde_json::to_value(lease) {
        Ok(value) => Transaction::Write(value),
        Err(e) => {
            tracing::error!("Failed to encode lease: {e}");
            Transaction::Abort
        }
    }
}

fn encode_error(path: &str) -> StoreError {
    let source = <serde_json::Error as serde::ser::Error>::custom("lease record is not serializable");
    StoreError::Encode {
        path: path.to_string(),
        source,
    }
}
