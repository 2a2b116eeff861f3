//! Offline queue of location updates the store could not confirm.
//!
//! Bounded (oldest evicted first), persisted after every mutation, and
//! purged of entries older than the maximum age on load and before each
//! flush. Only entries for the session's current bus are ever sent;
//! anything else is stale and dropped.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::lease::LeaseStore;
use crate::model::{BusId, Location};
use crate::storage::KeyValueStore;

/// Storage key of the persisted queue.
pub const QUEUE_KEY: &str = "queued_locations";

pub const DEFAULT_CAPACITY: usize = 10;

/// Queued entries older than this are discarded (1 hour).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedUpdate {
    pub bus_id: BusId,
    pub location: Location,
    /// Epoch ms at which the update was queued.
    pub enqueued_at: i64,
}

/// Outcome of one [`OfflineQueue::flush`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// The store reported offline; nothing was attempted.
    pub skipped_offline: bool,
    pub sent: usize,
    pub requeued: usize,
    /// Entries for another bus, or refused by the store.
    pub dropped: usize,
    /// The store refused an update because the lease is no longer ours.
    pub ownership_lost: bool,
}

pub struct OfflineQueue {
    entries: VecDeque<QueuedUpdate>,
    storage: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    max_age_ms: i64,
}

impl OfflineQueue {
    /// Load the persisted queue, discarding entries past the maximum age.
    ///
    /// An unreadable or corrupt persisted queue is logged and replaced by
    /// an empty one.
    pub async fn load(
        storage: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        capacity: usize,
        max_age: Duration,
    ) -> Self {
        let mut queue = Self {
            entries: VecDeque::new(),
            storage,
            clock,
            capacity: capacity.max(1),
            max_age_ms: i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX),
        };

        match queue.read_persisted().await {
            Ok(entries) => {
                queue.entries = entries.into();
                let purged = queue.purge_expired();
                while queue.entries.len() > queue.capacity {
                    queue.entries.pop_front();
                }
                if purged > 0 {
                    tracing::info!(purged, "Discarded stale queued locations");
                    queue.persist().await;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to load queued locations, starting empty: {e:#}");
            }
        }
        queue
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueuedUpdate> {
        self.entries.iter()
    }

    /// Append an update, evicting the oldest entry when full.
    pub async fn enqueue(&mut self, bus: BusId, location: Location) {
        self.entries.push_back(QueuedUpdate {
            bus_id: bus,
            location,
            enqueued_at: self.clock.now_ms(),
        });
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::debug!(bus = %evicted.bus_id, "Queue full, dropped oldest location");
            }
        }
        tracing::debug!(bus = %bus, queued = self.entries.len(), "Queued location for retry");
        self.persist().await;
    }

    /// Drop queued updates for `bus` taken before `confirmed_at`: a newer
    /// fix has already reached the store.
    pub async fn discard_superseded(&mut self, bus: BusId, confirmed_at: i64) {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.bus_id != bus || e.location.timestamp > confirmed_at);
        if self.entries.len() != before {
            self.persist().await;
        }
    }

    pub async fn clear(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        self.entries.clear();
        self.persist().await;
    }

    /// Try to deliver every queued update for `current_bus`.
    ///
    /// No-op while the store is offline. Updates for any other bus are
    /// dropped. After the first transport failure the remaining entries
    /// are re-queued untried, keeping their order, behind anything
    /// queued in the meantime.
    pub async fn flush(
        &mut self,
        current_bus: Option<BusId>,
        leases: &LeaseStore,
        owner_id: &str,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        if self.entries.is_empty() {
            return report;
        }
        if !leases.is_connected().await {
            report.skipped_offline = true;
            return report;
        }

        self.purge_expired();
        let pending = std::mem::take(&mut self.entries);
        let mut still_pending = Vec::new();
        let mut reachable = true;

        for entry in pending {
            if Some(entry.bus_id) != current_bus {
                report.dropped += 1;
                continue;
            }
            if !reachable || report.ownership_lost {
                still_pending.push(entry);
                continue;
            }
            match leases
                .renew_location(entry.bus_id, owner_id, &entry.location)
                .await
            {
                Ok(true) => report.sent += 1,
                Ok(false) => {
                    report.ownership_lost = true;
                    report.dropped += 1;
                }
                Err(e) => {
                    tracing::warn!(bus = %entry.bus_id, "Queued location still undeliverable: {e}");
                    reachable = false;
                    still_pending.push(entry);
                }
            }
        }

        if report.ownership_lost {
            report.dropped += still_pending.len();
            still_pending.clear();
        }
        report.requeued = still_pending.len();
        self.entries.extend(still_pending);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self.persist().await;

        tracing::info!(
            sent = report.sent,
            requeued = report.requeued,
            dropped = report.dropped,
            "Flushed offline queue"
        );
        report
    }

    fn purge_expired(&mut self) -> usize {
        let now = self.clock.now_ms();
        let max_age = self.max_age_ms;
        let before = self.entries.len();
        self.entries.retain(|e| now - e.enqueued_at <= max_age);
        before - self.entries.len()
    }

    async fn read_persisted(&self) -> Result<Vec<QueuedUpdate>> {
        let Some(bytes) = self.storage.get(QUEUE_KEY).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_slice(&bytes).context("decoding queued locations")
    }

    async fn persist(&self) {
        let result = match serde_json::to_vec(&self.entries) {
            Ok(bytes) => self.storage.set(QUEUE_KEY, &bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!("Failed to persist queued locations: {e:#}");
        }
    }
}
