//! Read side: follow a bus's live location.
//!
//! Push ([`Viewer::watch`]) and pull ([`Viewer::refresh`]) share one
//! expiry rule. Watchers also re-check on a timer, so a tracker that
//! crashes silently disappears once its lease ages out even though the
//! store never emits another change.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::StoreError;
use crate::geo::haversine_m;
use crate::lease::{Lease, LeaseStore};
use crate::model::{BusId, Coordinates, Location};

/// What a viewer shows for a tracked bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusView {
    pub bus: BusId,
    pub lease: Lease,
    /// Great-circle distance from the bus to the destination.
    pub distance_to_destination_m: f64,
    /// Milliseconds since the tracker's last heartbeat.
    pub heartbeat_age_ms: i64,
}

impl BusView {
    pub fn location(&self) -> &Location {
        &self.lease.location
    }
}

#[derive(Clone)]
pub struct Viewer {
    leases: LeaseStore,
    destination: Coordinates,
}

impl Viewer {
    pub fn new(leases: LeaseStore, destination: Coordinates) -> Self {
        Self {
            leases,
            destination,
        }
    }

    pub fn from_config(config: &TrackerConfig, leases: LeaseStore) -> Self {
        Self::new(leases, config.destination())
    }

    /// One-shot read for manual refresh.
    pub async fn refresh(&self, bus: BusId) -> Result<Option<BusView>, StoreError> {
        let lease = self.leases.read(bus).await?;
        Ok(self.view(bus, lease))
    }

    /// Call `on_update` with the current view and after every change.
    /// `None` means nobody is tracking the bus.
    pub fn watch<F>(&self, bus: BusId, on_update: F) -> ViewerSubscription
    where
        F: Fn(Option<BusView>) + Send + Sync + 'static,
    {
        let (tx, mut deliveries) = mpsc::unbounded_channel();
        let subscription = self.leases.subscribe(bus, move |lease| {
            let _ = tx.send(lease);
        });
        let viewer = self.clone();

        let task = tokio::spawn(async move {
            let _subscription = subscription;
            let mut current: Option<Lease> = None;
            loop {
                let deadline = current.as_ref().map(|lease| viewer.until_expiry(lease));
                tokio::select! {
                    delivery = deliveries.recv() => {
                        let Some(lease) = delivery else { break };
                        current = lease;
                        let view = viewer.view(bus, current.clone());
                        if view.is_none() {
                            current = None;
                        }
                        on_update(view);
                    }
                    _ = expiry(deadline) => {
                        if let Some(lease) = current.take() {
                            match viewer.view(bus, Some(lease.clone())) {
                                Some(_) => current = Some(lease),
                                None => {
                                    tracing::debug!(bus = %bus, "Tracker went silent, lease expired");
                                    on_update(None);
                                }
                            }
                        }
                    }
                }
            }
        });
        ViewerSubscription { task }
    }

    fn view(&self, bus: BusId, lease: Option<Lease>) -> Option<BusView> {
        let lease = lease?;
        let now = self.clock().now_ms();
        if lease.is_expired(now, self.leases.ttl_ms()) {
            return None;
        }
        Some(BusView {
            bus,
            distance_to_destination_m: haversine_m(lease.location.coordinates(), self.destination),
            heartbeat_age_ms: lease.heartbeat_age_ms(now),
            lease,
        })
    }

    /// Time left until `lease` counts as expired.
    fn until_expiry(&self, lease: &Lease) -> Duration {
        let expires_at = lease.last_heartbeat + self.leases.ttl_ms() + 1;
        let remaining = expires_at - self.clock().now_ms();
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.leases.clock()
    }
}

async fn expiry(after: Option<Duration>) {
    match after {
        Some(after) => tokio::time::sleep(after).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running [`Viewer::watch`]. Dropping it stops the updates.
pub struct ViewerSubscription {
    task: JoinHandle<()>,
}

impl ViewerSubscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for ViewerSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
