//! Tracker coordinator: the write side of the lease protocol.
//!
//! ```text
//!          start_tracking                 granted
//!   Idle ───────────────▸ Acquiring ─────────────────▸ Active
//!    ▲                       │ denied / no fix           │  stop / arrival / lease lost
//!    └───────────────────────┘                           ▼
//!    ◂───────────────────────────────────────────── Releasing
//! ```
//!
//! The session lives inside one spawned actor task; the public
//! [`TrackerCoordinator`] is a cheap cloneable handle that sends it
//! commands and reads its published [`TrackerStatus`].

mod actor;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::identity::DeviceIdentity;
use crate::lease::{Lease, LeaseStore};
use crate::location::LocationSource;
use crate::model::BusId;
use crate::queue::OfflineQueue;
use crate::remote::RemoteStore;
use crate::storage::KeyValueStore;

use actor::{Command, TrackerActor};

/// Capacity of the command channel between handles and the actor.
const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerPhase {
    #[default]
    Idle,
    Acquiring,
    Active,
    Releasing,
}

/// Snapshot of the coordinator, republished after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStatus {
    pub phase: TrackerPhase,
    pub bus: Option<BusId>,
    /// Updates waiting in the offline queue.
    pub queued: usize,
    /// Fixes accepted by the quality filter this session.
    pub accepted_fixes: u64,
    /// Fixes dropped by the quality filter this session.
    pub rejected_fixes: u64,
}

/// Why a session ended without the user asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The bus reached its destination; the lease was released.
    Arrived,
    /// Another device owns the lease now, or it was cleaned up.
    LeaseLost,
}

/// Receives involuntary session ends so the host can inform the user.
pub trait DisconnectSink: Send + Sync {
    fn tracker_disconnected(&self, bus: BusId, reason: DisconnectReason);
}

impl<F> DisconnectSink for F
where
    F: Fn(BusId, DisconnectReason) + Send + Sync,
{
    fn tracker_disconnected(&self, bus: BusId, reason: DisconnectReason) {
        self(bus, reason)
    }
}

/// Result of a start request that reached the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Tracking {
        bus: BusId,
        /// An expired lease left by another device was replaced.
        took_over_expired: bool,
    },
    AlreadyTracked {
        bus: BusId,
        holder: Option<Lease>,
    },
}

impl StartOutcome {
    pub fn is_tracking(&self) -> bool {
        matches!(self, Self::Tracking { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Self::Tracking { bus, .. } => format!("You are now tracking Bus {bus}"),
            Self::AlreadyTracked { bus, .. } => format!("Bus {bus} is already being tracked"),
        }
    }
}

/// Collaborators the coordinator owns for its lifetime.
pub struct TrackerServices {
    pub leases: LeaseStore,
    pub location: Arc<dyn LocationSource>,
    pub queue: OfflineQueue,
    pub identity: DeviceIdentity,
    pub disconnect: Arc<dyn DisconnectSink>,
}

impl TrackerServices {
    /// Wire up services from platform collaborators: loads the device
    /// identity and the persisted offline queue from `storage`.
    pub async fn open(
        config: &TrackerConfig,
        remote: Arc<dyn RemoteStore>,
        location: Arc<dyn LocationSource>,
        storage: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        disconnect: Arc<dyn DisconnectSink>,
    ) -> Result<Self> {
        let identity = DeviceIdentity::load_or_create(storage.as_ref()).await?;
        let queue = OfflineQueue::load(
            storage,
            clock.clone(),
            config.queue.capacity,
            config.queue_max_age(),
        )
        .await;
        Ok(Self {
            leases: config.lease_store(remote, clock),
            location,
            queue,
            identity,
            disconnect,
        })
    }
}

/// Handle to the tracker actor.
#[derive(Clone)]
pub struct TrackerCoordinator {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<TrackerStatus>,
}

impl TrackerCoordinator {
    /// Spawn the actor on the current runtime. Fails if `config` does
    /// not validate.
    pub fn spawn(config: &TrackerConfig, services: TrackerServices) -> Result<Self> {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = watch::channel(TrackerStatus::default());
        let actor = TrackerActor::new(config, services, command_rx, status_tx);
        tokio::spawn(actor.run());
        Ok(Self {
            commands: command_tx,
            status: status_rx,
        })
    }

    /// Acquire the lease for `bus` and begin publishing.
    ///
    /// `Ok(AlreadyTracked)` is the normal contention outcome. Errors are
    /// a session already running, no position fix, or an unreachable
    /// store; none are retried automatically.
    pub async fn start_tracking(&self, bus: BusId) -> Result<StartOutcome, TrackerError> {
        self.request(|reply| Command::Start { bus, reply }).await?
    }

    /// [`start_tracking`](Self::start_tracking) from user-entered text.
    pub async fn start_tracking_input(&self, input: &str) -> Result<StartOutcome, TrackerError> {
        let bus: BusId = input.parse()?;
        self.start_tracking(bus).await
    }

    /// Stop the session and release the lease. `Ok(false)` means the
    /// session ended locally but the lease could not be released.
    pub async fn stop_tracking(&self) -> Result<bool, TrackerError> {
        self.request(|reply| Command::Stop { reply }).await?
    }

    /// The host app returned to the foreground.
    pub async fn app_foregrounded(&self) {
        if self.commands.send(Command::Foreground).await.is_err() {
            tracing::debug!("Foreground signal dropped, tracker already shut down");
        }
    }

    /// Cancel the watch and timers without releasing the lease.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    pub fn status(&self) -> TrackerStatus {
        self.status.borrow().clone()
    }

    /// Receiver of every status change.
    pub fn watch_status(&self) -> watch::Receiver<TrackerStatus> {
        self.status.clone()
    }

    pub fn is_tracking(&self) -> bool {
        self.status.borrow().phase == TrackerPhase::Active
    }

    pub fn current_bus(&self) -> Option<BusId> {
        let status = self.status.borrow();
        match status.phase {
            TrackerPhase::Active => status.bus,
            _ => None,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, TrackerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| TrackerError::Closed)?;
        response.await.map_err(|_| TrackerError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock as _, ManualClock};
    use crate::error::{LocationError, ValidationError};
    use crate::location::geofence::DEFAULT_DESTINATION;
    use crate::location::ManualLocationSource;
    use crate::model::Location;
    use crate::remote::MemoryRemoteStore;
    use crate::storage::MemoryKvStore;
    use parking_lot::Mutex;
    use std::time::Duration;

    const START: i64 = 1_700_000_000_000;

    struct Harness {
        clock: Arc<ManualClock>,
        remote: Arc<MemoryRemoteStore>,
        location: Arc<ManualLocationSource>,
        leases: LeaseStore,
        identity: DeviceIdentity,
        disconnects: Arc<Mutex<Vec<(BusId, DisconnectReason)>>>,
        tracker: TrackerCoordinator,
    }

    async fn harness() -> Harness {
        let config = TrackerConfig::default();
        let clock = Arc::new(ManualClock::new(START));
        let remote = Arc::new(MemoryRemoteStore::new(clock.clone()));
        let location = Arc::new(ManualLocationSource::new());
        let storage = Arc::new(MemoryKvStore::new());
        let disconnects = Arc::new(Mutex::new(Vec::new()));
        let sink = disconnects.clone();

        let services = TrackerServices::open(
            &config,
            remote.clone(),
            location.clone(),
            storage,
            clock.clone(),
            Arc::new(move |bus: BusId, reason: DisconnectReason| {
                sink.lock().push((bus, reason));
            }),
        )
        .await
        .unwrap();
        let leases = services.leases.clone();
        let identity = services.identity.clone();

        Harness {
            clock,
            remote,
            location,
            leases,
            identity,
            disconnects,
            tracker: TrackerCoordinator::spawn(&config, services).unwrap(),
        }
    }

    impl Harness {
        /// A fix `step` increments north of a point well outside the
        /// destination zone, taken at the current clock time.
        fn fix_at_step(&self, step: u32) -> Location {
            Location::new(
                17.30 + f64::from(step) * 0.0005,
                78.50,
                8.0,
                self.clock.now_ms(),
            )
        }

        fn fix_at_destination(&self) -> Location {
            Location::new(
                DEFAULT_DESTINATION.latitude,
                DEFAULT_DESTINATION.longitude,
                8.0,
                self.clock.now_ms(),
            )
        }

        /// Advance the device clock and deliver a fix taken then.
        async fn deliver(&self, make: impl Fn(&Self) -> Location) -> Location {
            self.clock.advance(Duration::from_secs(10));
            let fix = make(self);
            self.location.push_fix(fix);
            settle().await;
            fix
        }

        async fn start(&self) -> StartOutcome {
            self.location.push_fix(self.fix_at_step(0));
            self.tracker.start_tracking(bus(7)).await.unwrap()
        }
    }

    fn bus(n: u32) -> BusId {
        BusId::new(n).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_acquires_lease_and_watches() {
        let h = harness().await;
        let outcome = h.start().await;
        assert_eq!(
            outcome,
            StartOutcome::Tracking {
                bus: bus(7),
                took_over_expired: false
            }
        );
        assert_eq!(outcome.message(), "You are now tracking Bus 7");

        assert!(h.tracker.is_tracking());
        assert_eq!(h.tracker.current_bus(), Some(bus(7)));
        assert_eq!(h.location.active_watches(), 1);
        let lease = h.leases.read(bus(7)).await.unwrap().unwrap();
        assert_eq!(lease.owner_id, h.identity.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn start_denied_when_bus_already_tracked() {
        let h = harness().await;
        h.leases
            .try_acquire(bus(7), &h.fix_at_step(0), "device_other")
            .await
            .unwrap();

        let outcome = h.start().await;
        assert!(!outcome.is_tracking());
        assert_eq!(outcome.message(), "Bus 7 is already being tracked");
        match outcome {
            StartOutcome::AlreadyTracked { holder, .. } => {
                assert_eq!(holder.unwrap().owner_id, "device_other");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.tracker.status().phase, TrackerPhase::Idle);
        assert_eq!(h.location.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_fix_surfaces_location_error() {
        let h = harness().await;
        let err = h.tracker.start_tracking(bus(7)).await.unwrap_err();
        assert!(matches!(err, TrackerError::Location(LocationError::Unavailable(_))));
        assert_eq!(h.tracker.status().phase, TrackerPhase::Idle);
        assert!(h.remote.peek("buses/7/tracker").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_tracking_is_rejected() {
        let h = harness().await;
        h.start().await;
        let err = h.tracker.start_tracking(bus(9)).await.unwrap_err();
        assert!(matches!(err, TrackerError::AlreadyTracking { bus: b } if b == bus(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn start_from_text_validates_before_store() {
        let h = harness().await;
        let err = h.tracker.start_tracking_input("  ").await.unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Validation(ValidationError::MissingBusId)
        ));
        let err = h.tracker.start_tracking_input("53").await.unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Validation(ValidationError::InvalidBusId(_))
        ));
        assert_eq!(h.remote.commit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_fix_renews_location() {
        let h = harness().await;
        h.start().await;
        let fix = h.deliver(|h| h.fix_at_step(1)).await;

        let lease = h.leases.read(bus(7)).await.unwrap().unwrap();
        assert_eq!(lease.location, fix);
        assert_eq!(lease.last_update, h.clock.now_ms());
        assert_eq!(h.tracker.status().accepted_fixes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn imprecise_fix_is_dropped_silently() {
        let h = harness().await;
        h.start().await;
        let commits = h.remote.commit_count();
        h.deliver(|h| {
            let mut fix = h.fix_at_step(1);
            fix.accuracy = 80.0;
            fix
        })
        .await;

        assert_eq!(h.remote.commit_count(), commits);
        assert_eq!(h.tracker.status().rejected_fixes, 1);
        assert!(h.tracker.is_tracking());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_errors_do_not_end_session() {
        let h = harness().await;
        h.start().await;
        h.location
            .push_error(LocationError::Unavailable("signal lost".into()));
        settle().await;
        assert!(h.tracker.is_tracking());
        assert!(h.disconnects.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_releases_and_notifies() {
        let h = harness().await;
        h.location.push_fix(h.fix_at_destination());
        h.tracker.start_tracking(bus(7)).await.unwrap();

        h.deliver(Harness::fix_at_destination).await;
        h.deliver(Harness::fix_at_destination).await;
        assert!(h.tracker.is_tracking());
        h.deliver(Harness::fix_at_destination).await;

        assert_eq!(*h.disconnects.lock(), vec![(bus(7), DisconnectReason::Arrived)]);
        assert!(h.remote.peek("buses/7/tracker").is_none());
        assert_eq!(h.tracker.status().phase, TrackerPhase::Idle);
        assert_eq!(h.location.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_ends_session_without_release() {
        let h = harness().await;
        h.start().await;

        // Another device takes over after our lease disappears.
        h.leases.release(bus(7), h.identity.as_str()).await.unwrap();
        h.leases
            .try_acquire(bus(7), &h.fix_at_step(5), "device_other")
            .await
            .unwrap();
        h.deliver(|h| h.fix_at_step(1)).await;

        assert_eq!(*h.disconnects.lock(), vec![(bus(7), DisconnectReason::LeaseLost)]);
        let lease = h.leases.read(bus(7)).await.unwrap().unwrap();
        assert_eq!(lease.owner_id, "device_other");
        assert!(!h.tracker.is_tracking());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_store_queues_then_foreground_flushes() {
        let h = harness().await;
        h.start().await;

        h.remote.set_connected(false);
        let fix = h.deliver(|h| h.fix_at_step(1)).await;
        assert_eq!(h.tracker.status().queued, 1);
        assert!(h.tracker.is_tracking());
        assert!(h.disconnects.lock().is_empty());

        h.remote.set_connected(true);
        h.tracker.app_foregrounded().await;
        settle().await;

        assert_eq!(h.tracker.status().queued, 0);
        let lease = h.leases.read(bus(7)).await.unwrap().unwrap();
        assert_eq!(lease.location, fix);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timer_flushes_queue() {
        let h = harness().await;
        h.start().await;

        h.remote.set_connected(false);
        let fix = h.deliver(|h| h.fix_at_step(1)).await;
        assert_eq!(h.tracker.status().queued, 1);

        h.remote.set_connected(true);
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(h.tracker.status().queued, 0);
        let lease = h.leases.read(bus(7)).await.unwrap().unwrap();
        assert_eq!(lease.location, fix);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_every_interval() {
        let h = harness().await;
        h.start().await;

        h.clock.advance(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;

        let lease = h.leases.read(bus(7)).await.unwrap().unwrap();
        assert_eq!(lease.last_heartbeat, START + 30_000);
        assert_eq!(lease.last_update, START);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_heartbeat_ends_session() {
        let h = harness().await;
        h.start().await;
        h.leases.release(bus(7), h.identity.as_str()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(*h.disconnects.lock(), vec![(bus(7), DisconnectReason::LeaseLost)]);
        assert_eq!(h.tracker.status().phase, TrackerPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_heartbeat_keeps_session() {
        let h = harness().await;
        h.start().await;
        h.remote.set_connected(false);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.tracker.is_tracking());
        assert!(h.disconnects.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_lease() {
        let h = harness().await;
        h.start().await;

        assert!(h.tracker.stop_tracking().await.unwrap());
        assert!(h.remote.peek("buses/7/tracker").is_none());
        assert_eq!(h.location.active_watches(), 0);
        assert_eq!(h.tracker.status(), TrackerStatus::default());
        assert!(h.disconnects.lock().is_empty());

        assert!(matches!(
            h.tracker.stop_tracking().await,
            Err(TrackerError::NotTracking)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_offline_still_goes_idle() {
        let h = harness().await;
        h.start().await;
        h.remote.set_connected(false);

        assert!(!h.tracker.stop_tracking().await.unwrap());
        assert_eq!(h.tracker.status().phase, TrackerPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_leaves_lease_to_expire() {
        let h = harness().await;
        h.start().await;
        h.tracker.shutdown().await;

        assert!(h.remote.peek("buses/7/tracker").is_some());
        assert_eq!(h.location.active_watches(), 0);
        assert!(matches!(
            h.tracker.start_tracking(bus(7)).await,
            Err(TrackerError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_fixes_each_reach_the_geofence() {
        let h = harness().await;
        h.location.push_fix(h.fix_at_destination());
        h.tracker.start_tracking(bus(7)).await.unwrap();
        h.deliver(Harness::fix_at_destination).await;

        // Queued back to back, so the actor drains both in one pass.
        h.clock.advance(Duration::from_secs(60));
        h.location.push_fix(Location::new(
            DEFAULT_DESTINATION.latitude + 0.006,
            DEFAULT_DESTINATION.longitude,
            8.0,
            h.clock.now_ms(),
        ));
        h.clock.advance(Duration::from_secs(60));
        h.location.push_fix(h.fix_at_destination());
        settle().await;

        // Only the newest fix of the backlog was written.
        let lease = h.leases.read(bus(7)).await.unwrap().unwrap();
        assert_eq!(lease.location.timestamp, h.clock.now_ms());

        h.deliver(Harness::fix_at_destination).await;
        assert!(h.tracker.is_tracking());
        assert!(h.disconnects.lock().is_empty());
        assert_eq!(h.tracker.status().accepted_fixes, 4);

        h.deliver(Harness::fix_at_destination).await;
        assert_eq!(*h.disconnects.lock(), vec![(bus(7), DisconnectReason::Arrived)]);
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_progress_resets_between_sessions() {
        let h = harness().await;
        h.location.push_fix(h.fix_at_destination());
        h.tracker.start_tracking(bus(7)).await.unwrap();
        h.deliver(Harness::fix_at_destination).await;
        h.deliver(Harness::fix_at_destination).await;
        assert!(h.tracker.stop_tracking().await.unwrap());

        h.location.push_fix(h.fix_at_destination());
        h.tracker.start_tracking(bus(7)).await.unwrap();
        h.deliver(Harness::fix_at_destination).await;
        assert!(h.tracker.is_tracking());
        h.deliver(Harness::fix_at_destination).await;
        assert!(h.tracker.is_tracking());
        assert!(h.disconnects.lock().is_empty());

        h.deliver(Harness::fix_at_destination).await;
        assert_eq!(*h.disconnects.lock(), vec![(bus(7), DisconnectReason::Arrived)]);
    }

    #[tokio::test]
    async fn spawn_rejects_zero_intervals() {
        let clock = Arc::new(ManualClock::new(START));
        let config = TrackerConfig::default();

        for broken in [
            TrackerConfig {
                lease: crate::config::LeaseConfig {
                    heartbeat_interval_secs: 0,
                    ..config.lease.clone()
                },
                ..config.clone()
            },
            TrackerConfig {
                queue: crate::config::QueueConfig {
                    retry_interval_secs: 0,
                    ..config.queue.clone()
                },
                ..config.clone()
            },
        ] {
            let services = TrackerServices::open(
                &config,
                Arc::new(MemoryRemoteStore::new(clock.clone())),
                Arc::new(ManualLocationSource::new()),
                Arc::new(MemoryKvStore::new()),
                clock.clone(),
                Arc::new(|_: BusId, _: DisconnectReason| {}),
            )
            .await
            .unwrap();
            let err = TrackerCoordinator::spawn(&broken, services).err().unwrap();
            assert!(err.to_string().contains("must be greater than zero"));
        }
    }
}
