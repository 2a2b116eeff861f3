//! The write-side actor. Owns all session state; every input (commands,
//! watch fixes, heartbeat ticks, retry ticks) is handled one at a time
//! from a single `select!` loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use super::{
    DisconnectReason, DisconnectSink, StartOutcome, TrackerPhase, TrackerServices, TrackerStatus,
};
use crate::config::TrackerConfig;
use crate::error::{LocationError, TrackerError};
use crate::identity::DeviceIdentity;
use crate::lease::{AcquireReason, LeaseStore};
use crate::location::{
    GeofenceEvent, GeofenceMonitor, LocationEvent, LocationFilter, LocationOptions,
    LocationSource, WatchId,
};
use crate::model::{BusId, Location};
use crate::queue::OfflineQueue;

pub(super) enum Command {
    Start {
        bus: BusId,
        reply: oneshot::Sender<Result<StartOutcome, TrackerError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<bool, TrackerError>>,
    },
    Foreground,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// State of one Active session.
struct Session {
    bus: BusId,
    watch_id: WatchId,
    fixes: mpsc::UnboundedReceiver<LocationEvent>,
    fixes_open: bool,
    heartbeat: Interval,
    last_accepted: Option<Location>,
}

enum SessionEvent {
    Fix(Option<LocationEvent>),
    Heartbeat,
}

pub(super) struct TrackerActor {
    leases: LeaseStore,
    location: Arc<dyn LocationSource>,
    queue: OfflineQueue,
    identity: DeviceIdentity,
    disconnect: Arc<dyn DisconnectSink>,
    filter: LocationFilter,
    geofence: GeofenceMonitor,
    fix_options: LocationOptions,
    watch_options: LocationOptions,
    heartbeat_period: Duration,
    retry: Interval,
    session: Option<Session>,
    status: watch::Sender<TrackerStatus>,
    commands: mpsc::Receiver<Command>,
}

impl TrackerActor {
    pub(super) fn new(
        config: &TrackerConfig,
        services: TrackerServices,
        commands: mpsc::Receiver<Command>,
        status: watch::Sender<TrackerStatus>,
    ) -> Self {
        let retry_period = config.retry_interval();
        let mut retry = time::interval_at(Instant::now() + retry_period, retry_period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            leases: services.leases,
            location: services.location,
            queue: services.queue,
            identity: services.identity,
            disconnect: services.disconnect,
            filter: config.filter(),
            geofence: config.geofence(),
            fix_options: config.location_options(),
            watch_options: config.watch_options(),
            heartbeat_period: config.heartbeat_interval(),
            retry,
            session: None,
            status,
            commands,
        }
    }

    pub(super) async fn run(mut self) {
        self.publish_queue_len();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start { bus, reply }) => {
                        let _ = reply.send(self.start(bus).await);
                    }
                    Some(Command::Stop { reply }) => {
                        let _ = reply.send(self.stop().await);
                    }
                    Some(Command::Foreground) => self.on_foreground().await,
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                event = next_session_event(&mut self.session) => match event {
                    SessionEvent::Fix(event) => self.on_fix(event).await,
                    SessionEvent::Heartbeat => self.on_heartbeat().await,
                },
                _ = self.retry.tick(), if self.session.is_some() && !self.queue.is_empty() => {
                    tracing::debug!(queued = self.queue.len(), "Retrying offline queue");
                    self.flush_queue().await;
                }
            }
        }
        tracing::debug!("Tracker actor stopped");
    }

    // ── Start / stop ─────────────────────────────────────────────

    async fn start(&mut self, bus: BusId) -> Result<StartOutcome, TrackerError> {
        if let Some(session) = &self.session {
            return Err(TrackerError::AlreadyTracking { bus: session.bus });
        }

        self.status.send_modify(|s| {
            *s = TrackerStatus {
                phase: TrackerPhase::Acquiring,
                bus: Some(bus),
                queued: self.queue.len(),
                ..TrackerStatus::default()
            };
        });

        let result = self.acquire(bus).await;
        if !matches!(result, Ok(StartOutcome::Tracking { .. })) {
            self.set_phase(TrackerPhase::Idle, None);
        }
        result
    }

    async fn acquire(&mut self, bus: BusId) -> Result<StartOutcome, TrackerError> {
        let fix = self.current_fix().await?;

        let outcome = self
            .leases
            .try_acquire(bus, &fix, self.identity.as_str())
            .await?;
        if !outcome.granted {
            tracing::info!(bus = %bus, "{}", outcome.message(bus));
            return Ok(StartOutcome::AlreadyTracked {
                bus,
                holder: outcome.holder,
            });
        }

        let watch = match self.location.watch(&self.watch_options) {
            Ok(watch) => watch,
            Err(e) => {
                tracing::warn!(bus = %bus, "Location watch failed to start, releasing: {e}");
                if let Err(release_err) = self.leases.release(bus, self.identity.as_str()).await {
                    tracing::warn!(bus = %bus, "Release after failed start also failed: {release_err}");
                }
                return Err(e.into());
            }
        };

        self.geofence.reset();
        let period = self.heartbeat_period;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.session = Some(Session {
            bus,
            watch_id: watch.id,
            fixes: watch.fixes,
            fixes_open: true,
            heartbeat,
            last_accepted: Some(fix),
        });
        self.set_phase(TrackerPhase::Active, Some(bus));
        tracing::info!(bus = %bus, device = %self.identity, "{}", outcome.message(bus));

        if !self.queue.is_empty() {
            self.flush_queue().await;
        }

        Ok(StartOutcome::Tracking {
            bus,
            took_over_expired: outcome.reason == AcquireReason::TookOverExpired,
        })
    }

    async fn current_fix(&self) -> Result<Location, LocationError> {
        let limit = self.fix_options.timeout;
        match time::timeout(limit, self.location.get_once(&self.fix_options)).await {
            Ok(fix) => fix,
            Err(_) => Err(LocationError::Timeout(limit)),
        }
    }

    async fn stop(&mut self) -> Result<bool, TrackerError> {
        let Some(bus) = self.close_session() else {
            return Err(TrackerError::NotTracking);
        };
        self.set_phase(TrackerPhase::Releasing, Some(bus));

        let released = match self.leases.release(bus, self.identity.as_str()).await {
            Ok(released) => released,
            Err(e) => {
                tracing::warn!(bus = %bus, "Release failed, lease will expire on its own: {e}");
                false
            }
        };
        self.queue.clear().await;
        self.set_phase(TrackerPhase::Idle, None);
        tracing::info!(bus = %bus, released, "Tracking stopped");
        Ok(released)
    }

    /// Involuntary end of the session. Releases only on arrival: after a
    /// lost lease there is nothing of ours to release.
    async fn end_session(&mut self, reason: DisconnectReason) {
        let Some(bus) = self.close_session() else {
            return;
        };
        self.set_phase(TrackerPhase::Releasing, Some(bus));

        if reason == DisconnectReason::Arrived {
            if let Err(e) = self.leases.release(bus, self.identity.as_str()).await {
                tracing::warn!(bus = %bus, "Release on arrival failed: {e}");
            }
        }
        self.queue.clear().await;
        self.set_phase(TrackerPhase::Idle, None);
        tracing::info!(bus = %bus, ?reason, "Tracking ended");
        self.disconnect.tracker_disconnected(bus, reason);
    }

    /// Cancel the watch and drop both timers. The lease is untouched.
    fn close_session(&mut self) -> Option<BusId> {
        let session = self.session.take()?;
        self.location.cancel(session.watch_id);
        self.geofence.reset();
        Some(session.bus)
    }

    fn shutdown(&mut self) {
        if let Some(bus) = self.close_session() {
            tracing::info!(bus = %bus, "Tracker shut down, lease left to expire");
        }
        self.set_phase(TrackerPhase::Idle, None);
    }

    // ── Session events ───────────────────────────────────────────

    async fn on_fix(&mut self, event: Option<LocationEvent>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(first) = event else {
            tracing::warn!(bus = %session.bus, "Location watch closed by the source");
            session.fixes_open = false;
            return;
        };

        // Every fix of a backlog goes through the filter and the geofence
        // in order; only the newest accepted one is written.
        let bus = session.bus;
        let mut latest = None;
        let mut accepted = 0;
        let mut rejected = 0;
        let mut arrived = false;
        let mut next = Some(first);
        while let Some(event) = next {
            match event {
                Ok(fix) => {
                    let verdict = self.filter.evaluate(&fix, session.last_accepted.as_ref());
                    if verdict.is_accepted() {
                        session.last_accepted = Some(fix);
                        latest = Some(fix);
                        accepted += 1;
                        if self.geofence.observe(&fix) == GeofenceEvent::Arrived {
                            arrived = true;
                            break;
                        }
                    } else {
                        tracing::debug!(bus = %bus, ?verdict, "Location rejected");
                        rejected += 1;
                    }
                }
                Err(e) => tracing::warn!(bus = %bus, "Location watch error: {e}"),
            }
            next = session.fixes.try_recv().ok();
        }
        self.status.send_modify(|s| {
            s.accepted_fixes += accepted;
            s.rejected_fixes += rejected;
        });

        if arrived {
            tracing::info!(bus = %bus, "Arrived at destination");
            self.end_session(DisconnectReason::Arrived).await;
            return;
        }
        let Some(fix) = latest else {
            return;
        };

        if !self.queue.is_empty() {
            self.flush_queue().await;
            if self.session.is_none() {
                return;
            }
        }

        match self
            .leases
            .renew_location(bus, self.identity.as_str(), &fix)
            .await
        {
            Ok(true) => self.queue.discard_superseded(bus, fix.timestamp).await,
            Ok(false) => {
                self.end_session(DisconnectReason::LeaseLost).await;
                return;
            }
            Err(e) => {
                tracing::warn!(bus = %bus, "Location write failed, queued for retry: {e}");
                if self.queue.is_empty() {
                    self.retry.reset();
                }
                self.queue.enqueue(bus, fix).await;
            }
        }
        self.publish_queue_len();
    }

    async fn on_heartbeat(&mut self) {
        let Some(bus) = self.session.as_ref().map(|s| s.bus) else {
            return;
        };
        match self.leases.heartbeat(bus, self.identity.as_str()).await {
            Ok(true) => tracing::debug!(bus = %bus, "Heartbeat sent"),
            Ok(false) => self.end_session(DisconnectReason::LeaseLost).await,
            Err(e) => tracing::warn!(bus = %bus, "Heartbeat failed, retrying next tick: {e}"),
        }
    }

    async fn on_foreground(&mut self) {
        if self.session.is_some() && !self.queue.is_empty() {
            tracing::debug!("App foregrounded, flushing offline queue");
            self.flush_queue().await;
        }
    }

    async fn flush_queue(&mut self) {
        let Some(bus) = self.session.as_ref().map(|s| s.bus) else {
            return;
        };
        let report = self
            .queue
            .flush(Some(bus), &self.leases, self.identity.as_str())
            .await;
        self.publish_queue_len();
        if report.ownership_lost {
            self.end_session(DisconnectReason::LeaseLost).await;
        }
    }

    // ── Status ───────────────────────────────────────────────────

    fn set_phase(&self, phase: TrackerPhase, bus: Option<BusId>) {
        let queued = self.queue.len();
        self.status.send_modify(|s| {
            s.phase = phase;
            s.bus = bus;
            s.queued = queued;
        });
    }

    fn publish_queue_len(&self) {
        let queued = self.queue.len();
        self.status.send_modify(|s| s.queued = queued);
    }
}

/// Next fix or heartbeat tick of the active session; never resolves
/// while idle.
async fn next_session_event(session: &mut Option<Session>) -> SessionEvent {
    let Some(session) = session.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        event = session.fixes.recv(), if session.fixes_open => SessionEvent::Fix(event),
        _ = session.heartbeat.tick() => SessionEvent::Heartbeat,
    }
}
