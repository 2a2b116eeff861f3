//! Device position source port, plus fix filtering and arrival detection.

pub mod filter;
pub mod geofence;

pub use filter::{FilterVerdict, LocationFilter};
pub use geofence::{GeofenceEvent, GeofenceMonitor};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::LocationError;
use crate::model::Location;

/// Hints passed to the platform position provider.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest cached fix the provider may return.
    pub maximum_age: Duration,
    /// Minimum movement in meters between continuous updates.
    pub distance_filter_m: Option<f64>,
}

impl Default for LocationOptions {
    fn default() -> Self {
        Self {
            high_accuracy: false,
            timeout: Duration::from_secs(30),
            maximum_age: Duration::from_secs(60),
            distance_filter_m: None,
        }
    }
}

/// Identifier of a continuous watch, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// One delivery from a continuous watch.
pub type LocationEvent = Result<Location, LocationError>;

/// A running continuous watch.
pub struct LocationWatch {
    pub id: WatchId,
    pub fixes: mpsc::UnboundedReceiver<LocationEvent>,
}

#[async_trait]
pub trait LocationSource: Send + Sync {
    /// One fresh (or acceptably cached) fix.
    async fn get_once(&self, options: &LocationOptions) -> Result<Location, LocationError>;

    /// Start delivering fixes and errors until cancelled.
    fn watch(&self, options: &LocationOptions) -> Result<LocationWatch, LocationError>;

    /// Stop a watch. Unknown ids are ignored.
    fn cancel(&self, id: WatchId);
}

/// A [`LocationSource`] fed by the host platform.
///
/// Mobile hosts forward their native position callbacks into
/// [`push_fix`](Self::push_fix) / [`push_error`](Self::push_error); the
/// latest fix answers [`get_once`](LocationSource::get_once).
#[derive(Default)]
pub struct ManualLocationSource {
    last_fix: Mutex<Option<Location>>,
    watchers: Mutex<HashMap<WatchId, mpsc::UnboundedSender<LocationEvent>>>,
    next_id: AtomicU64,
    failure: Mutex<Option<LocationError>>,
}

impl ManualLocationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fix and deliver it to every active watch.
    pub fn push_fix(&self, fix: Location) {
        *self.last_fix.lock() = Some(fix);
        self.broadcast(Ok(fix));
    }

    /// Deliver a provider error to every active watch.
    pub fn push_error(&self, error: LocationError) {
        self.broadcast(Err(error));
    }

    /// Make subsequent `get_once`/`watch` calls fail with `error`
    /// (e.g. permission revoked). `None` clears it.
    pub fn set_failure(&self, error: Option<LocationError>) {
        *self.failure.lock() = error;
    }

    /// Forget the cached fix.
    pub fn clear_fix(&self) {
        *self.last_fix.lock() = None;
    }

    pub fn active_watches(&self) -> usize {
        self.watchers.lock().len()
    }

    fn broadcast(&self, event: LocationEvent) {
        self.watchers
            .lock()
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl LocationSource for ManualLocationSource {
    async fn get_once(&self, _options: &LocationOptions) -> Result<Location, LocationError> {
        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }
        let fix = *self.last_fix.lock();
        fix.ok_or_else(|| LocationError::Unavailable("no position fix yet".into()))
    }

    fn watch(&self, _options: &LocationOptions) -> Result<LocationWatch, LocationError> {
        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, fixes) = mpsc::unbounded_channel();
        self.watchers.lock().insert(id, tx);
        Ok(LocationWatch { id, fixes })
    }

    fn cancel(&self, id: WatchId) {
        self.watchers.lock().remove(&id);
    }
}
