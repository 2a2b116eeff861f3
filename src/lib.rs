#![forbid(unsafe_code)]

//! Lease coordination for live bus location sharing.
//!
//! One device (the *tracker*) publishes its position against a bus id
//! while any number of *viewers* follow it. The remote store holds at
//! most one live [`Lease`] per bus; trackers acquire it atomically, keep
//! it alive with heartbeats, and give it up on arrival or explicit stop.
//!
//! ```text
//! LocationSource ─▸ LocationFilter ─▸ GeofenceMonitor ─▸ TrackerCoordinator ─▸ LeaseStore ─▸ RemoteStore
//!                                                              │      ▲
//!                                          heartbeat timer ────┤      │
//!                                          retry timer ────────┘   OfflineQueue
//!
//! RemoteStore change feed ─▸ LeaseStore::subscribe ─▸ Viewer
//! ```
//!
//! Platform collaborators (position source, durable key-value storage,
//! remote synchronized store, disconnect notifications) are traits; the
//! crate ships in-memory and SQLite implementations for them.

pub mod clock;
pub mod config;
pub mod error;
pub mod geo;
pub mod identity;
pub mod lease;
pub mod location;
pub mod logging;
pub mod model;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod tracker;
pub mod viewer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TrackerConfig;
pub use error::{LocationError, StoreError, TrackerError, ValidationError};
pub use identity::DeviceIdentity;
pub use lease::{AcquireOutcome, AcquireReason, Lease, LeaseStore, Subscription};
pub use location::{LocationOptions, LocationSource, ManualLocationSource};
pub use model::{BusId, Coordinates, Location};
pub use queue::{FlushReport, OfflineQueue, QueuedUpdate};
pub use remote::{MemoryRemoteStore, RemoteStore};
pub use storage::{KeyValueStore, MemoryKvStore, SqliteKvStore};
pub use tracker::{
    DisconnectReason, DisconnectSink, StartOutcome, TrackerCoordinator, TrackerPhase,
    TrackerServices, TrackerStatus,
};
pub use viewer::{BusView, Viewer, ViewerSubscription};
