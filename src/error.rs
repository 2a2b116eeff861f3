//! Error taxonomy for the tracker core.
//!
//! Contention ("bus already tracked") and ownership mismatch are *not*
//! errors: they come back as ordinary results. What lands here is input
//! validation, transport failure, and position-source failure.

use std::time::Duration;

use crate::model::BusId;

/// Rejected caller input. Raised before any store interaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("bus number is required")]
    MissingBusId,
    #[error("invalid bus number '{0}', expected a number between {min}-{max}", min = BusId::MIN, max = BusId::MAX)]
    InvalidBusId(String),
}

/// Failure talking to the remote synchronized store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or did not answer. Recoverable:
    /// location writes are queued, heartbeats retried on the next tick.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    /// A record could not be encoded for writing.
    #[error("failed to encode record for {path}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Whether this failure is a transport problem (as opposed to a
    /// local encoding bug).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Failure obtaining a position fix from the device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location unavailable: {0}")]
    Unavailable(String),
    #[error("location request timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced by the tracker coordinator's public operations.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("already tracking bus {bus}")]
    AlreadyTracking { bus: BusId },
    #[error("not tracking any bus")]
    NotTracking,
    #[error("could not get current location: {0}")]
    Location(#[from] LocationError),
    #[error("failed to start tracking: {0}")]
    Store(#[from] StoreError),
    #[error("tracker coordinator has shut down")]
    Closed,
}
