//! Tracker leases.
//!
//! A [`Lease`] grants one device exclusive write rights to a bus's
//! location. It lives at `buses/{bus}/tracker` in the remote store and is
//! kept fresh by heartbeats; once `now - last_heartbeat` exceeds the TTL
//! every reader and writer treats it as absent.

pub mod store;

pub use store::{AcquireOutcome, AcquireReason, LeaseStore, Subscription};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::model::{BusId, Location};

/// Leases without a heartbeat for this long are expired (90 seconds).
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(90);

/// The record stored per bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Stable identifier of the device holding the lease.
    #[serde(alias = "userId")]
    pub owner_id: String,
    pub location: Location,
    /// Server timestamp of the last location write.
    pub last_update: i64,
    /// Server timestamp of the last liveness signal.
    pub last_heartbeat: i64,
}

impl Lease {
    /// Expired iff strictly more than `ttl_ms` has passed since the last
    /// heartbeat. `last_update` plays no part.
    pub fn is_expired(&self, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms - self.last_heartbeat > ttl_ms
    }

    /// Milliseconds since the last heartbeat.
    pub fn heartbeat_age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_heartbeat
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }

    /// Decode a stored value. Anything that does not parse as a lease is
    /// treated as no lease at all.
    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(lease) => Some(lease),
            Err(e) => {
                tracing::debug!("Ignoring malformed lease record: {e}");
                None
            }
        }
    }
}

/// Store path of the lease for `bus`.
pub fn lease_path(bus: BusId) -> String {
    format!("buses/{bus}/tracker")
}

pub(crate) fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}
