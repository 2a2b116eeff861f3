//! Stable device identity.
//!
//! Generated once on first run, persisted in local storage, and read
//! back unchanged on every later run. Injected into the tracker rather
//! than held as global state.

use anyhow::{Context, Result};
use std::fmt;

use crate::storage::KeyValueStore;

/// Storage key of the persisted identifier.
pub const DEVICE_ID_KEY: &str = "device_id";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Read the persisted identity, creating and persisting one if absent.
    ///
    /// If persisting a freshly generated id fails, the id is still used
    /// for this process; the next run will generate another.
    pub async fn load_or_create(storage: &dyn KeyValueStore) -> Result<Self> {
        let stored = storage
            .get(DEVICE_ID_KEY)
            .await
            .context("reading device identity")?;

        if let Some(bytes) = stored {
            let id = String::from_utf8(bytes).context("device identity is not valid UTF-8")?;
            let id = id.trim();
            if !id.is_empty() {
                return Ok(Self(id.to_string()));
            }
        }

        let identity = Self::generate();
        if let Err(e) = storage.set(DEVICE_ID_KEY, identity.0.as_bytes()).await {
            tracing::warn!("Failed to persist device identity, using it for this run only: {e:#}");
        } else {
            tracing::info!(device = %identity, "Created device identity");
        }
        Ok(identity)
    }

    pub fn generate() -> Self {
        Self(format!("device_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeviceIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
