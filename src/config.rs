//! Tracker configuration, loaded from `~/.buslease/config.toml`.
//!
//! Every section and field is optional; missing values take the
//! protocol defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::lease::{LeaseStore, DEFAULT_LEASE_TTL};
use crate::location::{filter, geofence, GeofenceMonitor, LocationFilter, LocationOptions};
use crate::model::Coordinates;
use crate::queue;
use crate::remote::RemoteStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub lease: LeaseConfig,
    pub filter: FilterConfig,
    pub geofence: GeofenceConfig,
    pub queue: QueueConfig,
    pub location: LocationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// A lease whose heartbeat is older than this is expired.
    pub ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_LEASE_TTL.as_secs(),
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub max_accuracy_m: f64,
    pub max_speed_kmh: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: filter::DEFAULT_MAX_ACCURACY_M,
            max_speed_kmh: filter::DEFAULT_MAX_SPEED_KMH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    /// Consecutive inside fixes needed to declare arrival.
    pub stable_samples: u32,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            latitude: geofence::DEFAULT_DESTINATION.latitude,
            longitude: geofence::DEFAULT_DESTINATION.longitude,
            radius_m: geofence::DEFAULT_RADIUS_M,
            stable_samples: geofence::DEFAULT_STABLE_SAMPLES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_age_secs: u64,
    /// How often a non-empty queue is retried while tracking.
    pub retry_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: queue::DEFAULT_CAPACITY,
            max_age_secs: queue::DEFAULT_MAX_AGE.as_secs(),
            retry_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub high_accuracy: bool,
    pub timeout_secs: u64,
    pub maximum_age_secs: u64,
    /// Minimum movement between continuous updates.
    pub distance_filter_m: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            high_accuracy: false,
            timeout_secs: 30,
            maximum_age_secs: 60,
            distance_filter_m: 10.0,
        }
    }
}

impl TrackerConfig {
    /// `~/.buslease/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let home = directories::UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".buslease").join("config.toml"))
    }

    /// Load and validate `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease.ttl_secs == 0 {
            anyhow::bail!("lease.ttl_secs must be greater than zero");
        }
        if self.lease.heartbeat_interval_secs == 0 {
            anyhow::bail!("lease.heartbeat_interval_secs must be greater than zero");
        }
        if self.lease.heartbeat_interval_secs >= self.lease.ttl_secs {
            anyhow::bail!(
                "lease.heartbeat_interval_secs ({}) must be shorter than lease.ttl_secs ({})",
                self.lease.heartbeat_interval_secs,
                self.lease.ttl_secs
            );
        }
        if self.queue.capacity == 0 {
            anyhow::bail!("queue.capacity must be greater than zero");
        }
        if self.queue.retry_interval_secs == 0 {
            anyhow::bail!("queue.retry_interval_secs must be greater than zero");
        }
        if self.location.timeout_secs == 0 {
            anyhow::bail!("location.timeout_secs must be greater than zero");
        }
        if self.geofence.stable_samples == 0 {
            anyhow::bail!("geofence.stable_samples must be greater than zero");
        }
        if !(self.geofence.radius_m > 0.0) {
            anyhow::bail!("geofence.radius_m must be positive");
        }
        if !self.destination().is_valid() {
            anyhow::bail!(
                "geofence destination ({}, {}) is not a valid coordinate",
                self.geofence.latitude,
                self.geofence.longitude
            );
        }
        if !(self.filter.max_accuracy_m > 0.0) || !(self.filter.max_speed_kmh > 0.0) {
            anyhow::bail!("filter thresholds must be positive");
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease.ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.lease.heartbeat_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.queue.retry_interval_secs)
    }

    pub fn queue_max_age(&self) -> Duration {
        Duration::from_secs(self.queue.max_age_secs)
    }

    pub fn destination(&self) -> Coordinates {
        Coordinates::new(self.geofence.latitude, self.geofence.longitude)
    }

    /// Options for the initial one-shot fix.
    pub fn location_options(&self) -> LocationOptions {
        LocationOptions {
            high_accuracy: self.location.high_accuracy,
            timeout: Duration::from_secs(self.location.timeout_secs),
            maximum_age: Duration::from_secs(self.location.maximum_age_secs),
            distance_filter_m: None,
        }
    }

    /// Options for the continuous watch.
    pub fn watch_options(&self) -> LocationOptions {
        LocationOptions {
            distance_filter_m: Some(self.location.distance_filter_m),
            ..self.location_options()
        }
    }

    pub fn filter(&self) -> LocationFilter {
        LocationFilter::new(self.filter.max_accuracy_m, self.filter.max_speed_kmh)
    }

    pub fn geofence(&self) -> GeofenceMonitor {
        GeofenceMonitor::new(
            self.destination(),
            self.geofence.radius_m,
            self.geofence.stable_samples,
        )
    }

    /// A [`LeaseStore`] using this config's TTL.
    pub fn lease_store(&self, remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> LeaseStore {
        LeaseStore::with_ttl(remote, clock, self.lease_ttl())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = TrackerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.lease_ttl(), Duration::from_secs(90));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.queue.capacity, 10);
        assert_eq!(config.queue_max_age(), Duration::from_secs(3600));
        assert_eq!(config.filter.max_accuracy_m, 50.0);
        assert_eq!(config.filter.max_speed_kmh, 100.0);
        assert_eq!(config.geofence.radius_m, 500.0);
        assert_eq!(config.geofence.stable_samples, 3);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = TrackerConfig::from_toml(
            r#"
[geofence]
latitude = 12.97
longitude = 77.59

[queue]
capacity = 25
"#,
        )
        .unwrap();
        assert_eq!(config.destination(), Coordinates::new(12.97, 77.59));
        assert_eq!(config.geofence.radius_m, 500.0);
        assert_eq!(config.queue.capacity, 25);
        assert_eq!(config.lease.ttl_secs, 90);
    }

    #[test]
    fn heartbeat_must_be_shorter_than_ttl() {
        let err = TrackerConfig::from_toml(
            r#"
[lease]
ttl_secs = 30
heartbeat_interval_secs = 30
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("shorter than"));
    }

    #[test]
    fn rejects_zero_capacity_and_bad_destination() {
        let mut config = TrackerConfig::default();
        config.queue.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.geofence.latitude = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn watch_options_carry_distance_filter() {
        let config = TrackerConfig::default();
        assert_eq!(config.location_options().distance_filter_m, None);
        let watch = config.watch_options();
        assert_eq!(watch.distance_filter_m, Some(10.0));
        assert_eq!(watch.timeout, Duration::from_secs(30));
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = TrackerConfig::load(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config, TrackerConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[filter]\nmax_speed_kmh = 80.0\n").unwrap();
        let config = TrackerConfig::load(&path).unwrap();
        assert_eq!(config.filter.max_speed_kmh, 80.0);
        assert_eq!(config.filter().max_speed_kmh, 80.0);
    }

    #[test]
    fn load_reports_malformed_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[lease\nttl_secs = ").unwrap();
        let err = TrackerConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }
}
