//! Core value types: bus identifiers and position fixes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Identifier of a bus route. Valid range is `1..=52`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BusId(u32);

impl BusId {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 52;

    pub fn new(value: u32) -> Result<Self, ValidationError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ValidationError::InvalidBusId(value.to_string()))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for BusId {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BusId> for u32 {
    fn from(id: BusId) -> Self {
        id.0
    }
}

/// Parses user-entered text such as `" 7 "`.
impl FromStr for BusId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::MissingBusId);
        }
        let value: u32 = trimmed
            .parse()
            .map_err(|_| ValidationError::InvalidBusId(trimmed.to_string()))?;
        Self::new(value)
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Both components are finite and within the valid degree ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A single position fix from the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy: f64,
    /// Epoch milliseconds at which the fix was taken.
    pub timestamp: i64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            timestamp,
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}
