//! Location quality filter.
//!
//! Rejects fixes that are too imprecise, or that imply a speed the bus
//! cannot physically reach relative to the previously accepted fix (GPS
//! jumps, multipath noise).

use crate::geo::{haversine_m, implied_speed_kmh};
use crate::model::Location;

/// Default accuracy ceiling in meters.
pub const DEFAULT_MAX_ACCURACY_M: f64 = 50.0;

/// Default speed ceiling in km/h.
pub const DEFAULT_MAX_SPEED_KMH: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterVerdict {
    Accepted,
    /// Coordinates or accuracy are not finite numbers in range.
    Invalid,
    PoorAccuracy { accuracy_m: f64 },
    ImplausibleSpeed { speed_kmh: f64 },
}

impl FilterVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFilter {
    pub max_accuracy_m: f64,
    pub max_speed_kmh: f64,
}

impl Default for LocationFilter {
    fn default() -> Self {
        Self {
            max_accuracy_m: DEFAULT_MAX_ACCURACY_M,
            max_speed_kmh: DEFAULT_MAX_SPEED_KMH,
        }
    }
}

impl LocationFilter {
    pub fn new(max_accuracy_m: f64, max_speed_kmh: f64) -> Self {
        Self {
            max_accuracy_m,
            max_speed_kmh,
        }
    }

    /// Pure accept/reject decision.
    pub fn accept(&self, candidate: &Location, previous: Option<&Location>) -> bool {
        self.evaluate(candidate, previous).is_accepted()
    }

    /// Accept/reject with the reason.
    pub fn evaluate(&self, candidate: &Location, previous: Option<&Location>) -> FilterVerdict {
        if !candidate.coordinates().is_valid() || !candidate.accuracy.is_finite() {
            return FilterVerdict::Invalid;
        }
        if candidate.accuracy > self.max_accuracy_m {
            return FilterVerdict::PoorAccuracy {
                accuracy_m: candidate.accuracy,
            };
        }

        let Some(previous) = previous else {
            return FilterVerdict::Accepted;
        };

        let distance = haversine_m(previous.coordinates(), candidate.coordinates());
        let elapsed_ms = candidate.timestamp - previous.timestamp;
        match implied_speed_kmh(distance, elapsed_ms) {
            Some(speed_kmh) if speed_kmh > self.max_speed_kmh => {
                FilterVerdict::ImplausibleSpeed { speed_kmh }
            }
            Some(_) => FilterVerdict::Accepted,
            // No elapsed time: any movement at all is an infinite speed.
            None if distance > 0.0 => FilterVerdict::ImplausibleSpeed {
                speed_kmh: f64::INFINITY,
            },
            None => FilterVerdict::Accepted,
        }
    }
}
