//! Destination geofence with consecutive-sample debounce.

use crate::geo::haversine_m;
use crate::model::{Coordinates, Location};

/// Default destination: the campus the buses run to.
pub const DEFAULT_DESTINATION: Coordinates = Coordinates {
    latitude: 17.19664395356277,
    longitude: 78.59606101533295,
};

pub const DEFAULT_RADIUS_M: f64 = 500.0;

/// Consecutive inside-zone samples required to declare arrival.
pub const DEFAULT_STABLE_SAMPLES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeofenceEvent {
    Outside,
    /// Inside the zone, `count` consecutive samples so far.
    Inside { count: u32 },
    /// The threshold was just reached.
    Arrived,
}

#[derive(Debug, Clone)]
pub struct GeofenceMonitor {
    center: Coordinates,
    radius_m: f64,
    threshold: u32,
    count: u32,
}

impl Default for GeofenceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_DESTINATION, DEFAULT_RADIUS_M, DEFAULT_STABLE_SAMPLES)
    }
}

impl GeofenceMonitor {
    pub fn new(center: Coordinates, radius_m: f64, threshold: u32) -> Self {
        Self {
            center,
            radius_m,
            threshold: threshold.max(1),
            count: 0,
        }
    }

    pub fn center(&self) -> Coordinates {
        self.center
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn contains(&self, point: Coordinates) -> bool {
        self.distance_m(point) <= self.radius_m
    }

    /// Distance from `point` to the zone center.
    pub fn distance_m(&self, point: Coordinates) -> f64 {
        haversine_m(point, self.center)
    }

    /// Feed one accepted fix.
    pub fn observe(&mut self, fix: &Location) -> GeofenceEvent {
        if !self.contains(fix.coordinates()) {
            self.count = 0;
            return GeofenceEvent::Outside;
        }
        self.count = self.count.saturating_add(1);
        if self.count == self.threshold {
            GeofenceEvent::Arrived
        } else {
            GeofenceEvent::Inside { count: self.count }
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inside() -> Location {
        Location::new(17.1967, 78.5961, 5.0, 0)
    }

    fn outside() -> Location {
        Location::new(17.3850, 78.4867, 5.0, 0)
    }

    #[test]
    fn two_samples_do_not_trigger_third_does() {
        let mut fence = GeofenceMonitor::default();
        assert_eq!(fence.observe(&inside()), GeofenceEvent::Inside { count: 1 });
        assert_eq!(fence.observe(&inside()), GeofenceEvent::Inside { count: 2 });
        assert_eq!(fence.observe(&inside()), GeofenceEvent::Arrived);
    }

    #[test]
    fn outside_sample_resets_the_count() {
        let mut fence = GeofenceMonitor::default();
        fence.observe(&inside());
        fence.observe(&inside());
        assert_eq!(fence.observe(&outside()), GeofenceEvent::Outside);
        assert_eq!(fence.count(), 0);

        assert_eq!(fence.observe(&inside()), GeofenceEvent::Inside { count: 1 });
        assert_eq!(fence.observe(&inside()), GeofenceEvent::Inside { count: 2 });
        assert_eq!(fence.observe(&inside()), GeofenceEvent::Arrived);
    }

    #[test]
    fn reset_clears_progress() {
        let mut fence = GeofenceMonitor::default();
        fence.observe(&inside());
        fence.observe(&inside());
        fence.reset();
        assert_eq!(fence.observe(&inside()), GeofenceEvent::Inside { count: 1 });
    }

    #[test]
    fn boundary_uses_radius() {
        let fence = GeofenceMonitor::new(Coordinates::new(0.0, 0.0), 500.0, 3);
        // ~445 m north of the center.
        assert!(fence.contains(Coordinates::new(0.004, 0.0)));
        // ~556 m north of the center.
        assert!(!fence.contains(Coordinates::new(0.005, 0.0)));
    }
}
