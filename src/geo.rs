//! Great-circle distance helpers.

use crate::model::Coordinates;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two points, in meters.
pub fn haversine_m(a: Coordinates, b: Coordinates) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Speed in km/h implied by covering `distance_m` in `elapsed_ms`.
///
/// Returns `None` when no time has elapsed (or time ran backwards).
pub fn implied_speed_kmh(distance_m: f64, elapsed_ms: i64) -> Option<f64> {
    if elapsed_ms <= 0 {
        return None;
    }
    let elapsed_secs = elapsed_ms as f64 / 1000.0;
    Some(distance_m / elapsed_secs * 3.6)
}
