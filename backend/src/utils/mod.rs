//! # Utilities Module
//!
//! This module contains helper functions and utilities used
//! across the backend service: great-circle distance, coordinate
//! validation and the per-key lock registry.

pub mod locks;

pub use locks::KeyedLocks;

use crate::db::GeoPoint;

/// Mean Earth radius used by every distance computation, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two points using the haversine formula.
///
/// ## Returns
///
/// Distance in meters, unrounded.
///
/// ## Examples
///
/// ```rust,ignore
/// let a = GeoPoint::new(24.8067, 120.9687);
/// let b = GeoPoint::new(24.8167, 120.9687);
/// assert!((haversine_meters(a, b) - 1112.0).abs() < 1.0);
/// ```
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Validate a latitude/longitude pair.
///
/// ## Returns
///
/// * `Ok(())` - Both values finite and in range
/// * `Err(Vec<String>)` - Names of the offending fields
pub fn validate_coordinates(lat: f64, lng: f64) -> Result<(), Vec<String>> {
    let mut invalid = Vec::new();
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        invalid.push("lat".to_string());
    }
    if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
        invalid.push("lng".to_string());
    }
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(invalid)
    }
}

/// Round a distance for presentation (whole meters).
pub fn round_meters(distance: f64) -> f64 {
    distance.round()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_zero_for_same_point() {
        let p = GeoPoint::new(24.8067, 120.9687);
        assert_eq!(haversine_meters(p, p), 0.0);
    }

    #[test]
    fn test_haversine_is_symmetric() {
        let pairs = [
            (GeoPoint::new(24.8067, 120.9687), GeoPoint::new(24.8167, 120.9687)),
            (GeoPoint::new(-33.86, 151.21), GeoPoint::new(51.5, -0.12)),
            (GeoPoint::new(0.0, 179.9), GeoPoint::new(0.0, -179.9)),
            (GeoPoint::new(89.9, 0.0), GeoPoint::new(-89.9, 45.0)),
        ];
        for (a, b) in pairs {
            assert_eq!(haversine_meters(a, b), haversine_meters(b, a));
        }
    }

    #[test]
    fn test_haversine_known_distance() {
        // 0.01 degrees of latitude is ~1.11 km everywhere.
        let d = haversine_meters(
            GeoPoint::new(24.8067, 120.9687),
            GeoPoint::new(24.8167, 120.9687),
        );
        assert!((d - 1111.95).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_validate_coordinates() {
        assert!(validate_coordinates(24.8, 120.9).is_ok());
        assert_eq!(validate_coordinates(91.0, 0.0), Err(vec!["lat".to_string()]));
        assert_eq!(
            validate_coordinates(f64::NAN, 200.0),
            Err(vec!["lat".to_string(), "lng".to_string()])
        );
    }

    #[test]
    fn test_round_meters() {
        assert_eq!(round_meters(1111.6), 1112.0);
    }
}
