//! Geographic utilities: great-circle distance, centroid and small offsets.

use geo::{Centroid, MultiPoint};

use crate::{LatLng, Point};

/// Earth radius used for every distance in this crate, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two positions in meters.
///
/// # Example
/// ```
/// use visit_cluster::LatLng;
/// use visit_cluster::geo_utils::haversine_distance;
///
/// let london = LatLng::new(51.5074, -0.1278);
/// let paris = LatLng::new(48.8566, 2.3522);
/// let d = haversine_distance(&london, &paris);
/// assert!((d - 343_556.0).abs() < 1_000.0);
/// ```
pub fn haversine_distance(p1: &LatLng, p2: &LatLng) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let d_lat = (p2.latitude - p1.latitude).to_radians();
    let d_lon = (p2.longitude - p1.longitude).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Arithmetic mean of the latitudes and longitudes of `points`.
///
/// This is a planar mean, not a spherical one. At visit scale (tens to
/// hundreds of meters) the difference is negligible.
///
/// Returns `None` for an empty slice.
pub fn compute_centroid(points: &[Point]) -> Option<LatLng> {
    if points.is_empty() {
        return None;
    }
    let multi: MultiPoint<f64> = points
        .iter()
        .map(|p| geo::Point::new(p.longitude, p.latitude))
        .collect::<Vec<_>>()
        .into();
    multi.centroid().map(|c| LatLng::new(c.y(), c.x()))
}

/// Shift a position by the given meters north and east.
///
/// Uses a local flat-earth approximation on the crate's sphere; exact along
/// a meridian, accurate to well under a meter for offsets of a few km.
pub fn offset_meters(origin: &LatLng, north_m: f64, east_m: f64) -> LatLng {
    let d_lat = (north_m / EARTH_RADIUS_M).to_degrees();
    let d_lon = (east_m / (EARTH_RADIUS_M * origin.latitude.to_radians().cos())).to_degrees();
    LatLng::new(origin.latitude + d_lat, origin.longitude + d_lon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::f64::consts::PI;

    #[test]
    fn test_distance_to_self_is_zero() {
        let p = LatLng::new(59.3293, 18.0686);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_quarter_meridian() {
        let equator = LatLng::new(0.0, 0.0);
        let pole = LatLng::new(90.0, 0.0);
        let expected = EARTH_RADIUS_M * PI / 2.0;
        assert!((haversine_distance(&equator, &pole) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_antipodes() {
        let a = LatLng::new(0.0, 0.0);
        let b = LatLng::new(0.0, 180.0);
        let expected = EARTH_RADIUS_M * PI;
        assert!((haversine_distance(&a, &b) - expected).abs() < 1e-3);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = LatLng::new(40.7128, -74.0060);
        let b = LatLng::new(34.0522, -118.2437);
        let d1 = haversine_distance(&a, &b);
        let d2 = haversine_distance(&b, &a);
        assert!((d1 - d2).abs() < 1e-6);
        // NYC to LA is roughly 3936 km
        assert!((d1 / 1000.0 - 3936.0).abs() < 10.0);
    }

    #[test]
    fn test_centroid_is_planar_mean() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let points = vec![
            Point::new(10.0, 20.0, ts),
            Point::new(12.0, 24.0, ts),
            Point::new(14.0, 19.0, ts),
        ];
        let c = compute_centroid(&points).unwrap();
        assert!((c.latitude - 12.0).abs() < 1e-12);
        assert!((c.longitude - 21.0).abs() < 1e-12);
        assert!(compute_centroid(&[]).is_none());
    }

    #[test]
    fn test_offset_north_matches_distance() {
        let origin = LatLng::new(57.7089, 11.9746);
        let moved = offset_meters(&origin, 150.0, 0.0);
        assert!((haversine_distance(&origin, &moved) - 150.0).abs() < 1e-6);

        let east = offset_meters(&origin, 0.0, 80.0);
        assert!((haversine_distance(&origin, &east) - 80.0).abs() < 0.01);
    }
}
