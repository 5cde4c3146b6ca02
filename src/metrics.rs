//! Derived cluster metrics.
//!
//! Everything here is a pure function of the member list. The engine calls
//! [`update_cluster_metrics`] after every membership change.

use crate::geo_utils::{compute_centroid, haversine_distance};
use crate::Cluster;

/// Recompute center, radius, average signal/speed and dwell time.
///
/// Members are sorted oldest first before anything is summed, so running
/// this twice on the same members gives bit-identical results. An empty
/// cluster keeps its previous derived values.
pub fn update_cluster_metrics(cluster: &mut Cluster) {
    cluster.points.sort_by_key(|p| p.timestamp);
    let Some(center) = compute_centroid(&cluster.points) else {
        return;
    };

    let count = cluster.points.len() as f64;
    let (total_signal, total_speed) = cluster
        .points
        .iter()
        .fold((0.0, 0.0), |(sig, spd), p| (sig + p.signal, spd + p.speed));

    cluster.center = center;
    cluster.avg_signal = total_signal / count;
    cluster.avg_speed = total_speed / count;
    cluster.radius = cluster
        .points
        .iter()
        .map(|p| haversine_distance(&p.position(), &center))
        .fold(0.0, f64::max);

    cluster.total_time = match (cluster.points.first(), cluster.points.last()) {
        (Some(oldest), Some(newest)) if cluster.points.len() > 1 => {
            (newest.timestamp - oldest.timestamp).num_milliseconds() as f64 / 1000.0
        }
        _ => 0.0,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_meters;
    use crate::{LatLng, Point};
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeSet;

    fn empty_cluster() -> Cluster {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Cluster {
            id: "cluster_test".to_string(),
            center: LatLng::new(0.0, 0.0),
            radius: 0.0,
            points: Vec::new(),
            created_at: ts,
            last_updated: ts,
            visit_count: 1,
            total_time: 0.0,
            avg_signal: 0.0,
            avg_speed: 0.0,
            tags: BTreeSet::new(),
        }
    }

    #[test]
    fn test_metrics_from_members() {
        let base = LatLng::new(48.1374, 11.5755);
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut cluster = empty_cluster();
        // Deliberately out of order
        cluster.points = vec![
            Point::at(offset_meters(&base, 40.0, 0.0), t0 + Duration::seconds(120))
                .with_signal(-80.0)
                .with_speed(2.0),
            Point::at(base, t0).with_signal(-60.0).with_speed(0.0),
            Point::at(offset_meters(&base, 20.0, 0.0), t0 + Duration::seconds(30))
                .with_signal(-70.0)
                .with_speed(1.0),
        ];

        update_cluster_metrics(&mut cluster);

        assert_eq!(cluster.points[0].timestamp, t0);
        assert_eq!(cluster.points[2].timestamp, t0 + Duration::seconds(120));
        assert!((cluster.avg_signal + 70.0).abs() < 1e-9);
        assert!((cluster.avg_speed - 1.0).abs() < 1e-9);
        assert!((cluster.total_time - 120.0).abs() < 1e-9);

        let expected_center = offset_meters(&base, 20.0, 0.0);
        assert!(haversine_distance(&cluster.center, &expected_center) < 0.01);
        assert!((cluster.radius - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_single_member_has_zero_dwell() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut cluster = empty_cluster();
        cluster.total_time = 500.0;
        cluster.points = vec![Point::new(10.0, 10.0, t0)];

        update_cluster_metrics(&mut cluster);

        assert_eq!(cluster.total_time, 0.0);
        assert_eq!(cluster.radius, 0.0);
        assert_eq!(cluster.center, LatLng::new(10.0, 10.0));
    }

    #[test]
    fn test_empty_cluster_keeps_previous_values() {
        let mut cluster = empty_cluster();
        cluster.center = LatLng::new(1.0, 2.0);
        cluster.radius = 42.0;
        cluster.avg_signal = -77.0;

        update_cluster_metrics(&mut cluster);

        assert_eq!(cluster.center, LatLng::new(1.0, 2.0));
        assert_eq!(cluster.radius, 42.0);
        assert_eq!(cluster.avg_signal, -77.0);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let base = LatLng::new(-33.8688, 151.2093);
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut cluster = empty_cluster();
        cluster.points = (0..7)
            .map(|i| {
                Point::at(
                    offset_meters(&base, (i * 13 % 50) as f64, (i * 7 % 30) as f64),
                    t0 + Duration::seconds(60 - i * 5),
                )
            })
            .collect();

        update_cluster_metrics(&mut cluster);
        let (center, radius) = (cluster.center, cluster.radius);
        update_cluster_metrics(&mut cluster);

        assert_eq!(cluster.center, center);
        assert_eq!(cluster.radius, radius);
    }
}
