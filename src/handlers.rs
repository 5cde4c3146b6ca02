//! JSON request handlers for the location clustering service.
//!
//! Thin layer between a message bus (or any JSON transport) and
//! [`ClusterManager`]. Requests and responses are `serde_json::Value`s so the
//! caller owns the transport.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use serde_json::{json, Value};

use crate::error::{ClusterError, OptionExt, Result};
use crate::{ClusterManager, ClusterSummary, ClusteringConfig, LatLng, Point};

/// Request handlers backed by a shared [`ClusterManager`].
#[derive(Clone)]
pub struct LocationHandlers {
    manager: Arc<ClusterManager>,
}

impl LocationHandlers {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ClusterManager> {
        &self.manager
    }

    /// `{clusters: [summary], count}`
    pub fn get_clusters(&self) -> Result<Value> {
        let clusters: Vec<ClusterSummary> = self
            .manager
            .get_clusters()
            .iter()
            .map(|c| c.summary())
            .collect();
        Ok(json!({
            "count": clusters.len(),
            "clusters": clusters,
        }))
    }

    /// The full cluster, members included.
    pub fn get_cluster_by_id(&self, id: &str) -> Result<Value> {
        let cluster = self
            .manager
            .get_cluster_by_id(id)
            .ok_or_cluster_not_found(id)?;
        Ok(serde_json::to_value(cluster)?)
    }

    /// Parse a sample and ingest it.
    ///
    /// `latitude` and `longitude` are required; `timestamp` (RFC 3339)
    /// defaults to now, the telemetry fields default to empty.
    pub fn add_point(&self, data: &Value) -> Result<Value> {
        let point = parse_point(data)?;
        let outcome = self.manager.add_point(point);
        debug!("[LocationHandlers] add_point -> {:?}", outcome);
        Ok(json!({
            "success": true,
            "outcome": outcome,
        }))
    }

    /// `{cluster: summary | null, distance: meters | null}`
    pub fn find_nearest_cluster(&self, data: &Value) -> Result<Value> {
        let position = parse_position(data)?;
        Ok(match self.manager.find_nearest_cluster(&position) {
            Some(nearest) => json!({
                "cluster": nearest.cluster.summary(),
                "distance": nearest.distance,
            }),
            None => json!({
                "cluster": null,
                "distance": null,
            }),
        })
    }

    pub fn get_clusters_by_tag(&self, tag: &str) -> Result<Value> {
        let clusters: Vec<ClusterSummary> = self
            .manager
            .get_clusters_by_tag(tag)
            .iter()
            .map(|c| c.summary())
            .collect();
        Ok(json!({
            "tag": tag,
            "count": clusters.len(),
            "clusters": clusters,
        }))
    }

    /// `{cluster_id, tag}` -> `{success, changed}`
    pub fn add_tag_to_cluster(&self, data: &Value) -> Result<Value> {
        let (cluster_id, tag) = parse_tag_request(data)?;
        let changed = self.manager.add_tag_to_cluster(cluster_id, tag)?;
        Ok(json!({ "success": true, "changed": changed }))
    }

    /// `{cluster_id, tag}` -> `{success, changed}`
    pub fn remove_tag_from_cluster(&self, data: &Value) -> Result<Value> {
        let (cluster_id, tag) = parse_tag_request(data)?;
        let changed = self.manager.remove_tag_from_cluster(cluster_id, tag)?;
        Ok(json!({ "success": true, "changed": changed }))
    }

    pub fn get_statistics(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.manager.get_statistics().to_map())?)
    }

    /// Replace the configuration. Missing fields take their defaults, so a
    /// partial object resets the other options.
    pub fn update_config(&self, data: &Value) -> Result<Value> {
        let config: ClusteringConfig = serde_json::from_value(data.clone())?;
        config.validate()?;
        self.manager.update_config(config);
        Ok(json!({ "success": true }))
    }

    pub fn get_config(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.manager.config())?)
    }
}

fn required_f64(data: &Value, field: &str) -> Result<f64> {
    data.get(field)
        .and_then(Value::as_f64)
        .ok_or_invalid_request(&format!("{} is required and must be a number", field))
}

fn required_str<'a>(data: &'a Value, field: &str) -> Result<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_invalid_request(&format!("{} is required", field))
}

fn parse_position(data: &Value) -> Result<LatLng> {
    let position = LatLng::new(
        required_f64(data, "latitude")?,
        required_f64(data, "longitude")?,
    );
    if !position.is_valid() {
        return Err(ClusterError::invalid_request(format!(
            "coordinates out of range: {}, {}",
            position.latitude, position.longitude
        )));
    }
    Ok(position)
}

fn parse_point(data: &Value) -> Result<Point> {
    let position = parse_position(data)?;

    let timestamp = match data.get("timestamp").and_then(Value::as_str) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| ClusterError::invalid_request(format!("invalid timestamp format: {}", e)))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    // Non-string entries are skipped
    let tags: Vec<String> = data
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Point::at(position, timestamp)
        .with_signal(data.get("signal").and_then(Value::as_f64).unwrap_or(0.0))
        .with_speed(data.get("speed").and_then(Value::as_f64).unwrap_or(0.0))
        .with_member(data.get("member").and_then(Value::as_str).unwrap_or_default())
        .with_obstruction(data.get("obstruction").and_then(Value::as_bool).unwrap_or(false))
        .with_tags(tags))
}

fn parse_tag_request(data: &Value) -> Result<(&str, &str)> {
    Ok((required_str(data, "cluster_id")?, required_str(data, "tag")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn handlers() -> LocationHandlers {
        LocationHandlers::new(Arc::new(ClusterManager::without_maintenance(
            ClusteringConfig::default(),
        )))
    }

    fn sample(lat: f64) -> Value {
        json!({
            "latitude": lat,
            "longitude": 18.0686,
            "signal": -72.5,
            "speed": 0.3,
            "member": "starlink",
            "obstruction": false,
            "tags": ["parked", 7],
        })
    }

    #[test]
    fn test_add_point_and_list() {
        let h = handlers();
        for i in 0..2 {
            let resp = h.add_point(&sample(59.3293 + i as f64 * 0.0001)).unwrap();
            assert_eq!(resp["outcome"]["result"], "pending");
        }
        let resp = h.add_point(&sample(59.3295)).unwrap();
        assert_eq!(resp["success"], true);
        assert_eq!(resp["outcome"]["result"], "seeded");
        assert_eq!(resp["outcome"]["points"], 3);

        let list = h.get_clusters().unwrap();
        assert_eq!(list["count"], 1);
        assert_eq!(list["clusters"][0]["points_count"], 3);
        assert!(list["clusters"][0].get("points").is_none());

        let id = list["clusters"][0]["id"].as_str().unwrap().to_string();
        let full = h.get_cluster_by_id(&id).unwrap();
        assert_eq!(full["points"].as_array().unwrap().len(), 3);
        assert_eq!(full["points"][0]["member"], "starlink");
        assert_eq!(full["points"][0]["tags"], json!(["parked"]));
        assert!((full["avg_signal"].as_f64().unwrap() + 72.5).abs() < 1e-9);
    }

    #[test]
    fn test_add_point_validation() {
        let h = handlers();
        assert!(matches!(
            h.add_point(&json!({"longitude": 1.0})),
            Err(ClusterError::InvalidRequest { .. })
        ));
        assert!(h.add_point(&json!({"latitude": "x", "longitude": 1.0})).is_err());
        assert!(h.add_point(&json!({"latitude": 95.0, "longitude": 1.0})).is_err());
        assert!(h
            .add_point(&json!({"latitude": 1.0, "longitude": 1.0, "timestamp": "yesterday"}))
            .is_err());
        assert_eq!(h.manager().pending_count(), 0);
    }

    #[test]
    fn test_add_point_with_timestamp() {
        let h = handlers();
        let ts = (Utc::now() - Duration::seconds(30)).to_rfc3339();
        h.add_point(&json!({"latitude": 10.0, "longitude": 10.0, "timestamp": ts}))
            .unwrap();
        assert_eq!(h.manager().pending_count(), 1);

        // Older than the default one-hour window: decays on ingest
        let stale = (Utc::now() - Duration::hours(2)).to_rfc3339();
        h.add_point(&json!({"latitude": 10.0, "longitude": 10.0, "timestamp": stale}))
            .unwrap();
        assert_eq!(h.manager().pending_count(), 1);
    }

    #[test]
    fn test_find_nearest_without_clusters_is_null() {
        let h = handlers();
        let resp = h
            .find_nearest_cluster(&json!({"latitude": 1.0, "longitude": 2.0}))
            .unwrap();
        assert!(resp["cluster"].is_null());
        assert!(resp["distance"].is_null());

        for _ in 0..3 {
            h.add_point(&sample(59.3293)).unwrap();
        }
        let resp = h
            .find_nearest_cluster(&json!({"latitude": 59.3293, "longitude": 18.0686}))
            .unwrap();
        assert!(resp["cluster"]["id"].is_string());
        assert!(resp["distance"].as_f64().unwrap() < 1.0);
    }

    #[test]
    fn test_tag_handlers() {
        let h = handlers();
        for _ in 0..3 {
            h.add_point(&sample(59.3293)).unwrap();
        }
        let id = h.get_clusters().unwrap()["clusters"][0]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let req = json!({"cluster_id": id, "tag": "home"});
        assert_eq!(h.add_tag_to_cluster(&req).unwrap()["changed"], true);
        assert_eq!(h.add_tag_to_cluster(&req).unwrap()["changed"], false);

        let by_tag = h.get_clusters_by_tag("home").unwrap();
        assert_eq!(by_tag["count"], 1);
        assert_eq!(by_tag["tag"], "home");

        assert_eq!(h.remove_tag_from_cluster(&req).unwrap()["changed"], true);
        assert_eq!(h.get_clusters_by_tag("home").unwrap()["count"], 0);

        assert!(matches!(
            h.add_tag_to_cluster(&json!({"cluster_id": "missing", "tag": "x"})),
            Err(ClusterError::ClusterNotFound { .. })
        ));
        assert!(matches!(
            h.add_tag_to_cluster(&json!({"cluster_id": id})),
            Err(ClusterError::InvalidRequest { .. })
        ));
        assert!(matches!(
            h.get_cluster_by_id("missing"),
            Err(ClusterError::ClusterNotFound { .. })
        ));
    }

    #[test]
    fn test_config_round_trip() {
        let h = handlers();
        h.update_config(&json!({"max_distance": 50.0, "max_clusters": 10}))
            .unwrap();

        let config = h.get_config().unwrap();
        assert_eq!(config["max_distance"], 50.0);
        assert_eq!(config["max_clusters"], 10);
        assert_eq!(config["min_points"], 3);

        assert!(matches!(
            h.update_config(&json!({"min_points": 0})),
            Err(ClusterError::InvalidConfig { .. })
        ));
        assert!(matches!(
            h.update_config(&json!({"min_points": "three"})),
            Err(ClusterError::Serialization(_))
        ));
        assert_eq!(h.get_config().unwrap()["max_distance"], 50.0);
    }

    #[test]
    fn test_statistics_map() {
        let h = handlers();
        let stats = h.get_statistics().unwrap();
        assert_eq!(stats["total_clusters"], 0);
        assert!(stats["average_radius"].is_null());
        assert_eq!(stats["max_clusters"], 100);
    }
}
