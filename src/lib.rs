//! # Visit Cluster
//!
//! Online clustering of GPS samples into recurring "visit" locations.
//!
//! This library provides:
//! - Incremental assignment of samples to the nearest cluster, or seeding of
//!   a new cluster once enough samples accumulate in one spot
//! - Time-windowed decay of old samples, greedy merging of nearby clusters
//!   and eviction of the least recently updated clusters
//! - A thread-safe manager with a cancellable background maintenance thread
//! - A JSON request surface for embedding in a device control loop
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::Utc;
//! use visit_cluster::{ClusterManager, ClusteringConfig, Point};
//!
//! let manager = ClusterManager::without_maintenance(ClusteringConfig::default());
//!
//! let now = Utc::now();
//! for i in 0..3 {
//!     let lat = 59.3293 + i as f64 * 0.0001;
//!     manager.add_point(Point::new(lat, 18.0686, now).with_signal(-70.0));
//! }
//!
//! let clusters = manager.get_clusters();
//! assert_eq!(clusters.len(), 1);
//! assert_eq!(clusters[0].points.len(), 3);
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{ClusterError, OptionExt, Result};

// Geographic utilities (haversine distance, centroid)
pub mod geo_utils;

// Derived cluster metrics
pub mod metrics;
pub use metrics::update_cluster_metrics;

// Unlocked clustering state and passes
pub mod engine;
pub use engine::{
    ClusterEngine, ClusterStatistics, IngestOutcome, MaintenanceReport, NearestCluster,
};

// Thread-safe manager with background maintenance
pub mod manager;
pub use manager::ClusterManager;

// JSON request handlers
pub mod handlers;
pub use handlers::LocationHandlers;

// ============================================================================
// Core Types
// ============================================================================

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLng {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the position has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A single GPS sample with link-quality telemetry.
///
/// # Example
/// ```
/// use chrono::Utc;
/// use visit_cluster::Point;
///
/// let p = Point::new(51.5074, -0.1278, Utc::now())
///     .with_signal(-85.0)
///     .with_speed(0.4)
///     .with_member("starlink")
///     .with_tags(["parked"]);
/// assert!(p.is_valid());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    /// Signal quality reported with the fix
    #[serde(default)]
    pub signal: f64,
    /// Ground speed in m/s
    #[serde(default)]
    pub speed: f64,
    /// Source of the sample (e.g. the uplink member that reported it)
    #[serde(default)]
    pub member: String,
    /// Whether the source reported an obstructed view
    #[serde(default)]
    pub obstruction: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Point {
    /// Create a sample with empty telemetry.
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            signal: 0.0,
            speed: 0.0,
            member: String::new(),
            obstruction: false,
            tags: Vec::new(),
        }
    }

    pub fn at(position: LatLng, timestamp: DateTime<Utc>) -> Self {
        Self::new(position.latitude, position.longitude, timestamp)
    }

    pub fn with_signal(mut self, signal: f64) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = member.into();
        self
    }

    pub fn with_obstruction(mut self, obstruction: bool) -> Self {
        self.obstruction = obstruction;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn position(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }

    /// Check if the sample has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.position().is_valid()
    }
}

/// A recurring location built from nearby samples.
///
/// `center`, `radius`, `avg_signal`, `avg_speed` and `total_time` are derived
/// from `points` by [`update_cluster_metrics`]. A cluster whose samples all
/// decayed keeps its last derived values and stays until merged or evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub center: LatLng,
    /// Distance from the center to the farthest member, in meters
    pub radius: f64,
    /// Members, oldest first
    pub points: Vec<Point>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub visit_count: u64,
    /// Dwell time in seconds (newest minus oldest member)
    pub total_time: f64,
    pub avg_signal: f64,
    pub avg_speed: f64,
    pub tags: BTreeSet<String>,
}

impl Cluster {
    /// Listing view without the member samples.
    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            id: self.id.clone(),
            center: self.center,
            radius: self.radius,
            points_count: self.points.len(),
            created_at: self.created_at,
            last_updated: self.last_updated,
            visit_count: self.visit_count,
            total_time: self.total_time,
            avg_signal: self.avg_signal,
            avg_speed: self.avg_speed,
            tags: self.tags.clone(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Lightweight cluster view for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: String,
    pub center: LatLng,
    pub radius: f64,
    pub points_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub visit_count: u64,
    pub total_time: f64,
    pub avg_signal: f64,
    pub avg_speed: f64,
    pub tags: BTreeSet<String>,
}

/// Configuration for the clustering passes.
///
/// Replacing the configuration only affects later operations; existing
/// clusters are never rewritten to match it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Maximum distance from a sample to a cluster center for assignment,
    /// and between samples when seeding. Default: 100.0 meters
    pub max_distance: f64,

    /// Minimum nearby samples required to seed a cluster.
    /// Default: 3
    pub min_points: usize,

    /// Maximum cluster radius. Advisory only; reported but not enforced.
    /// Default: 500.0 meters
    pub max_radius: f64,

    /// Samples older than this many seconds decay away.
    /// Default: 3600.0 (1 hour)
    pub time_window: f64,

    /// Clusters whose centers are this close are merged.
    /// Default: 200.0 meters
    pub merge_threshold: f64,

    /// Background maintenance period in seconds.
    /// Default: 86400.0 (24 hours)
    pub cleanup_interval: f64,

    /// Maximum number of clusters kept.
    /// Default: 100
    pub max_clusters: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            max_distance: 100.0,
            min_points: 3,
            max_radius: 500.0,
            time_window: 3600.0,
            merge_threshold: 200.0,
            cleanup_interval: 86400.0,
            max_clusters: 100,
        }
    }
}

impl ClusteringConfig {
    /// Parse a (possibly partial) JSON configuration; missing fields take
    /// their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("max_distance", self.max_distance),
            ("max_radius", self.max_radius),
            ("time_window", self.time_window),
            ("merge_threshold", self.merge_threshold),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ClusterError::invalid_config(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.cleanup_interval <= 0.0
            || std::time::Duration::try_from_secs_f64(self.cleanup_interval).is_err()
        {
            return Err(ClusterError::invalid_config(format!(
                "cleanup_interval must be a positive, representable number of seconds, got {}",
                self.cleanup_interval
            )));
        }
        if self.min_points == 0 {
            return Err(ClusterError::invalid_config("min_points must be at least 1"));
        }
        Ok(())
    }

    /// Decay window as a chrono duration.
    pub fn time_window_duration(&self) -> chrono::Duration {
        let millis = (self.time_window * 1000.0) as i64;
        chrono::Duration::milliseconds(millis.clamp(-i64::MAX, i64::MAX))
    }

    /// Maintenance period, falling back to the default for unusable values.
    pub fn cleanup_interval_duration(&self) -> std::time::Duration {
        let fallback = std::time::Duration::from_secs(86400);
        if self.cleanup_interval > 0.0 {
            std::time::Duration::try_from_secs_f64(self.cleanup_interval).unwrap_or(fallback)
        } else {
            fallback
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
