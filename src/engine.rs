//! # Cluster Engine
//!
//! Unlocked clustering state: the pending pool, the cluster map and the
//! active configuration, with every pass that mutates them.
//!
//! ## Passes
//!
//! - **Ingest**: a sample is assigned to the nearest cluster within
//!   `max_distance`, or seeds a new cluster once `min_points` pending samples
//!   sit within `max_distance` of it, or stays pending.
//! - **Decay**: samples at or before `now - time_window` are dropped from the
//!   pool and from every cluster. Clusters are never removed here.
//! - **Merge**: one greedy left-to-right sweep over clusters ordered by
//!   creation. Earlier pairs are not revisited after a merge moves a center,
//!   so a chain of mergeable clusters may take several passes to collapse.
//! - **Eviction**: clusters over `max_clusters` are dropped oldest
//!   `last_updated` first, whatever they contain.
//!
//! Every method takes `now` explicitly. [`crate::ClusterManager`] wraps the
//! engine in a lock and supplies the wall clock.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{OptionExt, Result};
use crate::geo_utils::haversine_distance;
use crate::metrics::update_cluster_metrics;
use crate::{Cluster, ClusteringConfig, LatLng, Point};

// ============================================================================
// Result Types
// ============================================================================

/// What happened to an ingested sample.
///
/// `cluster_id` names the cluster holding the sample after the maintenance
/// pass that ends every ingest: if that pass merged the receiving cluster
/// into an older one, the older one is reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Folded into an existing cluster
    Assigned { cluster_id: String, distance: f64 },
    /// Seeded a new cluster together with nearby pending samples
    Seeded { cluster_id: String, points: usize },
    /// Left in the pending pool
    Pending,
}

/// Counts from one decay + merge + eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired_points: usize,
    pub merged: usize,
    /// Absorbed cluster id -> id of the cluster that absorbed it
    pub absorbed: BTreeMap<String, String>,
    pub evicted: Vec<String>,
}

impl IngestOutcome {
    /// Re-point the outcome at the cluster that survived `absorbed` merges.
    fn follow_merges(self, absorbed: &BTreeMap<String, String>) -> Self {
        let resolve = |mut id: String| {
            while let Some(target) = absorbed.get(&id) {
                id = target.clone();
            }
            id
        };
        match self {
            IngestOutcome::Assigned {
                cluster_id,
                distance,
            } => IngestOutcome::Assigned {
                cluster_id: resolve(cluster_id),
                distance,
            },
            IngestOutcome::Seeded { cluster_id, points } => IngestOutcome::Seeded {
                cluster_id: resolve(cluster_id),
                points,
            },
            IngestOutcome::Pending => IngestOutcome::Pending,
        }
    }
}

/// Result of a nearest-cluster lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestCluster {
    pub cluster: Cluster,
    /// Distance from the query position to the cluster center, in meters
    pub distance: f64,
}

/// Aggregate clustering statistics.
///
/// Averages are `None` when there are no clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatistics {
    pub total_points: usize,
    pub total_clusters: usize,
    pub total_visits: u64,
    pub average_radius: Option<f64>,
    pub average_points_per_cluster: Option<f64>,
    pub max_clusters: usize,
    pub max_distance: f64,
    pub max_radius: f64,
    pub min_points: usize,
}

impl ClusterStatistics {
    /// Flatten into a key/value map; absent averages become `null`.
    pub fn to_map(&self) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::from([
            ("total_points".to_string(), json!(self.total_points)),
            ("total_clusters".to_string(), json!(self.total_clusters)),
            ("total_visits".to_string(), json!(self.total_visits)),
            ("average_radius".to_string(), json!(self.average_radius)),
            (
                "average_points_per_cluster".to_string(),
                json!(self.average_points_per_cluster),
            ),
            ("max_clusters".to_string(), json!(self.max_clusters)),
            ("max_distance".to_string(), json!(self.max_distance)),
            ("max_radius".to_string(), json!(self.max_radius)),
            ("min_points".to_string(), json!(self.min_points)),
        ])
    }
}

// ============================================================================
// Cluster Engine
// ============================================================================

/// The clustering state and all passes over it.
#[derive(Debug)]
pub struct ClusterEngine {
    config: ClusteringConfig,
    clusters: HashMap<String, Cluster>,
    /// Samples not yet folded into any cluster, in arrival order
    pending: Vec<Point>,
    /// Disambiguates cluster ids created within the same nanosecond
    next_seq: u64,
}

impl ClusterEngine {
    pub fn new(config: ClusteringConfig) -> Self {
        Self {
            config,
            clusters: HashMap::new(),
            pending: Vec::new(),
            next_seq: 0,
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    /// Swap the configuration. Existing clusters are left as they are.
    pub fn set_config(&mut self, config: ClusteringConfig) {
        self.config = config;
        info!("[ClusterEngine] Updated clustering configuration");
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Ingest one sample, then run a full maintenance pass.
    pub fn add_point(&mut self, point: Point, now: DateTime<Utc>) -> IngestOutcome {
        let position = point.position();
        self.pending.push(point);

        let outcome = match self.assign_to_existing_cluster(&position, now) {
            Some(outcome) => outcome,
            None => self
                .create_new_cluster(&position, now)
                .unwrap_or(IngestOutcome::Pending),
        };

        let report = self.run_maintenance(now);
        outcome.follow_merges(&report.absorbed)
    }

    /// Move the newest pending sample into the nearest cluster in range.
    fn assign_to_existing_cluster(
        &mut self,
        position: &LatLng,
        now: DateTime<Utc>,
    ) -> Option<IngestOutcome> {
        let max_distance = self.config.max_distance;
        let (cluster_id, distance) = self
            .nearest_cluster(position)
            .filter(|(_, distance)| *distance <= max_distance)
            .map(|(cluster, distance)| (cluster.id.clone(), distance))?;

        let cluster = self.clusters.get_mut(&cluster_id)?;
        let point = self.pending.pop()?;
        cluster.points.push(point);
        cluster.last_updated = now;
        cluster.visit_count += 1;
        update_cluster_metrics(cluster);

        debug!("[ClusterEngine] Point assigned to cluster {} at {:.1}m", cluster_id, distance);
        Some(IngestOutcome::Assigned {
            cluster_id,
            distance,
        })
    }

    /// Seed a cluster from every pending sample within range of `position`.
    fn create_new_cluster(
        &mut self,
        position: &LatLng,
        now: DateTime<Utc>,
    ) -> Option<IngestOutcome> {
        let max_distance = self.config.max_distance;
        let in_range = |p: &Point| haversine_distance(position, &p.position()) <= max_distance;

        let nearby_count = self.pending.iter().filter(|p| in_range(*p)).count();
        if nearby_count == 0 || nearby_count < self.config.min_points {
            return None;
        }

        let (nearby, remaining): (Vec<Point>, Vec<Point>) =
            std::mem::take(&mut self.pending).into_iter().partition(in_range);
        self.pending = remaining;

        let cluster_id = self.generate_cluster_id(now);
        let mut cluster = Cluster {
            id: cluster_id.clone(),
            center: *position,
            radius: max_distance,
            points: nearby,
            created_at: now,
            last_updated: now,
            visit_count: 1,
            total_time: 0.0,
            avg_signal: 0.0,
            avg_speed: 0.0,
            tags: BTreeSet::new(),
        };
        update_cluster_metrics(&mut cluster);

        let points = cluster.points.len();
        self.clusters.insert(cluster_id.clone(), cluster);

        info!("[ClusterEngine] Created cluster {} with {} points", cluster_id, points);
        Some(IngestOutcome::Seeded { cluster_id, points })
    }

    fn generate_cluster_id(&mut self, now: DateTime<Utc>) -> String {
        let seq = self.next_seq;
        self.next_seq += 1;
        format!(
            "cluster_{}_{}",
            now.timestamp_nanos_opt().unwrap_or_default(),
            seq
        )
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Decay, merge and evict as one unit.
    pub fn run_maintenance(&mut self, now: DateTime<Utc>) -> MaintenanceReport {
        let expired_points = self.cleanup_old_points(now);
        let absorbed = self.merge_pass(now);
        let merged = absorbed.len();
        let evicted = self.limit_clusters();

        if expired_points > 0 || merged > 0 || !evicted.is_empty() {
            debug!(
                "[ClusterEngine] Maintenance: {} expired, {} merged, {} evicted",
                expired_points,
                merged,
                evicted.len()
            );
        }

        MaintenanceReport {
            expired_points,
            merged,
            absorbed,
            evicted,
        }
    }

    /// Drop samples at or before `now - time_window`. Returns the number removed.
    pub fn cleanup_old_points(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now
            .checked_sub_signed(self.config.time_window_duration())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let before = self.pending.len();
        self.pending.retain(|p| p.timestamp > cutoff);
        let mut removed = before - self.pending.len();

        for cluster in self.clusters.values_mut() {
            let before = cluster.points.len();
            cluster.points.retain(|p| p.timestamp > cutoff);
            removed += before - cluster.points.len();
            update_cluster_metrics(cluster);
        }

        removed
    }

    /// Single greedy sweep merging clusters whose centers are within
    /// `merge_threshold`. The older cluster absorbs the newer one.
    ///
    /// Returns the number of clusters absorbed.
    pub fn merge_nearby_clusters(&mut self, now: DateTime<Utc>) -> usize {
        self.merge_pass(now).len()
    }

    /// Merge sweep returning absorbed id -> surviving id.
    fn merge_pass(&mut self, now: DateTime<Utc>) -> BTreeMap<String, String> {
        let threshold = self.config.merge_threshold;
        let mut order: Vec<String> = self
            .clusters_by_creation()
            .into_iter()
            .map(|c| c.id.clone())
            .collect();
        let mut absorbed_into = BTreeMap::new();

        let mut i = 0;
        while i < order.len() {
            let mut j = i + 1;
            while j < order.len() {
                let pair = (self.clusters.get(&order[i]), self.clusters.get(&order[j]));
                let distance = match pair {
                    (Some(a), Some(b)) => haversine_distance(&a.center, &b.center),
                    _ => f64::INFINITY,
                };
                if distance > threshold {
                    j += 1;
                    continue;
                }

                let absorbed_id = order.remove(j);
                let absorbed = self.clusters.remove(&absorbed_id);
                let target = self.clusters.get_mut(&order[i]);
                if let (Some(absorbed), Some(target)) = (absorbed, target) {
                    merge_into(target, absorbed, now);
                    info!(
                        "[ClusterEngine] Merged cluster {} into {} ({:.1}m apart)",
                        absorbed_id, order[i], distance
                    );
                    absorbed_into.insert(absorbed_id, order[i].clone());
                }
            }
            i += 1;
        }

        absorbed_into
    }

    /// Evict the least recently updated clusters above `max_clusters`.
    /// Returns the evicted ids, oldest first.
    pub fn limit_clusters(&mut self) -> Vec<String> {
        let max_clusters = self.config.max_clusters;
        if self.clusters.len() <= max_clusters {
            return Vec::new();
        }

        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .clusters
            .values()
            .map(|c| (c.last_updated, c.id.clone()))
            .collect();
        by_age.sort();

        let to_remove = by_age.len() - max_clusters;
        by_age
            .into_iter()
            .take(to_remove)
            .map(|(_, id)| {
                self.clusters.remove(&id);
                debug!("[ClusterEngine] Evicted cluster {}", id);
                id
            })
            .collect()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Snapshot of all clusters, oldest created first.
    pub fn get_clusters(&self) -> Vec<Cluster> {
        self.clusters_by_creation().into_iter().cloned().collect()
    }

    pub fn get_cluster(&self, id: &str) -> Option<&Cluster> {
        self.clusters.get(id)
    }

    /// Nearest cluster center to `position`, or `None` without clusters.
    pub fn find_nearest_cluster(&self, position: &LatLng) -> Option<NearestCluster> {
        self.nearest_cluster(position)
            .map(|(cluster, distance)| NearestCluster {
                cluster: cluster.clone(),
                distance,
            })
    }

    pub fn get_clusters_by_tag(&self, tag: &str) -> Vec<Cluster> {
        self.clusters_by_creation()
            .into_iter()
            .filter(|c| c.has_tag(tag))
            .cloned()
            .collect()
    }

    pub fn pending_points(&self) -> &[Point] {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn statistics(&self) -> ClusterStatistics {
        let total_clusters = self.clusters.len();
        let total_visits: u64 = self.clusters.values().map(|c| c.visit_count).sum();

        let (average_radius, average_points_per_cluster) = if total_clusters > 0 {
            let n = total_clusters as f64;
            let radius_sum: f64 = self.clusters.values().map(|c| c.radius).sum();
            let points_sum: usize = self.clusters.values().map(|c| c.points.len()).sum();
            (Some(radius_sum / n), Some(points_sum as f64 / n))
        } else {
            (None, None)
        };

        ClusterStatistics {
            total_points: self.pending.len(),
            total_clusters,
            total_visits,
            average_radius,
            average_points_per_cluster,
            max_clusters: self.config.max_clusters,
            max_distance: self.config.max_distance,
            max_radius: self.config.max_radius,
            min_points: self.config.min_points,
        }
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// Add a tag. Returns whether the tag set changed.
    pub fn add_tag(&mut self, cluster_id: &str, tag: &str, now: DateTime<Utc>) -> Result<bool> {
        let cluster = self
            .clusters
            .get_mut(cluster_id)
            .ok_or_cluster_not_found(cluster_id)?;

        if !cluster.tags.insert(tag.to_string()) {
            return Ok(false);
        }
        cluster.last_updated = now;
        debug!("[ClusterEngine] Added tag '{}' to cluster {}", tag, cluster_id);
        Ok(true)
    }

    /// Remove a tag. Returns whether the tag set changed.
    pub fn remove_tag(&mut self, cluster_id: &str, tag: &str, now: DateTime<Utc>) -> Result<bool> {
        let cluster = self
            .clusters
            .get_mut(cluster_id)
            .ok_or_cluster_not_found(cluster_id)?;

        if !cluster.tags.remove(tag) {
            return Ok(false);
        }
        cluster.last_updated = now;
        debug!("[ClusterEngine] Removed tag '{}' from cluster {}", tag, cluster_id);
        Ok(true)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Nearest cluster by center distance; ties go to the smallest id.
    fn nearest_cluster(&self, position: &LatLng) -> Option<(&Cluster, f64)> {
        self.clusters
            .values()
            .map(|c| (c, haversine_distance(position, &c.center)))
            .filter(|(_, distance)| !distance.is_nan())
            .min_by(|(a, da), (b, db)| da.total_cmp(db).then_with(|| a.id.cmp(&b.id)))
    }

    fn clusters_by_creation(&self) -> Vec<&Cluster> {
        let mut clusters: Vec<&Cluster> = self.clusters.values().collect();
        clusters.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        clusters
    }
}

impl Default for ClusterEngine {
    fn default() -> Self {
        Self::new(ClusteringConfig::default())
    }
}

/// Fold `absorbed` into `target`.
///
/// Visit counts and dwell times are summed, but the recompute that follows
/// replaces the summed dwell with the merged member span whenever the merged
/// cluster has members.
fn merge_into(target: &mut Cluster, absorbed: Cluster, now: DateTime<Utc>) {
    target.points.extend(absorbed.points);
    target.visit_count += absorbed.visit_count;
    target.total_time += absorbed.total_time;
    target.tags.extend(absorbed.tags);
    target.last_updated = now;
    update_cluster_metrics(target);
}

// ============================================================================
// Tests
// ============================================================================
