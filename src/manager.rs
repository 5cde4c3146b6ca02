//! # Cluster Manager
//!
//! Thread-safe front for [`ClusterEngine`].
//!
//! All state sits behind one `RwLock`: ingest, tag changes, config swaps and
//! maintenance passes take the write lock for their whole duration, queries
//! take the read lock. Nothing blocks or does I/O while holding it.
//!
//! A background thread runs a maintenance pass (decay, merge, eviction) every
//! `cleanup_interval`. The interval is read once when the thread starts.
//! [`ClusterManager::close`] asks the thread to stop and returns right away;
//! the thread exits on its next wake-up.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::engine::{
    ClusterEngine, ClusterStatistics, IngestOutcome, MaintenanceReport, NearestCluster,
};
use crate::error::Result;
use crate::{Cluster, ClusteringConfig, LatLng, Point};

/// Shared clustering state plus its maintenance thread.
pub struct ClusterManager {
    engine: Arc<RwLock<ClusterEngine>>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterManager {
    /// Create a manager and start periodic maintenance.
    pub fn new(config: ClusteringConfig) -> Self {
        let interval = config.cleanup_interval_duration();
        let engine = Arc::new(RwLock::new(ClusterEngine::new(config)));
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = spawn_maintenance(Arc::clone(&engine), interval, stop_rx);

        info!("[ClusterManager] Started with maintenance every {:?}", interval);

        Self {
            engine,
            stop_tx: Mutex::new(Some(stop_tx)),
            maintenance: Mutex::new(Some(handle)),
        }
    }

    /// Create a manager without a background thread. Maintenance then only
    /// runs on ingest and on explicit [`run_maintenance`](Self::run_maintenance) calls.
    pub fn without_maintenance(config: ClusteringConfig) -> Self {
        Self {
            engine: Arc::new(RwLock::new(ClusterEngine::new(config))),
            stop_tx: Mutex::new(None),
            maintenance: Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ClusterEngine> {
        self.engine.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ClusterEngine> {
        self.engine.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Ingest & Maintenance
    // ========================================================================

    /// Ingest a sample. Never fails; a sample that fits nowhere stays pending.
    pub fn add_point(&self, point: Point) -> IngestOutcome {
        self.add_point_at(point, Utc::now())
    }

    /// Ingest a sample as of `now` (for replaying recorded streams).
    pub fn add_point_at(&self, point: Point, now: DateTime<Utc>) -> IngestOutcome {
        self.write().add_point(point, now)
    }

    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.run_maintenance_at(Utc::now())
    }

    pub fn run_maintenance_at(&self, now: DateTime<Utc>) -> MaintenanceReport {
        self.write().run_maintenance(now)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_clusters(&self) -> Vec<Cluster> {
        self.read().get_clusters()
    }

    pub fn get_cluster_by_id(&self, id: &str) -> Option<Cluster> {
        self.read().get_cluster(id).cloned()
    }

    pub fn find_nearest_cluster(&self, position: &LatLng) -> Option<NearestCluster> {
        self.read().find_nearest_cluster(position)
    }

    pub fn get_clusters_by_tag(&self, tag: &str) -> Vec<Cluster> {
        self.read().get_clusters_by_tag(tag)
    }

    pub fn get_statistics(&self) -> ClusterStatistics {
        self.read().statistics()
    }

    pub fn pending_count(&self) -> usize {
        self.read().pending_count()
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// Add a tag to a cluster. `Ok(false)` if it was already there.
    pub fn add_tag_to_cluster(&self, cluster_id: &str, tag: &str) -> Result<bool> {
        self.write().add_tag(cluster_id, tag, Utc::now())
    }

    /// Remove a tag from a cluster. `Ok(false)` if it was not there.
    pub fn remove_tag_from_cluster(&self, cluster_id: &str, tag: &str) -> Result<bool> {
        self.write().remove_tag(cluster_id, tag, Utc::now())
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Replace the configuration for subsequent operations.
    ///
    /// The running maintenance thread keeps its original interval.
    pub fn update_config(&self, config: ClusteringConfig) {
        self.write().set_config(config);
    }

    pub fn config(&self) -> ClusteringConfig {
        self.read().config().clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Ask the maintenance thread to stop. Does not wait for it to exit.
    pub fn close(&self) {
        let sender = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The thread may already be gone; nothing to do then.
            let _ = sender.send(());
            debug!("[ClusterManager] Requested maintenance shutdown");
        }
    }

    /// Whether the maintenance thread is still alive.
    pub fn is_maintenance_running(&self) -> bool {
        self.maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run maintenance on every timeout; stop on a message or a dropped sender.
fn spawn_maintenance(
    engine: Arc<RwLock<ClusterEngine>>,
    interval: Duration,
    stop_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let report = engine
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .run_maintenance(Utc::now());
                debug!(
                    "[ClusterManager] Periodic cleanup: {} expired, {} merged, {} evicted",
                    report.expired_points,
                    report.merged,
                    report.evicted.len()
                );
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("[ClusterManager] Maintenance thread stopping");
                break;
            }
        }
    })
}
