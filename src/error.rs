//! Unified error handling for the visit-cluster library.
//!
//! Ingest never fails: a sample that cannot be assigned or seeded simply
//! stays pending. Errors only surface from operations that reference a
//! cluster by id, and from the JSON request surface.

use thiserror::Error;

/// Unified error type for clustering operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A tag or lookup operation referenced an unknown cluster id
    #[error("cluster not found: {cluster_id}")]
    ClusterNotFound { cluster_id: String },

    /// A request payload was missing a field or carried an unusable value
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// A configuration value was out of range
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// JSON (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        ClusterError::InvalidRequest {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        ClusterError::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Result type alias for clustering operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Extension trait for converting Option to ClusterError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a cluster-not-found error.
    fn ok_or_cluster_not_found(self, cluster_id: &str) -> Result<T>;

    /// Convert Option to Result with an invalid-request error.
    fn ok_or_invalid_request(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_cluster_not_found(self, cluster_id: &str) -> Result<T> {
        self.ok_or_else(|| ClusterError::ClusterNotFound {
            cluster_id: cluster_id.to_string(),
        })
    }

    fn ok_or_invalid_request(self, message: &str) -> Result<T> {
        self.ok_or_else(|| ClusterError::invalid_request(message))
    }
}
