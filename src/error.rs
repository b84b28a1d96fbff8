//! Error types for the Tollgate service.

use thiserror::Error;

use crate::cache::CacheError;
use crate::mesh::ClusterError;

/// Main error type for Tollgate operations.
///
/// Rate limiting decisions never fail; these cover setup and I/O around them.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cache backend errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Cluster membership errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
