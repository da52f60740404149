//! Master error types.

use thiserror::Error;

use rangegrid_cluster::{DirectoryError, MonitorError};
use rangegrid_core::{NameError, RegionIdentity};
use rangegrid_state::StateError;

/// Result type alias for master operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A directory row is unreadable or missing for a region the cluster
    /// knows about. The region stays unassigned.
    #[error("directory corrupt for region {region}: {reason}")]
    DirectoryCorrupt {
        region: RegionIdentity,
        reason: String,
    },

    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(#[from] DirectoryError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    InvalidTable(#[from] NameError),

    #[error("table {0} already exists")]
    TableExists(String),
}
