//! Cluster error types.

use thiserror::Error;

use rangegrid_core::ServerAddress;

/// The remote server could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection refused by {0}")]
    ConnectionRefused(ServerAddress),

    #[error("call to {0} timed out")]
    Timeout(ServerAddress),

    /// The server was declared dead while the call was outstanding.
    #[error("{0} was declared dead mid-call")]
    ServerDead(ServerAddress),
}

/// Distinguishable reasons a region server rejects a row operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowOpReject {
    /// The caller's epoch is older than the region's current one.
    #[error("assignment epoch is stale, region is at epoch {current}")]
    EpochStale { current: u64 },

    /// The region is not open on this server.
    #[error("region is not serving on this server")]
    NotServing,

    /// The row lies outside the region's key range.
    #[error("row {0:?} is outside the region")]
    RowOutOfRange(String),
}

/// Failure of a call against a region server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionCallError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Rejected(#[from] RowOpReject),

    /// The server refused to open a region.
    #[error("open refused: {0}")]
    OpenRefused(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl RegionCallError {
    /// Whether the caller should drop its cached location and re-resolve.
    pub fn is_relocation(&self) -> bool {
        matches!(
            self,
            RegionCallError::Transport(_)
                | RegionCallError::Rejected(RowOpReject::EpochStale { .. })
                | RegionCallError::Rejected(RowOpReject::NotServing)
                | RegionCallError::Rejected(RowOpReject::RowOutOfRange(_))
        )
    }
}

/// Failure while reading or writing ROOT/META.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Call(#[from] RegionCallError),

    #[error("bootstrap record unavailable: {0}")]
    Bootstrap(String),

    /// The directory region that should hold the row has no live assignment.
    #[error("directory region for {0} is not assigned")]
    Unassigned(String),

    #[error("corrupt directory row {row:?}: {reason}")]
    Corrupt { row: String, reason: String },
}

impl DirectoryError {
    /// Whether re-reading the directory later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DirectoryError::Call(e) => e.is_relocation(),
            DirectoryError::Bootstrap(_) | DirectoryError::Unassigned(_) => true,
            DirectoryError::Corrupt { .. } => false,
        }
    }
}

/// Registration rejected by the cluster monitor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("server address must not be empty")]
    EmptyAddress,

    /// The registration time is older than the live instance's last heartbeat.
    #[error("registration from {address} at {now} predates its last heartbeat at {last_heartbeat}")]
    StaleRegistration {
        address: ServerAddress,
        now: u64,
        last_heartbeat: u64,
    },
}
