//! Error types for the RangeGrid region storage.

use rangegrid_core::RegionId;
use thiserror::Error;

/// Result type alias for storage operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("region {region_id} is fenced at epoch {fence}, request carried epoch {epoch}")]
    Fenced {
        region_id: RegionId,
        fence: u64,
        epoch: u64,
    },
}
