use thiserror::Error;

use rangegrid_cluster::{DirectoryError, RegionCallError};
use rangegrid_core::NameError;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The retry bound was reached; `last` is the final attempt's failure.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },

    #[error("table {0} not found")]
    TableNotFound(String),

    /// The directory knows the region but it has no live assignment yet.
    #[error("region {0} is not online")]
    RegionOffline(String),

    #[error(transparent)]
    InvalidTable(#[from] NameError),

    #[error(transparent)]
    Call(#[from] RegionCallError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("attempt timed out")]
    Timeout,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Whether another attempt after re-resolving may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::RegionOffline(_) | ClientError::Timeout => true,
            ClientError::Call(e) => e.is_relocation(),
            ClientError::Directory(e) => e.is_retryable(),
            ClientError::RetriesExhausted { .. }
            | ClientError::TableNotFound(_)
            | ClientError::InvalidTable(_)
            | ClientError::UnexpectedResponse(_) => false,
        }
    }
}
