//! Transport seam between callers and region servers.
//!
//! The wire encoding of region RPCs is delegated; callers only see
//! [`RegionService`]. [`LocalTransport`] wires callers to in-process
//! [`RegionServer`]s, which is what the local cluster and tests use.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use rangegrid_core::{Cells, RegionIdentity, Row, ServerAddress};

use crate::error::{RegionCallError, TransportError};
use crate::server::RegionServer;

/// A single row operation against a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowOp {
    Get { row: String },
    Put { row: String, cells: Cells },
    /// Delete the named columns, or the whole row when `columns` is empty.
    Delete { row: String, columns: Vec<String> },
    /// Up to `limit` rows from `start_row` to the end of the region.
    Scan { start_row: String, limit: usize },
    /// The row with the greatest key `<= row`; used for directory lookups.
    ClosestRowBefore { row: String },
}

impl RowOp {
    /// Row key the operation is addressed to.
    pub fn row(&self) -> &str {
        match self {
            RowOp::Get { row }
            | RowOp::Put { row, .. }
            | RowOp::Delete { row, .. }
            | RowOp::ClosestRowBefore { row } => row,
            RowOp::Scan { start_row, .. } => start_row,
        }
    }
}

/// Successful result of a [`RowOp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOpOutput {
    Row(Option<Cells>),
    Rows(Vec<Row>),
    Closest(Option<Row>),
    Written,
    Deleted(bool),
}

/// The region storage engine as seen by callers.
#[async_trait]
pub trait RegionService: Send + Sync {
    fn address(&self) -> &ServerAddress;

    /// Start serving `region` at `epoch`.
    async fn open_region(&self, region: &RegionIdentity, epoch: u64) -> Result<(), RegionCallError>;

    /// Stop serving `region`. Closing a region that is not open succeeds.
    async fn close_region(&self, region: &RegionIdentity) -> Result<(), RegionCallError>;

    /// Apply `op` to `region`, provided `epoch` is the region's current one.
    async fn apply(
        &self,
        region: &RegionIdentity,
        epoch: u64,
        op: RowOp,
    ) -> Result<RowOpOutput, RegionCallError>;
}

/// Resolves a server address to a callable region service.
pub trait Transport: Send + Sync {
    fn connect(&self, address: &ServerAddress) -> Result<Arc<dyn RegionService>, TransportError>;
}

/// In-process transport over a registry of region servers.
#[derive(Clone, Default)]
pub struct LocalTransport {
    servers: Arc<RwLock<HashMap<ServerAddress, Arc<RegionServer>>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a server reachable, replacing any previous server at its address.
    pub fn register(&self, server: Arc<RegionServer>) {
        let mut servers = self.servers.write().expect("servers lock");
        debug!(server = %server.address(), "server reachable");
        servers.insert(server.address().clone(), server);
    }

    /// Make an address unreachable.
    pub fn unregister(&self, address: &ServerAddress) {
        let mut servers = self.servers.write().expect("servers lock");
        servers.remove(address);
    }

    pub fn server(&self, address: &ServerAddress) -> Option<Arc<RegionServer>> {
        let servers = self.servers.read().expect("servers lock");
        servers.get(address).cloned()
    }
}

impl Transport for LocalTransport {
    fn connect(&self, address: &ServerAddress) -> Result<Arc<dyn RegionService>, TransportError> {
        let servers = self.servers.read().expect("servers lock");
        match servers.get(address) {
            Some(server) if server.is_running() => Ok(server.clone() as Arc<dyn RegionService>),
            _ => Err(TransportError::ConnectionRefused(address.clone())),
        }
    }
}
