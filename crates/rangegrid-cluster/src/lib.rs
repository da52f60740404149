//! rangegrid-cluster: region serving and liveness for RangeGrid.
//!
//! Provides the region server (the storage-engine boundary with epoch
//! fencing), the transport seam used to reach region servers, directory
//! access shared by the master and clients, the master-side cluster monitor,
//! and the region server agent that keeps a server registered.
//!
//! # Architecture
//!
//! ```text
//! Master
//!   └── ClusterMonitor
//!       ├── register() → fresh ServerIdentity (new start code)
//!       ├── report_heartbeat() → Accepted | Duplicate | Fenced | Unknown
//!       ├── tick(now) → ALIVE → SUSPECT → DEAD transitions
//!       └── emits ServerFailure once per DEAD transition
//!
//! Region server process
//!   ├── RegionServer (open_region / close_region / apply)
//!   └── RegionServerAgent
//!       ├── registers through MasterLink
//!       ├── sends periodic heartbeats with the regions it holds
//!       └── aborts when the master fences it
//!
//! Directory
//!   └── bootstrap record → ROOT rows → META rows, read and written
//!       as ordinary row operations through the Transport
//! ```

pub mod agent;
pub mod directory;
pub mod error;
pub mod monitor;
pub mod server;
pub mod transport;

pub use agent::{AgentExit, MasterLink, Registration, RegionServerAgent};
pub use directory::Directory;
pub use error::{DirectoryError, MonitorError, RegionCallError, RowOpReject, TransportError};
pub use monitor::{
    ClusterMonitor, HeartbeatOutcome, HeartbeatReport, MonitorSettings, ServerFailure,
    ServerRecord, ServerState,
};
pub use server::RegionServer;
pub use transport::{LocalTransport, RegionService, RowOp, RowOpOutput, Transport};
