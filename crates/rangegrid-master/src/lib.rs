//! rangegrid-master: failure detection and region reassignment.
//!
//! The master combines the cluster monitor (heartbeat leases) with the
//! reassignment coordinator that moves a dead server's regions to
//! survivors and rewrites the directory.
//!
//! # Architecture
//!
//! ```text
//! Master
//!   ├── ClusterMonitor (tick loop on the master task)
//!   │   └── ServerFailure ──channel──► failure consumer task
//!   └── ReassignmentCoordinator
//!       ├── ROOT  → open on replacement → bootstrap record
//!       ├── META  → open on replacement → ROOT row
//!       └── user  → open on replacement → META row   (concurrent)
//! ```
//!
//! Replacement choice is least-loaded ALIVE server, ties broken by address.
//! Open-region calls and directory writes retry against other candidates
//! with exponential backoff (`backoff_base` doubling to `backoff_max`) and
//! are never abandoned. With no live server the region waits in
//! [`ReassignmentCoordinator::unassigned_regions`] until one registers.
//!
//! [`LocalCluster`] runs a master and region servers in one process.

pub mod backoff;
pub mod coordinator;
pub mod error;
pub mod local;
pub mod master;

pub use backoff::Backoff;
pub use coordinator::{CoordinatorSettings, CorruptionAlert, ReassignmentCoordinator};
pub use error::{CoordinatorError, CoordinatorResult};
pub use local::LocalCluster;
pub use master::Master;
