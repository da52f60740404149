//! rangegrid-core: shared types for RangeGrid crates.
//!
//! Defines the region model (identities, assignments, directory rows),
//! server identities, the cluster configuration file, and the clocks used
//! for lease accounting.

pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::ClusterConfig;
pub use types::*;
