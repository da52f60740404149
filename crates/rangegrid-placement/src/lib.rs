//! rangegrid-placement: choosing replacement servers for orphaned regions.
//!
//! Placement here is failure-driven only. Candidates are the ALIVE servers
//! known to the cluster monitor; the preferred one holds the fewest regions,
//! with ties broken by address ordering so every decision is reproducible.
//!
//! # Components
//!
//! - **`scorer`**: server load and ranking
//! - **`placer`**: single replacement selection and batch plans
//! - **`convert`**: monitor records to server loads

pub mod convert;
pub mod placer;
pub mod scorer;

pub use convert::{alive_loads, record_to_load};
pub use placer::{ReassignmentPlan, plan_reassignment, select_replacement};
pub use scorer::{ServerLoad, rank_servers};
