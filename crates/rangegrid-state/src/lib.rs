//! rangegrid-state: shared region storage for RangeGrid.
//!
//! Backed by [redb](https://docs.rs/redb). Region data outlives any single
//! region server: whichever server currently holds a region reads and writes
//! its rows here, so a reassigned region resumes with its data intact.
//!
//! # Architecture
//!
//! Cells are JSON-serialized into redb's `&[u8]` value columns. Row keys are
//! `{region_id:020}/{row}`, which keeps each region's rows contiguous and
//! ordered so scans and closest-row-before lookups are range reads.
//!
//! Every region carries a **fence epoch**. Opening a region at epoch `e`
//! raises its fence to `e`; writes carrying an older epoch fail with
//! [`StateError::Fenced`]. The bootstrap record (ROOT's location) is fenced
//! the same way.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::{BootstrapSource, StateStore};
