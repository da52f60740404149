//! rangegrid-client: locating regions and running row operations.
//!
//! A client never assumes a region stays where it found it. Locations are
//! cached per row range in a [`LocationCache`]; the [`DirectoryResolver`]
//! fills it by walking bootstrap record, ROOT, then META. Every row
//! operation goes through a [`RowOpRunner`], which drops the cached range
//! when a server answers "not serving", "epoch stale" or refuses the
//! connection, re-resolves, and tries again within a bounded number of
//! attempts.
//!
//! [`RangeClient`] and [`Table`] are the row API layered on top.

pub mod cache;
pub mod error;
pub mod resolver;
pub mod retry;
pub mod table;

#[cfg(test)]
mod testing;

pub use cache::{CacheStats, CachedLocation, LocationCache};
pub use error::ClientError;
pub use resolver::DirectoryResolver;
pub use retry::{OpState, RetryPolicy, RowOpRunner};
pub use table::{RangeClient, RowUpdate, Scanner, Table};
