//! redb table definitions for the RangeGrid region storage.
//!
//! Values are JSON-serialized core types unless noted otherwise.

use redb::TableDefinition;

/// Region catalog: `RegionIdentity` keyed by region id.
pub const REGIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("regions");

/// Row cells keyed by `{region_id:020}/{row}`.
pub const ROWS: TableDefinition<&str, &[u8]> = TableDefinition::new("rows");

/// Fence epoch per region id (raw `u64`).
pub const FENCES: TableDefinition<u64, u64> = TableDefinition::new("fences");

/// Small coordination records; holds the ROOT location under `root`.
pub const BOOTSTRAP: TableDefinition<&str, &[u8]> = TableDefinition::new("bootstrap");

/// Monotonic counters (raw `u64`), e.g. the region id allocator.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
