//! Client-side location cache.
//!
//! Maps row-key ranges to the server and epoch a region was last found at.
//! Entries are filled lazily by the resolver and dropped one range at a time
//! when a request proves them stale; nothing here expires on its own.
//!
//! Each table keeps its entries in a `BTreeMap` keyed by region start key,
//! so the entry covering a row is the greatest start key `<= row`, provided
//! its end key lies past the row.
//!
//! Cache statistics (hits, misses, invalidations) are emitted as
//! `tracing::debug` fields.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use rangegrid_core::{RegionAssignment, RegionIdentity, ServerAddress};

/// Where a region was last seen serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLocation {
    pub region: RegionIdentity,
    pub server: ServerAddress,
    /// Assignment epoch the directory reported when this entry was cached.
    pub epoch: u64,
}

impl CachedLocation {
    pub fn assignment(&self) -> RegionAssignment {
        RegionAssignment {
            region: self.region.clone(),
            server: self.server.clone(),
            epoch: self.epoch,
        }
    }
}

impl From<RegionAssignment> for CachedLocation {
    fn from(assignment: RegionAssignment) -> Self {
        Self {
            region: assignment.region,
            server: assignment.server,
            epoch: assignment.epoch,
        }
    }
}

/// Accumulated cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Row-range location cache.
///
/// Not internally synchronized; the resolver wraps it in a `Mutex`.
#[derive(Debug, Default)]
pub struct LocationCache {
    /// Table name → region start key → location.
    tables: HashMap<String, BTreeMap<String, CachedLocation>>,
    stats: CacheStats,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached location covering `row` of `table`.
    pub fn get(&mut self, table: &str, row: &str) -> Option<CachedLocation> {
        let found = self.covering(table, row).cloned();
        match &found {
            Some(location) => {
                self.stats.hits += 1;
                tracing::debug!(
                    table,
                    row,
                    server = %location.server,
                    cache_hits = self.stats.hits,
                    cache_misses = self.stats.misses,
                    "location cache hit"
                );
            }
            None => {
                self.stats.misses += 1;
                tracing::debug!(
                    table,
                    row,
                    cache_hits = self.stats.hits,
                    cache_misses = self.stats.misses,
                    "location cache miss"
                );
            }
        }
        found
    }

    /// Cache `location`, replacing every entry of the same table whose range
    /// overlaps it.
    pub fn insert(&mut self, location: CachedLocation) {
        let entries = self
            .tables
            .entry(location.region.table_name.clone())
            .or_default();
        entries.retain(|_, cached| !cached.region.overlaps(&location.region));
        entries.insert(location.region.start_key.clone(), location);
    }

    /// Drop the entry covering `row` of `table`, leaving the rest of the
    /// table's ranges in place. Returns the dropped entry.
    pub fn invalidate(&mut self, table: &str, row: &str) -> Option<CachedLocation> {
        let start_key = self.covering(table, row)?.region.start_key.clone();
        let entries = self.tables.get_mut(table)?;
        let removed = entries.remove(&start_key);
        if entries.is_empty() {
            self.tables.remove(table);
        }
        if let Some(location) = &removed {
            self.stats.invalidations += 1;
            tracing::debug!(
                table,
                row,
                region = %location.region,
                server = %location.server,
                cache_invalidations = self.stats.invalidations,
                "location cache entry invalidated"
            );
        }
        removed
    }

    /// Number of cached ranges across all tables.
    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn covering(&self, table: &str, row: &str) -> Option<&CachedLocation> {
        let (_, location) = self
            .tables
            .get(table)?
            .range::<str, _>((Bound::Unbounded, Bound::Included(row)))
            .next_back()?;
        location.region.contains(row).then_some(location)
    }
}
