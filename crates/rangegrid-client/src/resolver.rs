//! Directory resolver: row key to serving region.
//!
//! Resolution consults the cache first. On a miss it walks the directory:
//! the bootstrap record names ROOT's server, ROOT's entry covering
//! `{table},{row}` names the META region, and that META region's entry
//! names the user region. META locations are cached under the META table
//! like any other region; ROOT's location is read fresh each time. Rows of
//! the directory tables themselves resolve one level up: META rows through
//! ROOT, ROOT rows through the bootstrap record.
//!
//! A single `resolve` is one attempt. Retrying, and deciding which cache
//! entry a failed request invalidates, belongs to the retry loop.

use std::sync::Mutex;

use tracing::debug;

use rangegrid_cluster::{Directory, DirectoryError};
use rangegrid_core::{META_TABLE, ROOT_TABLE, RegionIdentity, directory_key, is_catalog_table};

use crate::cache::{CacheStats, CachedLocation, LocationCache};
use crate::error::ClientError;

pub struct DirectoryResolver {
    directory: Directory,
    cache: Mutex<LocationCache>,
}

impl DirectoryResolver {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            cache: Mutex::new(LocationCache::new()),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Location of the region covering `row` of `table`.
    pub async fn resolve(&self, table: &str, row: &str) -> Result<CachedLocation, ClientError> {
        match table {
            ROOT_TABLE => return self.locate_root(),
            META_TABLE => return self.locate_meta(row).await,
            _ => {}
        }
        if let Some(hit) = self.cache.lock().expect("cache lock").get(table, row) {
            return Ok(hit);
        }

        let meta_row = directory_key(table, row);
        let meta = self.locate_meta(&meta_row).await?;
        let found = match self.directory.lookup(&meta.assignment(), table, row).await {
            Ok(found) => found,
            Err(e) => {
                if e.is_retryable() {
                    // The META region itself may have moved.
                    self.cache
                        .lock()
                        .expect("cache lock")
                        .invalidate(META_TABLE, &meta_row);
                }
                return Err(e.into());
            }
        };

        let Some(entry) = found else {
            return Err(ClientError::TableNotFound(table.to_string()));
        };
        let location = online(&entry.region, entry.assignment())?;
        debug!(
            table,
            row,
            region = %location.region,
            server = %location.server,
            epoch = location.epoch,
            "resolved region"
        );
        self.cache.lock().expect("cache lock").insert(location.clone());
        Ok(location)
    }

    /// Drop the cached location covering `row` of `table`.
    pub fn invalidate(&self, table: &str, row: &str) -> Option<CachedLocation> {
        self.cache.lock().expect("cache lock").invalidate(table, row)
    }

    /// Drop the cached META location that `row` of `table` resolves
    /// through. Directory tables resolve without cached parents.
    pub fn invalidate_parent(&self, table: &str, row: &str) -> Option<CachedLocation> {
        if is_catalog_table(table) {
            return None;
        }
        self.cache
            .lock()
            .expect("cache lock")
            .invalidate(META_TABLE, &directory_key(table, row))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().expect("cache lock").stats()
    }

    /// ROOT's current location, straight from the bootstrap record.
    fn locate_root(&self) -> Result<CachedLocation, ClientError> {
        self.directory
            .root_assignment()?
            .map(CachedLocation::from)
            .ok_or_else(|| ClientError::RegionOffline(RegionIdentity::root().region_name()))
    }

    /// The META region holding `meta_row`.
    async fn locate_meta(&self, meta_row: &str) -> Result<CachedLocation, ClientError> {
        if let Some(hit) = self.cache.lock().expect("cache lock").get(META_TABLE, meta_row) {
            return Ok(hit);
        }

        let root = self.locate_root()?.assignment();
        let Some(entry) = self.directory.lookup(&root, META_TABLE, meta_row).await? else {
            return Err(DirectoryError::Corrupt {
                row: meta_row.to_string(),
                reason: "no META region covers row".to_string(),
            }
            .into());
        };

        let location = online(&entry.region, entry.assignment())?;
        self.cache.lock().expect("cache lock").insert(location.clone());
        Ok(location)
    }
}

fn online(
    region: &RegionIdentity,
    assignment: Option<rangegrid_core::RegionAssignment>,
) -> Result<CachedLocation, ClientError> {
    assignment
        .map(CachedLocation::from)
        .ok_or_else(|| ClientError::RegionOffline(region.region_name()))
}
