//! StateStore: redb-backed shared region storage for RangeGrid.
//!
//! Provides the region catalog, fenced row mutations, range reads, and the
//! bootstrap record. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use rangegrid_core::{Cells, FIRST_META_REGION_ID, RegionId, RegionIdentity, RootLocation, Row};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const ROOT_LOCATION_KEY: &str = "root";
const REGION_ID_SEQUENCE: &str = "region_id";

/// Where ROOT currently lives.
///
/// Readable by anyone resolving locations, written only by the
/// reassignment coordinator when ROOT moves.
pub trait BootstrapSource: Send + Sync {
    fn root_location(&self) -> StateResult<Option<RootLocation>>;

    /// Publish a new ROOT location. Fails with [`StateError::Fenced`] when
    /// the stored record already carries a newer epoch.
    fn publish_root_location(&self, location: &RootLocation) -> StateResult<()>;
}

/// Thread-safe region storage backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "region storage opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory region storage opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(REGIONS).map_err(map_err!(Table))?;
        txn.open_table(ROWS).map_err(map_err!(Table))?;
        txn.open_table(FENCES).map_err(map_err!(Table))?;
        txn.open_table(BOOTSTRAP).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Region catalog ─────────────────────────────────────────────

    /// Insert or update a region identity in the catalog.
    pub fn put_region(&self, region: &RegionIdentity) -> StateResult<()> {
        let value = serde_json::to_vec(region).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REGIONS).map_err(map_err!(Table))?;
            table
                .insert(region.region_id.0, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(region = %region, "region stored in catalog");
        Ok(())
    }

    /// Get a region identity by id.
    pub fn get_region(&self, region_id: RegionId) -> StateResult<Option<RegionIdentity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REGIONS).map_err(map_err!(Table))?;
        match table.get(region_id.0).map_err(map_err!(Read))? {
            Some(guard) => {
                let region: RegionIdentity =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(region))
            }
            None => Ok(None),
        }
    }

    /// List every region of a table, ordered by start key.
    pub fn list_regions_for_table(&self, table_name: &str) -> StateResult<Vec<RegionIdentity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REGIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let region: RegionIdentity =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if region.table_name == table_name {
                results.push(region);
            }
        }
        results.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        Ok(results)
    }

    /// Allocate the next region id. Ids below the first user id are reserved
    /// for ROOT and the initial META region.
    pub fn allocate_region_id(&self) -> StateResult<RegionId> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id;
        {
            let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let last = table
                .get(REGION_ID_SEQUENCE)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(FIRST_META_REGION_ID.0);
            id = last + 1;
            table
                .insert(REGION_ID_SEQUENCE, id)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(RegionId(id))
    }

    // ── Fences ─────────────────────────────────────────────────────

    /// Current fence epoch of a region (0 if it was never opened).
    pub fn fence(&self, region_id: RegionId) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FENCES).map_err(map_err!(Table))?;
        Ok(table
            .get(region_id.0)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }

    /// Raise a region's fence to `epoch`.
    ///
    /// Re-raising to the current fence is a no-op; lowering it fails with
    /// [`StateError::Fenced`].
    pub fn raise_fence(&self, region_id: RegionId, epoch: u64) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(FENCES).map_err(map_err!(Table))?;
            let fence = table
                .get(region_id.0)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            if epoch < fence {
                return Err(StateError::Fenced {
                    region_id,
                    fence,
                    epoch,
                });
            }
            table.insert(region_id.0, epoch).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%region_id, epoch, "region fence raised");
        Ok(())
    }

    // ── Rows ───────────────────────────────────────────────────────

    /// Merge `cells` into `row` of a region, provided `epoch` is not fenced.
    pub fn put_row(
        &self,
        region_id: RegionId,
        epoch: u64,
        row: &str,
        cells: &Cells,
    ) -> StateResult<()> {
        let key = row_key(region_id, row);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            check_fence(&txn, region_id, epoch)?;
            let mut table = txn.open_table(ROWS).map_err(map_err!(Table))?;
            let mut merged: Cells = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => Cells::new(),
            };
            merged.extend(cells.iter().map(|(k, v)| (k.clone(), v.clone())));
            let value = serde_json::to_vec(&merged).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%region_id, row, epoch, "row stored");
        Ok(())
    }

    /// Delete columns of a row; an empty column list deletes the whole row.
    /// Returns true if anything was removed.
    pub fn delete_row(
        &self,
        region_id: RegionId,
        epoch: u64,
        row: &str,
        columns: &[String],
    ) -> StateResult<bool> {
        let key = row_key(region_id, row);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            check_fence(&txn, region_id, epoch)?;
            let mut table = txn.open_table(ROWS).map_err(map_err!(Table))?;
            let existing: Option<Cells> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            removed = match existing {
                None => false,
                Some(_) if columns.is_empty() => {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    true
                }
                Some(mut cells) => {
                    let before = cells.len();
                    cells.retain(|column, _| !columns.contains(column));
                    let changed = cells.len() != before;
                    if cells.is_empty() {
                        table.remove(key.as_str()).map_err(map_err!(Write))?;
                    } else if changed {
                        let value = serde_json::to_vec(&cells).map_err(map_err!(Serialize))?;
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    changed
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    /// Get a single row of a region.
    pub fn get_row(&self, region_id: RegionId, row: &str) -> StateResult<Option<Cells>> {
        let key = row_key(region_id, row);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROWS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let cells: Cells =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(cells))
            }
            None => Ok(None),
        }
    }

    /// Scan up to `limit` rows of a region from `start_row` (inclusive) to
    /// `end_row` (exclusive, empty = end of region).
    pub fn scan_rows(
        &self,
        region_id: RegionId,
        start_row: &str,
        end_row: &str,
        limit: usize,
    ) -> StateResult<Vec<Row>> {
        let lo = row_key(region_id, start_row);
        let hi = if end_row.is_empty() {
            region_upper_bound(region_id)
        } else {
            row_key(region_id, end_row)
        };
        let prefix_len = region_prefix(region_id).len();

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROWS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        if lo >= hi {
            return Ok(results);
        }
        for entry in table.range(lo.as_str()..hi.as_str()).map_err(map_err!(Read))? {
            if results.len() >= limit {
                break;
            }
            let (key, value) = entry.map_err(map_err!(Read))?;
            let cells: Cells =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(Row {
                key: key.value()[prefix_len..].to_string(),
                cells,
            });
        }
        Ok(results)
    }

    /// The row with the greatest key `<= row` in a region, if any.
    pub fn closest_row_before(&self, region_id: RegionId, row: &str) -> StateResult<Option<Row>> {
        let lo = region_prefix(region_id);
        let hi = row_key(region_id, row);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROWS).map_err(map_err!(Table))?;
        let mut range = table.range(lo.as_str()..=hi.as_str()).map_err(map_err!(Read))?;
        match range.next_back() {
            Some(entry) => {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let cells: Cells =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(Row {
                    key: key.value()[lo.len()..].to_string(),
                    cells,
                }))
            }
            None => Ok(None),
        }
    }
}

impl BootstrapSource for StateStore {
    fn root_location(&self) -> StateResult<Option<RootLocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BOOTSTRAP).map_err(map_err!(Table))?;
        match table.get(ROOT_LOCATION_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let location: RootLocation =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(location))
            }
            None => Ok(None),
        }
    }

    fn publish_root_location(&self, location: &RootLocation) -> StateResult<()> {
        let value = serde_json::to_vec(location).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BOOTSTRAP).map_err(map_err!(Table))?;
            let current: Option<RootLocation> =
                match table.get(ROOT_LOCATION_KEY).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
            if let Some(current) = current
                && current.epoch > location.epoch
            {
                return Err(StateError::Fenced {
                    region_id: rangegrid_core::ROOT_REGION_ID,
                    fence: current.epoch,
                    epoch: location.epoch,
                });
            }
            table
                .insert(ROOT_LOCATION_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(server = %location.server, epoch = location.epoch, "root location published");
        Ok(())
    }
}

fn check_fence(txn: &redb::WriteTransaction, region_id: RegionId, epoch: u64) -> StateResult<()> {
    let fences = txn.open_table(FENCES).map_err(map_err!(Table))?;
    let fence = fences
        .get(region_id.0)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    if epoch < fence {
        return Err(StateError::Fenced {
            region_id,
            fence,
            epoch,
        });
    }
    Ok(())
}

fn region_prefix(region_id: RegionId) -> String {
    format!("{:020}/", region_id.0)
}

/// First key past every row of a region (`'0'` sorts right after `'/'`).
fn region_upper_bound(region_id: RegionId) -> String {
    format!("{:020}0", region_id.0)
}

fn row_key(region_id: RegionId, row: &str) -> String {
    format!("{:020}/{row}", region_id.0)
}
