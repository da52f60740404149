//! Region model shared across RangeGrid crates.
//!
//! A region is a contiguous `[start_key, end_key)` slice of one table. The
//! two catalog tables, `-ROOT-` and `.META.`, are ordinary tables whose rows
//! are [`DirectoryEntry`] values: ROOT maps META regions, META maps user
//! regions. ROOT's own location lives in the bootstrap record.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Table holding the directory entries of every META region.
pub const ROOT_TABLE: &str = "-ROOT-";

/// Table holding the directory entries of every user region.
pub const META_TABLE: &str = ".META.";

/// Column under which a directory row stores its serialized entry.
pub const DIRECTORY_COLUMN: &str = "info:assignment";

/// Well-known id of the single ROOT region.
pub const ROOT_REGION_ID: RegionId = RegionId(0);

/// Well-known id of the first META region.
pub const FIRST_META_REGION_ID: RegionId = RegionId(1);

/// Cell values of a row, keyed by `family:qualifier` column name.
pub type Cells = BTreeMap<String, Vec<u8>>;

/// Unique, monotonically allocated region identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network address of a region server (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerAddress(String);

impl ServerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One incarnation of a region server.
///
/// The `start_code` is handed out at registration and changes every time a
/// server process registers, so a restarted server on the same address is
/// never confused with the instance it replaced.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub address: ServerAddress,
    pub start_code: u64,
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.start_code)
    }
}

/// Catalog level of a region. Ordering is reassignment priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Root,
    Meta,
    User,
}

/// Immutable identity of a region.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionIdentity {
    pub table_name: String,
    /// Inclusive first row key. Empty means the start of the table.
    pub start_key: String,
    /// Exclusive end row key. Empty means unbounded.
    pub end_key: String,
    pub region_id: RegionId,
}

impl RegionIdentity {
    pub fn new(
        table_name: impl Into<String>,
        start_key: impl Into<String>,
        end_key: impl Into<String>,
        region_id: RegionId,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            start_key: start_key.into(),
            end_key: end_key.into(),
            region_id,
        }
    }

    /// The ROOT region, which always spans the whole `-ROOT-` table.
    pub fn root() -> Self {
        Self::new(ROOT_TABLE, "", "", ROOT_REGION_ID)
    }

    /// The initial META region, spanning the whole `.META.` table.
    pub fn first_meta() -> Self {
        Self::new(META_TABLE, "", "", FIRST_META_REGION_ID)
    }

    pub fn kind(&self) -> RegionKind {
        match self.table_name.as_str() {
            ROOT_TABLE => RegionKind::Root,
            META_TABLE => RegionKind::Meta,
            _ => RegionKind::User,
        }
    }

    /// Table whose rows point at this region, or `None` for ROOT.
    pub fn parent_table(&self) -> Option<&'static str> {
        parent_table_of(&self.table_name)
    }

    /// Whether `row` falls inside `[start_key, end_key)`.
    pub fn contains(&self, row: &str) -> bool {
        row >= self.start_key.as_str() && (self.end_key.is_empty() || row < self.end_key.as_str())
    }

    /// Whether two regions of the same table share at least one row key.
    pub fn overlaps(&self, other: &RegionIdentity) -> bool {
        if self.table_name != other.table_name {
            return false;
        }
        let self_before_other =
            !self.end_key.is_empty() && self.end_key.as_str() <= other.start_key.as_str();
        let other_before_self =
            !other.end_key.is_empty() && other.end_key.as_str() <= self.start_key.as_str();
        !(self_before_other || other_before_self)
    }

    /// Row key of this region's entry in its parent directory.
    pub fn directory_key(&self) -> String {
        directory_key(&self.table_name, &self.start_key)
    }

    /// Human-readable `table,start,id` name used in logs.
    pub fn region_name(&self) -> String {
        format!("{},{},{}", self.table_name, self.start_key, self.region_id)
    }
}

impl fmt::Display for RegionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.region_name())
    }
}

/// Whether `table` is one of the two directory tables.
pub fn is_catalog_table(table: &str) -> bool {
    table == ROOT_TABLE || table == META_TABLE
}

/// Table holding the directory rows of `table`'s regions.
pub fn parent_table_of(table: &str) -> Option<&'static str> {
    match table {
        ROOT_TABLE => None,
        META_TABLE => Some(ROOT_TABLE),
        _ => Some(META_TABLE),
    }
}

/// Directory row key for `row` of `table`.
///
/// Entries are keyed `{table},{start_key}`; looking up the closest entry at
/// or before `{table},{row}` yields the region covering `row`. Table names
/// only use characters ordered after `,`, so keys of one table never
/// interleave with another's.
pub fn directory_key(table: &str, row: &str) -> String {
    format!("{table},{row}")
}

/// A serving assignment: which server holds a region, at which epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionAssignment {
    pub region: RegionIdentity,
    pub server: ServerAddress,
    /// Fencing token; strictly increases on every reassignment.
    pub epoch: u64,
}

/// A row of ROOT or META.
///
/// `server == None` marks a region that exists but has never been opened or
/// is waiting for reassignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub region: RegionIdentity,
    pub server: Option<ServerAddress>,
    pub epoch: u64,
}

impl DirectoryEntry {
    pub fn unassigned(region: RegionIdentity) -> Self {
        Self {
            region,
            server: None,
            epoch: 0,
        }
    }

    pub fn assigned(assignment: &RegionAssignment) -> Self {
        Self {
            region: assignment.region.clone(),
            server: Some(assignment.server.clone()),
            epoch: assignment.epoch,
        }
    }

    pub fn assignment(&self) -> Option<RegionAssignment> {
        self.server.as_ref().map(|server| RegionAssignment {
            region: self.region.clone(),
            server: server.clone(),
            epoch: self.epoch,
        })
    }

    /// Cells written to the directory row.
    pub fn to_cells(&self) -> Result<Cells, serde_json::Error> {
        let mut cells = Cells::new();
        cells.insert(DIRECTORY_COLUMN.to_string(), serde_json::to_vec(self)?);
        Ok(cells)
    }

    /// Decode a directory row. `None` if the row lacks the entry column.
    pub fn from_cells(cells: &Cells) -> Result<Option<Self>, serde_json::Error> {
        cells
            .get(DIRECTORY_COLUMN)
            .map(|bytes| serde_json::from_slice(bytes))
            .transpose()
    }
}

/// The bootstrap record: where ROOT currently lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootLocation {
    pub server: ServerAddress,
    pub epoch: u64,
}

impl RootLocation {
    pub fn assignment(&self) -> RegionAssignment {
        RegionAssignment {
            region: RegionIdentity::root(),
            server: self.server.clone(),
            epoch: self.epoch,
        }
    }
}

/// A row returned by a read or scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    pub cells: Cells,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("table name is empty")]
    Empty,
    #[error("table name {0:?} is reserved")]
    Reserved(String),
    #[error("table name {0:?} may only contain [A-Za-z0-9_.-]")]
    InvalidCharacter(String),
}

/// Check that a user table name is usable as a directory key prefix.
pub fn validate_table_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if is_catalog_table(name) {
        return Err(NameError::Reserved(name.to_string()));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(NameError::InvalidCharacter(name.to_string()));
    }
    Ok(())
}
