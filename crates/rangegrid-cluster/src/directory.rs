//! Directory access: reading and writing ROOT and META rows.
//!
//! ROOT and META are ordinary regions; their rows are [`DirectoryEntry`]
//! values keyed by `{table},{start_key}`. Everything here goes through the
//! [`Transport`] as ordinary row operations, bounded by a per-call timeout.
//! ROOT's own location comes from the [`BootstrapSource`].

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use rangegrid_core::{DirectoryEntry, RegionAssignment, Row, directory_key};
use rangegrid_state::BootstrapSource;

use crate::error::{DirectoryError, RegionCallError, TransportError};
use crate::transport::{RowOp, RowOpOutput, Transport};

/// Rows fetched per scan call when listing a directory region.
const SCAN_BATCH: usize = 100;

/// Shared ROOT/META accessor.
#[derive(Clone)]
pub struct Directory {
    transport: Arc<dyn Transport>,
    bootstrap: Arc<dyn BootstrapSource>,
    call_timeout: Duration,
}

impl Directory {
    pub fn new(
        transport: Arc<dyn Transport>,
        bootstrap: Arc<dyn BootstrapSource>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            bootstrap,
            call_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn bootstrap(&self) -> &Arc<dyn BootstrapSource> {
        &self.bootstrap
    }

    /// ROOT's current assignment, or `None` before ROOT was first opened.
    pub fn root_assignment(&self) -> Result<Option<RegionAssignment>, DirectoryError> {
        let location = self
            .bootstrap
            .root_location()
            .map_err(|e| DirectoryError::Bootstrap(e.to_string()))?;
        Ok(location.map(|l| l.assignment()))
    }

    /// Find the entry covering `row` of `table` inside the directory region
    /// `parent`. `None` when the parent holds no entry for that row.
    pub async fn lookup(
        &self,
        parent: &RegionAssignment,
        table: &str,
        row: &str,
    ) -> Result<Option<DirectoryEntry>, DirectoryError> {
        let key = directory_key(table, row);
        let output = self
            .call(parent, RowOp::ClosestRowBefore { row: key.clone() })
            .await?;
        let RowOpOutput::Closest(found) = output else {
            return Err(unexpected(&key, &output));
        };
        let Some(found) = found else {
            return Ok(None);
        };

        let entry = decode(&found)?;
        if entry.region.table_name != table || !entry.region.contains(row) {
            debug!(table, row, closest = %found.key, "no directory entry covers row");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Every entry stored in the directory region `parent`.
    pub async fn scan(&self, parent: &RegionAssignment) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let mut entries = Vec::new();
        let mut start_row = String::new();
        loop {
            let output = self
                .call(
                    parent,
                    RowOp::Scan {
                        start_row: start_row.clone(),
                        limit: SCAN_BATCH,
                    },
                )
                .await?;
            let RowOpOutput::Rows(rows) = output else {
                return Err(unexpected(&start_row, &output));
            };
            let done = rows.len() < SCAN_BATCH;
            for row in &rows {
                entries.push(decode(row)?);
            }
            match rows.last() {
                Some(last) if !done => start_row = format!("{}\u{0}", last.key),
                _ => break,
            }
        }
        Ok(entries)
    }

    /// Write `entry` into the directory region `parent`.
    pub async fn write(
        &self,
        parent: &RegionAssignment,
        entry: &DirectoryEntry,
    ) -> Result<(), DirectoryError> {
        let row = entry.region.directory_key();
        let cells = entry.to_cells().map_err(|e| DirectoryError::Corrupt {
            row: row.clone(),
            reason: e.to_string(),
        })?;
        self.call(parent, RowOp::Put { row, cells }).await?;
        debug!(
            parent = %parent.region,
            region = %entry.region,
            server = ?entry.server,
            epoch = entry.epoch,
            "directory entry written"
        );
        Ok(())
    }

    async fn call(
        &self,
        target: &RegionAssignment,
        op: RowOp,
    ) -> Result<RowOpOutput, DirectoryError> {
        let service = self
            .transport
            .connect(&target.server)
            .map_err(RegionCallError::from)?;
        match tokio::time::timeout(
            self.call_timeout,
            service.apply(&target.region, target.epoch, op),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(RegionCallError::from(TransportError::Timeout(target.server.clone())).into()),
        }
    }
}

fn decode(row: &Row) -> Result<DirectoryEntry, DirectoryError> {
    match DirectoryEntry::from_cells(&row.cells) {
        Ok(Some(entry)) => Ok(entry),
        Ok(None) => Err(DirectoryError::Corrupt {
            row: row.key.clone(),
            reason: "missing assignment column".to_string(),
        }),
        Err(e) => Err(DirectoryError::Corrupt {
            row: row.key.clone(),
            reason: e.to_string(),
        }),
    }
}

fn unexpected(row: &str, output: &RowOpOutput) -> DirectoryError {
    DirectoryError::Corrupt {
        row: row.to_string(),
        reason: format!("unexpected response {output:?}"),
    }
}
