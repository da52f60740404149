//! Row API: tables, batched row updates and scanners.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use rangegrid_cluster::{Directory, RowOp, RowOpOutput, Transport};
use rangegrid_core::config::ClientConfig;
use rangegrid_core::{Cells, Row, is_catalog_table, validate_table_name};
use rangegrid_state::BootstrapSource;

use crate::cache::CacheStats;
use crate::error::ClientError;
use crate::resolver::DirectoryResolver;
use crate::retry::{RetryPolicy, RowOpRunner};

/// Rows fetched per scanner call.
const SCANNER_BATCH: usize = 100;

/// Entry point for clients. Cheap to clone; clones share the location cache.
#[derive(Clone)]
pub struct RangeClient {
    runner: Arc<RowOpRunner>,
}

impl RangeClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        bootstrap: Arc<dyn BootstrapSource>,
        config: &ClientConfig,
    ) -> Self {
        let policy = RetryPolicy::from_config(config);
        let directory = Directory::new(transport.clone(), bootstrap, policy.attempt_timeout);
        let resolver = DirectoryResolver::new(directory);
        Self {
            runner: Arc::new(RowOpRunner::new(resolver, transport, policy)),
        }
    }

    /// Open `name`, failing with `TableNotFound` when META holds no region
    /// for it. The directory tables `-ROOT-` and `.META.` can be opened too,
    /// for reading the directory itself.
    pub async fn open_table(&self, name: &str) -> Result<Table, ClientError> {
        if !is_catalog_table(name) {
            validate_table_name(name)?;
        }
        let first = self.runner.locate(name, "").await?;
        debug!(table = name, region = %first.region, "table opened");
        Ok(Table {
            name: name.to_string(),
            runner: self.runner.clone(),
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.runner.resolver().cache_stats()
    }
}

/// Handle on one table.
#[derive(Clone)]
pub struct Table {
    name: String,
    runner: Arc<RowOpRunner>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, row: &str) -> Result<Option<Cells>, ClientError> {
        let op = RowOp::Get {
            row: row.to_string(),
        };
        match self.runner.run(&self.name, row, op).await? {
            (_, RowOpOutput::Row(cells)) => Ok(cells),
            (_, other) => Err(unexpected(&other)),
        }
    }

    /// Begin collecting changes to `row`; nothing is sent until `commit`.
    pub fn start_update(&self, row: &str) -> RowUpdate<'_> {
        RowUpdate {
            table: self,
            row: row.to_string(),
            puts: Cells::new(),
            deletes: Vec::new(),
        }
    }

    /// Delete every column of `row`. Returns false if the row did not exist.
    pub async fn delete_row(&self, row: &str) -> Result<bool, ClientError> {
        let op = RowOp::Delete {
            row: row.to_string(),
            columns: Vec::new(),
        };
        match self.runner.run(&self.name, row, op).await? {
            (_, RowOpOutput::Deleted(removed)) => Ok(removed),
            (_, other) => Err(unexpected(&other)),
        }
    }

    /// Scan rows from `start_row` to the end of the table.
    ///
    /// `columns` selects which cells are returned: a full column name
    /// (`info:name`) or a family prefix ending in `:` (`info:`). An empty
    /// list returns every column. Rows with no selected cell are skipped.
    pub fn obtain_scanner(&self, columns: &[&str], start_row: &str) -> Scanner {
        Scanner {
            runner: self.runner.clone(),
            table: self.name.clone(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            cursor: Some(start_row.to_string()),
            buffer: VecDeque::new(),
        }
    }
}

/// Pending changes to one row.
pub struct RowUpdate<'a> {
    table: &'a Table,
    row: String,
    puts: Cells,
    deletes: Vec<String>,
}

impl RowUpdate<'_> {
    pub fn put(&mut self, column: &str, value: impl Into<Vec<u8>>) -> &mut Self {
        self.deletes.retain(|c| c != column);
        self.puts.insert(column.to_string(), value.into());
        self
    }

    pub fn delete(&mut self, column: &str) -> &mut Self {
        self.puts.remove(column);
        if !self.deletes.iter().any(|c| c == column) {
            self.deletes.push(column.to_string());
        }
        self
    }

    pub fn row(&self) -> &str {
        &self.row
    }

    /// Send the changes. Puts and deletes are applied as separate row
    /// operations, each retried on its own.
    pub async fn commit(self) -> Result<(), ClientError> {
        let RowUpdate {
            table,
            row,
            puts,
            deletes,
        } = self;

        if !puts.is_empty() {
            let op = RowOp::Put {
                row: row.clone(),
                cells: puts,
            };
            match table.runner.run(&table.name, &row, op).await? {
                (_, RowOpOutput::Written) => {}
                (_, other) => return Err(unexpected(&other)),
            }
        }
        if !deletes.is_empty() {
            let op = RowOp::Delete {
                row: row.clone(),
                columns: deletes,
            };
            match table.runner.run(&table.name, &row, op).await? {
                (_, RowOpOutput::Deleted(_)) => {}
                (_, other) => return Err(unexpected(&other)),
            }
        }
        Ok(())
    }
}

/// Iterates rows of a table in key order, one region at a time.
pub struct Scanner {
    runner: Arc<RowOpRunner>,
    table: String,
    columns: Vec<String>,
    /// Next row key to fetch from; `None` once the last region is done.
    cursor: Option<String>,
    buffer: VecDeque<Row>,
}

impl Scanner {
    pub async fn next(&mut self) -> Result<Option<Row>, ClientError> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            let Some(cursor) = self.cursor.take() else {
                return Ok(None);
            };

            let op = RowOp::Scan {
                start_row: cursor.clone(),
                limit: SCANNER_BATCH,
            };
            let (location, output) = self.runner.run(&self.table, &cursor, op).await?;
            let RowOpOutput::Rows(rows) = output else {
                return Err(unexpected(&output));
            };

            self.cursor = match rows.last() {
                Some(last) if rows.len() == SCANNER_BATCH => Some(format!("{}\u{0}", last.key)),
                _ if location.region.end_key.is_empty() => None,
                _ => Some(location.region.end_key.clone()),
            };
            let selected: Vec<Row> = rows
                .into_iter()
                .filter_map(|row| select(&self.columns, row))
                .collect();
            self.buffer.extend(selected);
        }
    }
}

fn select(columns: &[String], mut row: Row) -> Option<Row> {
    if columns.is_empty() {
        return Some(row);
    }
    row.cells.retain(|column, _| {
        columns.iter().any(|wanted| {
            if wanted.ends_with(':') {
                column.starts_with(wanted.as_str())
            } else {
                column == wanted
            }
        })
    });
    (!row.cells.is_empty()).then_some(row)
}

fn unexpected(output: &RowOpOutput) -> ClientError {
    ClientError::UnexpectedResponse(format!("{output:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangegrid_core::{
        DIRECTORY_COLUMN, DirectoryEntry, META_TABLE, NameError, ROOT_TABLE, RegionIdentity,
        ServerAddress,
    };

    use crate::testing::MiniCluster;

    fn config() -> ClientConfig {
        ClientConfig {
            max_attempts: 4,
            attempt_timeout: "1s".to_string(),
            retry_pause: "50ms".to_string(),
            retry_pause_max: "200ms".to_string(),
        }
    }

    async fn drain(scanner: &mut Scanner) -> Vec<Row> {
        let mut rows = Vec::new();
        while let Some(row) = scanner.next().await.unwrap() {
            rows.push(row);
        }
        rows
    }

    #[tokio::test]
    async fn open_table_checks_existence_and_name() {
        let cluster = MiniCluster::new().await;
        let client = cluster.client(&config());

        let table = client.open_table("orders").await.unwrap();
        assert_eq!(table.name(), "orders");
        assert!(matches!(
            client.open_table("users").await,
            Err(ClientError::TableNotFound(_))
        ));
        assert!(matches!(
            client.open_table("a,b").await,
            Err(ClientError::InvalidTable(NameError::InvalidCharacter(_)))
        ));
    }

    #[tokio::test]
    async fn directory_tables_can_be_opened_and_read() {
        let cluster = MiniCluster::new().await;
        let client = cluster.client(&config());

        let meta = client.open_table(META_TABLE).await.unwrap();
        let cells = meta.get(&cluster.high.directory_key()).await.unwrap().unwrap();
        let entry = DirectoryEntry::from_cells(&cells).unwrap().unwrap();
        assert_eq!(entry.region, cluster.high);
        assert_eq!(entry.server, Some(ServerAddress::from("s1:1")));

        let rows = drain(&mut meta.obtain_scanner(&[DIRECTORY_COLUMN], "")).await;
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["orders,", "orders,m"]);

        let root = client.open_table(ROOT_TABLE).await.unwrap();
        let rows = drain(&mut root.obtain_scanner(&[], "")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, RegionIdentity::first_meta().directory_key());
    }

    #[tokio::test(start_paused = true)]
    async fn meta_reads_follow_a_moved_meta_region() {
        let cluster = MiniCluster::new().await;
        let client = cluster.client(&config());
        let meta = client.open_table(META_TABLE).await.unwrap();

        let s2 = cluster.add_server("s2:1");
        cluster.move_meta(&s2, 2).await;

        let cells = meta.get(&cluster.low.directory_key()).await.unwrap().unwrap();
        let entry = DirectoryEntry::from_cells(&cells).unwrap().unwrap();
        assert_eq!(entry.region, cluster.low);
        assert_eq!(client.cache_stats().invalidations, 1);
    }

    #[tokio::test]
    async fn update_then_get() {
        let cluster = MiniCluster::new().await;
        let table = cluster.client(&config()).open_table("orders").await.unwrap();

        let mut update = table.start_update("row1");
        update.put("info:name", "ada").put("info:city", "london");
        update.commit().await.unwrap();

        let cells = table.get("row1").await.unwrap().unwrap();
        assert_eq!(cells["info:name"], b"ada".to_vec());
        assert_eq!(cells["info:city"], b"london".to_vec());

        let mut update = table.start_update("row1");
        update.delete("info:city");
        update.commit().await.unwrap();
        let cells = table.get("row1").await.unwrap().unwrap();
        assert!(!cells.contains_key("info:city"));

        assert!(table.delete_row("row1").await.unwrap());
        assert!(table.get("row1").await.unwrap().is_none());
        assert!(!table.delete_row("row1").await.unwrap());
    }

    #[tokio::test]
    async fn later_put_cancels_pending_delete() {
        let cluster = MiniCluster::new().await;
        let table = cluster.client(&config()).open_table("orders").await.unwrap();

        let mut update = table.start_update("r");
        update.delete("info:a").put("info:a", "kept");
        assert_eq!(update.row(), "r");
        update.commit().await.unwrap();
        assert_eq!(table.get("r").await.unwrap().unwrap()["info:a"], b"kept".to_vec());
    }

    #[tokio::test]
    async fn scanner_walks_every_region_in_order() {
        let cluster = MiniCluster::new().await;
        let table = cluster.client(&config()).open_table("orders").await.unwrap();
        for key in ["z", "a", "m", "c", "n"] {
            let mut update = table.start_update(key);
            update.put("info:v", key);
            update.commit().await.unwrap();
        }

        let rows = drain(&mut table.obtain_scanner(&[], "")).await;
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c", "m", "n", "z"]);

        let rows = drain(&mut table.obtain_scanner(&[], "d")).await;
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["m", "n", "z"]);
    }

    #[tokio::test]
    async fn scanner_pages_large_regions() {
        let cluster = MiniCluster::new().await;
        let table = cluster.client(&config()).open_table("orders").await.unwrap();
        for i in 0..(SCANNER_BATCH + 20) {
            let mut update = table.start_update(&format!("k{i:04}"));
            update.put("info:v", "x");
            update.commit().await.unwrap();
        }
        let rows = drain(&mut table.obtain_scanner(&[], "")).await;
        assert_eq!(rows.len(), SCANNER_BATCH + 20);
        assert_eq!(rows[0].key, "k0000");
        assert_eq!(rows[SCANNER_BATCH].key, format!("k{:04}", SCANNER_BATCH));
    }

    #[tokio::test]
    async fn scanner_filters_columns() {
        let cluster = MiniCluster::new().await;
        let table = cluster.client(&config()).open_table("orders").await.unwrap();

        let mut update = table.start_update("a");
        update.put("info:name", "ada").put("stats:visits", "3");
        update.commit().await.unwrap();
        let mut update = table.start_update("b");
        update.put("stats:visits", "9");
        update.commit().await.unwrap();

        let rows = drain(&mut table.obtain_scanner(&["info:"], "")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "a");
        assert_eq!(rows[0].cells.len(), 1);

        let rows = drain(&mut table.obtain_scanner(&["stats:visits"], "")).await;
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scanner_follows_a_moved_region() {
        let cluster = MiniCluster::new().await;
        let client = cluster.client(&config());
        let table = client.open_table("orders").await.unwrap();
        for key in ["b", "q"] {
            let mut update = table.start_update(key);
            update.put("info:v", key);
            update.commit().await.unwrap();
        }

        let s2 = cluster.add_server("s2:1");
        cluster.move_region(&cluster.high, &s2, 2).await;

        let rows = drain(&mut table.obtain_scanner(&[], "")).await;
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "q"]);
        assert_eq!(client.cache_stats().invalidations, 1);
    }
}
