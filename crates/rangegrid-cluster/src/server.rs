//! Region server: the storage engine boundary.
//!
//! Serves the regions it has been told to open, reading and writing their
//! rows in the shared [`StateStore`]. Every operation carries the caller's
//! assignment epoch and is checked twice: against the epoch this server
//! opened the region at, and against the region's fence in shared storage.
//! The second check is what stops a partitioned server that still believes
//! it owns a region from serving it after reassignment.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use rangegrid_core::{RegionId, RegionIdentity, ServerAddress};
use rangegrid_state::{StateError, StateStore};

use crate::error::{RegionCallError, RowOpReject, TransportError};
use crate::transport::{RegionService, RowOp, RowOpOutput};

/// A region this server currently serves.
#[derive(Debug, Clone)]
struct OnlineRegion {
    region: RegionIdentity,
    epoch: u64,
}

/// In-process region server.
pub struct RegionServer {
    address: ServerAddress,
    store: StateStore,
    /// Online regions: region_id → serving epoch.
    online: RwLock<HashMap<RegionId, OnlineRegion>>,
    running: AtomicBool,
    /// Refuse every open request (used to exercise candidate fallback).
    refuse_opens: AtomicBool,
    /// Never answer; callers observe timeouts.
    stalled: AtomicBool,
}

impl RegionServer {
    pub fn new(address: ServerAddress, store: StateStore) -> Self {
        Self {
            address,
            store,
            online: RwLock::new(HashMap::new()),
            running: AtomicBool::new(true),
            refuse_opens: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Close every region and stop accepting calls.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut online = self.online.write().expect("online lock");
        let closed = online.len();
        online.clear();
        info!(server = %self.address, closed, "region server stopped");
    }

    /// Drop every region after the master declared this server dead.
    pub fn abort(&self, reason: &str) {
        warn!(server = %self.address, reason, "region server aborting");
        self.stop();
    }

    pub fn set_refuse_opens(&self, refuse: bool) {
        self.refuse_opens.store(refuse, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Regions currently online, as reported in heartbeats.
    pub fn online_regions(&self) -> Vec<RegionIdentity> {
        let online = self.online.read().expect("online lock");
        let mut regions: Vec<RegionIdentity> =
            online.values().map(|o| o.region.clone()).collect();
        regions.sort();
        regions
    }

    /// Epoch a region is served at here, if it is online.
    pub fn serving_epoch(&self, region_id: RegionId) -> Option<u64> {
        let online = self.online.read().expect("online lock");
        online.get(&region_id).map(|o| o.epoch)
    }

    async fn gate(&self) -> Result<(), RegionCallError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.is_running() {
            return Err(TransportError::ConnectionRefused(self.address.clone()).into());
        }
        Ok(())
    }

    fn close_superseded(&self, region_id: RegionId, fence: u64) {
        let mut online = self.online.write().expect("online lock");
        if let Some(stale) = online.remove(&region_id) {
            warn!(
                server = %self.address,
                region = %stale.region,
                epoch = stale.epoch,
                fence,
                "region superseded by newer assignment, closed local copy"
            );
        }
    }

    /// Validate an operation against the online epoch and the shared fence.
    fn check_serving(
        &self,
        region: &RegionIdentity,
        epoch: u64,
    ) -> Result<OnlineRegion, RegionCallError> {
        let current = {
            let online = self.online.read().expect("online lock");
            online.get(&region.region_id).cloned()
        };
        let Some(current) = current else {
            return Err(RowOpReject::NotServing.into());
        };

        if epoch < current.epoch {
            return Err(RowOpReject::EpochStale {
                current: current.epoch,
            }
            .into());
        }
        if epoch > current.epoch {
            // The caller knows of an assignment newer than ours.
            self.close_superseded(region.region_id, epoch);
            return Err(RowOpReject::NotServing.into());
        }

        let fence = self
            .store
            .fence(region.region_id)
            .map_err(|e| RegionCallError::Storage(e.to_string()))?;
        if fence > current.epoch {
            self.close_superseded(region.region_id, fence);
            return Err(RowOpReject::EpochStale { current: fence }.into());
        }
        Ok(current)
    }

    fn storage_error(&self, region_id: RegionId, err: StateError) -> RegionCallError {
        match err {
            StateError::Fenced { fence, .. } => {
                self.close_superseded(region_id, fence);
                RowOpReject::EpochStale { current: fence }.into()
            }
            other => RegionCallError::Storage(other.to_string()),
        }
    }
}

#[async_trait]
impl RegionService for RegionServer {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    async fn open_region(&self, region: &RegionIdentity, epoch: u64) -> Result<(), RegionCallError> {
        self.gate().await?;
        if self.refuse_opens.load(Ordering::SeqCst) {
            return Err(RegionCallError::OpenRefused(format!(
                "{} is not accepting regions",
                self.address
            )));
        }

        {
            let online = self.online.read().expect("online lock");
            if let Some(current) = online.get(&region.region_id)
                && current.epoch >= epoch
            {
                return Err(RegionCallError::OpenRefused(format!(
                    "region {region} already open at epoch {}",
                    current.epoch
                )));
            }
            if let Some(clash) = online
                .values()
                .find(|o| o.region.region_id != region.region_id && o.region.overlaps(region))
            {
                return Err(RegionCallError::OpenRefused(format!(
                    "region {region} overlaps online region {}",
                    clash.region
                )));
            }
        }

        self.store
            .raise_fence(region.region_id, epoch)
            .map_err(|e| RegionCallError::OpenRefused(e.to_string()))?;

        let mut online = self.online.write().expect("online lock");
        online.insert(
            region.region_id,
            OnlineRegion {
                region: region.clone(),
                epoch,
            },
        );
        info!(server = %self.address, %region, epoch, "region opened");
        Ok(())
    }

    async fn close_region(&self, region: &RegionIdentity) -> Result<(), RegionCallError> {
        self.gate().await?;
        let mut online = self.online.write().expect("online lock");
        if online.remove(&region.region_id).is_some() {
            info!(server = %self.address, %region, "region closed");
        }
        Ok(())
    }

    async fn apply(
        &self,
        region: &RegionIdentity,
        epoch: u64,
        op: RowOp,
    ) -> Result<RowOpOutput, RegionCallError> {
        self.gate().await?;
        let serving = self.check_serving(region, epoch)?;
        let served = &serving.region;
        let id = served.region_id;

        match op {
            RowOp::Scan { start_row, limit } => {
                let start = if start_row.as_str() < served.start_key.as_str() {
                    served.start_key.clone()
                } else {
                    start_row
                };
                if !served.end_key.is_empty() && start.as_str() >= served.end_key.as_str() {
                    return Ok(RowOpOutput::Rows(Vec::new()));
                }
                let rows = self
                    .store
                    .scan_rows(id, &start, &served.end_key, limit)
                    .map_err(|e| self.storage_error(id, e))?;
                debug!(server = %self.address, region = %served, rows = rows.len(), "scan served");
                Ok(RowOpOutput::Rows(rows))
            }
            op if !served.contains(op.row()) => {
                Err(RowOpReject::RowOutOfRange(op.row().to_string()).into())
            }
            RowOp::Get { row } => {
                let cells = self
                    .store
                    .get_row(id, &row)
                    .map_err(|e| self.storage_error(id, e))?;
                Ok(RowOpOutput::Row(cells))
            }
            RowOp::Put { row, cells } => {
                self.store
                    .put_row(id, epoch, &row, &cells)
                    .map_err(|e| self.storage_error(id, e))?;
                Ok(RowOpOutput::Written)
            }
            RowOp::Delete { row, columns } => {
                let removed = self
                    .store
                    .delete_row(id, epoch, &row, &columns)
                    .map_err(|e| self.storage_error(id, e))?;
                Ok(RowOpOutput::Deleted(removed))
            }
            RowOp::ClosestRowBefore { row } => {
                let found = self
                    .store
                    .closest_row_before(id, &row)
                    .map_err(|e| self.storage_error(id, e))?;
                Ok(RowOpOutput::Closest(found))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangegrid_core::Cells;

    fn region() -> RegionIdentity {
        RegionIdentity::new("t", "", "", RegionId(10))
    }

    fn put(row: &str, value: &str) -> RowOp {
        let mut cells = Cells::new();
        cells.insert("f:q".to_string(), value.as_bytes().to_vec());
        RowOp::Put {
            row: row.to_string(),
            cells,
        }
    }

    fn server(name: &str, store: &StateStore) -> RegionServer {
        RegionServer::new(ServerAddress::from(name), store.clone())
    }

    #[tokio::test]
    async fn serves_only_open_regions() {
        let store = StateStore::open_in_memory().unwrap();
        let s1 = server("s1:1", &store);

        let err = s1.apply(&region(), 1, put("r", "v")).await.unwrap_err();
        assert_eq!(err, RegionCallError::Rejected(RowOpReject::NotServing));

        s1.open_region(&region(), 1).await.unwrap();
        assert_eq!(
            s1.apply(&region(), 1, put("r", "v")).await.unwrap(),
            RowOpOutput::Written
        );
        assert_eq!(s1.online_regions(), vec![region()]);
    }

    #[tokio::test]
    async fn stale_epoch_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let s1 = server("s1:1", &store);
        s1.open_region(&region(), 2).await.unwrap();

        let err = s1.apply(&region(), 1, put("r", "v")).await.unwrap_err();
        assert_eq!(
            err,
            RegionCallError::Rejected(RowOpReject::EpochStale { current: 2 })
        );
    }

    #[tokio::test]
    async fn superseded_server_stops_serving() {
        let store = StateStore::open_in_memory().unwrap();
        let old = server("s1:1", &store);
        let new = server("s2:1", &store);

        old.open_region(&region(), 1).await.unwrap();
        old.apply(&region(), 1, put("r", "before")).await.unwrap();

        // Reassignment opens the region elsewhere at a higher epoch.
        new.open_region(&region(), 2).await.unwrap();

        // The old server still has the region in memory but the shared
        // fence has moved, so both reads and writes are refused.
        let err = old
            .apply(&region(), 1, RowOp::Get { row: "r".to_string() })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegionCallError::Rejected(RowOpReject::EpochStale { current: 2 })
        );
        assert!(old.serving_epoch(RegionId(10)).is_none());

        let got = new
            .apply(&region(), 2, RowOp::Get { row: "r".to_string() })
            .await
            .unwrap();
        let RowOpOutput::Row(Some(cells)) = got else {
            panic!("expected row, got {got:?}");
        };
        assert_eq!(cells["f:q"], b"before".to_vec());
    }

    #[tokio::test]
    async fn open_rejects_lower_epoch_and_overlap() {
        let store = StateStore::open_in_memory().unwrap();
        let s1 = server("s1:1", &store);
        s1.open_region(&region(), 3).await.unwrap();

        assert!(matches!(
            s1.open_region(&region(), 3).await,
            Err(RegionCallError::OpenRefused(_))
        ));

        let overlapping = RegionIdentity::new("t", "m", "", RegionId(11));
        assert!(matches!(
            s1.open_region(&overlapping, 1).await,
            Err(RegionCallError::OpenRefused(_))
        ));
    }

    #[tokio::test]
    async fn open_below_fence_is_refused() {
        let store = StateStore::open_in_memory().unwrap();
        store.raise_fence(RegionId(10), 5).unwrap();
        let s1 = server("s1:1", &store);
        assert!(matches!(
            s1.open_region(&region(), 4).await,
            Err(RegionCallError::OpenRefused(_))
        ));
    }

    #[tokio::test]
    async fn rows_outside_region_are_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let s1 = server("s1:1", &store);
        let bounded = RegionIdentity::new("t", "b", "d", RegionId(12));
        s1.open_region(&bounded, 1).await.unwrap();

        let err = s1.apply(&bounded, 1, put("z", "v")).await.unwrap_err();
        assert_eq!(
            err,
            RegionCallError::Rejected(RowOpReject::RowOutOfRange("z".to_string()))
        );
    }

    #[tokio::test]
    async fn scan_is_clamped_to_region() {
        let store = StateStore::open_in_memory().unwrap();
        let s1 = server("s1:1", &store);
        let bounded = RegionIdentity::new("t", "b", "d", RegionId(12));
        s1.open_region(&bounded, 1).await.unwrap();
        for row in ["b", "c"] {
            s1.apply(&bounded, 1, put(row, row)).await.unwrap();
        }

        let out = s1
            .apply(
                &bounded,
                1,
                RowOp::Scan {
                    start_row: String::new(),
                    limit: 10,
                },
            )
            .await
            .unwrap();
        let RowOpOutput::Rows(rows) = out else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn stopped_server_refuses_calls() {
        let store = StateStore::open_in_memory().unwrap();
        let s1 = server("s1:1", &store);
        s1.open_region(&region(), 1).await.unwrap();
        s1.stop();

        let err = s1.apply(&region(), 1, put("r", "v")).await.unwrap_err();
        assert!(matches!(
            err,
            RegionCallError::Transport(TransportError::ConnectionRefused(_))
        ));
        assert!(s1.online_regions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_server_times_out() {
        let store = StateStore::open_in_memory().unwrap();
        let s1 = server("s1:1", &store);
        s1.set_stalled(true);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            s1.open_region(&region(), 1),
        )
        .await;
        assert!(result.is_err());
    }
}
