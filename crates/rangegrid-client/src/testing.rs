//! Hand-wired directory for client tests.
//!
//! One server `s1:1` holds ROOT, META and both regions of `orders`
//! (`["", "m")` and `["m", "")`), all at epoch 1. Helpers move regions
//! around by opening them elsewhere and rewriting the directory the way the
//! master would.

use std::sync::Arc;
use std::time::Duration;

use rangegrid_cluster::{Directory, LocalTransport, RegionServer, RegionService, RowOp};
use rangegrid_core::config::ClientConfig;
use rangegrid_core::{
    Cells, DirectoryEntry, META_TABLE, RegionAssignment, RegionId, RegionIdentity, RootLocation,
    ServerAddress,
};
use rangegrid_state::{BootstrapSource, StateStore};

use crate::resolver::DirectoryResolver;
use crate::retry::{RetryPolicy, RowOpRunner};
use crate::table::RangeClient;

pub(crate) struct MiniCluster {
    pub store: StateStore,
    pub transport: LocalTransport,
    pub s1: Arc<RegionServer>,
    pub low: RegionIdentity,
    pub high: RegionIdentity,
}

impl MiniCluster {
    pub async fn new() -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let transport = LocalTransport::new();
        let s1 = Arc::new(RegionServer::new(ServerAddress::from("s1:1"), store.clone()));
        transport.register(s1.clone());

        let root = RegionIdentity::root();
        let meta = RegionIdentity::first_meta();
        let low = RegionIdentity::new("orders", "", "m", RegionId(2));
        let high = RegionIdentity::new("orders", "m", "", RegionId(3));

        let cluster = Self {
            store,
            transport,
            s1,
            low,
            high,
        };
        for region in [&root, &meta, &cluster.low, &cluster.high] {
            cluster.store.put_region(region).unwrap();
            cluster.s1.open_region(region, 1).await.unwrap();
        }
        cluster
            .store
            .publish_root_location(&RootLocation {
                server: ServerAddress::from("s1:1"),
                epoch: 1,
            })
            .unwrap();

        let directory = cluster.directory();
        let root_assignment = directory.root_assignment().unwrap().unwrap();
        directory
            .write(&root_assignment, &on(&meta, "s1:1", 1))
            .await
            .unwrap();
        let meta_assignment = cluster.parent_of(&cluster.low).await;
        for region in [&cluster.low, &cluster.high] {
            directory
                .write(&meta_assignment, &on(region, "s1:1", 1))
                .await
                .unwrap();
        }
        cluster
    }

    pub fn directory(&self) -> Directory {
        Directory::new(
            Arc::new(self.transport.clone()),
            Arc::new(self.store.clone()),
            Duration::from_secs(1),
        )
    }

    pub fn resolver(&self) -> DirectoryResolver {
        DirectoryResolver::new(self.directory())
    }

    pub fn runner(&self, policy: RetryPolicy) -> RowOpRunner {
        RowOpRunner::new(self.resolver(), Arc::new(self.transport.clone()), policy)
    }

    pub fn client(&self, config: &ClientConfig) -> RangeClient {
        RangeClient::new(
            Arc::new(self.transport.clone()),
            Arc::new(self.store.clone()),
            config,
        )
    }

    pub fn add_server(&self, address: &str) -> Arc<RegionServer> {
        let server = Arc::new(RegionServer::new(ServerAddress::from(address), self.store.clone()));
        self.transport.register(server.clone());
        server
    }

    /// Write rows straight into a region through its current server.
    pub async fn seed(&self, region: &RegionIdentity, row: &str, cells: Cells) {
        let entry = self.entry_of(region).await;
        let server = self.transport.server(&entry.server).unwrap();
        server
            .apply(
                region,
                entry.epoch,
                RowOp::Put {
                    row: row.to_string(),
                    cells,
                },
            )
            .await
            .unwrap();
    }

    /// Open `region` on `to` at `epoch` and point its META entry there.
    pub async fn move_region(&self, region: &RegionIdentity, to: &RegionServer, epoch: u64) {
        to.open_region(region, epoch).await.unwrap();
        let parent = self.parent_of(region).await;
        self.directory()
            .write(&parent, &on(region, to.address().as_str(), epoch))
            .await
            .unwrap();
    }

    /// Open META on `to` at `epoch` and point ROOT at it.
    pub async fn move_meta(&self, to: &RegionServer, epoch: u64) {
        let meta = RegionIdentity::first_meta();
        to.open_region(&meta, epoch).await.unwrap();
        let root = self.directory().root_assignment().unwrap().unwrap();
        self.directory()
            .write(&root, &on(&meta, to.address().as_str(), epoch))
            .await
            .unwrap();
    }

    /// Mark `region` as having no server in META.
    pub async fn unassign(&self, region: &RegionIdentity) {
        let parent = self.parent_of(region).await;
        self.directory()
            .write(&parent, &DirectoryEntry::unassigned(region.clone()))
            .await
            .unwrap();
    }

    async fn entry_of(&self, region: &RegionIdentity) -> RegionAssignment {
        let parent = self.parent_of(region).await;
        self.directory()
            .lookup(&parent, &region.table_name, &region.start_key)
            .await
            .unwrap()
            .and_then(|e| e.assignment())
            .unwrap()
    }

    /// Current assignment of the META region holding `region`'s entry.
    async fn parent_of(&self, region: &RegionIdentity) -> RegionAssignment {
        let directory = self.directory();
        let root = directory.root_assignment().unwrap().unwrap();
        directory
            .lookup(&root, META_TABLE, &region.directory_key())
            .await
            .unwrap()
            .and_then(|e| e.assignment())
            .unwrap()
    }
}

fn on(region: &RegionIdentity, server: &str, epoch: u64) -> DirectoryEntry {
    DirectoryEntry {
        region: region.clone(),
        server: Some(ServerAddress::from(server)),
        epoch,
    }
}
