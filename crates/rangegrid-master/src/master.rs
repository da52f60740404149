//! The master: cluster monitor plus reassignment coordinator.
//!
//! The master owns liveness and assignment. Region server agents reach it
//! through [`MasterLink`]; [`Master::run`] drives the monitor's lease scan
//! and hands every declared failure to the coordinator on its own task, so
//! heartbeat ingestion never waits on reassignment work.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use rangegrid_cluster::{
    ClusterMonitor, Directory, DirectoryError, HeartbeatOutcome, HeartbeatReport, MasterLink,
    MonitorSettings, Registration, ServerFailure, ServerRecord, Transport,
};
use rangegrid_core::{
    Clock, ClusterConfig, DirectoryEntry, META_TABLE, RegionIdentity, ServerAddress,
    ServerIdentity, validate_table_name,
};
use rangegrid_state::StateStore;

use crate::coordinator::{CoordinatorSettings, CorruptionAlert, ReassignmentCoordinator};
use crate::error::{CoordinatorError, CoordinatorResult};

pub struct Master {
    config: ClusterConfig,
    clock: Arc<dyn Clock>,
    store: StateStore,
    monitor: Arc<ClusterMonitor>,
    directory: Directory,
    coordinator: ReassignmentCoordinator,
    /// Taken by `run`.
    failures: Mutex<Option<mpsc::UnboundedReceiver<ServerFailure>>>,
}

impl Master {
    pub fn new(
        config: ClusterConfig,
        store: StateStore,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (monitor, failures) = ClusterMonitor::new(MonitorSettings::from_config(&config.monitor));
        let monitor = Arc::new(monitor);
        let directory = Directory::new(
            transport,
            Arc::new(store.clone()),
            config.client.attempt_timeout(),
        );
        let coordinator = ReassignmentCoordinator::new(
            CoordinatorSettings::from_config(&config.coordinator),
            monitor.clone(),
            directory.clone(),
            store.clone(),
        );
        Self {
            config,
            clock,
            store,
            monitor,
            directory,
            coordinator,
            failures: Mutex::new(Some(failures)),
        }
    }

    pub fn monitor(&self) -> &Arc<ClusterMonitor> {
        &self.monitor
    }

    pub fn coordinator(&self) -> &ReassignmentCoordinator {
        &self.coordinator
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn servers(&self) -> Vec<ServerRecord> {
        self.monitor.servers()
    }

    pub fn unassigned_regions(&self) -> Vec<RegionIdentity> {
        self.coordinator.unassigned_regions()
    }

    pub fn alerts(&self) -> Vec<CorruptionAlert> {
        self.coordinator.alerts()
    }

    /// Create ROOT and the first META region and get both served.
    ///
    /// Safe to call on a cluster that is already bootstrapped, and on
    /// storage left by an earlier run: every region the directory lists is
    /// brought back online. Waits for a live region server if there is none
    /// yet.
    pub async fn bootstrap(&self) -> CoordinatorResult<()> {
        let root = RegionIdentity::root();
        let meta = RegionIdentity::first_meta();
        self.store.put_region(&root)?;
        self.store.put_region(&meta)?;

        if self.directory.root_assignment()?.is_none() {
            info!("assigning ROOT for the first time");
        }
        self.coordinator.assign_region(root.clone()).await;

        let root_assignment = self
            .directory
            .root_assignment()?
            .ok_or_else(|| DirectoryError::Unassigned(root.region_name()))?;
        let existing = self
            .directory
            .lookup(&root_assignment, META_TABLE, &meta.start_key)
            .await?;
        if existing.is_none() {
            self.directory
                .write(&root_assignment, &DirectoryEntry::unassigned(meta.clone()))
                .await?;
        }
        self.coordinator.assign_region(meta).await;
        self.coordinator.recover_directory().await;

        info!("cluster bootstrapped");
        Ok(())
    }

    /// Create the regions of a new table and assign them.
    ///
    /// `split_keys` are the start keys of every region but the first; the
    /// empty key and duplicates are ignored.
    pub async fn create_table(
        &self,
        name: &str,
        split_keys: &[&str],
    ) -> CoordinatorResult<Vec<RegionIdentity>> {
        validate_table_name(name)?;
        if !self.store.list_regions_for_table(name)?.is_empty() {
            return Err(CoordinatorError::TableExists(name.to_string()));
        }

        let splits: Vec<String> = split_keys
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| k.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let starts = std::iter::once(String::new()).chain(splits.iter().cloned());

        let mut regions = Vec::with_capacity(splits.len() + 1);
        for (i, start) in starts.enumerate() {
            let end = splits.get(i).cloned().unwrap_or_default();
            let region = RegionIdentity::new(name, start, end, self.store.allocate_region_id()?);
            self.store.put_region(&region)?;
            self.coordinator.publish_unassigned(&region).await?;
            regions.push(region);
        }

        self.coordinator.assign_regions(regions.clone()).await;
        info!(table = name, regions = regions.len(), "table created");
        Ok(regions)
    }

    /// Run the lease scan and the failure consumer until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut failures = self
            .failures
            .lock()
            .expect("failures lock")
            .take()
            .ok_or_else(|| anyhow::anyhow!("master is already running"))?;

        let coordinator = self.coordinator.clone();
        let consumer = tokio::spawn(async move {
            let mut handlers = JoinSet::new();
            while let Some(failure) = failures.recv().await {
                let coordinator = coordinator.clone();
                handlers.spawn(async move { coordinator.on_server_failed(failure).await });
                while handlers.try_join_next().is_some() {}
            }
            while handlers.join_next().await.is_some() {}
        });

        let tick_interval = self.config.monitor.tick_interval();
        let mut ticker = tokio::time::interval(tick_interval);
        info!(tick = ?tick_interval, "master running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let failed = self.monitor.tick(self.clock.now_millis());
                    if !failed.is_empty() {
                        debug!(count = failed.len(), "lease scan declared servers dead");
                    }
                }
                _ = shutdown.changed() => {
                    info!("master shutting down");
                    break;
                }
            }
        }

        consumer.abort();
        Ok(())
    }
}

#[async_trait]
impl MasterLink for Master {
    async fn register(&self, address: &ServerAddress) -> anyhow::Result<Registration> {
        let identity = self.monitor.register(address.clone(), self.clock.now_millis())?;
        Ok(Registration {
            identity,
            heartbeat_interval: self.config.monitor.heartbeat_interval(),
        })
    }

    async fn heartbeat(&self, report: HeartbeatReport) -> anyhow::Result<HeartbeatOutcome> {
        let outcome = self.monitor.report_heartbeat(&report);
        if outcome == HeartbeatOutcome::Unknown {
            warn!(server = %report.identity, "heartbeat from unregistered instance");
        }
        Ok(outcome)
    }

    async fn report_exiting(&self, identity: &ServerIdentity) -> anyhow::Result<()> {
        self.monitor.report_exiting(identity);
        Ok(())
    }
}
