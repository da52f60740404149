//! Reassignment coordinator: moves the regions of failed servers.
//!
//! A failure is handled in three strict phases: ROOT, then META, then user
//! regions. Each phase reassigns the union of what the dead server last
//! reported and what the directory says it held, so a region the server
//! never got around to reporting is not lost. User regions are reassigned
//! concurrently; ROOT and META one at a time.
//!
//! Per region the coordinator picks the least-loaded ALIVE server, opens the
//! region there at a fresh epoch, and only then writes the new assignment
//! into the parent directory (the bootstrap record for ROOT). Failures retry
//! against other candidates with bounded backoff, forever. A region with no
//! live server to go to is parked in the unassigned list until one
//! registers.
//!
//! At most one reassignment per region runs at a time. A failure report for
//! a region already in flight marks it for one more pass once the current
//! one finishes; that pass is a no-op if the region is already served.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use rangegrid_cluster::{
    ClusterMonitor, Directory, DirectoryError, RegionCallError, RowOp, ServerFailure,
    ServerState, TransportError,
};
use rangegrid_core::config::CoordinatorConfig;
use rangegrid_core::{
    DirectoryEntry, META_TABLE, RegionAssignment, RegionId, RegionIdentity, RegionKind,
    RootLocation, ServerAddress, ServerIdentity,
};
use rangegrid_placement::{alive_loads, plan_reassignment, select_replacement};
use rangegrid_state::StateStore;

use crate::backoff::Backoff;
use crate::error::CoordinatorResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Bound on one open-region call (and on probes of a server's regions).
    pub open_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            open_timeout: config.open_timeout(),
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

/// Operator-visible report of a region left unassigned because its
/// directory row is missing or unreadable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionAlert {
    pub region: RegionIdentity,
    pub reason: String,
}

/// How a single reassignment pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PassOutcome {
    Assigned,
    AlreadyServed,
    Corrupt,
}

#[derive(Clone)]
pub struct ReassignmentCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    settings: CoordinatorSettings,
    monitor: Arc<ClusterMonitor>,
    directory: Directory,
    store: StateStore,
    /// Regions being reassigned, with a flag asking for one more pass.
    in_flight: Mutex<HashMap<RegionId, bool>>,
    /// Regions waiting for a live server.
    waiting: Mutex<BTreeMap<RegionId, RegionIdentity>>,
    alerts: Mutex<Vec<CorruptionAlert>>,
}

impl ReassignmentCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        monitor: Arc<ClusterMonitor>,
        directory: Directory,
        store: StateStore,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                settings,
                monitor,
                directory,
                store,
                in_flight: Mutex::new(HashMap::new()),
                waiting: Mutex::new(BTreeMap::new()),
                alerts: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Regions currently parked until a live server appears.
    pub fn unassigned_regions(&self) -> Vec<RegionIdentity> {
        let waiting = self.inner.waiting.lock().expect("waiting lock");
        waiting.values().cloned().collect()
    }

    pub fn alerts(&self) -> Vec<CorruptionAlert> {
        self.inner.alerts.lock().expect("alerts lock").clone()
    }

    /// Reassign everything a dead server held. Returns once every region
    /// is served again or has raised an alert.
    pub async fn on_server_failed(&self, failure: ServerFailure) {
        let dead = failure.identity.address.clone();
        info!(
            server = %failure.identity,
            reported = failure.last_known_regions.len(),
            "reassigning regions of failed server"
        );

        let mut reported: BTreeMap<RegionKind, BTreeSet<RegionIdentity>> = BTreeMap::new();
        for region in failure.last_known_regions {
            reported.entry(region.kind()).or_default().insert(region);
        }

        let root_reported = reported.remove(&RegionKind::Root).is_some();
        let root_on_dead = match self.inner.directory.root_assignment() {
            Ok(Some(root)) => root.server == dead,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "bootstrap record unreadable, checking ROOT anyway");
                true
            }
        };
        if root_reported || root_on_dead {
            self.reassign_region(RegionIdentity::root(), None).await;
        }

        let mut metas = reported.remove(&RegionKind::Meta).unwrap_or_default();
        metas.extend(self.orphans_in(&RegionIdentity::root(), &dead).await);
        for meta in metas {
            self.reassign_region(meta, None).await;
        }

        let mut users = reported.remove(&RegionKind::User).unwrap_or_default();
        for meta in self.meta_regions().await {
            users.extend(self.orphans_in(&meta, &dead).await);
        }
        self.assign_regions(users.into_iter().collect()).await;

        info!(server = %failure.identity, "failed server's regions handled");
    }

    /// Assign one region, waiting as long as it takes.
    pub async fn assign_region(&self, region: RegionIdentity) {
        self.reassign_region(region, None).await;
    }

    /// Assign a batch concurrently, spreading it across live servers.
    pub async fn assign_regions(&self, regions: Vec<RegionIdentity>) {
        if regions.is_empty() {
            return;
        }
        let loads = alive_loads(&self.inner.monitor.servers());
        let plan = plan_reassignment(&regions, &loads, &HashSet::new());

        let mut tasks = JoinSet::new();
        let planned = plan.assignments.into_iter().map(|(r, s)| (r, Some(s)));
        let unplanned = plan.unplaced.into_iter().map(|r| (r, None));
        for (region, preferred) in planned.chain(unplanned) {
            let coordinator = self.clone();
            tasks.spawn(async move { coordinator.reassign_region(region, preferred).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "region reassignment task failed");
            }
        }
    }

    /// Check every region the directory lists is served, assigning the
    /// ones that are not. Used when a cluster starts on existing storage.
    pub async fn recover_directory(&self) {
        let metas = self.meta_regions().await;
        for meta in &metas {
            self.reassign_region(meta.clone(), None).await;
        }
        let mut users = Vec::new();
        for meta in &metas {
            users.extend(self.scan_directory(meta).await.into_iter().map(|e| e.region));
        }
        if !users.is_empty() {
            info!(regions = users.len(), "checking user regions are served");
        }
        self.assign_regions(users).await;
    }

    /// Write an unassigned directory row for a new region.
    pub async fn publish_unassigned(&self, region: &RegionIdentity) -> CoordinatorResult<()> {
        let parent = self.parent_assignment(region).await?;
        self.inner
            .directory
            .write(&parent, &DirectoryEntry::unassigned(region.clone()))
            .await?;
        Ok(())
    }

    /// Current directory entry for `region`. `None` when the parent holds
    /// no row for it.
    pub async fn current_entry(
        &self,
        region: &RegionIdentity,
    ) -> Result<Option<DirectoryEntry>, DirectoryError> {
        if region.kind() == RegionKind::Root {
            let entry = match self.inner.directory.root_assignment()? {
                Some(root) => DirectoryEntry::assigned(&root),
                None => DirectoryEntry::unassigned(RegionIdentity::root()),
            };
            return Ok(Some(entry));
        }

        let parent = self.parent_assignment(region).await?;
        let found = self
            .inner
            .directory
            .lookup(&parent, &region.table_name, &region.start_key)
            .await?;
        Ok(found.filter(|e| e.region.region_id == region.region_id))
    }

    async fn reassign_region(&self, region: RegionIdentity, mut preferred: Option<ServerIdentity>) {
        let id = region.region_id;
        if !self.begin(id) {
            debug!(%region, "reassignment already in flight, coalesced");
            return;
        }
        loop {
            let outcome = self.reassign_once(&region, preferred.take()).await;
            debug!(%region, ?outcome, "reassignment pass finished");
            if !self.finish(id) {
                return;
            }
            debug!(%region, "re-checking region after coalesced failure report");
        }
    }

    async fn reassign_once(
        &self,
        region: &RegionIdentity,
        mut preferred: Option<ServerIdentity>,
    ) -> PassOutcome {
        let inner = &self.inner;
        let mut backoff = Backoff::new(inner.settings.backoff_base, inner.settings.backoff_max);
        let mut refused: HashSet<ServerAddress> = HashSet::new();

        loop {
            let current = match self.current_entry(region).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.raise_alert(region, "no directory entry".to_string());
                    return PassOutcome::Corrupt;
                }
                Err(DirectoryError::Corrupt { row, reason }) => {
                    self.raise_alert(region, format!("row {row:?}: {reason}"));
                    return PassOutcome::Corrupt;
                }
                Err(e) => {
                    warn!(%region, error = %e, "directory read failed, retrying");
                    self.pause(&mut backoff).await;
                    continue;
                }
            };

            if let Some(existing) = current.assignment()
                && self.is_served(&existing).await
            {
                self.clear_waiting(region.region_id);
                return PassOutcome::AlreadyServed;
            }

            let loads = alive_loads(&inner.monitor.servers());
            if loads.is_empty() {
                self.wait_for_server(region, &mut backoff).await;
                continue;
            }
            let preferred_target = preferred
                .take()
                .filter(|p| inner.monitor.is_alive(p) && !refused.contains(&p.address));
            let target = match preferred_target.or_else(|| select_replacement(&loads, &refused)) {
                Some(target) => target,
                None => {
                    debug!(%region, refused = refused.len(), "every live server refused, starting over");
                    refused.clear();
                    self.pause(&mut backoff).await;
                    continue;
                }
            };

            let fence = match inner.store.fence(region.region_id) {
                Ok(fence) => fence,
                Err(e) => {
                    warn!(%region, error = %e, "fence unreadable, retrying");
                    self.pause(&mut backoff).await;
                    continue;
                }
            };
            let assignment = RegionAssignment {
                region: region.clone(),
                server: target.address.clone(),
                epoch: current.epoch.max(fence) + 1,
            };

            if let Err(e) = self.open_on(&target, &assignment).await {
                warn!(
                    %region,
                    server = %target,
                    epoch = assignment.epoch,
                    error = %e,
                    "open-region failed, trying another server"
                );
                refused.insert(target.address.clone());
                self.pause(&mut backoff).await;
                continue;
            }
            if !inner.monitor.is_alive(&target) {
                warn!(%region, server = %target, "replacement died mid-assignment, reselecting");
                continue;
            }

            if let Err(e) = self.publish(&assignment).await {
                warn!(
                    %region,
                    server = %target,
                    epoch = assignment.epoch,
                    error = %e,
                    "directory write failed, retrying"
                );
                self.close_on(&assignment).await;
                self.pause(&mut backoff).await;
                continue;
            }
            inner.monitor.note_region_opened(&target, region);
            self.clear_waiting(region.region_id);

            if !inner.monitor.is_alive(&target) {
                warn!(%region, server = %target, "replacement died after directory write, reselecting");
                continue;
            }
            info!(
                %region,
                server = %target,
                epoch = assignment.epoch,
                "region reassigned"
            );
            return PassOutcome::Assigned;
        }
    }

    /// Whether a live server answers for `assignment` right now.
    async fn is_served(&self, assignment: &RegionAssignment) -> bool {
        let live_at_address = self
            .inner
            .monitor
            .alive_servers()
            .iter()
            .any(|r| r.identity.address == assignment.server);
        if !live_at_address {
            return false;
        }
        let Ok(service) = self.inner.directory.transport().connect(&assignment.server) else {
            return false;
        };
        let probe = service.apply(
            &assignment.region,
            assignment.epoch,
            RowOp::Get {
                row: assignment.region.start_key.clone(),
            },
        );
        matches!(
            tokio::time::timeout(self.inner.settings.open_timeout, probe).await,
            Ok(Ok(_))
        )
    }

    /// Open `assignment` on `target`, bounded by the open timeout. Gives up
    /// early if the monitor declares `target` dead while the call is out.
    async fn open_on(
        &self,
        target: &ServerIdentity,
        assignment: &RegionAssignment,
    ) -> Result<(), RegionCallError> {
        let monitor = &self.inner.monitor;
        let service = self.inner.directory.transport().connect(&assignment.server)?;
        let open = tokio::time::timeout(
            self.inner.settings.open_timeout,
            service.open_region(&assignment.region, assignment.epoch),
        );
        tokio::pin!(open);
        loop {
            let died = monitor.deaths().notified();
            if monitor.state_of(target) == Some(ServerState::Dead) {
                return Err(TransportError::ServerDead(assignment.server.clone()).into());
            }
            tokio::select! {
                opened = &mut open => {
                    return match opened {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Timeout(assignment.server.clone()).into()),
                    };
                }
                _ = died => {}
            }
        }
    }

    /// Best-effort close of a copy that never made it into the directory.
    async fn close_on(&self, assignment: &RegionAssignment) {
        let Ok(service) = self.inner.directory.transport().connect(&assignment.server) else {
            return;
        };
        let closed = tokio::time::timeout(
            self.inner.settings.open_timeout,
            service.close_region(&assignment.region),
        )
        .await;
        if !matches!(closed, Ok(Ok(()))) {
            debug!(region = %assignment.region, server = %assignment.server, "close after failed publish did not complete");
        }
    }

    /// Commit `assignment` to its parent directory.
    async fn publish(&self, assignment: &RegionAssignment) -> Result<(), DirectoryError> {
        let directory = &self.inner.directory;
        if assignment.region.kind() == RegionKind::Root {
            let location = RootLocation {
                server: assignment.server.clone(),
                epoch: assignment.epoch,
            };
            return directory
                .bootstrap()
                .publish_root_location(&location)
                .map_err(|e| DirectoryError::Bootstrap(e.to_string()));
        }
        let parent = self.parent_assignment(&assignment.region).await?;
        directory
            .write(&parent, &DirectoryEntry::assigned(assignment))
            .await
    }

    /// Assignment of the directory region that holds `region`'s row.
    async fn parent_assignment(
        &self,
        region: &RegionIdentity,
    ) -> Result<RegionAssignment, DirectoryError> {
        let directory = &self.inner.directory;
        let root = directory
            .root_assignment()?
            .ok_or_else(|| DirectoryError::Unassigned(RegionIdentity::root().region_name()))?;
        if region.kind() == RegionKind::Meta {
            return Ok(root);
        }

        let key = region.directory_key();
        let meta = directory.lookup(&root, META_TABLE, &key).await?;
        match meta {
            Some(entry) => entry
                .assignment()
                .ok_or_else(|| DirectoryError::Unassigned(entry.region.region_name())),
            None => Err(DirectoryError::Corrupt {
                row: key,
                reason: "no META region covers this row".to_string(),
            }),
        }
    }

    /// Every entry in the directory region `parent`, retrying transient
    /// failures. Corrupt rows raise an alert and yield nothing.
    async fn scan_directory(&self, parent: &RegionIdentity) -> Vec<DirectoryEntry> {
        let mut backoff = Backoff::new(
            self.inner.settings.backoff_base,
            self.inner.settings.backoff_max,
        );
        loop {
            let attempt = match self.current_entry(parent).await {
                Ok(Some(entry)) => match entry.assignment() {
                    Some(assignment) => self.inner.directory.scan(&assignment).await,
                    None => Err(DirectoryError::Unassigned(parent.region_name())),
                },
                Ok(None) => return Vec::new(),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(entries) => return entries,
                Err(DirectoryError::Corrupt { row, reason }) => {
                    self.raise_alert(parent, format!("row {row:?}: {reason}"));
                    return Vec::new();
                }
                Err(e) => {
                    warn!(region = %parent, error = %e, "directory scan failed, retrying");
                    self.pause(&mut backoff).await;
                }
            }
        }
    }

    /// Regions in `parent` whose entries still point at `dead`.
    async fn orphans_in(&self, parent: &RegionIdentity, dead: &ServerAddress) -> Vec<RegionIdentity> {
        let orphans: Vec<RegionIdentity> = self
            .scan_directory(parent)
            .await
            .into_iter()
            .filter(|e| e.server.as_ref() == Some(dead))
            .map(|e| e.region)
            .collect();
        if !orphans.is_empty() {
            debug!(parent = %parent, orphans = orphans.len(), "directory entries still on failed server");
        }
        orphans
    }

    async fn meta_regions(&self) -> Vec<RegionIdentity> {
        self.scan_directory(&RegionIdentity::root())
            .await
            .into_iter()
            .map(|e| e.region)
            .collect()
    }

    async fn wait_for_server(&self, region: &RegionIdentity, backoff: &mut Backoff) {
        {
            let mut waiting = self.inner.waiting.lock().expect("waiting lock");
            waiting.insert(region.region_id, region.clone());
        }
        warn!(%region, "region unavailable: no live region servers");
        let delay = backoff.fail();
        tokio::select! {
            _ = self.inner.monitor.registrations().notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn pause(&self, backoff: &mut Backoff) {
        tokio::time::sleep(backoff.fail()).await;
    }

    fn clear_waiting(&self, region_id: RegionId) {
        let mut waiting = self.inner.waiting.lock().expect("waiting lock");
        waiting.remove(&region_id);
    }

    fn raise_alert(&self, region: &RegionIdentity, reason: String) {
        error!(%region, reason = %reason, "directory corruption, region left unassigned");
        let alert = CorruptionAlert {
            region: region.clone(),
            reason,
        };
        let mut alerts = self.inner.alerts.lock().expect("alerts lock");
        if !alerts.contains(&alert) {
            alerts.push(alert);
        }
    }

    /// Claim a region. `false` if it is already in flight; the running
    /// reassignment is then asked for one more pass.
    fn begin(&self, region_id: RegionId) -> bool {
        let mut in_flight = self.inner.in_flight.lock().expect("in-flight lock");
        match in_flight.get_mut(&region_id) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                in_flight.insert(region_id, false);
                true
            }
        }
    }

    /// Release a region. `true` if another pass was requested meanwhile.
    fn finish(&self, region_id: RegionId) -> bool {
        let mut in_flight = self.inner.in_flight.lock().expect("in-flight lock");
        match in_flight.get(&region_id).copied() {
            Some(true) => {
                in_flight.insert(region_id, false);
                true
            }
            _ => {
                in_flight.remove(&region_id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rangegrid_cluster::{
        LocalTransport, MonitorSettings, RegionServer, RegionService, RowOpOutput, Transport,
    };
    use rangegrid_core::Cells;
    use rangegrid_state::{BootstrapSource, StateResult};

    /// A directory write as seen from outside: the bootstrap record or a
    /// row written into a directory region.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Write {
        Bootstrap(RootLocation),
        Row {
            parent: RegionIdentity,
            entry: DirectoryEntry,
        },
    }

    /// Transport and bootstrap source that log every directory write in the
    /// order it reaches storage.
    #[derive(Clone)]
    struct Recorder {
        transport: LocalTransport,
        store: StateStore,
        writes: Arc<Mutex<Vec<Write>>>,
    }

    impl Recorder {
        fn push(&self, write: Write) {
            self.writes.lock().unwrap().push(write);
        }
    }

    impl Transport for Recorder {
        fn connect(&self, address: &ServerAddress) -> Result<Arc<dyn RegionService>, TransportError> {
            let inner = self.transport.connect(address)?;
            Ok(Arc::new(RecordingService {
                inner,
                recorder: self.clone(),
            }))
        }
    }

    impl BootstrapSource for Recorder {
        fn root_location(&self) -> StateResult<Option<RootLocation>> {
            self.store.root_location()
        }

        fn publish_root_location(&self, location: &RootLocation) -> StateResult<()> {
            self.store.publish_root_location(location)?;
            self.push(Write::Bootstrap(location.clone()));
            Ok(())
        }
    }

    struct RecordingService {
        inner: Arc<dyn RegionService>,
        recorder: Recorder,
    }

    #[async_trait]
    impl RegionService for RecordingService {
        fn address(&self) -> &ServerAddress {
            self.inner.address()
        }

        async fn open_region(&self, region: &RegionIdentity, epoch: u64) -> Result<(), RegionCallError> {
            self.inner.open_region(region, epoch).await
        }

        async fn close_region(&self, region: &RegionIdentity) -> Result<(), RegionCallError> {
            self.inner.close_region(region).await
        }

        async fn apply(
            &self,
            region: &RegionIdentity,
            epoch: u64,
            op: RowOp,
        ) -> Result<RowOpOutput, RegionCallError> {
            let entry = match &op {
                RowOp::Put { cells, .. } => DirectoryEntry::from_cells(cells).ok().flatten(),
                _ => None,
            };
            let output = self.inner.apply(region, epoch, op).await?;
            if let Some(entry) = entry {
                self.recorder.push(Write::Row {
                    parent: region.clone(),
                    entry,
                });
            }
            Ok(output)
        }
    }

    struct Fixture {
        store: StateStore,
        transport: LocalTransport,
        monitor: Arc<ClusterMonitor>,
        directory: Directory,
        coordinator: ReassignmentCoordinator,
        writes: Arc<Mutex<Vec<Write>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = StateStore::open_in_memory().unwrap();
            let transport = LocalTransport::new();
            let (monitor, _rx) = ClusterMonitor::new(MonitorSettings {
                suspect_after: 3_000,
                dead_after: 10_000,
            });
            let monitor = Arc::new(monitor);
            let writes = Arc::new(Mutex::new(Vec::new()));
            let recorder = Recorder {
                transport: transport.clone(),
                store: store.clone(),
                writes: writes.clone(),
            };
            let directory = Directory::new(
                Arc::new(recorder.clone()),
                Arc::new(recorder),
                Duration::from_secs(1),
            );
            let settings = CoordinatorSettings {
                open_timeout: Duration::from_secs(1),
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(100),
            };
            let coordinator = ReassignmentCoordinator::new(
                settings,
                monitor.clone(),
                directory.clone(),
                store.clone(),
            );
            Self {
                store,
                transport,
                monitor,
                directory,
                coordinator,
                writes,
            }
        }

        /// Directory writes recorded since the last call.
        fn take_writes(&self) -> Vec<Write> {
            std::mem::take(&mut *self.writes.lock().unwrap())
        }

        fn start_server(&self, address: &str) -> (Arc<RegionServer>, ServerIdentity) {
            let server = Arc::new(RegionServer::new(
                ServerAddress::from(address),
                self.store.clone(),
            ));
            self.transport.register(server.clone());
            let identity = self.monitor.register(ServerAddress::from(address), 0).unwrap();
            (server, identity)
        }

        /// ROOT, META and one user region, all on `server` at epoch 1.
        async fn seed(&self, server: &RegionServer) -> RegionIdentity {
            let user = RegionIdentity::new("orders", "", "", RegionId(2));
            for region in [RegionIdentity::root(), RegionIdentity::first_meta(), user.clone()] {
                server.open_region(&region, 1).await.unwrap();
            }
            self.store
                .publish_root_location(&RootLocation {
                    server: server.address().clone(),
                    epoch: 1,
                })
                .unwrap();
            let root = self.directory.root_assignment().unwrap().unwrap();
            let meta = RegionAssignment {
                region: RegionIdentity::first_meta(),
                server: server.address().clone(),
                epoch: 1,
            };
            self.directory
                .write(&root, &DirectoryEntry::assigned(&meta))
                .await
                .unwrap();
            let user_assignment = RegionAssignment {
                region: user.clone(),
                server: server.address().clone(),
                epoch: 1,
            };
            self.directory
                .write(&meta, &DirectoryEntry::assigned(&user_assignment))
                .await
                .unwrap();
            user
        }

        fn kill(&self, server: &RegionServer, identity: &ServerIdentity) -> ServerFailure {
            server.stop();
            self.monitor.report_exiting(identity);
            ServerFailure {
                identity: identity.clone(),
                last_known_regions: Vec::new(),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_server_regions_move_in_priority_order() {
        let f = Fixture::new();
        let (s1, id1) = f.start_server("s1:1");
        let (s2, _id2) = f.start_server("s2:1");
        let user = f.seed(&s1).await;

        // Nothing reported: everything is discovered from the directory.
        f.coordinator.on_server_failed(f.kill(&s1, &id1)).await;

        let root = f.directory.root_assignment().unwrap().unwrap();
        assert_eq!(root.server, ServerAddress::from("s2:1"));
        assert_eq!(root.epoch, 2);

        let meta = f.coordinator.current_entry(&RegionIdentity::first_meta()).await.unwrap().unwrap();
        assert_eq!(meta.server, Some(ServerAddress::from("s2:1")));
        assert_eq!(meta.epoch, 2);

        let entry = f.coordinator.current_entry(&user).await.unwrap().unwrap();
        assert_eq!(entry.server, Some(ServerAddress::from("s2:1")));
        assert_eq!(entry.epoch, 2);

        assert_eq!(s2.online_regions().len(), 3);
        assert!(f.coordinator.unassigned_regions().is_empty());
        assert!(f.coordinator.alerts().is_empty());
    }

    fn position(writes: &[Write], wanted: impl Fn(&Write) -> bool) -> usize {
        writes
            .iter()
            .position(wanted)
            .unwrap_or_else(|| panic!("missing write in {writes:?}"))
    }

    #[tokio::test(start_paused = true)]
    async fn directory_is_rewritten_top_down() {
        let f = Fixture::new();
        let (s1, id1) = f.start_server("s1:1");
        let (_s2, _) = f.start_server("s2:1");
        let user = f.seed(&s1).await;
        f.take_writes();

        let mut failure = f.kill(&s1, &id1);
        failure.last_known_regions = vec![user.clone(), RegionIdentity::first_meta()];
        f.coordinator.on_server_failed(failure).await;

        let writes = f.take_writes();
        let root = position(&writes, |w| matches!(w, Write::Bootstrap(l) if l.epoch == 2));
        let meta = position(&writes, |w| {
            matches!(w, Write::Row { parent, entry }
                if parent.kind() == RegionKind::Root
                    && entry.region == RegionIdentity::first_meta()
                    && entry.epoch == 2)
        });
        let first_user = position(&writes, |w| {
            matches!(w, Write::Row { parent, .. } if parent.kind() == RegionKind::Meta)
        });
        assert!(root < meta, "ROOT published after META: {writes:?}");
        assert!(meta < first_user, "user row rewritten before META: {writes:?}");

        // No user row is pointed back at the failed server.
        for write in &writes[first_user..] {
            if let Write::Row { parent, entry } = write {
                assert_eq!(parent.kind(), RegionKind::Meta);
                assert_ne!(entry.server, Some(ServerAddress::from("s1:1")));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_on_a_target_declared_dead_is_abandoned_early() {
        let f = Fixture::new();
        let (s1, id1) = f.start_server("s1:1");
        let (s2, id2) = f.start_server("s2:1");
        let (_s3, _) = f.start_server("s3:1");
        f.seed(&s1).await;
        s2.set_stalled(true);

        let failure = f.kill(&s1, &id1);
        let coordinator = f.coordinator.clone();
        let started = tokio::time::Instant::now();
        let handler = tokio::spawn(async move { coordinator.on_server_failed(failure).await });

        // ROOT's open is stuck on s2; the monitor gives up on s2 well
        // before the open timeout.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handler.is_finished());
        f.monitor.report_exiting(&id2);
        handler.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        let root = f.directory.root_assignment().unwrap().unwrap();
        assert_eq!(root.server, ServerAddress::from("s3:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn user_rows_survive_reassignment() {
        let f = Fixture::new();
        let (s1, id1) = f.start_server("s1:1");
        let (s2, _) = f.start_server("s2:1");
        let user = f.seed(&s1).await;

        let mut cells = Cells::new();
        cells.insert("f:q".to_string(), b"v1".to_vec());
        s1.apply(&user, 1, RowOp::Put { row: "row1".to_string(), cells })
            .await
            .unwrap();

        f.coordinator.on_server_failed(f.kill(&s1, &id1)).await;

        let got = s2
            .apply(&user, 2, RowOp::Get { row: "row1".to_string() })
            .await
            .unwrap();
        let RowOpOutput::Row(Some(cells)) = got else {
            panic!("row missing after reassignment: {got:?}");
        };
        assert_eq!(cells["f:q"], b"v1".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn refusing_candidate_is_skipped() {
        let f = Fixture::new();
        let (s1, id1) = f.start_server("s1:1");
        let (s2, _) = f.start_server("s2:1");
        let (s3, _) = f.start_server("s3:1");
        let user = f.seed(&s1).await;
        s2.set_refuse_opens(true);

        f.coordinator.on_server_failed(f.kill(&s1, &id1)).await;

        let entry = f.coordinator.current_entry(&user).await.unwrap().unwrap();
        assert_eq!(entry.server, Some(ServerAddress::from("s3:1")));
        assert!(s2.online_regions().is_empty());
        assert_eq!(s3.online_regions().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_candidate_times_out_and_is_skipped() {
        let f = Fixture::new();
        let (s1, id1) = f.start_server("s1:1");
        let (s2, _) = f.start_server("s2:1");
        let (_s3, _) = f.start_server("s3:1");
        f.seed(&s1).await;
        s2.set_stalled(true);

        f.coordinator.on_server_failed(f.kill(&s1, &id1)).await;

        let root = f.directory.root_assignment().unwrap().unwrap();
        assert_eq!(root.server, ServerAddress::from("s3:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn regions_wait_for_a_live_server() {
        let f = Fixture::new();
        let (s1, id1) = f.start_server("s1:1");
        let user = f.seed(&s1).await;
        let failure = f.kill(&s1, &id1);

        let coordinator = f.coordinator.clone();
        let handler = tokio::spawn(async move { coordinator.on_server_failed(failure).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.coordinator.unassigned_regions(), vec![RegionIdentity::root()]);
        assert!(!handler.is_finished());

        let (s2, _) = f.start_server("s2:1");
        handler.await.unwrap();

        assert!(f.coordinator.unassigned_regions().is_empty());
        let entry = f.coordinator.current_entry(&user).await.unwrap().unwrap();
        assert_eq!(entry.server, Some(ServerAddress::from("s2:1")));
        assert_eq!(s2.online_regions().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_directory_entry_raises_alert() {
        let f = Fixture::new();
        let (s1, id1) = f.start_server("s1:1");
        let (_s2, _) = f.start_server("s2:1");
        let user = f.seed(&s1).await;
        let ghost = RegionIdentity::new("ghost", "", "", RegionId(99));

        let mut failure = f.kill(&s1, &id1);
        failure.last_known_regions = vec![ghost.clone()];
        f.coordinator.on_server_failed(failure).await;

        let alerts = f.coordinator.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].region, ghost);

        // The rest of the cluster still moved.
        let entry = f.coordinator.current_entry(&user).await.unwrap().unwrap();
        assert_eq!(entry.server, Some(ServerAddress::from("s2:1")));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_failure_reports_are_coalesced() {
        let f = Fixture::new();
        let (s1, id1) = f.start_server("s1:1");
        let (_s2, _) = f.start_server("s2:1");
        let user = f.seed(&s1).await;
        let failure = f.kill(&s1, &id1);

        tokio::join!(
            f.coordinator.on_server_failed(failure.clone()),
            f.coordinator.on_server_failed(failure),
        );

        let entry = f.coordinator.current_entry(&user).await.unwrap().unwrap();
        assert_eq!(entry.epoch, 2);
        let root = f.directory.root_assignment().unwrap().unwrap();
        assert_eq!(root.epoch, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn late_report_for_served_region_is_a_no_op() {
        let f = Fixture::new();
        let (s1, id1) = f.start_server("s1:1");
        let (_s2, _) = f.start_server("s2:1");
        let user = f.seed(&s1).await;

        let failure = f.kill(&s1, &id1);
        f.coordinator.on_server_failed(failure.clone()).await;
        f.coordinator.on_server_failed(failure).await;

        let entry = f.coordinator.current_entry(&user).await.unwrap().unwrap();
        assert_eq!(entry.epoch, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_spread_across_servers() {
        let f = Fixture::new();
        let (s1, _) = f.start_server("s1:1");
        let (s2, _) = f.start_server("s2:1");
        let (s0, id0) = f.start_server("s0:1");
        f.seed(&s0).await;
        for region in s0.online_regions() {
            f.monitor.note_region_opened(&id0, &region);
        }

        let regions: Vec<RegionIdentity> = ["a", "b", "c", "d"]
            .iter()
            .enumerate()
            .map(|(i, start)| {
                let end = ["b", "c", "d", ""][i];
                RegionIdentity::new("wide", *start, end, RegionId(10 + i as u64))
            })
            .collect();
        for region in &regions {
            f.coordinator.publish_unassigned(region).await.unwrap();
        }
        f.coordinator.assign_regions(regions.clone()).await;

        for region in &regions {
            let entry = f.coordinator.current_entry(region).await.unwrap().unwrap();
            assert_eq!(entry.epoch, 1);
            assert!(entry.server.is_some());
        }
        assert_eq!(s1.online_regions().len() + s2.online_regions().len(), 4);
        assert_eq!(s1.online_regions().len(), 2);
    }
}
