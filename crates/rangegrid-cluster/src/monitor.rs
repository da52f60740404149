//! Cluster monitor: tracks region server liveness on the master.
//!
//! Each registered server instance has a [`ServerRecord`] guarded by its own
//! mutex, so heartbeat ingestion and the periodic [`ClusterMonitor::tick`]
//! scan only contend on the record they both touch. A record moves
//! ALIVE → SUSPECT → DEAD as its lease runs out; DEAD is terminal and is
//! announced exactly once as a [`ServerFailure`] on the failure channel.
//!
//! All times are milliseconds from the master's [`Clock`](rangegrid_core::Clock).
//!
//! Lock order: the record map, then a record, then the dead set.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use rangegrid_core::config::MonitorConfig;
use rangegrid_core::{RegionIdentity, ServerAddress, ServerIdentity};

use crate::error::MonitorError;

/// Lease thresholds in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub suspect_after: u64,
    pub dead_after: u64,
}

impl MonitorSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            suspect_after: config.suspect_after().as_millis() as u64,
            dead_after: config.dead_after().as_millis() as u64,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

/// Liveness state of a server record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerState {
    Alive,
    Suspect,
    Dead,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Alive => f.write_str("ALIVE"),
            ServerState::Suspect => f.write_str("SUSPECT"),
            ServerState::Dead => f.write_str("DEAD"),
        }
    }
}

/// The monitor's view of one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub identity: ServerIdentity,
    pub last_heartbeat: u64,
    pub state: ServerState,
    /// Regions the server last said it holds. Advisory only.
    pub regions_held: BTreeSet<RegionIdentity>,
}

/// A periodic liveness report from an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub identity: ServerIdentity,
    pub regions_held: Vec<RegionIdentity>,
    pub timestamp: u64,
}

/// What the monitor made of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatOutcome {
    Accepted,
    /// Timestamp already seen; nothing changed.
    Duplicate,
    /// The instance is dead. It must stop serving.
    Fenced,
    /// No such instance was ever registered.
    Unknown,
}

/// Emitted once when a server instance is declared dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFailure {
    pub identity: ServerIdentity,
    pub last_known_regions: Vec<RegionIdentity>,
}

/// Heartbeat lease tracker for every registered region server.
pub struct ClusterMonitor {
    settings: MonitorSettings,
    /// Latest instance per address.
    records: RwLock<HashMap<ServerAddress, Arc<Mutex<ServerRecord>>>>,
    /// Every instance ever declared dead.
    dead: Mutex<HashSet<ServerIdentity>>,
    failures: mpsc::UnboundedSender<ServerFailure>,
    registered: Notify,
    deaths: Notify,
    last_start_code: AtomicU64,
}

impl ClusterMonitor {
    /// Create a monitor and the receiving end of its failure channel.
    pub fn new(settings: MonitorSettings) -> (Self, mpsc::UnboundedReceiver<ServerFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            settings,
            records: RwLock::new(HashMap::new()),
            dead: Mutex::new(HashSet::new()),
            failures,
            registered: Notify::new(),
            deaths: Notify::new(),
            last_start_code: AtomicU64::new(0),
        };
        (monitor, rx)
    }

    pub fn settings(&self) -> MonitorSettings {
        self.settings
    }

    /// Notified whenever a server registers.
    pub fn registrations(&self) -> &Notify {
        &self.registered
    }

    /// Notified whenever a server instance is declared dead.
    pub fn deaths(&self) -> &Notify {
        &self.deaths
    }

    /// Register a server instance at `address` and hand out its identity.
    ///
    /// If a previous instance at the same address is still ALIVE or SUSPECT
    /// it has evidently restarted, so the old instance is declared dead.
    pub fn register(&self, address: ServerAddress, now: u64) -> Result<ServerIdentity, MonitorError> {
        if address.as_str().is_empty() {
            return Err(MonitorError::EmptyAddress);
        }

        let mut records = self.records.write().expect("records lock");
        if let Some(previous) = records.get(&address) {
            let mut previous = previous.lock().expect("record lock");
            if previous.state != ServerState::Dead {
                if now < previous.last_heartbeat {
                    return Err(MonitorError::StaleRegistration {
                        address,
                        now,
                        last_heartbeat: previous.last_heartbeat,
                    });
                }
                info!(
                    server = %previous.identity,
                    "server re-registered, previous instance declared dead"
                );
                self.declare_dead(&mut previous);
            }
        }

        let identity = ServerIdentity {
            address: address.clone(),
            start_code: self.next_start_code(now),
        };
        let record = ServerRecord {
            identity: identity.clone(),
            last_heartbeat: now,
            state: ServerState::Alive,
            regions_held: BTreeSet::new(),
        };
        records.insert(address, Arc::new(Mutex::new(record)));
        drop(records);

        info!(server = %identity, "region server registered");
        self.registered.notify_waiters();
        Ok(identity)
    }

    /// Record a heartbeat.
    ///
    /// A timestamp at or past `last_heartbeat + dead_after` arrives after the
    /// lease has already run out; the record is declared dead and the
    /// heartbeat fenced, whether or not a tick got there first.
    pub fn report_heartbeat(&self, report: &HeartbeatReport) -> HeartbeatOutcome {
        let Some(record) = self.record_for(&report.identity) else {
            if self.dead.lock().expect("dead lock").contains(&report.identity) {
                warn!(server = %report.identity, "heartbeat from dead instance fenced");
                return HeartbeatOutcome::Fenced;
            }
            warn!(server = %report.identity, "heartbeat from unknown server");
            return HeartbeatOutcome::Unknown;
        };

        let mut record = record.lock().expect("record lock");
        if record.state == ServerState::Dead {
            warn!(server = %record.identity, "heartbeat from dead instance fenced");
            return HeartbeatOutcome::Fenced;
        }
        if report.timestamp <= record.last_heartbeat {
            debug!(
                server = %record.identity,
                timestamp = report.timestamp,
                last = record.last_heartbeat,
                "duplicate heartbeat ignored"
            );
            return HeartbeatOutcome::Duplicate;
        }
        if report.timestamp >= record.last_heartbeat + self.settings.dead_after {
            info!(
                server = %record.identity,
                timestamp = report.timestamp,
                last = record.last_heartbeat,
                "heartbeat arrived after lease expiry"
            );
            self.declare_dead(&mut record);
            warn!(server = %record.identity, "heartbeat from dead instance fenced");
            return HeartbeatOutcome::Fenced;
        }

        record.last_heartbeat = report.timestamp;
        record.regions_held = report.regions_held.iter().cloned().collect();
        if record.state == ServerState::Suspect {
            info!(server = %record.identity, "server recovered from SUSPECT");
            record.state = ServerState::Alive;
        }
        debug!(
            server = %record.identity,
            regions = record.regions_held.len(),
            "heartbeat received"
        );
        HeartbeatOutcome::Accepted
    }

    /// Advance every record's lease to `now`, returning the failures emitted.
    pub fn tick(&self, now: u64) -> Vec<ServerFailure> {
        let records: Vec<Arc<Mutex<ServerRecord>>> = {
            let records = self.records.read().expect("records lock");
            records.values().cloned().collect()
        };

        let mut failed = Vec::new();
        for record in records {
            let mut record = record.lock().expect("record lock");
            let silent_for = now.saturating_sub(record.last_heartbeat);
            match record.state {
                ServerState::Dead => {}
                _ if silent_for >= self.settings.dead_after => {
                    info!(
                        server = %record.identity,
                        silent_ms = silent_for,
                        "lease expired"
                    );
                    if let Some(failure) = self.declare_dead(&mut record) {
                        failed.push(failure);
                    }
                }
                ServerState::Alive if silent_for >= self.settings.suspect_after => {
                    warn!(
                        server = %record.identity,
                        silent_ms = silent_for,
                        "server SUSPECT: heartbeats overdue"
                    );
                    record.state = ServerState::Suspect;
                }
                _ => {}
            }
        }
        failed
    }

    /// A server is shutting down cleanly. Declares it dead without waiting
    /// for its lease to run out. Returns whether the report changed anything.
    pub fn report_exiting(&self, identity: &ServerIdentity) -> bool {
        let Some(record) = self.record_for(identity) else {
            return false;
        };
        let mut record = record.lock().expect("record lock");
        if record.state == ServerState::Dead {
            return false;
        }
        info!(server = %identity, "server reported clean exit");
        self.declare_dead(&mut record).is_some()
    }

    /// Count a freshly opened region against a server before its next
    /// heartbeat says so.
    pub fn note_region_opened(&self, identity: &ServerIdentity, region: &RegionIdentity) {
        if let Some(record) = self.record_for(identity) {
            let mut record = record.lock().expect("record lock");
            if record.state != ServerState::Dead {
                record.regions_held.insert(region.clone());
            }
        }
    }

    /// Snapshots of every ALIVE server.
    pub fn alive_servers(&self) -> Vec<ServerRecord> {
        self.servers()
            .into_iter()
            .filter(|r| r.state == ServerState::Alive)
            .collect()
    }

    pub fn is_alive(&self, identity: &ServerIdentity) -> bool {
        self.state_of(identity) == Some(ServerState::Alive)
    }

    /// State of a specific instance. Replaced instances report DEAD.
    pub fn state_of(&self, identity: &ServerIdentity) -> Option<ServerState> {
        match self.record_for(identity) {
            Some(record) => Some(record.lock().expect("record lock").state),
            None if self.dead.lock().expect("dead lock").contains(identity) => {
                Some(ServerState::Dead)
            }
            None => None,
        }
    }

    /// Snapshots of the latest record per address, sorted by address.
    pub fn servers(&self) -> Vec<ServerRecord> {
        let records = self.records.read().expect("records lock");
        let mut snapshot: Vec<ServerRecord> = records
            .values()
            .map(|r| r.lock().expect("record lock").clone())
            .collect();
        snapshot.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshot
    }

    fn record_for(&self, identity: &ServerIdentity) -> Option<Arc<Mutex<ServerRecord>>> {
        let records = self.records.read().expect("records lock");
        let record = records.get(&identity.address)?;
        let matches = record.lock().expect("record lock").identity == *identity;
        matches.then(|| record.clone())
    }

    /// Start codes are unique even when two registrations share a timestamp.
    fn next_start_code(&self, now: u64) -> u64 {
        let mut current = self.last_start_code.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self.last_start_code.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Move a record to DEAD and emit its failure, at most once per instance.
    fn declare_dead(&self, record: &mut ServerRecord) -> Option<ServerFailure> {
        if record.state == ServerState::Dead {
            return None;
        }
        record.state = ServerState::Dead;
        let newly_dead = self
            .dead
            .lock()
            .expect("dead lock")
            .insert(record.identity.clone());
        if !newly_dead {
            return None;
        }

        let failure = ServerFailure {
            identity: record.identity.clone(),
            last_known_regions: record.regions_held.iter().cloned().collect(),
        };
        info!(
            server = %record.identity,
            regions = failure.last_known_regions.len(),
            "server declared DEAD"
        );
        self.deaths.notify_waiters();
        if self.failures.send(failure.clone()).is_err() {
            debug!(server = %record.identity, "no failure consumer attached");
        }
        Some(failure)
    }
}
