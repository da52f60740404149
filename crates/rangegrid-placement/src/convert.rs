//! Conversions from cluster monitor records to placement inputs.

use rangegrid_cluster::{ServerRecord, ServerState};

use crate::scorer::ServerLoad;

/// Load of a single server as the monitor last saw it.
pub fn record_to_load(record: &ServerRecord) -> ServerLoad {
    ServerLoad {
        identity: record.identity.clone(),
        regions_held: record.regions_held.len(),
    }
}

/// Loads of every ALIVE record. SUSPECT and DEAD servers are not candidates.
pub fn alive_loads(records: &[ServerRecord]) -> Vec<ServerLoad> {
    records
        .iter()
        .filter(|r| r.state == ServerState::Alive)
        .map(record_to_load)
        .collect()
}
