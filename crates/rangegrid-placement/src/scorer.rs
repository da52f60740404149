//! Server ranking for replacement decisions.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use rangegrid_core::ServerIdentity;

/// A candidate server and how many regions it currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLoad {
    pub identity: ServerIdentity,
    pub regions_held: usize,
}

impl ServerLoad {
    /// Preference order: fewer regions first, then address, then start code.
    pub fn preference(&self, other: &ServerLoad) -> Ordering {
        self.regions_held
            .cmp(&other.regions_held)
            .then_with(|| self.identity.address.cmp(&other.identity.address))
            .then_with(|| self.identity.start_code.cmp(&other.identity.start_code))
    }
}

/// Candidates sorted best first.
pub fn rank_servers(loads: &[ServerLoad]) -> Vec<&ServerLoad> {
    let mut ranked: Vec<&ServerLoad> = loads.iter().collect();
    ranked.sort_by(|a, b| a.preference(b));
    ranked
}
