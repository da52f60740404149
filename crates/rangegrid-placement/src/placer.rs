//! Replacement selection for orphaned regions.
//!
//! [`select_replacement`] picks one server for one region.
//! [`plan_reassignment`] spreads a batch of regions, counting each choice
//! against the chosen server so a single failure does not pile every
//! orphan onto the same survivor.

use std::collections::HashSet;

use tracing::{debug, warn};

use rangegrid_core::{RegionIdentity, ServerAddress, ServerIdentity};

use crate::scorer::{ServerLoad, rank_servers};

/// Target server per region, plus regions no server could take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassignmentPlan {
    pub assignments: Vec<(RegionIdentity, ServerIdentity)>,
    pub unplaced: Vec<RegionIdentity>,
}

/// Best candidate not in `exclude`, if any.
pub fn select_replacement(
    loads: &[ServerLoad],
    exclude: &HashSet<ServerAddress>,
) -> Option<ServerIdentity> {
    rank_servers(loads)
        .into_iter()
        .find(|l| !exclude.contains(&l.identity.address))
        .map(|l| l.identity.clone())
}

/// Assign every region in `regions`, in order, to the least-loaded candidate.
pub fn plan_reassignment(
    regions: &[RegionIdentity],
    loads: &[ServerLoad],
    exclude: &HashSet<ServerAddress>,
) -> ReassignmentPlan {
    let mut working: Vec<ServerLoad> = loads
        .iter()
        .filter(|l| !exclude.contains(&l.identity.address))
        .cloned()
        .collect();
    let mut plan = ReassignmentPlan::default();

    for region in regions {
        let best = working
            .iter_mut()
            .min_by(|a, b| a.preference(b));
        match best {
            Some(target) => {
                target.regions_held += 1;
                debug!(
                    %region,
                    server = %target.identity,
                    load = target.regions_held,
                    "planned replacement"
                );
                plan.assignments.push((region.clone(), target.identity.clone()));
            }
            None => plan.unplaced.push(region.clone()),
        }
    }

    if !plan.unplaced.is_empty() {
        warn!(
            unplaced = plan.unplaced.len(),
            "no live region server available for some regions"
        );
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangegrid_core::RegionId;

    fn load(address: &str, regions_held: usize) -> ServerLoad {
        ServerLoad {
            identity: ServerIdentity {
                address: ServerAddress::from(address),
                start_code: 1,
            },
            regions_held,
        }
    }

    fn regions(n: u64) -> Vec<RegionIdentity> {
        (0..n)
            .map(|i| RegionIdentity::new("t", format!("k{i}"), "", RegionId(100 + i)))
            .collect()
    }

    #[test]
    fn selects_least_loaded() {
        let loads = vec![load("s1:1", 4), load("s2:1", 1)];
        let chosen = select_replacement(&loads, &HashSet::new()).unwrap();
        assert_eq!(chosen.address.as_str(), "s2:1");
    }

    #[test]
    fn excluded_candidates_are_skipped() {
        let loads = vec![load("s1:1", 4), load("s2:1", 1)];
        let exclude: HashSet<ServerAddress> = [ServerAddress::from("s2:1")].into();
        let chosen = select_replacement(&loads, &exclude).unwrap();
        assert_eq!(chosen.address.as_str(), "s1:1");

        let all: HashSet<ServerAddress> =
            [ServerAddress::from("s1:1"), ServerAddress::from("s2:1")].into();
        assert!(select_replacement(&loads, &all).is_none());
    }

    #[test]
    fn plan_spreads_batch() {
        let loads = vec![load("s1:1", 0), load("s2:1", 0)];
        let plan = plan_reassignment(&regions(4), &loads, &HashSet::new());
        assert!(plan.unplaced.is_empty());

        let on_s1 = plan
            .assignments
            .iter()
            .filter(|(_, s)| s.address.as_str() == "s1:1")
            .count();
        assert_eq!(on_s1, 2);
        assert_eq!(plan.assignments[0].1.address.as_str(), "s1:1");
        assert_eq!(plan.assignments[1].1.address.as_str(), "s2:1");
    }

    #[test]
    fn plan_accounts_for_existing_load() {
        let loads = vec![load("s1:1", 3), load("s2:1", 0)];
        let plan = plan_reassignment(&regions(3), &loads, &HashSet::new());
        assert!(
            plan.assignments
                .iter()
                .all(|(_, s)| s.address.as_str() == "s2:1")
        );
    }

    #[test]
    fn plan_without_candidates_leaves_regions_unplaced() {
        let plan = plan_reassignment(&regions(2), &[], &HashSet::new());
        assert!(plan.assignments.is_empty());
        assert_eq!(plan.unplaced.len(), 2);
    }
}
