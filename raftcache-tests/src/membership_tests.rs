//! Membership change simulation tests.

use raftcache_core::{LogIndex, ServerId};
use raftcache_raft::{ConfigChange, RaftError, RaftState};

use crate::scenarios::clusters::THREE_NODE;
use crate::simulation::{create_bucket, set, SimConfig, Simulation};

const MAX_TICKS: u64 = 5_000;

fn id(name: &str) -> ServerId {
    ServerId::new(name).unwrap()
}

fn add_voter(name: &str) -> ConfigChange {
    ConfigChange::AddVoter {
        id: id(name),
        address: name.to_string(),
    }
}

fn add_non_voter(name: &str) -> ConfigChange {
    ConfigChange::AddNonVoter {
        id: id(name),
        address: name.to_string(),
    }
}

fn started(seed: u64, ids: &[&str]) -> Simulation {
    let mut sim = Simulation::with_voters(SimConfig::new(seed), ids);
    sim.wait_for_leader(MAX_TICKS).expect("leader elected");
    sim
}

#[test]
fn test_sim_added_voter_catches_up() {
    let mut sim = started(21, THREE_NODE);
    sim.propose(&create_bucket("b")).unwrap();
    let written = sim.propose(&set("b", "k", "v")).unwrap();
    assert!(sim.wait_for_applied(THREE_NODE, written, MAX_TICKS));

    sim.add_node("cache-3");
    let index = sim
        .change_configuration(&add_voter("cache-3"), LogIndex::new(0))
        .unwrap();
    let all = ["cache-0", "cache-1", "cache-2", "cache-3"];
    assert!(sim.wait_for_applied(&all, index, MAX_TICKS));

    let joined = sim.node("cache-3").unwrap();
    assert_eq!(joined.configuration().voters().count(), 4);
    assert_eq!(joined.configuration_index(), index);
    assert_eq!(sim.get("cache-3", "b", "k").as_deref(), Some("v"));
    sim.assert_safe();
}

#[test]
fn test_sim_promote_is_one_entry() {
    let mut sim = started(22, THREE_NODE);
    sim.add_node("cache-3");
    let added = sim
        .change_configuration(&add_non_voter("cache-3"), LogIndex::new(0))
        .unwrap();
    assert!(sim.wait_for_applied(THREE_NODE, added, MAX_TICKS));

    let promote = ConfigChange::PromoteServer {
        id: id("cache-3"),
        address: "cache-3".to_string(),
    };
    let promoted = sim.change_configuration(&promote, added).unwrap();
    assert_eq!(promoted, added.next());

    assert!(sim.wait_for_applied(&["cache-3"], promoted, MAX_TICKS));
    let configuration = sim.node("cache-3").unwrap().configuration().clone();
    assert_eq!(configuration.voters().count(), 4);
    assert_eq!(configuration.non_voters().count(), 0);
    sim.assert_safe();
}

#[test]
fn test_sim_non_voter_never_campaigns() {
    let mut sim = started(23, &["cache-0"]);
    sim.add_node("cache-1");
    let index = sim
        .change_configuration(&add_non_voter("cache-1"), LogIndex::new(0))
        .unwrap();
    assert!(sim.wait_for_applied(&["cache-1"], index, MAX_TICKS));
    let term = sim.node("cache-1").unwrap().current_term();

    sim.crash("cache-0");
    sim.run(1_000);

    let node = sim.node("cache-1").unwrap();
    assert_eq!(node.state(), RaftState::Follower);
    assert_eq!(node.current_term(), term);
}

#[test]
fn test_sim_stale_expected_index_conflicts() {
    let mut sim = started(24, THREE_NODE);
    sim.add_node("cache-3");
    let first = sim
        .change_configuration(&add_non_voter("cache-3"), LogIndex::new(0))
        .unwrap();
    assert!(sim.wait_for_applied(THREE_NODE, first, MAX_TICKS));

    let stale = sim.change_configuration(&add_voter("cache-3"), first.prev());
    assert!(matches!(
        stale,
        Err(RaftError::ConfigurationConflict { latest, .. }) if latest == first
    ));
}

#[test]
fn test_sim_one_change_in_flight() {
    let mut sim = started(25, THREE_NODE);
    sim.add_node("cache-3");
    sim.add_node("cache-4");

    sim.change_configuration(&add_non_voter("cache-3"), LogIndex::new(0))
        .unwrap();
    // The first change has not committed yet.
    let second = sim.change_configuration(&add_non_voter("cache-4"), LogIndex::new(0));
    assert!(matches!(second, Err(RaftError::ConfigurationConflict { .. })));
}

#[test]
fn test_sim_removed_server_leaves_working_cluster() {
    let mut sim = started(26, THREE_NODE);
    sim.propose(&create_bucket("b")).unwrap();

    let leader = sim.leader().unwrap();
    let removed = THREE_NODE
        .iter()
        .copied()
        .find(|name| *name != leader.as_str())
        .unwrap();
    let index = sim
        .change_configuration(&ConfigChange::RemoveServer { id: id(removed) }, LogIndex::new(0))
        .unwrap();
    let remaining: Vec<&str> = THREE_NODE
        .iter()
        .copied()
        .filter(|name| *name != removed)
        .collect();
    assert!(sim.wait_for_applied(&remaining, index, MAX_TICKS));
    sim.crash(removed);

    let written = sim.propose(&set("b", "k", "v")).unwrap();
    assert!(sim.wait_for_applied(&remaining, written, MAX_TICKS));
    for name in &remaining {
        let node = sim.node(name).unwrap();
        assert_eq!(node.configuration().voters().count(), 2);
        assert_eq!(sim.get(name, "b", "k").as_deref(), Some("v"));
    }
    sim.assert_safe();
}

#[test]
fn test_sim_removing_last_voter_rejected() {
    let mut sim = started(27, &["cache-0"]);
    let result =
        sim.change_configuration(&ConfigChange::RemoveServer { id: id("cache-0") }, LogIndex::new(0));
    assert!(matches!(result, Err(RaftError::InvalidConfiguration { .. })));
}
