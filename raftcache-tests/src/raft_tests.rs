//! Raft consensus simulation tests.
//!
//! Clusters run under the deterministic simulation; every test ends by
//! checking the safety properties over the whole run.

use raftcache_core::{LogIndex, MAX_FRAME_BYTES};
use raftcache_raft::RaftState;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::properties::leader_count;
use crate::scenarios::clusters::{FIVE_NODE, THREE_NODE};
use crate::scenarios::seeds::REGRESSION_SEEDS;
use crate::simulation::{create_bucket, set, SimConfig, Simulation};

const MAX_TICKS: u64 = 5_000;

/// Starts a cluster with a leader and bucket `b` applied everywhere.
fn cluster_with_bucket(seed: u64, ids: &[&str]) -> Simulation {
    let mut sim = Simulation::with_voters(SimConfig::new(seed), ids);
    sim.wait_for_leader(MAX_TICKS).expect("leader elected");
    let index = sim.propose(&create_bucket("b")).expect("leader accepts");
    assert!(sim.wait_for_applied(ids, index, MAX_TICKS));
    sim
}

#[test]
fn test_sim_elects_single_leader() {
    let mut sim = Simulation::with_voters(SimConfig::new(1), THREE_NODE);
    let leader = sim.wait_for_leader(MAX_TICKS).expect("leader elected");

    sim.run(300);
    assert_eq!(leader_count(sim.live_nodes()), 1);
    assert_eq!(sim.leader(), Some(leader.clone()));
    for id in THREE_NODE {
        assert_eq!(sim.node(id).unwrap().leader_id(), Some(&leader));
    }
    sim.assert_safe();
}

#[test]
fn test_sim_single_voter_elects_itself() {
    let mut sim = Simulation::with_voters(SimConfig::new(2), &["cache-0"]);
    let leader = sim.wait_for_leader(MAX_TICKS).expect("leader elected");
    assert_eq!(leader.as_str(), "cache-0");

    let index = sim.propose(&create_bucket("b")).unwrap();
    // A lone voter commits without any messages.
    assert_eq!(sim.node("cache-0").unwrap().commit_index(), index);
}

#[test]
fn test_sim_writes_replicate_to_all_nodes() {
    let mut sim = cluster_with_bucket(3, THREE_NODE);

    let mut last = LogIndex::new(0);
    for i in 0..20 {
        last = sim
            .propose(&set("b", &format!("k{i}"), &i.to_string()))
            .unwrap();
    }
    assert!(sim.wait_for_applied(THREE_NODE, last, MAX_TICKS));

    for id in THREE_NODE {
        assert_eq!(sim.get(id, "b", "k0").as_deref(), Some("0"));
        assert_eq!(sim.get(id, "b", "k19").as_deref(), Some("19"));
    }
    sim.assert_safe();
}

#[test]
fn test_sim_set_into_missing_bucket_does_not_stall() {
    let mut sim = cluster_with_bucket(4, THREE_NODE);

    sim.propose(&set("missing", "k", "v")).unwrap();
    let index = sim.propose(&set("b", "k", "v")).unwrap();
    assert!(sim.wait_for_applied(THREE_NODE, index, MAX_TICKS));

    for id in THREE_NODE {
        assert_eq!(sim.get(id, "missing", "k"), None);
        assert_eq!(sim.get(id, "b", "k").as_deref(), Some("v"));
    }
}

#[test]
fn test_sim_leader_crash_elects_new_leader() {
    let mut sim = cluster_with_bucket(5, THREE_NODE);
    let index = sim.propose(&set("b", "before", "1")).unwrap();
    assert!(sim.wait_for_applied(THREE_NODE, index, MAX_TICKS));

    let old = sim.leader().unwrap();
    sim.crash(old.as_str());
    let new = sim.wait_for_leader(MAX_TICKS).expect("new leader");
    assert_ne!(new, old);

    let index = sim.propose(&set("b", "after", "2")).unwrap();
    sim.restart(old.as_str());
    assert!(sim.wait_for_applied(THREE_NODE, index, MAX_TICKS));

    for id in THREE_NODE {
        assert_eq!(sim.get(id, "b", "before").as_deref(), Some("1"));
        assert_eq!(sim.get(id, "b", "after").as_deref(), Some("2"));
    }
    sim.assert_safe();
}

#[test]
fn test_sim_isolated_leader_cannot_commit() {
    let mut sim = cluster_with_bucket(7, FIVE_NODE);
    let old = sim.leader().unwrap();
    let majority: Vec<&str> = FIVE_NODE
        .iter()
        .copied()
        .filter(|id| *id != old.as_str())
        .collect();

    sim.isolate(old.as_str());
    let stale = sim
        .propose_on(old.as_str(), &set("b", "lost", "x"))
        .expect("still leader when isolated");

    sim.run(200);
    let node = sim.node(old.as_str()).unwrap();
    assert!(node.commit_index() < stale);
    // Without contact to a quorum the old leader steps down.
    assert_ne!(node.state(), RaftState::Leader);

    let new = sim.wait_for_leader(MAX_TICKS).expect("majority elects");
    assert_ne!(new, old);
    let kept = sim.propose(&set("b", "kept", "y")).unwrap();
    assert!(sim.wait_for_applied(&majority, kept, MAX_TICKS));

    sim.heal();
    assert!(sim.wait_for_applied(FIVE_NODE, kept, MAX_TICKS));
    for id in FIVE_NODE {
        assert_eq!(sim.get(id, "b", "lost"), None);
        assert_eq!(sim.get(id, "b", "kept").as_deref(), Some("y"));
    }
    sim.assert_safe();
}

#[test]
fn test_sim_minority_partition_keeps_majority_available() {
    let mut sim = cluster_with_bucket(11, FIVE_NODE);
    let leader = sim.leader().unwrap();
    let followers: Vec<&str> = FIVE_NODE
        .iter()
        .copied()
        .filter(|id| *id != leader.as_str())
        .collect();

    // The leader keeps two followers: still a majority of five.
    let (minority, majority) = followers.split_at(2);
    sim.partition(minority, &[leader.as_str()]);
    sim.partition(minority, majority);

    let index = sim.propose(&set("b", "k", "v")).unwrap();
    let mut reachable = majority.to_vec();
    reachable.push(leader.as_str());
    assert!(sim.wait_for_applied(&reachable, index, MAX_TICKS));
    assert_eq!(sim.leader(), Some(leader));

    sim.heal();
    assert!(sim.wait_for_applied(FIVE_NODE, index, MAX_TICKS));
    sim.assert_safe();
}

#[test]
fn test_sim_follower_catches_up_across_large_log() {
    let mut sim = cluster_with_bucket(13, THREE_NODE);
    let leader = sim.leader().unwrap();
    let lagging = THREE_NODE
        .iter()
        .copied()
        .find(|id| *id != leader.as_str())
        .unwrap();
    let reachable: Vec<&str> = THREE_NODE
        .iter()
        .copied()
        .filter(|id| *id != lagging)
        .collect();

    // Twenty 1 MiB values: more log than fits in one frame.
    let value = "v".repeat(1024 * 1024);
    sim.isolate(lagging);
    let mut last = LogIndex::new(0);
    for i in 0..20 {
        last = sim
            .propose(&set("b", &format!("k{i}"), &value))
            .expect("leader keeps a quorum");
        sim.step();
    }
    assert!(sim.wait_for_applied(&reachable, last, MAX_TICKS));
    assert!(20 * value.len() > MAX_FRAME_BYTES as usize);

    sim.heal();
    assert!(sim.wait_for_applied(THREE_NODE, last, MAX_TICKS));
    let node = sim.node(lagging).unwrap();
    assert_eq!(node.commit_index(), last);
    assert_eq!(node.log().snapshot_index().get(), 0);
    for key in ["k0", "k19"] {
        assert_eq!(sim.get(lagging, "b", key).map(|v| v.len()), Some(value.len()));
    }
    assert_eq!(sim.oversized_frames(), 0);
    sim.assert_safe();
}

#[test]
fn test_sim_safety_under_random_faults() {
    for &seed in REGRESSION_SEEDS {
        let config = SimConfig::new(seed).with_drop_rate(0.05).with_max_delay(4);
        let mut sim = Simulation::with_voters(config, FIVE_NODE);
        let mut faults = ChaCha8Rng::seed_from_u64(seed.rotate_left(17));

        sim.wait_for_leader(MAX_TICKS);
        sim.propose(&create_bucket("b"));

        let mut crashed: Option<&str> = None;
        for round in 0..40_u64 {
            sim.propose(&set("b", &format!("k{}", round % 8), &round.to_string()));
            sim.run(faults.gen_range(5..30));

            let victim = FIVE_NODE[faults.gen_range(0..FIVE_NODE.len())];
            match faults.gen_range(0..10) {
                0 if crashed.is_none() => {
                    sim.crash(victim);
                    crashed = Some(victim);
                }
                1 => {
                    if let Some(id) = crashed.take() {
                        sim.restart(id);
                    }
                }
                2 => sim.isolate(victim),
                3 => sim.heal(),
                _ => {}
            }
        }

        sim.heal();
        if let Some(id) = crashed {
            sim.restart(id);
        }
        sim.wait_for_leader(MAX_TICKS)
            .unwrap_or_else(|| panic!("seed {seed}: no leader after heal"));
        let last = (0..10)
            .find_map(|_| {
                let index = sim.propose(&set("b", "final", "done"));
                if index.is_none() {
                    sim.wait_for_leader(MAX_TICKS);
                }
                index
            })
            .unwrap_or_else(|| panic!("seed {seed}: no leader accepts writes"));
        assert!(
            sim.wait_for_applied(FIVE_NODE, last, MAX_TICKS),
            "seed {seed}: cluster did not converge"
        );

        for key in (0..8).map(|k| format!("k{k}")).chain(["final".to_string()]) {
            let expected = sim.get("cache-0", "b", &key);
            for id in FIVE_NODE {
                assert_eq!(sim.get(id, "b", &key), expected, "seed {seed}: {id} {key}");
            }
        }
        sim.assert_safe();
    }
}

#[test]
fn test_sim_same_seed_replays_identically() {
    let run = |seed| {
        let config = SimConfig::new(seed).with_drop_rate(0.1).with_max_delay(5);
        let mut sim = Simulation::with_voters(config, THREE_NODE);
        for i in 0..30 {
            sim.propose(&set("b", "k", &i.to_string()));
            sim.run(10);
        }
        (sim.leader(), sim.checker().committed().clone())
    };

    assert_eq!(run(99), run(99));
}
