//! Raft safety properties and their checker.
//!
//! The checker is fed the live nodes after every simulation step and every
//! applied entry. It remembers what it has seen (leaders per term, committed
//! entries, applied entries) so that a violation is caught even when the node
//! that would expose it has since crashed or compacted its log.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use raftcache_core::LogIndex;
use raftcache_raft::{LogEntry, RaftNode, RaftState, RaftStorage};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a Raft safety property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// Multiple leaders in the same term.
    MultipleLeadersInTerm {
        /// The term in which multiple leaders were observed.
        term: u64,
        /// The leaders.
        leaders: Vec<String>,
    },
    /// Two logs agree on an entry but differ on an earlier one.
    LogMismatch {
        /// Index of the earlier, differing entry.
        index: u64,
        /// First node.
        node_a: String,
        /// Term at `index` on the first node.
        term_a: u64,
        /// Second node.
        node_b: String,
        /// Term at `index` on the second node.
        term_b: u64,
    },
    /// A committed entry is missing from a later leader's log.
    MissingCommittedEntry {
        /// Index of the committed entry.
        index: u64,
        /// Term of the committed entry.
        term: u64,
        /// The leader missing it.
        leader: String,
        /// The leader's term.
        leader_term: u64,
    },
    /// A node committed a different entry at an index already committed.
    CommittedEntryChanged {
        /// The index.
        index: u64,
        /// Term first seen committed.
        expected_term: u64,
        /// Term this node committed.
        actual_term: u64,
        /// The node.
        node: String,
    },
    /// Two nodes applied different commands at the same index.
    StateMachineDivergence {
        /// The index.
        index: u64,
        /// The node whose entry differed from the first one applied.
        node: String,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MultipleLeadersInTerm { term, leaders } => {
                write!(f, "Multiple leaders in term {term}: {leaders:?}")
            }
            Self::LogMismatch {
                index,
                node_a,
                term_a,
                node_b,
                term_b,
            } => write!(
                f,
                "Log mismatch at index {index}: {node_a} has term {term_a}, \
                 {node_b} has term {term_b}"
            ),
            Self::MissingCommittedEntry {
                index,
                term,
                leader,
                leader_term,
            } => write!(
                f,
                "Committed entry (index={index}, term={term}) missing from \
                 leader {leader} in term {leader_term}"
            ),
            Self::CommittedEntryChanged {
                index,
                expected_term,
                actual_term,
                node,
            } => write!(
                f,
                "{node} committed term {actual_term} at index {index}, \
                 already committed with term {expected_term}"
            ),
            Self::StateMachineDivergence { index, node } => {
                write!(f, "{node} applied a different command at index {index}")
            }
        }
    }
}

// ============================================================================
// Property Checker
// ============================================================================

/// Tracks state across a simulation for property verification.
#[derive(Debug, Default)]
pub struct PropertyChecker {
    /// Leaders observed in each term.
    leaders_by_term: BTreeMap<u64, BTreeSet<String>>,
    /// Committed entries: index -> term. Never changes once recorded.
    committed: BTreeMap<u64, u64>,
    /// Highest commit index already recorded per node.
    recorded_commit: BTreeMap<String, u64>,
    /// First command applied at each index: index -> (term, payload).
    applied: BTreeMap<u64, (u64, Bytes)>,
    /// Violations found.
    violations: Vec<PropertyViolation>,
}

impl PropertyChecker {
    /// Creates a new property checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records leaders and newly committed entries of the live nodes.
    ///
    /// Call this after each simulation step.
    pub fn record_state<'a, S: RaftStorage + 'a>(
        &mut self,
        nodes: impl IntoIterator<Item = &'a RaftNode<S>>,
    ) {
        for node in nodes {
            let id = node.id().as_str().to_string();
            let term = node.current_term().get();

            if node.state() == RaftState::Leader {
                let leaders = self.leaders_by_term.entry(term).or_default();
                leaders.insert(id.clone());
                if leaders.len() > 1 {
                    let violation = PropertyViolation::MultipleLeadersInTerm {
                        term,
                        leaders: leaders.iter().cloned().collect(),
                    };
                    self.push(violation);
                }
            }

            let commit = node.commit_index().get();
            let recorded = self.recorded_commit.entry(id.clone()).or_insert(0);
            // A restarted node starts over from its snapshot.
            *recorded = (*recorded).min(commit);
            let start = (*recorded).max(node.log().snapshot_index().get()) + 1;
            *recorded = commit;

            for index in start..=commit {
                let Some(entry_term) = node.log().term_at(LogIndex::new(index)) else {
                    continue;
                };
                let entry_term = entry_term.get();
                match self.committed.get(&index) {
                    None => {
                        self.committed.insert(index, entry_term);
                    }
                    Some(&expected_term) if expected_term != entry_term => {
                        self.push(PropertyViolation::CommittedEntryChanged {
                            index,
                            expected_term,
                            actual_term: entry_term,
                            node: id.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
    }

    /// Records a command applied to a node's state machine.
    pub fn record_applied(&mut self, node: &str, entry: &LogEntry) {
        let index = entry.index.get();
        match self.applied.get(&index) {
            None => {
                self.applied
                    .insert(index, (entry.term.get(), entry.data.clone()));
            }
            Some((term, data)) if *term != entry.term.get() || *data != entry.data => {
                self.push(PropertyViolation::StateMachineDivergence {
                    index,
                    node: node.to_string(),
                });
            }
            Some(_) => {}
        }
    }

    /// Checks log matching and leader completeness on the live nodes and
    /// returns every violation found so far.
    pub fn check_all<'a, S: RaftStorage + 'a>(
        &mut self,
        nodes: impl IntoIterator<Item = &'a RaftNode<S>>,
    ) -> &[PropertyViolation] {
        let nodes: Vec<&RaftNode<S>> = nodes.into_iter().collect();
        self.record_state(nodes.iter().copied());

        let mut found = Vec::new();
        for (i, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(i + 1) {
                found.extend(check_log_matching(a, b));
            }
        }
        for node in &nodes {
            found.extend(self.check_leader_completeness(node));
        }
        for violation in found {
            self.push(violation);
        }
        &self.violations
    }

    /// Checks that a leader holds every entry committed so far.
    #[must_use]
    pub fn check_leader_completeness<S: RaftStorage>(&self, node: &RaftNode<S>) -> Vec<PropertyViolation> {
        if node.state() != RaftState::Leader {
            return Vec::new();
        }
        let snapshot_index = node.log().snapshot_index().get();
        self.committed
            .range(snapshot_index + 1..)
            .filter(|&(&index, &term)| {
                node.log().term_at(LogIndex::new(index)).map(|t| t.get()) != Some(term)
            })
            .map(|(&index, &term)| PropertyViolation::MissingCommittedEntry {
                index,
                term,
                leader: node.id().as_str().to_string(),
                leader_term: node.current_term().get(),
            })
            .collect()
    }

    /// Returns the committed entries recorded so far.
    #[must_use]
    pub const fn committed(&self) -> &BTreeMap<u64, u64> {
        &self.committed
    }

    /// Returns all violations found so far.
    #[must_use]
    pub fn violations(&self) -> &[PropertyViolation] {
        &self.violations
    }

    /// Returns true if no violations have been found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    fn push(&mut self, violation: PropertyViolation) {
        if !self.violations.contains(&violation) {
            self.violations.push(violation);
        }
    }
}

/// Checks the log matching property between two logs.
///
/// If both logs hold an entry with the same index and term, every earlier
/// entry both still hold must match too.
#[must_use]
pub fn check_log_matching<S: RaftStorage>(a: &RaftNode<S>, b: &RaftNode<S>) -> Vec<PropertyViolation> {
    let (log_a, log_b) = (a.log(), b.log());
    let start = log_a.snapshot_index().max(log_b.snapshot_index()).get() + 1;
    let end = log_a.last_index().min(log_b.last_index()).get();

    let mut agreed = false;
    let mut violations = Vec::new();
    for index in (start..=end).rev() {
        let term_a = log_a.term_at(LogIndex::new(index)).map_or(0, |t| t.get());
        let term_b = log_b.term_at(LogIndex::new(index)).map_or(0, |t| t.get());
        if term_a == term_b {
            agreed = true;
        } else if agreed {
            violations.push(PropertyViolation::LogMismatch {
                index,
                node_a: a.id().as_str().to_string(),
                term_a,
                node_b: b.id().as_str().to_string(),
                term_b,
            });
        }
    }
    violations
}

/// Counts the leaders among the live nodes.
#[must_use]
pub fn leader_count<'a, S: RaftStorage + 'a>(nodes: impl IntoIterator<Item = &'a RaftNode<S>>) -> usize {
    nodes
        .into_iter()
        .filter(|n| n.state() == RaftState::Leader)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftcache_core::{ServerId, TermId};

    fn entry(index: u64, term: u64, data: &'static [u8]) -> LogEntry {
        LogEntry::new(TermId::new(term), LogIndex::new(index), Bytes::from_static(data))
    }

    #[test]
    fn test_divergent_apply_detected() {
        let mut checker = PropertyChecker::new();
        checker.record_applied("n-0", &entry(3, 1, b"a"));
        checker.record_applied("n-1", &entry(3, 1, b"a"));
        assert!(checker.is_valid());

        checker.record_applied("n-2", &entry(3, 1, b"b"));
        assert_eq!(
            checker.violations(),
            &[PropertyViolation::StateMachineDivergence {
                index: 3,
                node: "n-2".to_string()
            }]
        );
    }

    #[test]
    fn test_violation_display_names_nodes() {
        let violation = PropertyViolation::MultipleLeadersInTerm {
            term: 4,
            leaders: vec![
                ServerId::new("n-0").unwrap().as_str().to_string(),
                "n-1".to_string(),
            ],
        };
        assert_eq!(
            violation.to_string(),
            "Multiple leaders in term 4: [\"n-0\", \"n-1\"]"
        );
    }
}
