//! Bootstrap policy.
//!
//! A node seeds a single-voter cluster only when it has never persisted any
//! Raft state and it was either told to, or it is the first ordinal (`*-0`)
//! of a stateful set. Every other node waits to be added by a leader.

use raftcache_core::ServerId;
use raftcache_raft::{Configuration, RaftResult, ServerDescriptor};

/// Decides whether this node bootstraps a new cluster.
#[must_use]
pub fn should_bootstrap(id: &ServerId, bootstrap_flag: bool, has_existing_state: bool) -> bool {
    !has_existing_state && (bootstrap_flag || id.is_first_ordinal())
}

/// Builds the first configuration: this node as the only voter.
///
/// # Errors
/// Returns `InvalidConfiguration` if the address is empty.
pub fn initial_configuration(id: &ServerId, address: &str) -> RaftResult<Configuration> {
    Configuration::new(vec![ServerDescriptor::voter(id.clone(), address)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> ServerId {
        ServerId::new(value).unwrap()
    }

    #[test]
    fn test_first_ordinal_bootstraps_when_fresh() {
        assert!(should_bootstrap(&id("cache-0"), false, false));
        assert!(!should_bootstrap(&id("cache-1"), false, false));
        assert!(!should_bootstrap(&id("cache-10"), false, false));
    }

    #[test]
    fn test_flag_forces_bootstrap_when_fresh() {
        assert!(should_bootstrap(&id("cache-1"), true, false));
    }

    #[test]
    fn test_existing_state_never_bootstraps() {
        assert!(!should_bootstrap(&id("cache-0"), true, true));
        assert!(!should_bootstrap(&id("cache-0"), false, true));
    }

    #[test]
    fn test_initial_configuration_has_one_voter() {
        let configuration = initial_configuration(&id("cache-0"), "10.0.0.1:7000").unwrap();
        assert_eq!(configuration.voters().count(), 1);
        assert_eq!(
            configuration.address_of(&id("cache-0")),
            Some("10.0.0.1:7000")
        );
        assert!(initial_configuration(&id("cache-0"), "").is_err());
    }
}
