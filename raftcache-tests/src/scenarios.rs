//! Reusable cluster shapes and seeds for simulation tests.

/// Standard cluster configurations.
pub mod clusters {
    /// 3-node cluster.
    pub const THREE_NODE: &[&str] = &["cache-0", "cache-1", "cache-2"];

    /// 5-node cluster for stronger fault tolerance.
    pub const FIVE_NODE: &[&str] = &["cache-0", "cache-1", "cache-2", "cache-3", "cache-4"];
}

/// Seeds for reproducible testing.
pub mod seeds {
    /// Seeds run by every fault-injection test.
    pub const REGRESSION_SEEDS: &[u64] = &[1, 7, 42, 1337, 9001, 31_337, 0xDEAD_BEEF, 0x5EED];
}
