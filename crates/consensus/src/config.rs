use std::time::Duration;

use types::Address;

/// The two pluggable payload flavors (spec §1): `use: "Defi" | "ML"` in the
/// source configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    Financial,
    Ml,
}

/// Node construction configuration (spec §6 "Configuration"). Extends the
/// source's flat field list into a typed, serde-deserializable struct so it
/// can be loaded from a TOML file or environment, following the teacher's
/// config-via-env bootstrap pattern in `main.rs`.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub address: Address,
    pub global_peers: Vec<Address>,
    pub flavor: Flavor,
    pub num_nodes: usize,
    pub quorum_size: usize,
    pub minimum_transactions: usize,
    pub max_peers: usize,
    pub is_malicious: bool,
    /// Spec §9 open question #1: preserve the source's vote-under-count
    /// quirk in `tally_quorum_sigs` when `true` (the default, matching the
    /// source); set `false` to run the corrected tally.
    pub preserve_source_tally_quirk: bool,
    /// How long a phase-gated handler waits for its required phase before
    /// treating the message as out-of-order (spec §4.1's "bounded wait").
    pub phase_wait_timeout: Duration,
    /// Re-check interval within a phase-gated wait.
    pub phase_poll_interval: Duration,
    /// Bound on how long `receive_skeleton` waits for gossip to deliver
    /// transactions missing from the local mempool (spec §9 open question
    /// #2) before failing loudly.
    pub skeleton_reconstruction_timeout: Duration,
}

impl NodeConfig {
    pub fn quorum_member_count(&self) -> usize {
        self.quorum_size.min(self.global_peers.len())
    }

    /// The gossip peer set a node maintains locally (spec §3: `local_peers`
    /// — a subset of addresses the node currently gossips with, size ≤
    /// `max_peers - 1`, never containing its own address). With no dynamic
    /// membership (spec §1 non-goals), this is just `global_peers` minus
    /// self, capped at `max_peers - 1`.
    pub fn local_peers(&self) -> Vec<Address> {
        self.global_peers
            .iter()
            .filter(|a| **a != self.address)
            .take(self.max_peers.saturating_sub(1))
            .cloned()
            .collect()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: Address::new("127.0.0.1", 9000),
            global_peers: Vec::new(),
            flavor: Flavor::Financial,
            num_nodes: 1,
            quorum_size: 1,
            minimum_transactions: 1,
            max_peers: 8,
            is_malicious: false,
            preserve_source_tally_quirk: true,
            phase_wait_timeout: Duration::from_secs(5),
            phase_poll_interval: Duration::from_millis(100),
            skeleton_reconstruction_timeout: Duration::from_secs(5),
        }
    }
}
