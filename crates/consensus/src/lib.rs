//! The Consensus Coordinator (C4), the Round State Machine (C1), the
//! Interval Validator (C5) and the Skeleton Propagator (C6), wired together
//! around the phase-gated `Node` in [`node`].

pub mod config;
pub mod error;
pub mod flavor;
pub mod interval;
pub mod node;
pub mod phase;
pub mod round;
pub mod skeleton;

pub use config::{Flavor, NodeConfig};
pub use error::ConsensusError;
pub use node::Node;
pub use phase::{Phase, PhaseGate};

use types::Block;

/// The genesis block for a given flavor (spec §3: genesis is
/// flavor-specific — the financial genesis carries no `ml` extension, the
/// ML genesis starts with `all_valid: true` and an empty validation map).
pub fn genesis_for_flavor(flavor: Flavor) -> Block {
    match flavor {
        Flavor::Financial => Block::genesis(),
        Flavor::Ml => Block::genesis_ml(),
    }
}
