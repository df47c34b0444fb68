//! Deterministic quorum derivation (C2).
//!
//! `derive_quorum` is a pure function: every honest node must compute the
//! same ordered quorum for the same `(block, nonce, global_peers)` triple.
//! The PRNG choice and the hash-to-seed reduction are part of the wire
//! contract, not an implementation detail — see DESIGN.md.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use types::{block_hash, Address, Block};

/// Reduce a hex-encoded digest to a seed in `[0, modulus)` by treating the
/// digest as a big-endian integer, per spec §4.2 step 2. `modulus` is
/// `NUM_NODES` and is assumed to be nonzero.
fn reduce_hex_mod(hex: &str, modulus: u64) -> u64 {
    let mut acc: u64 = 0;
    for byte in hex.as_bytes() {
        let digit = (*byte as char).to_digit(16).unwrap_or(0) as u64;
        acc = (acc.wrapping_mul(16).wrapping_add(digit)) % modulus;
    }
    acc
}

/// Derive the ordered quorum for `block` at `nonce`, drawing `quorum_size`
/// addresses without replacement from `global_peers`.
///
/// Returns fewer than `quorum_size` addresses only if `global_peers` itself
/// is shorter than `quorum_size` (callers should treat that as a
/// misconfiguration, not a protocol condition).
pub fn derive_quorum(
    block: &Block,
    nonce: u64,
    global_peers: &[Address],
    quorum_size: usize,
) -> Vec<Address> {
    if global_peers.is_empty() {
        return Vec::new();
    }

    let hash = block_hash(block, nonce);
    let seed = reduce_hex_mod(&hash, global_peers.len() as u64);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    global_peers
        .choose_multiple(&mut rng, quorum_size.min(global_peers.len()))
        .cloned()
        .collect()
}

/// `true` iff `addr` is a member of the quorum derived for `(tip, nonce)`.
pub fn in_quorum(
    addr: &Address,
    block: &Block,
    nonce: u64,
    global_peers: &[Address],
    quorum_size: usize,
) -> bool {
    derive_quorum(block, nonce, global_peers, quorum_size).contains(addr)
}
