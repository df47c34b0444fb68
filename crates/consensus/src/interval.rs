//! Interval Validator (C5, ML flavor): task derivation, voting, and tally.
//! Spec §4.5.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use types::{Address, IntervalValidations, ModelData};

/// `task_intervals(model_data, block_hash) -> list of int` (spec §6): an
/// external collaborator out of scope for this crate. The stand-in here
/// assigns one interval per entry in the model's validity array, which is
/// the natural bijection given `ModelData.intervals_validity` "bounds the
/// interval index space" (spec §3).
pub fn task_intervals(model: &ModelData) -> Vec<u32> {
    (0..model.intervals_validity.len() as u32).collect()
}

/// Fold the UTF-8 bytes of a hex block hash into a 64-bit accumulator by
/// repeatedly shifting left 8 bits and OR-ing in the next byte — bit for
/// bit what spec §4.5.1 step 3 prescribes, including that only the
/// trailing 8 bytes of the hash effectively survive once the accumulator
/// fills up. Part of the cross-node determinism contract: every quorum
/// member must compute the same seed for the same block hash.
pub fn fold_seed(block_hash_hex: &str) -> u64 {
    let mut seed: u64 = 0;
    for byte in block_hash_hex.as_bytes() {
        seed = (seed << 8) | (*byte as u64);
    }
    seed
}

/// Shuffle a copy of `quorum` under a PRNG seeded by `fold_seed(block_hash)`
/// and distribute `task_intervals(model)` round-robin over it, returning
/// the intervals assigned to `self_addr`. Spec §4.5.1 describes "the one
/// assigned to self" (singular); this generalizes to "the set" so it stays
/// correct when there are more intervals than quorum members.
pub fn assign_intervals(
    model: &ModelData,
    block_hash_hex: &str,
    quorum: &[Address],
    self_addr: &Address,
) -> Vec<u32> {
    if quorum.is_empty() {
        return Vec::new();
    }

    let seed = fold_seed(block_hash_hex);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut shuffled: Vec<Address> = quorum.to_vec();
    shuffled.shuffle(&mut rng);

    let Some(self_pos) = shuffled.iter().position(|a| a == self_addr) else {
        return Vec::new();
    };

    task_intervals(model)
        .into_iter()
        .enumerate()
        .filter(|(i, _)| i % shuffled.len() == self_pos)
        .map(|(_, interval)| interval)
        .collect()
}

/// Majority tally over collected per-interval votes (spec §4.5.2): an
/// interval is valid iff `valid_votes > invalid_votes`. Returns the
/// resulting validity map plus the block-level `all_valid` flag (every
/// interval valid).
pub fn tally_intervals(votes: &HashMap<u32, Vec<bool>>) -> (IntervalValidations, bool) {
    let mut result = IntervalValidations::new();
    for (idx, ballots) in votes {
        let valid_votes = ballots.iter().filter(|v| **v).count();
        let invalid_votes = ballots.len() - valid_votes;
        result.insert(*idx, valid_votes > invalid_votes);
    }
    let all_valid = !result.is_empty() && result.values().all(|v| *v);
    (result, all_valid)
}
