use std::collections::HashMap;

use types::{Block, BlockSignature, IntervalValidations};

/// Per-round scratch state, bundled into one struct owned by the
/// coordinator and replaced atomically at round start (spec §9
/// recommendation), rather than reset field-by-field. Covers
/// `quorum_sigs`, `quorum_block`, `validation_votes`, and the three
/// independent round counters (`quorum_ready_votes`, `mempool_rounds`,
/// `validation_responses`), which are reset defensively both on threshold
/// crossing and in `add_block`, to survive aborted rounds (spec §9).
#[derive(Default)]
pub struct RoundState {
    /// Set when `send_quorum_ready` starts the round; read back in
    /// `tally_quorum_sigs` to report the round's wall-clock duration.
    pub started_at: Option<std::time::Instant>,
    pub quorum_sigs: Vec<BlockSignature>,
    pub quorum_block: Option<Block>,

    pub quorum_ready_votes: usize,
    pub mempool_rounds: usize,

    /// Per-interval collected votes (ML flavor only), cleared once tallied.
    pub validation_votes: HashMap<u32, Vec<bool>>,
    pub validation_responses: usize,
    /// Total interval-vote events expected this round (one per
    /// `task_intervals` entry — every interval is assigned to exactly one
    /// quorum member and broadcast to the rest, so this is the count that
    /// actually reaches the tally threshold, not `|quorum|`). `None` until
    /// `run_interval_validation` has identified the submitted model and set
    /// it; a vote arriving before that point has to wait rather than record
    /// into state that's about to be reset.
    pub validation_expected: Option<usize>,
    pub validation_complete: bool,
    pub interval_validations: IntervalValidations,
    pub all_valid: bool,
}

impl RoundState {
    pub fn reset(&mut self) {
        *self = RoundState::default();
    }
}
