use types::{block_hash, Block, BlockSignature, BlockSkeleton};

/// The source accepts a skeleton once `verified_count == quorum.len() - 1`,
/// excluding one signer (typically self or the leader) from the count —
/// spec §4.6.2 step 3. Preserved verbatim as a named constant rather than
/// re-derived inline.
pub const SKELETON_SIGNATURE_SLACK: usize = 1;

/// Build the compact commit record broadcast to non-quorum peers (spec
/// §4.6.1): the committed block's id, its ordered tx digests, the full
/// signature set collected during the round, the block hash, and the
/// ML-flavor interval validation outcome.
pub fn build_skeleton(block: &Block, signatures: Vec<BlockSignature>) -> BlockSkeleton {
    let ml = block.ml.as_ref();
    BlockSkeleton {
        block_id: block.block_id,
        tx_digests: block.ordered_tx_digests(),
        signatures,
        block_hash: block_hash(block, 0),
        interval_validations: ml.map(|m| m.interval_validations.clone()).unwrap_or_default(),
        all_valid: ml.map(|m| m.all_valid).unwrap_or(true),
    }
}
