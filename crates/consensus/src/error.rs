use thiserror::Error;

/// Errors grouped by effect, per spec §7: transient peer errors and
/// protocol mismatches are never fatal (logged and the round continues or
/// the message is dropped); round failures abandon the round; invariant
/// violations are the only fatal case.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("mempool error: {0}")]
    Mempool(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    /// Protocol mismatch (spec §4.1): a message arrived for a phase the
    /// node will never reach before the next `addBlock` resets to Idle.
    #[error("message arrived out of order for the current phase")]
    OutOfOrderMessage,

    /// Round failure (spec §4.4.8 step 6): signature tally below quorum
    /// size, or the local hash lost the tally.
    #[error("round aborted: {0}")]
    RoundAborted(String),

    /// Spec §9 open question #2, resolved as a REDESIGN: fail loudly
    /// rather than silently reconstruct a block with missing transactions.
    #[error("cannot reconstruct block {block_id} from skeleton: {reason}")]
    SkeletonReconstruction { block_id: u64, reason: String },
}

impl From<storage::StorageError> for ConsensusError {
    fn from(e: storage::StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<mempool::MempoolError> for ConsensusError {
    fn from(e: mempool::MempoolError) -> Self {
        Self::Mempool(e.to_string())
    }
}

impl From<networking::NetworkError> for ConsensusError {
    fn from(e: networking::NetworkError) -> Self {
        Self::Network(e.to_string())
    }
}
