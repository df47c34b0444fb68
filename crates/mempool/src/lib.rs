//! The mempool (C3): passive storage for pending transactions, keyed by
//! digest. It knows nothing about networking, consensus phases, or chain
//! state beyond what callers hand it — the chain-membership check in
//! `insert` takes a snapshot of already-committed digests rather than
//! reaching into storage itself, so the crate stays leaf-level.

use std::collections::{HashMap, HashSet};

use metrics as sequencer_metrics;
use thiserror::Error;
use types::{Hash, Transaction};

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("mempool is full")]
    Full,
}

#[derive(Clone, Debug)]
pub struct MempoolConfig {
    pub max_tx: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self { max_tx: 100_000 }
    }
}

/// Result of an `insert` attempt, used by the coordinator to decide whether
/// to gossip (§4.3: "every accepted insert triggers a one-way
/// ADD_TRANSACTION...duplicates suppress propagation").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
    AlreadyCommitted,
}

pub trait Mempool {
    /// `true` iff `digest` is currently held in the mempool.
    fn contains(&self, digest: &Hash) -> bool;

    /// Insert `tx` unless its digest is already held or appears in
    /// `committed` (a snapshot of digests present in any block on the
    /// chain, per §4.3's "rejected if the digest already appears in any
    /// block" rule).
    fn insert(
        &mut self,
        tx: Transaction,
        committed: &HashSet<Hash>,
    ) -> Result<InsertOutcome, MempoolError>;

    /// Snapshot of digests currently held, used for reconciliation (§4.4.3).
    fn snapshot_keys(&self) -> HashSet<Hash>;

    fn get(&self, digest: &Hash) -> Option<&Transaction>;

    /// Remove every entry whose digest is in `digests`, returning the
    /// transactions found and the digests that were *not* present locally
    /// (used by skeleton reconstruction, §4.6.2).
    fn drain(&mut self, digests: &[Hash]) -> (Vec<Transaction>, Vec<Hash>);

    /// Drop all held transactions. Invoked by the coordinator on commit
    /// (§4.4.8 step 1). After this returns, `len() == 0`.
    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory `HashMap`-backed mempool. Insertion order is not meaningful:
/// the tx set is reconciled and ordered by digest (`Block::ordered_tx_digests`),
/// not by arrival order.
#[derive(Debug, Default)]
pub struct SimpleMempool {
    config: MempoolConfig,
    txs: HashMap<Hash, Transaction>,
}

impl SimpleMempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            txs: HashMap::new(),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(MempoolConfig::default())
    }
}

impl Mempool for SimpleMempool {
    fn contains(&self, digest: &Hash) -> bool {
        self.txs.contains_key(digest)
    }

    fn insert(
        &mut self,
        tx: Transaction,
        committed: &HashSet<Hash>,
    ) -> Result<InsertOutcome, MempoolError> {
        let digest = tx.digest();

        if self.txs.contains_key(&digest) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        if committed.contains(&digest) {
            return Ok(InsertOutcome::AlreadyCommitted);
        }
        if self.txs.len() >= self.config.max_tx {
            return Err(MempoolError::Full);
        }

        self.txs.insert(digest, tx);
        sequencer_metrics::record_mempool_size(self.txs.len());
        Ok(InsertOutcome::Inserted)
    }

    fn snapshot_keys(&self) -> HashSet<Hash> {
        self.txs.keys().copied().collect()
    }

    fn get(&self, digest: &Hash) -> Option<&Transaction> {
        self.txs.get(digest)
    }

    fn drain(&mut self, digests: &[Hash]) -> (Vec<Transaction>, Vec<Hash>) {
        let mut found = Vec::with_capacity(digests.len());
        let mut missing = Vec::new();
        for digest in digests {
            match self.txs.remove(digest) {
                Some(tx) => found.push(tx),
                None => missing.push(*digest),
            }
        }
        sequencer_metrics::record_mempool_size(self.txs.len());
        (found, missing)
    }

    fn clear(&mut self) {
        self.txs.clear();
        sequencer_metrics::record_mempool_size(0);
    }

    fn len(&self) -> usize {
        self.txs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{AccountKey, FinancialTx, TxUid};

    fn make_tx(uid: &str) -> Transaction {
        Transaction::Financial(FinancialTx {
            uid: TxUid(uid.as_bytes().to_vec()),
            from: AccountKey("A".into()),
            to: AccountKey("B".into()),
            amount: 1,
            signature: vec![],
        })
    }

    #[test]
    fn insert_then_contains() {
        let mut mp = SimpleMempool::with_default_config();
        let tx = make_tx("uid-1");
        let digest = tx.digest();
        let committed = HashSet::new();

        let outcome = mp.insert(tx, &committed).unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
        assert!(mp.contains(&digest));
        assert_eq!(mp.len(), 1);
    }

    #[test]
    fn duplicate_insert_suppressed() {
        let mut mp = SimpleMempool::with_default_config();
        let tx = make_tx("uid-1");
        let committed = HashSet::new();

        mp.insert(tx.clone(), &committed).unwrap();
        let second = mp.insert(tx, &committed).unwrap();
        assert_eq!(second, InsertOutcome::AlreadyPresent);
        assert_eq!(mp.len(), 1);
    }

    #[test]
    fn insert_rejected_if_already_committed() {
        let mut mp = SimpleMempool::with_default_config();
        let tx = make_tx("uid-1");
        let digest = tx.digest();
        let mut committed = HashSet::new();
        committed.insert(digest);

        let outcome = mp.insert(tx, &committed).unwrap();
        assert_eq!(outcome, InsertOutcome::AlreadyCommitted);
        assert_eq!(mp.len(), 0);
    }

    #[test]
    fn clear_empties_mempool() {
        let mut mp = SimpleMempool::with_default_config();
        let committed = HashSet::new();
        mp.insert(make_tx("uid-1"), &committed).unwrap();
        mp.insert(make_tx("uid-2"), &committed).unwrap();
        assert_eq!(mp.len(), 2);

        mp.clear();
        assert_eq!(mp.len(), 0);
        assert!(mp.is_empty());
    }

    #[test]
    fn drain_reports_missing_digests() {
        let mut mp = SimpleMempool::with_default_config();
        let committed = HashSet::new();
        let tx1 = make_tx("uid-1");
        let digest1 = tx1.digest();
        mp.insert(tx1, &committed).unwrap();

        let missing_digest = make_tx("uid-ghost").digest();
        let (found, missing) = mp.drain(&[digest1, missing_digest]);

        assert_eq!(found.len(), 1);
        assert_eq!(missing, vec![missing_digest]);
        assert_eq!(mp.len(), 0);
    }

    #[test]
    fn capacity_limit_is_enforced() {
        let mut mp = SimpleMempool::new(MempoolConfig { max_tx: 1 });
        let committed = HashSet::new();
        mp.insert(make_tx("uid-1"), &committed).unwrap();
        let res = mp.insert(make_tx("uid-2"), &committed);
        assert!(matches!(res, Err(MempoolError::Full)));
    }
}
