//! Chain and account storage.
//!
//! `ChainStore` holds the append-only block list and the digest index used
//! by the mempool's chain-membership check (§4.3). `AccountStore` holds the
//! financial-flavor balance ledger (§4.7 step 4). Both are provided as an
//! in-memory implementation (used by tests and as the protocol's default —
//! spec §3's "no persistence across restarts" non-goal) and a sled-backed
//! one for operators who want durability across process restarts.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use metrics as sequencer_metrics;
use thiserror::Error;
use types::{block_hash, AccountKey, Block, FinancialTx, Hash, GENESIS_PREV_HASH};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("block {block_id} is not the chain tip successor (expected prev_hash {expected}, got {got})")]
    NonMonotonicAppend {
        block_id: u64,
        expected: String,
        got: String,
    },
    #[error("insufficient balance for {account}: has {balance}, needs {needed}")]
    InsufficientBalance {
        account: AccountKey,
        balance: u64,
        needed: u64,
    },
    #[error("backend error: {0}")]
    Backend(String),
}

pub trait ChainStore {
    /// Append `block` to the chain. Rejects non-monotonic appends: the
    /// block's `prev_hash` must equal `block_hash(tip, 0)` and its
    /// `block_id` must be `tip.block_id + 1` (spec §8 invariant 2).
    fn append_block(&mut self, block: Block) -> Result<(), StorageError>;

    /// The last block on the chain.
    fn tip(&self) -> Block;

    fn get_block(&self, block_id: u64) -> Result<Block, StorageError>;

    /// Digests present in any committed block, used by the mempool to
    /// reject re-admission of already-settled transactions (§4.3).
    fn committed_digests(&self) -> HashSet<Hash>;

    fn contains_digest(&self, digest: &Hash) -> bool;
}

pub trait AccountStore {
    fn balance(&self, account: &AccountKey) -> u64;

    fn set_balance(&mut self, account: AccountKey, amount: u64);

    /// Apply a financial transfer. Fails if `from` cannot cover `amount` —
    /// acceptance-time validation (§4.4.5) should make this unreachable in
    /// practice, but `add_block` re-checks rather than trusting the
    /// mempool's earlier pass.
    fn apply_transfer(&mut self, tx: &FinancialTx) -> Result<(), StorageError>;
}

/// In-memory chain + account storage. The default backend: spec §3 lists
/// "no persistence across restarts" as a non-goal, so this is what every
/// test and the single-process demo in `main.rs` uses.
#[derive(Default)]
pub struct InMemoryStorage {
    blocks: Vec<Block>,
    digest_index: HashSet<Hash>,
    accounts: HashMap<AccountKey, u64>,
}

impl InMemoryStorage {
    /// Start a chain with the given genesis block already appended.
    pub fn with_genesis(genesis: Block) -> Self {
        let mut digest_index = HashSet::new();
        digest_index.extend(genesis.tx_map.keys().copied());
        Self {
            blocks: vec![genesis],
            digest_index,
            accounts: HashMap::new(),
        }
    }
}

impl ChainStore for InMemoryStorage {
    fn append_block(&mut self, block: Block) -> Result<(), StorageError> {
        let tip = self.blocks.last().expect("genesis always present");
        let expected_prev = block_hash(tip, 0);
        let expected_id = tip.block_id + 1;

        if block.prev_hash != expected_prev || block.block_id != expected_id {
            return Err(StorageError::NonMonotonicAppend {
                block_id: block.block_id,
                expected: expected_prev,
                got: block.prev_hash.clone(),
            });
        }

        self.digest_index.extend(block.tx_map.keys().copied());
        self.blocks.push(block);
        sequencer_metrics::record_block_committed(
            self.blocks.last().map(|b| b.tx_map.len()).unwrap_or(0),
        );
        Ok(())
    }

    fn tip(&self) -> Block {
        self.blocks.last().expect("genesis always present").clone()
    }

    fn get_block(&self, block_id: u64) -> Result<Block, StorageError> {
        self.blocks
            .get(block_id as usize)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn committed_digests(&self) -> HashSet<Hash> {
        self.digest_index.clone()
    }

    fn contains_digest(&self, digest: &Hash) -> bool {
        self.digest_index.contains(digest)
    }
}

impl AccountStore for InMemoryStorage {
    fn balance(&self, account: &AccountKey) -> u64 {
        self.accounts.get(account).copied().unwrap_or(0)
    }

    fn set_balance(&mut self, account: AccountKey, amount: u64) {
        self.accounts.insert(account, amount);
    }

    fn apply_transfer(&mut self, tx: &FinancialTx) -> Result<(), StorageError> {
        let balance = self.balance(&tx.from);
        if balance < tx.amount {
            return Err(StorageError::InsufficientBalance {
                account: tx.from.clone(),
                balance,
                needed: tx.amount,
            });
        }
        *self.accounts.entry(tx.from.clone()).or_insert(0) -= tx.amount;
        *self.accounts.entry(tx.to.clone()).or_insert(0) += tx.amount;
        Ok(())
    }
}

/// Sled-backed storage for operators who want the chain to survive a
/// restart. The consensus core itself never requires this — it treats
/// `ChainStore`/`AccountStore` as an opaque trait object.
pub struct SledStorage {
    db: sled::Db,
    blocks: sled::Tree,
    digest_index: sled::Tree,
    accounts: sled::Tree,
}

impl SledStorage {
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        let blocks = db
            .open_tree("blocks")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let digest_index = db
            .open_tree("digest_index")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let accounts = db
            .open_tree("accounts")
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let storage = Self {
            db,
            blocks,
            digest_index,
            accounts,
        };
        if storage.blocks.is_empty() {
            storage.put_block_raw(&Block::genesis())?;
        }
        Ok(storage)
    }

    fn put_block_raw(&self, block: &Block) -> Result<(), StorageError> {
        let key = block.block_id.to_be_bytes();
        let value = bincode::serialize(block).map_err(|e| StorageError::Backend(e.to_string()))?;
        self.blocks
            .insert(key, value)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        for digest in block.tx_map.keys() {
            self.digest_index
                .insert(digest.to_hex(), &[])
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    fn height(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }
}

impl ChainStore for SledStorage {
    fn append_block(&mut self, block: Block) -> Result<(), StorageError> {
        let start = Instant::now();
        let tip = self.tip();
        let expected_prev = block_hash(&tip, 0);
        let expected_id = tip.block_id + 1;

        if block.prev_hash != expected_prev || block.block_id != expected_id {
            return Err(StorageError::NonMonotonicAppend {
                block_id: block.block_id,
                expected: expected_prev,
                got: block.prev_hash.clone(),
            });
        }

        self.put_block_raw(&block)?;
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        sequencer_metrics::record_storage_op_duration_ms("sled_append_block", elapsed);
        sequencer_metrics::record_block_committed(block.tx_map.len());
        Ok(())
    }

    fn tip(&self) -> Block {
        self.get_block(self.height()).expect("genesis always present")
    }

    fn get_block(&self, block_id: u64) -> Result<Block, StorageError> {
        let key = block_id.to_be_bytes();
        let bytes = self
            .blocks
            .get(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .ok_or(StorageError::NotFound)?;
        bincode::deserialize(&bytes).map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn committed_digests(&self) -> HashSet<Hash> {
        self.digest_index
            .iter()
            .keys()
            .filter_map(|k| k.ok())
            .filter_map(|k| std::str::from_utf8(&k).ok().and_then(Hash::from_hex))
            .collect()
    }

    fn contains_digest(&self, digest: &Hash) -> bool {
        self.digest_index
            .contains_key(digest.to_hex())
            .unwrap_or(false)
    }
}

impl AccountStore for SledStorage {
    fn balance(&self, account: &AccountKey) -> u64 {
        self.accounts
            .get(account.0.as_bytes())
            .ok()
            .flatten()
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(0)
    }

    fn set_balance(&mut self, account: AccountKey, amount: u64) {
        let _ = self
            .accounts
            .insert(account.0.as_bytes(), &amount.to_be_bytes());
    }

    fn apply_transfer(&mut self, tx: &FinancialTx) -> Result<(), StorageError> {
        let balance = self.balance(&tx.from);
        if balance < tx.amount {
            return Err(StorageError::InsufficientBalance {
                account: tx.from.clone(),
                balance,
                needed: tx.amount,
            });
        }
        self.set_balance(tx.from.clone(), balance - tx.amount);
        let to_balance = self.balance(&tx.to);
        self.set_balance(tx.to.clone(), to_balance + tx.amount);
        Ok(())
    }
}

impl Drop for SledStorage {
    fn drop(&mut self) {
        let _ = self.db.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use types::{Transaction, TxUid};

    fn make_financial(uid: &str, from: &str, to: &str, amount: u64) -> Transaction {
        Transaction::Financial(FinancialTx {
            uid: TxUid(uid.as_bytes().to_vec()),
            from: AccountKey(from.to_string()),
            to: AccountKey(to.to_string()),
            amount,
            signature: vec![],
        })
    }

    fn next_block(tip: &Block, txs: Vec<Transaction>) -> Block {
        let mut tx_map = HashMap::new();
        for tx in txs {
            tx_map.insert(tx.digest(), tx);
        }
        Block {
            block_id: tip.block_id + 1,
            prev_hash: block_hash(tip, 0),
            tx_map,
            merkle_root: None,
            ml: None,
        }
    }

    #[test]
    fn genesis_has_literal_prev_hash_and_zero_id() {
        let store = InMemoryStorage::with_genesis(Block::genesis());
        let tip = store.tip();
        assert_eq!(tip.block_id, 0);
        assert_eq!(tip.prev_hash, GENESIS_PREV_HASH);
    }

    #[test]
    fn append_accepts_monotonic_successor() {
        let mut store = InMemoryStorage::with_genesis(Block::genesis());
        let tip = store.tip();
        let tx = make_financial("uid-1", "A", "B", 5);
        let block = next_block(&tip, vec![tx]);

        store.append_block(block).unwrap();
        assert_eq!(store.tip().block_id, 1);
    }

    #[test]
    fn append_rejects_wrong_block_id() {
        let mut store = InMemoryStorage::with_genesis(Block::genesis());
        let tip = store.tip();
        let mut block = next_block(&tip, vec![]);
        block.block_id = 99;

        let err = store.append_block(block).unwrap_err();
        assert!(matches!(err, StorageError::NonMonotonicAppend { .. }));
    }

    #[test]
    fn committed_digests_grow_monotonically() {
        let mut store = InMemoryStorage::with_genesis(Block::genesis());
        let tip = store.tip();
        let tx = make_financial("uid-1", "A", "B", 5);
        let digest = tx.digest();
        let block = next_block(&tip, vec![tx]);
        store.append_block(block).unwrap();

        assert!(store.contains_digest(&digest));
        assert!(store.committed_digests().contains(&digest));
    }

    #[test]
    fn apply_transfer_moves_balance() {
        let mut store = InMemoryStorage::default();
        store.set_balance(AccountKey("A".into()), 10);

        let tx = FinancialTx {
            uid: TxUid(b"uid-1".to_vec()),
            from: AccountKey("A".into()),
            to: AccountKey("B".into()),
            amount: 4,
            signature: vec![],
        };
        store.apply_transfer(&tx).unwrap();

        assert_eq!(store.balance(&AccountKey("A".into())), 6);
        assert_eq!(store.balance(&AccountKey("B".into())), 4);
    }

    #[test]
    fn apply_transfer_rejects_insufficient_balance() {
        let mut store = InMemoryStorage::default();
        store.set_balance(AccountKey("A".into()), 1);

        let tx = FinancialTx {
            uid: TxUid(b"uid-1".to_vec()),
            from: AccountKey("A".into()),
            to: AccountKey("B".into()),
            amount: 4,
            signature: vec![],
        };
        let err = store.apply_transfer(&tx).unwrap_err();
        assert!(matches!(err, StorageError::InsufficientBalance { .. }));
    }

    #[test]
    fn sled_chain_and_account_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SledStorage::open(dir.path()).unwrap();

        let tip = store.tip();
        assert_eq!(tip.block_id, 0);

        let tx = make_financial("uid-1", "A", "B", 3);
        let digest = tx.digest();
        let block = next_block(&tip, vec![tx]);
        store.append_block(block).unwrap();

        assert_eq!(store.tip().block_id, 1);
        assert!(store.contains_digest(&digest));

        store.set_balance(AccountKey("A".into()), 10);
        assert_eq!(store.balance(&AccountKey("A".into())), 10);
    }

    proptest! {
        #[test]
        fn in_memory_append_chain_stays_monotonic(lengths in proptest::collection::vec(0usize..3, 0..8)) {
            let mut store = InMemoryStorage::with_genesis(Block::genesis());
            let mut counter = 0u64;
            for n in lengths {
                let tip = store.tip();
                let txs: Vec<Transaction> = (0..n)
                    .map(|_| {
                        counter += 1;
                        make_financial(&format!("uid-{counter}"), "A", "B", 1)
                    })
                    .collect();
                let block = next_block(&tip, txs);
                let expected_id = tip.block_id + 1;
                store.append_block(block).unwrap();
                prop_assert_eq!(store.tip().block_id, expected_id);
            }
        }
    }
}
