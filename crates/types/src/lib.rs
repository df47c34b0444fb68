use std::collections::HashMap;
use std::fmt;

use blake3::Hasher;
use serde::{Deserialize, Serialize};

/// A node identity: `(host, port)`. Equality is structural and this is used
/// as a map key and as the input to the public-key registry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Fixed-size hash used across the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(#[serde(with = "serde_bytes_array")] pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hex-encoded digest, as used for `prev_hash` and block signing.
    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex_decode(s)?;
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Some(Hash(out))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hex digest string used for genesis's literal `prev_hash`.
pub const GENESIS_PREV_HASH: &str = "000000";

/// Opaque, stable transaction identifier. The mempool key is the blake3
/// digest of these bytes, not the bytes themselves.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxUid(#[serde(with = "serde_bytes_vec")] pub Vec<u8>);

impl TxUid {
    pub fn digest(&self) -> Hash {
        hash_bytes(&self.0)
    }
}

/// Balances live under opaque account keys; the financial flavor moves
/// value between them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountKey(pub String);

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A financial-flavor transaction: moves `amount` from `from` to `to`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialTx {
    pub uid: TxUid,
    pub from: AccountKey,
    pub to: AccountKey,
    pub amount: u64,
    #[serde(with = "serde_bytes_vec")]
    pub signature: Vec<u8>,
}

/// Opaque model payload for the ML flavor. `intervals_validity` bounds the
/// interval index space: interval `i` is independently re-checkable
/// against `intervals_validity[i]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelData {
    #[serde(with = "serde_bytes_vec")]
    pub model_bytes: Vec<u8>,
    pub intervals_validity: Vec<bool>,
}

/// An ML-flavor transaction: submits a model for quorum re-validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlTx {
    pub uid: TxUid,
    pub model: ModelData,
    #[serde(with = "serde_bytes_vec")]
    pub signature: Vec<u8>,
}

/// The two payload flavors. Both expose a stable UID; everything else
/// about the payload is opaque to consensus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    Financial(FinancialTx),
    Ml(MlTx),
}

impl Transaction {
    pub fn uid(&self) -> &TxUid {
        match self {
            Transaction::Financial(tx) => &tx.uid,
            Transaction::Ml(tx) => &tx.uid,
        }
    }

    pub fn digest(&self) -> Hash {
        self.uid().digest()
    }

    pub fn as_financial(&self) -> Option<&FinancialTx> {
        match self {
            Transaction::Financial(tx) => Some(tx),
            _ => None,
        }
    }

    pub fn as_ml(&self) -> Option<&MlTx> {
        match self {
            Transaction::Ml(tx) => Some(tx),
            _ => None,
        }
    }
}

/// Per-interval validity map produced by the interval validator.
pub type IntervalValidations = HashMap<u32, bool>;

/// ML-flavor-only extension to a block: the outcome of the interval
/// validation sub-protocol for the model submitted in this block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlBlockExt {
    pub interval_validations: IntervalValidations,
    pub all_valid: bool,
}

impl MlBlockExt {
    pub fn genesis() -> Self {
        Self {
            interval_validations: HashMap::new(),
            all_valid: true,
        }
    }
}

/// A block on the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_id: u64,
    pub prev_hash: String,
    pub tx_map: HashMap<Hash, Transaction>,
    /// Set once, on append; `None` for an in-construction candidate block.
    pub merkle_root: Option<Hash>,
    pub ml: Option<MlBlockExt>,
}

impl Block {
    pub fn genesis() -> Self {
        Self {
            block_id: 0,
            prev_hash: GENESIS_PREV_HASH.to_string(),
            tx_map: HashMap::new(),
            merkle_root: None,
            ml: None,
        }
    }

    pub fn genesis_ml() -> Self {
        Self {
            ml: Some(MlBlockExt::genesis()),
            ..Self::genesis()
        }
    }

    /// Transaction digests, in a stable (sorted) order. Insertion order into
    /// `tx_map` is not load-bearing: any node that reconciles to the same
    /// digest set must derive the same order from it.
    pub fn ordered_tx_digests(&self) -> Vec<Hash> {
        let mut digests: Vec<Hash> = self.tx_map.keys().copied().collect();
        digests.sort_by(|a, b| a.0.cmp(&b.0));
        digests
    }
}

/// `(signer, block_hash, signature_bytes)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    pub signer: Address,
    pub block_hash: String,
    #[serde(with = "serde_bytes_vec")]
    pub signature: Vec<u8>,
}

/// The compact commit record broadcast to non-quorum peers so they can
/// assemble the same block locally from their own mempool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSkeleton {
    pub block_id: u64,
    pub tx_digests: Vec<Hash>,
    pub signatures: Vec<BlockSignature>,
    pub block_hash: String,
    pub interval_validations: IntervalValidations,
    pub all_valid: bool,
}

/// Deterministic block-hash contract shared by quorum derivation, signing,
/// and skeleton validation. `nonce` is part of the wire contract: all
/// honest nodes must compute the same digest for the same `(block, nonce)`.
pub fn block_hash(block: &Block, nonce: u64) -> String {
    let digests = block.ordered_tx_digests();

    #[derive(Serialize)]
    struct Hashed<'a> {
        block_id: u64,
        prev_hash: &'a str,
        tx_digests: Vec<Hash>,
        nonce: u64,
    }

    let hashed = Hashed {
        block_id: block.block_id,
        prev_hash: &block.prev_hash,
        tx_digests: digests,
        nonce,
    };

    let encoded = bincode::serialize(&hashed).expect("block hash input should serialize");
    hash_bytes(&encoded).to_hex()
}

/// Merkle proof for a transaction's inclusion in a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub index: u32,
    pub siblings: Vec<Hash>,
}

fn combine(a: &Hash, b: &Hash) -> Hash {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(&a.0);
    data.extend_from_slice(&b.0);
    hash_bytes(&data)
}

/// Compute a Merkle root over a block's (ordered) transaction digests.
/// Empty input yields a zero hash.
pub fn merkle_root(digests: &[Hash]) -> Hash {
    if digests.is_empty() {
        return Hash::ZERO;
    }

    let mut layer: Vec<Hash> = digests.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for chunk in layer.chunks(2) {
            let combined = if chunk.len() == 2 {
                combine(&chunk[0], &chunk[1])
            } else {
                combine(&chunk[0], &chunk[0])
            };
            next.push(combined);
        }
        layer = next;
    }

    layer[0]
}

/// Build a Merkle proof for the leaf at `index`.
pub fn merkle_proof(digests: &[Hash], index: usize) -> Option<MerkleProof> {
    if digests.is_empty() || index >= digests.len() {
        return None;
    }

    let mut idx = index;
    let mut layer: Vec<Hash> = digests.to_vec();
    let mut siblings = Vec::new();

    while layer.len() > 1 {
        let is_right = idx % 2 == 1;
        let sibling_idx = if is_right { idx - 1 } else { idx + 1 };
        let sibling_hash = if sibling_idx < layer.len() {
            layer[sibling_idx]
        } else {
            layer[idx]
        };
        siblings.push(sibling_hash);
        idx /= 2;

        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for chunk in layer.chunks(2) {
            let combined = if chunk.len() == 2 {
                combine(&chunk[0], &chunk[1])
            } else {
                combine(&chunk[0], &chunk[0])
            };
            next.push(combined);
        }
        layer = next;
    }

    Some(MerkleProof {
        index: index as u32,
        siblings,
    })
}

/// Verify that a transaction digest is included in a tree with the given
/// root.
pub fn verify_merkle_proof(root: Hash, leaf: Hash, proof: &MerkleProof) -> bool {
    let mut hash = leaf;
    let mut idx = proof.index as usize;

    for sibling in &proof.siblings {
        hash = if idx % 2 == 0 {
            combine(&hash, sibling)
        } else {
            combine(sibling, &hash)
        };
        idx /= 2;
    }

    hash == root
}

pub fn hash_bytes(data: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(hasher.finalize().as_bytes());
    Hash(out)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

mod serde_bytes_array {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = [u8; 32];

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "a 32-byte hash")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != 32 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut out = [0u8; 32];
                out.copy_from_slice(v);
                Ok(out)
            }
        }

        deserializer.deserialize_bytes(Visitor)
    }
}

mod serde_bytes_vec {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "a byte vector")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(v.to_vec())
            }
        }

        deserializer.deserialize_bytes(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_financial(uid: &str, from: &str, to: &str, amount: u64) -> Transaction {
        Transaction::Financial(FinancialTx {
            uid: TxUid(uid.as_bytes().to_vec()),
            from: AccountKey(from.to_string()),
            to: AccountKey(to.to_string()),
            amount,
            signature: vec![],
        })
    }

    #[test]
    fn hash_bytes_is_deterministic() {
        let h1 = hash_bytes(b"hello world");
        let h2 = hash_bytes(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_bytes_is_sensitive_to_input() {
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
    }

    #[test]
    fn tx_digest_is_uid_hash_not_whole_tx() {
        let tx1 = make_financial("uid-1", "A", "B", 5);
        let mut tx2 = tx1.clone();
        if let Transaction::Financial(ref mut f) = tx2 {
            f.amount = 999; // same uid, different payload
        }
        assert_eq!(tx1.digest(), tx2.digest());
    }

    #[test]
    fn genesis_has_literal_prev_hash() {
        let genesis = Block::genesis();
        assert_eq!(genesis.prev_hash, GENESIS_PREV_HASH);
        assert_eq!(genesis.block_id, 0);
        assert!(genesis.tx_map.is_empty());
    }

    #[test]
    fn genesis_ml_all_valid_and_empty() {
        let genesis = Block::genesis_ml();
        let ml = genesis.ml.expect("ml extension present");
        assert!(ml.all_valid);
        assert!(ml.interval_validations.is_empty());
    }

    #[test]
    fn block_hash_is_deterministic_and_nonce_sensitive() {
        let mut block = Block::genesis();
        let tx = make_financial("uid-1", "A", "B", 5);
        block.tx_map.insert(tx.digest(), tx);
        let h1 = block_hash(&block, 0);
        let h2 = block_hash(&block, 0);
        assert_eq!(h1, h2);

        let h3 = block_hash(&block, 1);
        assert_ne!(h1, h3);
    }

    #[test]
    fn merkle_root_empty_is_zero() {
        assert_eq!(merkle_root(&[]), Hash::ZERO);
    }

    #[test]
    fn merkle_proof_roundtrip() {
        let txs: Vec<Hash> = (0u8..5)
            .map(|i| make_financial(&format!("uid-{i}"), "A", "B", i as u64).digest())
            .collect();

        let root = merkle_root(&txs);
        for (idx, digest) in txs.iter().enumerate() {
            let proof = merkle_proof(&txs, idx).expect("proof exists");
            assert!(verify_merkle_proof(root, *digest, &proof));
        }
    }

    #[test]
    fn hash_hex_roundtrip() {
        let h = hash_bytes(b"roundtrip");
        let hex = h.to_hex();
        assert_eq!(Hash::from_hex(&hex), Some(h));
    }
}
