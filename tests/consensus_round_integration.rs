//! End-to-end consensus round scenarios (spec §8's "end-to-end scenarios"),
//! driven over real TCP sockets between several in-process nodes rather
//! than through any in-memory shortcut — this is the same `Node` and
//! `networking::serve` stack `src/main.rs` runs.

use std::sync::Arc;
use std::time::Duration;

use consensus::{genesis_for_flavor, Flavor, Node, NodeConfig};
use ed25519_dalek::SigningKey;
use mempool::SimpleMempool;
use networking::{serve, MessageHandler, PublicKeyRegistry, TcpTransport, Transport};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use storage::{AccountStore, InMemoryStorage};
use types::{AccountKey, Address, FinancialTx, ModelData, MlTx, Transaction, TxUid};

type TestNode = Node<SimpleMempool, InMemoryStorage>;

fn derive_signing_key(seed: u64) -> SigningKey {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    SigningKey::generate(&mut rng)
}

async fn spin_up_node(
    index: usize,
    global_peers: Vec<Address>,
    flavor: Flavor,
    quorum_size: usize,
    minimum_transactions: usize,
    seed_balances: &[(&str, u64)],
) -> Arc<TestNode> {
    spin_up_node_maybe_malicious(index, global_peers, flavor, quorum_size, minimum_transactions, seed_balances, false)
        .await
}

#[allow(clippy::too_many_arguments)]
async fn spin_up_node_maybe_malicious(
    index: usize,
    global_peers: Vec<Address>,
    flavor: Flavor,
    quorum_size: usize,
    minimum_transactions: usize,
    seed_balances: &[(&str, u64)],
    is_malicious: bool,
) -> Arc<TestNode> {
    let config = NodeConfig {
        address: global_peers[index].clone(),
        global_peers: global_peers.clone(),
        flavor,
        num_nodes: global_peers.len(),
        quorum_size,
        minimum_transactions,
        max_peers: global_peers.len(),
        is_malicious,
        phase_wait_timeout: Duration::from_secs(5),
        phase_poll_interval: Duration::from_millis(20),
        skeleton_reconstruction_timeout: Duration::from_secs(5),
        ..NodeConfig::default()
    };

    let mut storage = InMemoryStorage::with_genesis(genesis_for_flavor(flavor));
    for (account, amount) in seed_balances {
        storage.set_balance(AccountKey((*account).to_string()), *amount);
    }

    let registry = PublicKeyRegistry::new();
    for (i, peer) in global_peers.iter().enumerate() {
        registry.write_public_key(peer.clone(), derive_signing_key(i as u64).verifying_key());
    }

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport);
    let node = Arc::new(Node::new(
        config,
        SimpleMempool::with_default_config(),
        storage,
        transport,
        registry,
        derive_signing_key(index as u64),
    ));

    let listen_addr: std::net::SocketAddr =
        format!("{}:{}", node.config.address.host, node.config.address.port)
            .parse()
            .unwrap();
    let dispatch_node = Arc::clone(&node);
    tokio::spawn(async move {
        let handler: MessageHandler = Arc::new(move |msg| {
            let node = Arc::clone(&dispatch_node);
            Box::pin(async move { node.dispatch(msg).await })
        });
        let _ = serve(listen_addr, handler).await;
    });

    node
}

async fn wait_for_height(nodes: &[Arc<TestNode>], height: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let mut settled = true;
            for node in nodes {
                if node.chain_height().await < height {
                    settled = false;
                    break;
                }
            }
            if settled {
                return;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    })
    .await
    .expect("nodes did not reach the expected height in time");
}

fn financial_tx(uid: &str, from: &str, to: &str, amount: u64) -> Transaction {
    Transaction::Financial(FinancialTx {
        uid: TxUid(uid.as_bytes().to_vec()),
        from: AccountKey(from.to_string()),
        to: AccountKey(to.to_string()),
        amount,
        signature: vec![],
    })
}

/// Spec §8 end-to-end scenario 1: 4 nodes, `QUORUM_SIZE = 3`,
/// `MINIMUM_TRANSACTIONS = 2`. A→B(5) and B→C(3) against {A:10,B:0,C:0}
/// should settle to {A:5,B:2,C:3} in block 1, with every node — including
/// the one node excluded from this round's quorum, which only learns
/// about the block from a gossiped skeleton — converging on the same
/// chain and an empty mempool.
#[tokio::test]
async fn happy_financial_commit_reaches_every_node() {
    let base_port = 19_300u16;
    let global_peers: Vec<Address> = (0..4)
        .map(|i| Address::new("127.0.0.1", base_port + i as u16))
        .collect();

    let mut nodes = Vec::new();
    for i in 0..4 {
        nodes.push(
            spin_up_node(
                i,
                global_peers.clone(),
                Flavor::Financial,
                3,
                2,
                &[("A", 10), ("B", 0), ("C", 0)],
            )
            .await,
        );
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    nodes[0].submit_tx(financial_tx("uid-ab", "A", "B", 5)).await;
    nodes[0].submit_tx(financial_tx("uid-bc", "B", "C", 3)).await;

    wait_for_height(&nodes, 1).await;

    for node in &nodes {
        assert_eq!(node.chain_height().await, 1);
        assert_eq!(node.mempool_len().await, 0, "mempool should be drained on commit");
        assert_eq!(node.balance(&AccountKey("A".into())).await, 5);
        assert_eq!(node.balance(&AccountKey("B".into())).await, 2);
        assert_eq!(node.balance(&AccountKey("C".into())).await, 3);

        let block = node.get_block(1).await.expect("block 1 committed");
        assert_eq!(block.tx_map.len(), 2);
        assert!(block.merkle_root.is_some());
    }
}

/// Spec §8 end-to-end scenario 2: 5 nodes, `QUORUM_SIZE = 5` (full
/// membership), one `ModelData` with every interval valid and no
/// malicious nodes. Expected: every interval comes back valid and
/// `all_valid` is set.
#[tokio::test]
async fn ml_commit_with_all_intervals_valid() {
    let base_port = 19_400u16;
    let global_peers: Vec<Address> = (0..5)
        .map(|i| Address::new("127.0.0.1", base_port + i as u16))
        .collect();

    let mut nodes = Vec::new();
    for i in 0..5 {
        nodes.push(spin_up_node(i, global_peers.clone(), Flavor::Ml, 5, 1, &[]).await);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let model = ModelData {
        model_bytes: vec![1, 2, 3, 4],
        intervals_validity: vec![true, true, true, true],
    };
    let tx = Transaction::Ml(MlTx {
        uid: TxUid(b"model-1".to_vec()),
        model,
        signature: vec![],
    });
    nodes[0].submit_tx(tx).await;

    wait_for_height(&nodes, 1).await;

    for node in &nodes {
        let block = node.get_block(1).await.expect("block 1 committed");
        let ml = block.ml.expect("ml extension present for ml flavor");
        assert!(ml.all_valid);
        assert_eq!(ml.interval_validations.len(), 4);
        assert!(ml.interval_validations.values().all(|v| *v));
    }
}

/// Spec §8 end-to-end scenario 3: same as scenario 2, but one node is
/// configured `is_malicious` and inverts its verdict on every interval it is
/// assigned. Every interval still gets a majority of honest votes, so
/// `all_valid` stays `true` and the malicious votes are simply outvoted.
#[tokio::test]
async fn ml_commit_outvotes_single_malicious_node() {
    let base_port = 19_450u16;
    let global_peers: Vec<Address> = (0..5)
        .map(|i| Address::new("127.0.0.1", base_port + i as u16))
        .collect();

    let mut nodes = Vec::new();
    for i in 0..5 {
        nodes.push(
            spin_up_node_maybe_malicious(i, global_peers.clone(), Flavor::Ml, 5, 1, &[], i == 2).await,
        );
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let model = ModelData {
        model_bytes: vec![1, 2, 3, 4],
        intervals_validity: vec![true, true, true, true],
    };
    let tx = Transaction::Ml(MlTx {
        uid: TxUid(b"model-2".to_vec()),
        model,
        signature: vec![],
    });
    nodes[0].submit_tx(tx).await;

    wait_for_height(&nodes, 1).await;

    for node in &nodes {
        let block = node.get_block(1).await.expect("block 1 committed");
        let ml = block.ml.expect("ml extension present for ml flavor");
        assert!(ml.all_valid, "honest majority should outvote the single malicious node");
        assert_eq!(ml.interval_validations.len(), 4);
    }
}
