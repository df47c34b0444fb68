use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use consensus::{genesis_for_flavor, Flavor, Node, NodeConfig};
use ed25519_dalek::SigningKey;
use mempool::SimpleMempool;
use metrics as sequencer_metrics;
use networking::{heartbeat_loop, serve, MessageHandler, PublicKeyRegistry, TcpTransport, Transport};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rpc::{run_rpc_server, RpcState};
use storage::InMemoryStorage;
use tokio::time::Duration;
use tracing::{error, info, Level};
use types::Address;

type NodeHandle = Arc<Node<SimpleMempool, InMemoryStorage>>;

/// Key-pair generation is an external collaborator out of scope for this
/// crate (spec §1/§6). For this single-machine bootstrap, each peer's
/// signing key is derived deterministically from its position in
/// `global_peers`, so every node can populate the public-key registry
/// without a live out-of-band exchange channel.
fn derive_signing_key(index: u64) -> SigningKey {
    let mut rng = ChaCha8Rng::seed_from_u64(index);
    SigningKey::generate(&mut rng)
}

/// Env-var-driven bootstrap, following the teacher's `main.rs` pattern,
/// extended into a typed `NodeConfig` (spec §6 "Configuration") rather than
/// the teacher's hardcoded two-node demo table.
fn load_config() -> (NodeConfig, usize, SocketAddr) {
    let index: usize = env::var("NODE_INDEX")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let num_nodes: usize = env::var("NUM_NODES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    let quorum_size: usize = env::var("QUORUM_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3);
    let minimum_transactions: usize = env::var("MINIMUM_TRANSACTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    let max_peers: usize = env::var("MAX_PEERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8);
    let base_port: u16 = env::var("BASE_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9000);
    let rpc_base_port: u16 = env::var("RPC_BASE_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let is_malicious = env::var("IS_MALICIOUS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let flavor = match env::var("USE").unwrap_or_else(|_| "Defi".to_string()).as_str() {
        "ML" | "ml" => Flavor::Ml,
        _ => Flavor::Financial,
    };

    let global_peers: Vec<Address> = (0..num_nodes)
        .map(|i| Address::new("127.0.0.1", base_port + i as u16))
        .collect();
    let address = global_peers
        .get(index)
        .cloned()
        .unwrap_or_else(|| Address::new("127.0.0.1", base_port));

    let config = NodeConfig {
        address,
        global_peers,
        flavor,
        num_nodes,
        quorum_size,
        minimum_transactions,
        max_peers,
        is_malicious,
        ..NodeConfig::default()
    };

    let rpc_addr: SocketAddr = format!("127.0.0.1:{}", rpc_base_port + index as u16)
        .parse()
        .expect("rpc address always parses");

    (config, index, rpc_addr)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    // Install global metrics recorder; metrics are exposed via the RPC server.
    sequencer_metrics::init_metrics()?;

    let (config, index, rpc_addr) = load_config();
    info!(address = %config.address, flavor = ?config.flavor, quorum_size = config.quorum_size, "starting consensus node");

    let genesis = genesis_for_flavor(config.flavor);
    let storage = InMemoryStorage::with_genesis(genesis);
    let mempool = SimpleMempool::with_default_config();
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport);
    let registry = PublicKeyRegistry::new();

    let signing_key = derive_signing_key(index as u64);
    for (i, peer) in config.global_peers.iter().enumerate() {
        let peer_key = derive_signing_key(i as u64);
        registry.write_public_key(peer.clone(), peer_key.verifying_key());
    }

    let node: NodeHandle = Arc::new(Node::new(
        config.clone(),
        mempool,
        storage,
        Arc::clone(&transport),
        registry,
        signing_key,
    ));

    let listen_addr: SocketAddr = format!("{}:{}", config.address.host, config.address.port).parse()?;
    let serve_node = Arc::clone(&node);
    tokio::spawn(async move {
        let handler: MessageHandler = Arc::new(move |msg| {
            let node = Arc::clone(&serve_node);
            Box::pin(async move { node.dispatch(msg).await })
        });
        if let Err(e) = serve(listen_addr, handler).await {
            error!(error = %e, "networking server exited");
        }
    });

    let heartbeat_peers = Arc::new(std::sync::RwLock::new(config.local_peers()));
    tokio::spawn(heartbeat_loop(
        Arc::clone(&transport),
        heartbeat_peers,
        Duration::from_secs(10),
    ));

    let rpc_state = RpcState::new(Arc::clone(&node));
    tokio::spawn(async move {
        if let Err(e) = run_rpc_server(rpc_state, rpc_addr).await {
            error!(error = %e, "RPC server exited");
        }
    });

    info!(%rpc_addr, "node bootstrapped; awaiting transactions and peer traffic");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    Ok(())
}
