//! Transport, wire messages, and the public-key registry — the external
//! collaborators listed in spec §6. This crate knows nothing about
//! consensus phases; it only knows how to exchange `Message` values between
//! `Address`es and how to verify signatures against registered keys.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};
use types::{Address, BlockSignature, BlockSkeleton, Transaction};

/// The message kinds carried over the wire (spec §6). Wire format is
/// "opaque serialized objects" per the spec; this crate picks
/// length-prefixed `serde_json` frames over TCP as the concrete encoding,
/// the same choice the teacher's gossip channel already made for its
/// payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Message {
    Ping,
    AddTransaction(Transaction),
    QuorumReady,
    /// `Some((block_id, block_hash))` is the initial disagreement reply;
    /// `None` alongside a bare `block_id` the confirming reply — modeled as
    /// two variants to keep the wire format self-describing.
    ReconcileBlockFull { block_id: u64, block_hash: String },
    ReconcileBlockId { block_id: u64 },
    ReceiveMempoolRequest { digests: Vec<types::Hash> },
    ReceiveMempoolReply { txs: Vec<Transaction> },
    RequestTransaction { missing: Vec<types::Hash> },
    ReceiveSignature(BlockSignature),
    ReceiveSkeleton(BlockSkeleton),
    ReceiveIntervalValidation { interval_idx: u32, is_valid: bool },
    AlertWallet { account: String, proof_json: String },
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("peer {0} unreachable: {1}")]
    Unreachable(Address, String),
    #[error("peer {0} sent a malformed frame")]
    Malformed(Address),
    #[error("io error: {0}")]
    Io(String),
}

/// Two-way and one-way send primitives, abstracted behind a trait so the
/// consensus crate can be exercised against an in-process double in tests
/// without opening real sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_one_way(&self, to: &Address, msg: Message) -> Result<(), NetworkError>;
    async fn send_two_way(&self, to: &Address, msg: Message) -> Result<Message, NetworkError>;
}

fn to_socket_addr(addr: &Address) -> Result<SocketAddr, NetworkError> {
    format!("{}:{}", addr.host, addr.port)
        .parse()
        .map_err(|_| NetworkError::Unreachable(addr.clone(), "unparsable address".into()))
}

async fn write_frame(stream: &mut TcpStream, msg: &Message) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(msg).expect("Message always serializes");
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Message> {
    let len = stream.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// TCP-backed transport: one connection per logical exchange, matching the
/// source's synchronous blocking-socket exchange model (spec §5) adapted to
/// async I/O.
#[derive(Clone)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn send_one_way(&self, to: &Address, msg: Message) -> Result<(), NetworkError> {
        let socket_addr = to_socket_addr(to)?;
        let mut stream = TcpStream::connect(socket_addr)
            .await
            .map_err(|e| NetworkError::Unreachable(to.clone(), e.to_string()))?;
        write_frame(&mut stream, &msg)
            .await
            .map_err(|e| NetworkError::Io(e.to_string()))
    }

    async fn send_two_way(&self, to: &Address, msg: Message) -> Result<Message, NetworkError> {
        let socket_addr = to_socket_addr(to)?;
        let mut stream = TcpStream::connect(socket_addr)
            .await
            .map_err(|e| NetworkError::Unreachable(to.clone(), e.to_string()))?;
        write_frame(&mut stream, &msg)
            .await
            .map_err(|e| NetworkError::Io(e.to_string()))?;
        read_frame(&mut stream)
            .await
            .map_err(|_| NetworkError::Malformed(to.clone()))
    }
}

/// A handler invoked for each inbound connection. Returns `Some(reply)` for
/// two-way exchanges, `None` for one-way messages (no reply is written).
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<Option<Message>> + Send + Sync>;

/// Bind `listen_addr` and dispatch every inbound frame to `handler`,
/// spawning one short-lived worker task per connection (mirrors the
/// source's acceptor-thread-per-connection model, spec §5).
pub async fn serve(
    listen_addr: SocketAddr,
    handler: MessageHandler,
) -> Result<(), NetworkError> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| NetworkError::Io(e.to_string()))?;

    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let msg = match read_frame(&mut stream).await {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(%peer, error = %e, "dropping malformed frame");
                    return;
                }
            };
            if let Some(reply) = handler(msg).await {
                if let Err(e) = write_frame(&mut stream, &reply).await {
                    debug!(%peer, error = %e, "failed to write reply");
                }
            }
        });
    }
}

/// Periodically pings `local_peers`, matching the heartbeat thread in
/// spec §5. Transient failures are logged and otherwise ignored — the round
/// continues with whichever peers remain reachable.
pub async fn heartbeat_loop(
    transport: Arc<dyn Transport>,
    local_peers: Arc<RwLock<Vec<Address>>>,
    interval: Duration,
) {
    loop {
        let peers = local_peers.read().expect("peers lock poisoned").clone();
        for peer in peers {
            let transport = Arc::clone(&transport);
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.send_two_way(&peer, Message::Ping).await {
                    debug!(%peer, error = %e, "heartbeat failed");
                }
            });
        }
        sleep(interval).await;
    }
}

/// Injected process-wide key registry (spec §9: "inject them rather than
/// using file-scope globals"). Maps `Address -> VerifyingKey`.
#[derive(Default, Clone)]
pub struct PublicKeyRegistry {
    inner: Arc<RwLock<HashMap<Address, VerifyingKey>>>,
}

impl PublicKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_public_key(&self, addr: Address, key: VerifyingKey) {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .insert(addr, key);
    }

    pub fn lookup(&self, addr: &Address) -> Option<VerifyingKey> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(addr)
            .copied()
    }
}

/// Sign a hex-encoded block digest with a node's private key.
pub fn sign_hash(hash_hex: &str, signing_key: &SigningKey) -> Vec<u8> {
    signing_key.sign(hash_hex.as_bytes()).to_bytes().to_vec()
}

/// Verify a signature over a hex-encoded block digest against `addr`'s
/// registered public key. `false` on any malformed input or unknown
/// address — never panics, since this sits on the untrusted wire boundary.
pub fn verify_signature(
    hash_hex: &str,
    signature_bytes: &[u8],
    addr: &Address,
    registry: &PublicKeyRegistry,
) -> bool {
    let Some(key) = registry.lookup(addr) else {
        return false;
    };
    let Ok(sig_array): Result<[u8; 64], _> = signature_bytes.try_into() else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);
    key.verify(hash_hex.as_bytes(), &signature).is_ok()
}
