//! Ambient HTTP surface for the node: not a spec feature, but the minimal
//! observability/operability surface a runnable node needs (spec §1 scopes
//! raw transport plumbing out, but says nothing against a read/submit
//! surface sitting alongside it — carried from the teacher's existing
//! `/health` + `/metrics` handlers and extended with transaction submission
//! and chain queries so the node is operable without raw socket tooling).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use consensus::Node;
use mempool::Mempool;
use serde::Serialize;
use storage::{AccountStore, ChainStore};
use tracing::info;
use types::{Block, Transaction};

/// Shared state handed to every handler: just the node itself. Kept as a
/// thin wrapper (rather than handing `Arc<Node<M, S>>` directly to Axum as
/// state) so additional ambient fields can be added later without changing
/// handler signatures.
pub struct RpcState<M, S>
where
    M: Mempool + Send + 'static,
    S: ChainStore + AccountStore + Send + 'static,
{
    pub node: Arc<Node<M, S>>,
}

impl<M, S> RpcState<M, S>
where
    M: Mempool + Send + 'static,
    S: ChainStore + AccountStore + Send + 'static,
{
    pub fn new(node: Arc<Node<M, S>>) -> Arc<Self> {
        Arc::new(Self { node })
    }
}

#[derive(Serialize)]
pub struct SubmitTxResponse {
    pub digest: String,
}

#[derive(Serialize)]
pub struct ChainHeightResponse {
    pub height: u64,
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn metrics_handler() -> impl IntoResponse {
    let body = metrics::render_metrics();
    ([("Content-Type", "text/plain; version=0.0.4")], body)
}

/// `POST /tx` — submit a transaction (either flavor; the payload decides,
/// per spec §3 "two flavors exist"). Goes through the same gated
/// acceptance path as a gossiped `ADD_TRANSACTION` (spec §4.4.5).
async fn submit_tx_handler<M, S>(
    State(state): State<Arc<RpcState<M, S>>>,
    Json(tx): Json<Transaction>,
) -> Json<SubmitTxResponse>
where
    M: Mempool + Send + 'static,
    S: ChainStore + AccountStore + Send + 'static,
{
    let digest = tx.digest();
    state.node.submit_tx(tx).await;
    Json(SubmitTxResponse {
        digest: digest.to_hex(),
    })
}

/// `GET /chain/height` — the current chain tip's `block_id`.
async fn chain_height_handler<M, S>(
    State(state): State<Arc<RpcState<M, S>>>,
) -> Json<ChainHeightResponse>
where
    M: Mempool + Send + 'static,
    S: ChainStore + AccountStore + Send + 'static,
{
    Json(ChainHeightResponse {
        height: state.node.chain_height().await,
    })
}

/// `GET /chain/block/:id` — a committed block by id, 404 if not yet
/// appended.
async fn chain_block_handler<M, S>(
    State(state): State<Arc<RpcState<M, S>>>,
    Path(block_id): Path<u64>,
) -> Result<Json<Block>, axum::http::StatusCode>
where
    M: Mempool + Send + 'static,
    S: ChainStore + AccountStore + Send + 'static,
{
    state
        .node
        .get_block(block_id)
        .await
        .map(Json)
        .ok_or(axum::http::StatusCode::NOT_FOUND)
}

pub fn router<M, S>(state: Arc<RpcState<M, S>>) -> Router
where
    M: Mempool + Send + Sync + 'static,
    S: ChainStore + AccountStore + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/tx", post(submit_tx_handler::<M, S>))
        .route("/chain/height", get(chain_height_handler::<M, S>))
        .route("/chain/block/:id", get(chain_block_handler::<M, S>))
        .with_state(state)
}

/// Bind and serve the HTTP surface on `addr`, returning once the listener
/// fails (the caller typically spawns this as a background task).
pub async fn run_rpc_server<M, S>(
    state: Arc<RpcState<M, S>>,
    addr: std::net::SocketAddr,
) -> std::io::Result<()>
where
    M: Mempool + Send + Sync + 'static,
    S: ChainStore + AccountStore + Send + Sync + 'static,
{
    let app = router(state);
    info!(%addr, "starting RPC server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
