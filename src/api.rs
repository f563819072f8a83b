use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::errors::{ChainError, ChainResult};
use crate::node::{NodeHandle, NodeStatus};
use crate::proofs::{
    AccountTxInfo, BalanceMerkleInfo, FeeInfo, RecentTxMerkleInfo, TxMerkleInfo,
    UpdatedAccountsInfo,
};
use crate::types::{Account, Block, Debt, SignedTransaction};

#[derive(Clone)]
struct AppState {
    node: NodeHandle,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    hash: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    address: String,
}

#[derive(Serialize)]
struct RootResponse {
    root: String,
}

#[derive(Serialize)]
struct CreatorResponse {
    creator: String,
}

#[derive(Serialize)]
struct SignatureResponse {
    signature: String,
}

#[derive(Serialize)]
struct BlockInfoResponse {
    data: String,
}

#[derive(Serialize)]
struct RelayIntervalResponse {
    relay_interval: u64,
}

type HandlerResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub async fn serve(node: NodeHandle, addr: SocketAddr) -> ChainResult<()> {
    let state = AppState { node };
    let router = Router::new()
        .route("/health", get(health))
        .route("/status", get(node_status))
        .route("/transactions", post(submit_transaction))
        .route("/debts", post(submit_debt))
        .route("/blocks/latest", get(latest_block))
        .route("/blocks/:height", get(block_by_height))
        .route("/accounts/:address", get(account_info))
        .route("/subchain/blockCreator/:height", get(block_creator))
        .route("/subchain/balanceTreeRoot/:height", get(balance_tree_root))
        .route("/subchain/txTreeRoot/:height", get(tx_tree_root))
        .route("/subchain/blockSignature/:height", get(block_signature))
        .route("/subchain/blockInfoForStem/:height", get(block_info_for_stem))
        .route("/subchain/txMerkleInfo/:hash", get(tx_merkle_info))
        .route(
            "/subchain/balanceMerkleInfo/:address/:height",
            get(balance_merkle_info),
        )
        .route("/subchain/recentTxTreeRoot/:height", get(recent_tx_tree_root))
        .route(
            "/subchain/recentTxMerkleInfo/:address/:height",
            get(recent_tx_merkle_info),
        )
        .route("/subchain/accountTx/:address/:start/:end", get(account_tx))
        .route(
            "/subchain/updatedAccountInfo/:height",
            get(updated_account_info),
        )
        .route("/subchain/fee/:height", get(fee))
        .route("/subchain/relayInterval", get(relay_interval))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "RPC server listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| ChainError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        address: state.node.address().to_string(),
    })
}

async fn node_status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.node.status())
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(tx): Json<SignedTransaction>,
) -> HandlerResult<SubmitResponse> {
    state
        .node
        .submit_transaction(tx)
        .map(|hash| Json(SubmitResponse { hash }))
        .map_err(to_http_error)
}

async fn submit_debt(
    State(state): State<AppState>,
    Json(debt): Json<Debt>,
) -> HandlerResult<SubmitResponse> {
    state
        .node
        .submit_debt(debt)
        .map(|hash| Json(SubmitResponse { hash }))
        .map_err(to_http_error)
}

async fn latest_block(State(state): State<AppState>) -> HandlerResult<Option<Block>> {
    state.node.latest_block().map(Json).map_err(to_http_error)
}

async fn block_by_height(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> HandlerResult<Option<Block>> {
    state.node.get_block(height).map(Json).map_err(to_http_error)
}

async fn account_info(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> HandlerResult<Option<Account>> {
    state
        .node
        .get_account(&address)
        .map(Json)
        .map_err(to_http_error)
}

async fn block_creator(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> HandlerResult<CreatorResponse> {
    state
        .node
        .proof_service()
        .block_creator(height)
        .map(|creator| Json(CreatorResponse { creator }))
        .map_err(to_http_error)
}

async fn balance_tree_root(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> HandlerResult<RootResponse> {
    state
        .node
        .proof_service()
        .balance_tree_root(height)
        .map(|root| Json(RootResponse { root }))
        .map_err(to_http_error)
}

async fn tx_tree_root(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> HandlerResult<RootResponse> {
    state
        .node
        .proof_service()
        .tx_tree_root(height)
        .map(|root| Json(RootResponse { root }))
        .map_err(to_http_error)
}

async fn recent_tx_tree_root(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> HandlerResult<RootResponse> {
    state
        .node
        .proof_service()
        .recent_tx_tree_root(height)
        .map(|root| Json(RootResponse { root }))
        .map_err(to_http_error)
}

async fn block_signature(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> HandlerResult<SignatureResponse> {
    state
        .node
        .proof_service()
        .block_signature(height)
        .map(|signature| Json(SignatureResponse { signature }))
        .map_err(to_http_error)
}

async fn block_info_for_stem(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> HandlerResult<BlockInfoResponse> {
    state
        .node
        .proof_service()
        .block_info_for_stem(height)
        .map(|data| {
            Json(BlockInfoResponse {
                data: hex::encode(data),
            })
        })
        .map_err(to_http_error)
}

async fn tx_merkle_info(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> HandlerResult<TxMerkleInfo> {
    state
        .node
        .proof_service()
        .tx_merkle(&hash)
        .map(Json)
        .map_err(to_http_error)
}

async fn balance_merkle_info(
    State(state): State<AppState>,
    Path((address, height)): Path<(String, u64)>,
) -> HandlerResult<BalanceMerkleInfo> {
    state
        .node
        .proof_service()
        .balance_merkle(&address, height)
        .map(Json)
        .map_err(to_http_error)
}

async fn recent_tx_merkle_info(
    State(state): State<AppState>,
    Path((address, height)): Path<(String, u64)>,
) -> HandlerResult<RecentTxMerkleInfo> {
    state
        .node
        .proof_service()
        .recent_tx_merkle(&address, height)
        .map(Json)
        .map_err(to_http_error)
}

async fn account_tx(
    State(state): State<AppState>,
    Path((address, start, end)): Path<(String, u64, u64)>,
) -> HandlerResult<AccountTxInfo> {
    state
        .node
        .proof_service()
        .account_tx(&address, start, end)
        .map(Json)
        .map_err(to_http_error)
}

async fn updated_account_info(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> HandlerResult<UpdatedAccountsInfo> {
    state
        .node
        .proof_service()
        .updated_accounts(height)
        .map(Json)
        .map_err(to_http_error)
}

async fn fee(State(state): State<AppState>, Path(height): Path<u64>) -> HandlerResult<FeeInfo> {
    state
        .node
        .proof_service()
        .fee(height)
        .map(Json)
        .map_err(to_http_error)
}

async fn relay_interval(State(state): State<AppState>) -> Json<RelayIntervalResponse> {
    Json(RelayIntervalResponse {
        relay_interval: state.node.proof_service().relay_interval(),
    })
}

fn to_http_error(err: ChainError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        ChainError::NotFound(_) => StatusCode::NOT_FOUND,
        ChainError::Transaction(_)
        | ChainError::Debt(_)
        | ChainError::Config(_)
        | ChainError::RelayConstraint(_)
        | ChainError::InvalidHeaderExtra => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
