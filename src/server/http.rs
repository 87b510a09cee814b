//! The HTTP surface: JSON endpoints for clients, consensus RPCs, catch-up,
//! time synchronization, and the ordering buffer.
//!
//! Handlers are thin: they decode the request, route it to the event loop
//! (or to a shared snapshot), and encode the response. Field names are
//! lowercase snake_case and stable.

use super::{ClientRequest, Detector, NodeStatus, RpcRequest, SyncResponse};
use crate::error::Error;
use crate::raft::{
    AppendRequest, AppendResponse, Entry, Index, Message, SendReceipt, Term, VoteRequest,
    VoteResponse,
};
use crate::store::{MessagePage, MessageQuery};
use crate::time::{now, Clock, Corrector};

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub node_id: String,
    pub client_tx: mpsc::UnboundedSender<ClientRequest>,
    pub rpc_tx: mpsc::UnboundedSender<RpcRequest>,
    pub clock: Clock,
    pub corrector: Corrector,
    pub detector: Arc<Detector>,
    pub client: reqwest::Client,
    pub send_timeout: Duration,
}

/// Builds the router over all endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Client surface.
        .route("/send", post(send))
        .route("/messages", get(messages))
        .route("/status", get(status))
        // Liveness and catch-up.
        .route("/heartbeat", get(heartbeat))
        .route("/sync", post(sync))
        .route("/replicate", post(replicate))
        // Consensus RPCs.
        .route("/request_vote", post(request_vote))
        .route("/append_entries", post(append_entries))
        // Time subsystem.
        .route("/time", get(time))
        .route("/time/sync", post(time_sync))
        .route("/time/correct", post(time_correct))
        .route("/time/stats", get(time_stats))
        // Ordering buffer.
        .route("/ordering/status", get(ordering_status))
        .route("/ordering/force_delivery", post(ordering_force_delivery))
        .with_state(state)
}

/// An API error: a crate error mapped onto a status code and a structured
/// JSON body.
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let reason = self.0.to_string();
        let body = json!({ "status": "error", "error": self.0.kind(), "reason": reason });
        match self.0 {
            Error::NotLeader { leader: Some(url) } => (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, format!("{url}/send"))],
                Json(json!({ "leader_url": url, "reason": "not_leader" })),
            )
                .into_response(),
            Error::NotLeader { leader: None } | Error::Abort | Error::QuorumUnreachable => {
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
            Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, Json(body)).into_response(),
            Error::InvalidData(_) | Error::IO(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Routes a client request to the event loop and awaits the reply.
async fn roundtrip<T>(
    client_tx: &mpsc::UnboundedSender<ClientRequest>,
    make: impl FnOnce(oneshot::Sender<T>) -> ClientRequest,
) -> ApiResult<T> {
    let (tx, rx) = oneshot::channel();
    client_tx.send(make(tx)).map_err(Error::from)?;
    Ok(rx.await.map_err(Error::from)?)
}

#[derive(Deserialize)]
struct SendBody {
    payload: String,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default)]
    msg_id: Option<String>,
    #[serde(default, alias = "ts")]
    original_ts: Option<f64>,
}

#[derive(Serialize)]
struct SendResponse {
    status: &'static str,
    seq: Index,
    msg_id: String,
    corrected_ts: f64,
}

/// POST /send: submit a message. Leaders accept it per the replication
/// mode; followers redirect to the leader.
async fn send(
    State(state): State<AppState>,
    Json(body): Json<SendBody>,
) -> ApiResult<Json<SendResponse>> {
    let message = Message {
        msg_id: body.msg_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        sender: body.sender,
        recipient: body.recipient,
        payload: body.payload,
        original_ts: body.original_ts.unwrap_or_else(now),
    };

    let (tx, rx) = oneshot::channel();
    state.client_tx.send(ClientRequest::Send { message, tx }).map_err(Error::from)?;

    // The reply arrives when the dispatch policy is satisfied. A sync_quorum
    // write that can't reach its quorum within the deadline fails with a
    // retryable error; the entry may still commit later.
    let receipt: SendReceipt = match tokio::time::timeout(state.send_timeout, rx).await {
        Ok(reply) => reply.map_err(Error::from)??,
        Err(_) => return Err(Error::QuorumUnreachable.into()),
    };
    Ok(Json(SendResponse {
        status: "ok",
        seq: receipt.seq,
        msg_id: receipt.msg_id,
        corrected_ts: receipt.corrected_ts,
    }))
}

#[derive(Deserialize)]
struct MessagesParams {
    #[serde(default)]
    after: Index,
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    recipient: Option<String>,
}

/// GET /messages: applied messages in sequence order, filtered and
/// paginated.
async fn messages(
    State(state): State<AppState>,
    Query(params): Query<MessagesParams>,
) -> ApiResult<Json<MessagePage>> {
    let query = MessageQuery {
        after: params.after,
        limit: params.limit,
        sender: params.sender,
        recipient: params.recipient,
    };
    let page =
        roundtrip(&state.client_tx, |tx| ClientRequest::Query { query, tx }).await??;
    Ok(Json(page))
}

/// GET /status: the full node status.
async fn status(State(state): State<AppState>) -> ApiResult<Json<NodeStatus>> {
    let status = roundtrip(&state.client_tx, |tx| ClientRequest::Status { tx }).await??;
    Ok(Json(status))
}

/// GET /heartbeat: a cheap liveness probe, independent of consensus.
async fn heartbeat(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "node_id": state.node_id, "time": now() }))
}

#[derive(Deserialize)]
struct SyncBody {
    #[serde(default)]
    after: Index,
}

/// POST /sync: committed entries after the given sequence number, for
/// catch-up pulls.
async fn sync(
    State(state): State<AppState>,
    Json(body): Json<SyncBody>,
) -> ApiResult<Json<SyncResponse>> {
    let response =
        roundtrip(&state.client_tx, |tx| ClientRequest::SyncEntries { after: body.after, tx })
            .await??;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct ReplicateBody {
    term: Term,
    entries: Vec<Entry>,
}

/// POST /replicate: ingest pre-formed committed entries (a catch-up push).
async fn replicate(
    State(state): State<AppState>,
    Json(body): Json<ReplicateBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let commit_index = roundtrip(&state.client_tx, |tx| ClientRequest::Replicate {
        term: body.term,
        entries: body.entries,
        tx,
    })
    .await??;
    Ok(Json(json!({ "status": "ok", "commit_index": commit_index })))
}

/// POST /request_vote: consensus RPC.
async fn request_vote(
    State(state): State<AppState>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<Json<VoteResponse>> {
    let resp = roundtrip_rpc(&state.rpc_tx, |tx| RpcRequest::Vote(req, tx)).await?;
    Ok(Json(resp))
}

/// POST /append_entries: consensus RPC.
async fn append_entries(
    State(state): State<AppState>,
    Json(req): Json<AppendRequest>,
) -> ApiResult<Json<AppendResponse>> {
    let resp = roundtrip_rpc(&state.rpc_tx, |tx| RpcRequest::Append(req, tx)).await?;
    Ok(Json(resp))
}

/// Routes a consensus RPC to the event loop and awaits the response.
async fn roundtrip_rpc<T>(
    rpc_tx: &mpsc::UnboundedSender<RpcRequest>,
    make: impl FnOnce(oneshot::Sender<T>) -> RpcRequest,
) -> ApiResult<T> {
    let (tx, rx) = oneshot::channel();
    rpc_tx.send(make(tx)).map_err(Error::from)?;
    Ok(rx.await.map_err(Error::from)?)
}

/// GET /time: the NTP exchange endpoint. Returns receive/send timestamps
/// for offset and delay calculation, plus the synchronized clock reading.
async fn time(State(state): State<AppState>) -> Json<serde_json::Value> {
    let server_receive_time = now();
    let synchronized_time = state.clock.synchronized_time();
    let stats = state.clock.stats();
    let server_send_time = now();
    Json(json!({
        "server_receive_time": server_receive_time,
        "server_send_time": server_send_time,
        "synchronized_time": synchronized_time,
        "node_id": state.node_id,
        "is_synchronized": state.clock.is_synchronized(),
        "clock_offset": stats.clock_offset,
        "sync_accuracy": stats.sync_accuracy,
        "last_sync_time": stats.last_sync_time,
    }))
}

/// POST /time/sync: manually trigger a synchronization round against alive
/// peers.
async fn time_sync(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let peers = state.detector.alive_peers();
    let ok = state.clock.synchronize(&state.client, &peers).await.map_err(ApiError)?;
    Ok(Json(json!({
        "status": if ok { "ok" } else { "degraded" },
        "sync_status": state.clock.stats(),
    })))
}

#[derive(Deserialize)]
struct CorrectBody {
    timestamp: f64,
}

/// POST /time/correct: validate and correct a timestamp.
async fn time_correct(
    State(state): State<AppState>,
    Json(body): Json<CorrectBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let corrected = state.corrector.correct(body.timestamp).map_err(ApiError)?;
    Ok(Json(json!({
        "status": "ok",
        "original_timestamp": body.timestamp,
        "corrected_timestamp": corrected,
        "correction": {
            "applied_offset": corrected - body.timestamp,
            "magnitude": (corrected - body.timestamp).abs(),
        },
    })))
}

/// GET /time/stats: the full time-synchronization snapshot.
async fn time_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "time_synchronization": state.clock.stats(),
        "timestamp_correction": state.corrector.stats(),
    }))
}

/// GET /ordering/status: the ordering buffer snapshot.
async fn ordering_status(State(state): State<AppState>) -> ApiResult<Json<crate::ordering::Stats>> {
    let stats =
        roundtrip(&state.client_tx, |tx| ClientRequest::OrderingStatus { tx }).await?;
    Ok(Json(stats))
}

/// POST /ordering/force_delivery: flush the ordering buffer.
async fn ordering_force_delivery(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let released =
        roundtrip(&state.client_tx, |tx| ClientRequest::ForceDelivery { tx }).await??;
    Ok(Json(json!({ "status": "ok", "released": released })))
}
