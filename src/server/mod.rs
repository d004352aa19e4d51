//! The node's HTTP surface: producer/consumer endpoints, consensus RPCs,
//! catch-up sync, and the time/ordering observability endpoints.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use raft::{AppendEntriesRequest, VoteRequest};
use storage::{IncomingMessage, Message, MessageFilter};
use timesync::unix_now;

use crate::cluster;
use crate::node::{Node, ReplicationMode, SendDecision};

pub fn router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/send", post(send))
        .route("/replicate", post(replicate))
        .route("/heartbeat", get(heartbeat))
        .route("/request_vote", post(request_vote))
        .route("/append_entries", post(append_entries))
        .route("/sync", post(sync_since))
        .route("/messages", get(messages))
        .route("/status", get(status))
        .route("/time", get(time_probe))
        .route("/clock", get(clock_status))
        .route("/time/stats", get(time_stats))
        .route("/time/sync", post(time_sync_trigger))
        .route("/time/correct", post(time_correct))
        .route("/time/reset", post(time_reset))
        .route("/ordering/status", get(ordering_status))
        .route("/ordering/force_delivery", post(force_delivery))
        .layer(cors)
        .with_state(node)
}

/// Bind and serve until the shutdown signal fires.
pub async fn serve(node: Arc<Node>, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    let addr = format!("{}:{}", node.config.host, node.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("node {} listening on {}", node.config.node_id, addr);
    axum::serve(listener, router(node))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

fn error_response(code: StatusCode, reason: impl Into<String>) -> Response {
    (
        code,
        Json(json!({ "status": "error", "reason": reason.into() })),
    )
        .into_response()
}

fn bad_request(reason: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "bad_request", "reason": reason })),
    )
        .into_response()
}

/// Producer ingress. Non-leaders redirect when a leader is known;
/// otherwise the message is stored, queued for consensus, and replicated
/// per the configured mode.
async fn send(State(node): State<Arc<Node>>, Json(incoming): Json<IncomingMessage>) -> Response {
    let decision = match node.accept_send(incoming) {
        Ok(decision) => decision,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let (message, _inserted) = match decision {
        SendDecision::Redirect { leader_url } => {
            let body = json!({
                "status": "redirect",
                "leader_url": leader_url,
                "reason": "node_is_not_leader",
            });
            let mut response = (StatusCode::TEMPORARY_REDIRECT, Json(body)).into_response();
            if let Ok(location) = HeaderValue::from_str(&leader_url) {
                response.headers_mut().insert(header::LOCATION, location);
            }
            return response;
        }
        SendDecision::Stored { message, inserted } => (message, inserted),
    };

    match node.config.replication_mode {
        ReplicationMode::Async => {
            if !node.config.peers.is_empty() {
                tokio::spawn(cluster::replicate_to_peers(node.clone(), message.clone()));
            }
            node.commit(message.seq);
        }
        ReplicationMode::SyncQuorum => {
            if cluster::replicate_with_quorum(&node, &message).await {
                node.commit(message.seq);
            } else {
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "replication quorum not achieved",
                );
            }
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "seq": message.seq,
            "msg_id": message.msg_id,
            "corrected_ts": message.corrected_ts,
            "original_ts": message.original_ts,
            "correction": message.correction_metadata,
        })),
    )
        .into_response()
}

#[derive(Deserialize)]
struct ReplicateBody {
    msg: Option<IncomingMessage>,
}

/// Follower ingest: idempotent store, immediate commit on insert.
async fn replicate(State(node): State<Arc<Node>>, Json(body): Json<ReplicateBody>) -> Response {
    let Some(incoming) = body.msg else {
        return bad_request("missing msg");
    };
    match node.apply_replicated(incoming) {
        Ok((message, _)) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "seq": message.seq, "msg_id": message.msg_id })),
        )
            .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn heartbeat(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node_id": node.config.node_id,
        "time": unix_now(),
    }))
}

async fn request_vote(
    State(node): State<Arc<Node>>,
    Json(request): Json<VoteRequest>,
) -> Response {
    match node.handle_request_vote(&request) {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn append_entries(
    State(node): State<Arc<Node>>,
    Json(request): Json<AppendEntriesRequest<Message>>,
) -> Response {
    match node.handle_append_entries(&request) {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Deserialize)]
struct SyncBody {
    #[serde(default)]
    since: i64,
}

/// Catch-up sync: everything after `since`, committed or not.
async fn sync_since(State(node): State<Arc<Node>>, Json(body): Json<SyncBody>) -> Response {
    match node.messages_since(body.since.max(0) as u64) {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Consumer read of the committed stream.
async fn messages(
    State(node): State<Arc<Node>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let limit = match params.get("limit") {
        None => 50,
        Some(raw) => match raw.parse::<i64>() {
            Ok(limit) if limit > 0 => limit as usize,
            _ => return bad_request("limit must be positive integer"),
        },
    };
    let after_seq = match params.get("after") {
        None => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(after) => Some(after.max(0) as u64),
            Err(_) => return bad_request("after must be integer"),
        },
    };
    let filter = MessageFilter {
        limit: Some(limit),
        after_seq,
        sender: params.get("sender").cloned(),
        recipient: params.get("recipient").cloned(),
    };
    match node.committed_messages(&filter) {
        Ok(messages) => {
            let next_after = messages.last().map(|m| m.seq).or(after_seq);
            Json(json!({ "messages": messages, "next_after": next_after })).into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn status(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(node.status())
}

/// NTP peer endpoint: the four-timestamp exchange's server side.
async fn time_probe(State(node): State<Arc<Node>>) -> Json<Value> {
    let server_receive_time = unix_now();
    let (synchronized_time, is_synchronized, clock_offset, sync_accuracy, last_sync_time) = {
        let inner = node.state();
        let sync = &inner.time.sync;
        (
            sync.synchronized_time(server_receive_time),
            sync.is_synchronized(server_receive_time),
            sync.clock_offset(),
            sync.sync_accuracy(),
            sync.last_sync_time(),
        )
    };
    let server_send_time = unix_now();
    Json(json!({
        "server_receive_time": server_receive_time,
        "server_send_time": server_send_time,
        "synchronized_time": synchronized_time,
        "local_time": server_send_time,
        "node_id": node.config.node_id,
        "is_synchronized": is_synchronized,
        "clock_offset": clock_offset,
        "sync_accuracy": sync_accuracy,
        "last_sync_time": last_sync_time,
    }))
}

async fn clock_status(State(node): State<Arc<Node>>) -> Json<Value> {
    let now = unix_now();
    let inner = node.state();
    Json(json!({
        "current_time": now,
        "node_id": node.config.node_id,
        "synchronized_time": inner.time.sync.synchronized_time(now),
        "time_synchronization": inner.time.sync.status(now),
        "clock_skew_analysis": inner.time.skew.statistics(),
        "timestamp_correction": inner.time.corrector.statistics(),
        "message_ordering": inner.time.buffer.status(now),
    }))
}

async fn time_stats(State(node): State<Arc<Node>>) -> Json<Value> {
    let now = unix_now();
    let inner = node.state();
    let sync_status = inner.time.sync.status(now);
    let correction = inner.time.corrector.statistics();
    let buffer = inner.time.buffer.status(now);

    let mut stats = json!({
        "timestamp": now,
        "node_id": node.config.node_id,
        "synchronization": {
            "is_synchronized": sync_status.synchronized,
            "success_rate": sync_status.success_rate,
            "attempts": sync_status.sync_attempts,
            "successful": sync_status.successful_syncs,
            "current_offset": sync_status.clock_offset,
            "accuracy": sync_status.sync_accuracy,
            "peer_count": sync_status.peer_offsets.len(),
        },
        "timestamp_correction": {
            "corrections_applied": correction.corrections_applied,
            "average_magnitude": correction.average_correction_magnitude,
            "max_magnitude": correction.max_correction_magnitude,
            "method": correction.current_method,
        },
        "message_ordering": {
            "buffer_size": buffer.buffer_size,
            "utilization": buffer.buffer_utilization,
            "reordered": buffer.messages_reordered,
            "delivered": buffer.messages_delivered,
            "reorder_rate": buffer.reorder_rate,
            "average_age": buffer.average_message_age,
        },
    });
    if let Some(skew) = inner.time.skew.statistics() {
        stats["clock_skew"] = json!({
            "current_skew": skew.current_skew,
            "drift_rate": skew.drift_rate,
            "measurements": skew.measurements,
            "std_deviation": skew.std_deviation,
            "acceptable": skew.acceptable,
            "recommended_sync_interval": inner.time.skew.recommend_sync_interval(),
        });
    }
    Json(json!({ "status": "ok", "statistics": stats }))
}

/// Operator action: run a synchronization round right now.
async fn time_sync_trigger(State(node): State<Arc<Node>>) -> Response {
    let success = cluster::sync_round(&node).await;
    let sync_status = {
        let inner = node.state();
        inner.time.sync.status(unix_now())
    };
    if success {
        Json(json!({
            "status": "ok",
            "message": "Time synchronization completed",
            "sync_status": sync_status,
        }))
        .into_response()
    } else {
        (
            StatusCode::PARTIAL_CONTENT,
            Json(json!({
                "status": "partial",
                "message": "Time synchronization completed with limited success",
                "sync_status": sync_status,
            })),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct CorrectBody {
    timestamp: Option<f64>,
    sender: Option<String>,
}

async fn time_correct(State(node): State<Arc<Node>>, Json(body): Json<CorrectBody>) -> Response {
    let Some(timestamp) = body.timestamp else {
        return bad_request("missing timestamp parameter");
    };
    let mut guard = node.state();
    let corrector = &mut guard.time.corrector;
    if let Err(reason) = corrector.validate_timestamp(timestamp, unix_now()) {
        return bad_request(&format!("invalid timestamp: {}", reason));
    }
    let (corrected, info) = corrector.correct(timestamp, body.sender.as_deref());
    let accuracy = corrector.estimate_accuracy(corrected, timestamp, body.sender.as_deref());
    Json(json!({
        "status": "ok",
        "original_timestamp": timestamp,
        "corrected_timestamp": corrected,
        "correction_info": info,
        "estimated_accuracy": accuracy,
    }))
    .into_response()
}

async fn time_reset(State(node): State<Arc<Node>>) -> Json<Value> {
    let mut inner = node.state();
    inner.time.corrector.reset_statistics();
    inner.time.skew.reset();
    Json(json!({
        "status": "ok",
        "message": "Reset 2 statistics modules",
        "timestamp": unix_now(),
    }))
}

async fn ordering_status(State(node): State<Arc<Node>>) -> Json<Value> {
    let now = unix_now();
    let mut guard = node.state();
    let inner = &mut *guard;
    let deliverable = inner.time.buffer.get_deliverable(now);
    inner.metrics.record_deliveries(&deliverable, now);
    let samples: Vec<Value> = deliverable
        .iter()
        .take(5)
        .map(|message| {
            json!({
                "msg_id": message.msg_id,
                "corrected_timestamp": message.corrected_ts,
                "original_timestamp": message.original_ts,
                "sender": message.sender,
            })
        })
        .collect();
    let mut status = serde_json::to_value(inner.time.buffer.status(now)).unwrap_or_default();
    status["deliverable_messages_count"] = json!(deliverable.len());
    if !samples.is_empty() {
        status["sample_deliverable_messages"] = json!(samples);
    }
    Json(json!({ "status": "ok", "ordering_status": status }))
}

/// Operator action: flush the reordering buffer unconditionally.
async fn force_delivery(State(node): State<Arc<Node>>) -> Json<Value> {
    let now = unix_now();
    let mut guard = node.state();
    let inner = &mut *guard;
    let delivered = inner.time.buffer.force_deliver_all(now);
    inner.metrics.record_deliveries(&delivered, now);
    let listing: Vec<Value> = delivered
        .iter()
        .map(|message| {
            json!({
                "msg_id": message.msg_id,
                "corrected_timestamp": message.corrected_ts,
                "sender": message.sender,
                "recipient": message.recipient,
            })
        })
        .collect();
    Json(json!({
        "status": "ok",
        "message": "All buffered messages forced for delivery",
        "delivered_count": delivered.len(),
        "delivered_messages": listing,
    }))
}
