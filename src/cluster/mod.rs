//! Background roles: liveness probing, elections, leader replication,
//! catch-up sync, and periodic time synchronization. One task per role;
//! every task swallows and logs network errors and stops on shutdown.

pub mod detector;

pub use detector::FailureDetector;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use raft::{AppendEntriesResponse, VoteResponse};
use storage::{IncomingMessage, Message};
use timesync::{offset_sample, unix_now};

use crate::node::Node;
use crate::rpc;

/// How often the election deadline is checked.
const ELECTION_POLL: Duration = Duration::from_millis(50);

pub fn spawn_background(
    node: Arc<Node>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(heartbeat_loop(node.clone(), shutdown.clone())),
        tokio::spawn(election_loop(node.clone(), shutdown.clone())),
        tokio::spawn(leader_loop(node.clone(), shutdown.clone())),
        tokio::spawn(catchup_loop(node.clone(), shutdown.clone())),
        tokio::spawn(timesync_loop(node, shutdown)),
    ]
}

/// Sleep for `period` unless shutdown fires first. Returns true on
/// shutdown.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        _ = shutdown.changed() => true,
    }
}

async fn heartbeat_loop(node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if wait_or_shutdown(&mut shutdown, node.config.heartbeat_interval).await {
            break;
        }
        probe_peers(&node).await;
    }
}

async fn probe_peers(node: &Arc<Node>) {
    let peers = node.config.peers.clone();
    if peers.is_empty() {
        return;
    }
    let probes = peers.iter().map(|peer| {
        let client = node.http.clone();
        let url = format!("{}/heartbeat", peer);
        async move {
            rpc::get_json::<serde_json::Value>(&client, &url, rpc::HEARTBEAT_TIMEOUT)
                .await
                .is_ok()
        }
    });
    let results = join_all(probes).await;

    let now = unix_now();
    let mut inner = node.state();
    for (peer, ok) in peers.iter().zip(results) {
        if ok {
            inner.detector.mark_alive(peer, now);
        }
    }
    for failed in inner.detector.check_failures(now) {
        warn!("peer {} marked as failed, heartbeat timeout exceeded", failed);
    }
}

async fn election_loop(node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if wait_or_shutdown(&mut shutdown, ELECTION_POLL).await {
            break;
        }
        election_tick(&node).await;
    }
}

async fn election_tick(node: &Arc<Node>) {
    let request = {
        let mut guard = node.state();
        let inner = &mut *guard;
        if !inner.raft.election_due(Instant::now()) {
            return;
        }
        match inner.raft.start_election(Instant::now(), &mut inner.store) {
            Ok(request) => request,
            Err(err) => {
                error!("failed to start election: {}", err);
                return;
            }
        }
    };
    // a single-node group wins outright and returns no request
    let Some(request) = request else { return };

    let votes = node.config.peers.iter().map(|peer| {
        let client = node.http.clone();
        let url = format!("{}/request_vote", peer);
        let request = request.clone();
        async move {
            rpc::post_json::<_, VoteResponse>(&client, &url, &request, rpc::VOTE_TIMEOUT).await
        }
    });
    let replies = join_all(votes).await;

    let mut guard = node.state();
    let inner = &mut *guard;
    for reply in replies.into_iter().flatten() {
        match inner.raft.record_vote(Instant::now(), &reply, &mut inner.store) {
            Ok(true) => break,
            Ok(false) => {}
            Err(err) => {
                error!("failed to record vote: {}", err);
                break;
            }
        }
    }
}

async fn leader_loop(node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    let interval = node.config.raft.heartbeat_interval;
    loop {
        if wait_or_shutdown(&mut shutdown, interval).await {
            break;
        }
        replication_tick(&node).await;
    }
}

/// One leader heartbeat: ship the next pending batch (or an empty
/// leadership assertion) to every peer and settle the round.
async fn replication_tick(node: &Arc<Node>) {
    let request = {
        let mut guard = node.state();
        let inner = &mut *guard;
        match inner.raft.heartbeat_batch(&mut inner.store) {
            Ok(request) => request,
            Err(err) => {
                error!("failed to assemble heartbeat batch: {}", err);
                return;
            }
        }
    };
    let Some(request) = request else { return };

    let appends = node.config.peers.iter().map(|peer| {
        let client = node.http.clone();
        let url = format!("{}/append_entries", peer);
        let request = request.clone();
        async move {
            rpc::post_json::<_, AppendEntriesResponse>(&client, &url, &request, rpc::APPEND_TIMEOUT)
                .await
        }
    });
    let replies: Vec<AppendEntriesResponse> = join_all(appends)
        .await
        .into_iter()
        .flatten()
        .collect();

    let successes = replies.iter().filter(|reply| reply.success).count();
    let highest_term = replies.iter().map(|reply| reply.term).max().unwrap_or(0);

    let mut guard = node.state();
    let inner = &mut *guard;
    if let Err(err) =
        inner
            .raft
            .record_append_round(Instant::now(), successes, highest_term, &mut inner.store)
    {
        error!("failed to settle replication round: {}", err);
    }
}

#[derive(Deserialize)]
struct ReplicateReply {
    status: String,
}

/// Fire-and-forget fan-out to every alive peer. Failures flip the peer
/// down in the detector.
pub async fn replicate_to_peers(node: Arc<Node>, message: Message) {
    let peers = node.state().detector.alive_peers();
    if peers.is_empty() {
        return;
    }
    let body = json!({ "msg": message });
    let sends = peers.iter().map(|peer| {
        let client = node.http.clone();
        let url = format!("{}/replicate", peer);
        let body = body.clone();
        async move {
            rpc::post_json::<_, ReplicateReply>(&client, &url, &body, rpc::REPLICATION_TIMEOUT)
                .await
        }
    });
    let results = join_all(sends).await;

    let mut inner = node.state();
    for (peer, result) in peers.iter().zip(results) {
        if result.is_err() {
            warn!("replication to {} failed, marking as down", peer);
            inner.detector.mark_down(peer);
        }
    }
}

/// Quorum replication: returns true once `quorum` acknowledgments exist,
/// counting the local write.
pub async fn replicate_with_quorum(node: &Arc<Node>, message: &Message) -> bool {
    let needed = node.config.replication_quorum;
    let mut acks = 1;
    if acks >= needed {
        return true;
    }

    let peers = node.state().detector.alive_peers();
    let body = json!({ "msg": message });
    let sends = peers.iter().map(|peer| {
        let client = node.http.clone();
        let url = format!("{}/replicate", peer);
        let body = body.clone();
        async move {
            rpc::post_json::<_, ReplicateReply>(&client, &url, &body, rpc::REPLICATION_TIMEOUT)
                .await
        }
    });
    for result in join_all(sends).await {
        if matches!(&result, Ok(reply) if reply.status == "ok") {
            acks += 1;
            if acks >= needed {
                info!("replication quorum achieved: {}/{}", acks, needed);
                return true;
            }
        }
    }
    warn!("replication quorum not achieved: {}/{}", acks, needed);
    false
}

async fn catchup_loop(node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    loop {
        catch_up(&node).await;
        if wait_or_shutdown(&mut shutdown, node.config.catchup_interval).await {
            break;
        }
    }
}

#[derive(Deserialize)]
struct SyncReply {
    #[serde(default)]
    messages: Vec<Message>,
}

/// Pull anything newer than the local log end from peers and apply it.
/// Runs at startup and on a fixed cadence; `msg_id` dedup keeps it
/// convergent alongside consensus replication.
pub async fn catch_up(node: &Arc<Node>) {
    let (since, targets) = {
        let mut guard = node.state();
        let inner = &mut *guard;
        let since = match inner.store.max_seq() {
            Ok(since) => since,
            Err(err) => {
                error!("catch-up skipped: {}", err);
                return;
            }
        };
        let alive = inner.detector.alive_peers();
        let targets = if alive.is_empty() {
            node.config.peers.clone()
        } else {
            alive
        };
        (since, targets)
    };

    let mut recovered = 0usize;
    for peer in targets {
        let url = format!("{}/sync", peer);
        let reply: Result<SyncReply, rpc::RpcError> =
            rpc::post_json(&node.http, &url, &json!({ "since": since }), rpc::SYNC_TIMEOUT).await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                debug!("catch-up with {} failed: {}", peer, err);
                continue;
            }
        };
        for message in reply.messages {
            match node.apply_replicated(IncomingMessage::from(message)) {
                Ok((_, true)) => recovered += 1,
                Ok((_, false)) => {}
                Err(err) => {
                    error!("catch-up apply failed: {}", err);
                    break;
                }
            }
        }
    }
    if recovered > 0 {
        info!("caught up {} messages from peers", recovered);
        node.state().metrics.last_recovery_time = Some(unix_now());
    }
}

async fn timesync_loop(node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if wait_or_shutdown(&mut shutdown, node.config.time_sync_interval).await {
            break;
        }
        sync_round(&node).await;
    }
}

#[derive(Deserialize)]
struct TimeReply {
    server_receive_time: f64,
    server_send_time: f64,
}

/// One NTP-style round against every alive peer; medians become the new
/// offset and delay estimates, and the drift analyzer and corrector are
/// refreshed from the result.
pub async fn sync_round(node: &Arc<Node>) -> bool {
    let peers = {
        let mut inner = node.state();
        inner.time.sync.record_attempt();
        inner.detector.alive_peers()
    };
    if peers.is_empty() {
        warn!("no alive peers available for time synchronization");
        return false;
    }

    let probes = peers.iter().map(|peer| {
        let client = node.http.clone();
        let url = format!("{}/time", peer);
        async move {
            let t1 = unix_now();
            let reply = rpc::get_json::<TimeReply>(&client, &url, rpc::SYNC_TIMEOUT).await;
            let t4 = unix_now();
            reply
                .ok()
                .and_then(|reply| {
                    offset_sample(t1, reply.server_receive_time, reply.server_send_time, t4)
                })
        }
    });
    let results = join_all(probes).await;

    let now = unix_now();
    let mut guard = node.state();
    let inner = &mut *guard;
    let mut samples = Vec::new();
    for (peer, result) in peers.iter().zip(results) {
        match result {
            Some(sample) => samples.push((peer.clone(), sample)),
            None => {
                debug!("marking peer {} down after failed time sync", peer);
                inner.detector.mark_down(peer);
            }
        }
    }

    if !inner.time.sync.apply_round(&samples, now) {
        return false;
    }

    let offset = inner.time.sync.clock_offset();
    inner.time.skew.record_offset(offset, now);
    for (peer, sample) in &samples {
        inner.time.skew.record_peer_offset(peer, sample.offset, now);
        inner.time.corrector.update_peer_data(peer, sample.offset, sample.delay);
    }
    let drift = inner.time.skew.drift_rate();
    let delay = inner.time.sync.network_delay();
    let accuracy = inner.time.sync.sync_accuracy();
    let history = inner.time.skew.sample_count();
    inner
        .time
        .corrector
        .update_sync_data(offset, drift, delay, accuracy, history, now);
    true
}
