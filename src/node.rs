//! Node wiring: the durable log, consensus state, failure detector, and
//! time pipeline behind a single per-node mutex, plus message ingress.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use raft::{
    AppendEntriesRequest, AppendEntriesResponse, Consensus, Role, VoteRequest, VoteResponse,
};
use storage::{
    IncomingMessage, LogStore, Message, MessageFilter, PreparedMessage, StoreError,
};
use timesync::{
    unix_now, CausalOrderingManager, ClockSkewAnalyzer, MessageOrderingBuffer, TimeSync,
    TimedMessage, TimestampCorrector,
};

use crate::cluster::FailureDetector;

const METRIC_HISTORY: usize = 512;
const RECENT_DELIVERIES: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Fire-and-forget fan-out; the local commit advances immediately.
    Async,
    /// Wait for `quorum` acknowledgments (the local write counts as one)
    /// before committing.
    SyncQuorum,
}

impl ReplicationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMode::Async => "async",
            ReplicationMode::SyncQuorum => "sync_quorum",
        }
    }
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub node_id: String,
    /// Base URLs of every other node; fixed for the life of the process.
    pub peers: Vec<String>,
    pub replication_mode: ReplicationMode,
    pub replication_quorum: usize,
    pub db_path: PathBuf,
    pub raft: raft::Config,
    /// Cadence of liveness probes.
    pub heartbeat_interval: Duration,
    /// Seconds without a successful probe before a peer counts as down.
    pub heartbeat_timeout: f64,
    pub catchup_interval: Duration,
    pub time_sync_interval: Duration,
}

impl NodeConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        node_id: impl Into<String>,
        peers: Vec<String>,
    ) -> Self {
        NodeConfig {
            host: host.into(),
            port,
            node_id: node_id.into(),
            peers,
            replication_mode: ReplicationMode::Async,
            replication_quorum: 2,
            db_path: PathBuf::from(format!("messages.db.{}", port)),
            raft: raft::Config::default(),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: 6.0,
            catchup_interval: Duration::from_secs(5),
            time_sync_interval: Duration::from_secs(30),
        }
    }
}

/// The time-synchronization components, driven together by the sync loop.
pub struct TimePipeline {
    pub sync: TimeSync,
    pub skew: ClockSkewAnalyzer,
    pub corrector: TimestampCorrector,
    pub buffer: MessageOrderingBuffer,
    pub causal: CausalOrderingManager,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeliveredSummary {
    pub msg_id: String,
    pub corrected_ts: f64,
    pub sender: String,
}

/// Bounded operational metrics surfaced through `/status`.
#[derive(Default)]
pub struct DeliveryMetrics {
    store_latencies: VecDeque<f64>,
    correction_magnitudes: VecDeque<f64>,
    pub last_recovery_time: Option<f64>,
    pub last_delivery_time: Option<f64>,
    recent_deliveries: VecDeque<DeliveredSummary>,
}

impl DeliveryMetrics {
    fn push_latency(&mut self, latency: f64) {
        self.store_latencies.push_back(latency);
        if self.store_latencies.len() > METRIC_HISTORY {
            self.store_latencies.pop_front();
        }
    }

    fn push_magnitude(&mut self, magnitude: f64) {
        self.correction_magnitudes.push_back(magnitude);
        if self.correction_magnitudes.len() > METRIC_HISTORY {
            self.correction_magnitudes.pop_front();
        }
    }

    pub fn record_deliveries(&mut self, delivered: &[TimedMessage], now: f64) {
        if delivered.is_empty() {
            return;
        }
        for message in delivered {
            self.recent_deliveries.push_back(DeliveredSummary {
                msg_id: message.msg_id.clone(),
                corrected_ts: message.corrected_ts,
                sender: message.sender.clone(),
            });
            if self.recent_deliveries.len() > RECENT_DELIVERIES {
                self.recent_deliveries.pop_front();
            }
        }
        self.last_delivery_time = Some(now);
    }

    pub fn average_store_latency(&self) -> f64 {
        average(&self.store_latencies)
    }

    pub fn average_correction_magnitude(&self) -> f64 {
        average(&self.correction_magnitudes)
    }

    pub fn recent(&self, count: usize) -> Vec<DeliveredSummary> {
        self.recent_deliveries
            .iter()
            .rev()
            .take(count)
            .rev()
            .cloned()
            .collect()
    }
}

fn average(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub struct NodeInner {
    pub store: LogStore,
    pub raft: Consensus<Message>,
    pub detector: FailureDetector,
    pub time: TimePipeline,
    pub metrics: DeliveryMetrics,
}

/// One cluster node. Shared state sits behind a single mutex; the critical
/// sections are short and never span network I/O, so the background loops
/// gather under the lock, call out without it, and re-lock to apply.
pub struct Node {
    pub config: NodeConfig,
    pub base_url: String,
    pub http: reqwest::Client,
    inner: Mutex<NodeInner>,
}

/// Outcome of `send` ingress before replication runs.
pub enum SendDecision {
    /// This node is not the leader; the client should retry there.
    Redirect { leader_url: String },
    Stored { message: Message, inserted: bool },
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Arc<Node>, StoreError> {
        let base_url = format!("http://{}:{}", config.host, config.port);
        let mut store = LogStore::open(&config.db_path)?;
        let (current_term, voted_for) = store.load_term_state()?;

        let mut raft = Consensus::new(
            config.node_id.clone(),
            base_url.clone(),
            config.peers.len(),
            config.raft.clone(),
            Instant::now(),
        );
        raft.load_persisted(current_term, voted_for);

        let detector = FailureDetector::new(&config.peers, config.heartbeat_timeout);
        let time = TimePipeline {
            sync: TimeSync::new(
                config.time_sync_interval.as_secs_f64(),
                timesync::sync::DEFAULT_MAX_OFFSET,
            ),
            skew: ClockSkewAnalyzer::default(),
            corrector: TimestampCorrector::default(),
            buffer: MessageOrderingBuffer::default(),
            causal: CausalOrderingManager::new(config.node_id.clone()),
        };

        Ok(Arc::new(Node {
            base_url,
            http: reqwest::Client::new(),
            inner: Mutex::new(NodeInner {
                store,
                raft,
                detector,
                time,
                metrics: DeliveryMetrics::default(),
            }),
            config,
        }))
    }

    pub fn state(&self) -> MutexGuard<'_, NodeInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// `send` ingress: redirect to a known leader, otherwise store locally
    /// (correcting the timestamp) and queue for consensus replication.
    pub fn accept_send(&self, incoming: IncomingMessage) -> Result<SendDecision, StoreError> {
        {
            let inner = self.state();
            if inner.raft.role() != Role::Leader {
                if let Some(leader_url) = inner.raft.leader_url() {
                    if leader_url != self.base_url {
                        return Ok(SendDecision::Redirect {
                            leader_url: leader_url.to_owned(),
                        });
                    }
                }
            }
        }

        let (message, inserted) = self.store_message(incoming)?;
        if inserted {
            let mut inner = self.state();
            let entry = message.clone();
            inner.raft.register_entry(message.seq, entry);
        }
        Ok(SendDecision::Stored { message, inserted })
    }

    /// Follower ingest for `/replicate` and catch-up sync: idempotent store
    /// that keeps the sender's corrected timestamp, committing on insert.
    pub fn apply_replicated(
        &self,
        incoming: IncomingMessage,
    ) -> Result<(Message, bool), StoreError> {
        let (message, inserted) = self.store_message(incoming)?;
        if inserted {
            self.state().store.commit(message.seq);
        }
        Ok((message, inserted))
    }

    /// Prepare (defaults, msg_id, correction) and insert a message, feeding
    /// the reordering buffer on first insert.
    pub fn store_message(
        &self,
        incoming: IncomingMessage,
    ) -> Result<(Message, bool), StoreError> {
        let mut guard = self.state();
        let inner = &mut *guard;

        let vector_clock = incoming.vector_clock.clone();
        let prepared = prepare_message(inner, incoming);
        let started = Instant::now();
        let (message, inserted) = inner.store.insert(&prepared)?;

        if inserted {
            inner
                .metrics
                .push_latency(started.elapsed().as_secs_f64());
            if let Some(magnitude) = message
                .correction_metadata
                .get("magnitude")
                .and_then(serde_json::Value::as_f64)
            {
                inner.metrics.push_magnitude(magnitude);
            }
            register_for_ordering(inner, &message, vector_clock);
        } else {
            debug!("duplicate message {} kept seq {}", message.msg_id, message.seq);
        }
        Ok((message, inserted))
    }

    pub fn commit(&self, seq: u64) {
        self.state().store.commit(seq);
    }

    pub fn max_seq(&self) -> Result<u64, StoreError> {
        self.state().store.max_seq()
    }

    pub fn messages_since(&self, seq: u64) -> Result<Vec<Message>, StoreError> {
        self.state().store.messages_since(seq)
    }

    pub fn committed_messages(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>, StoreError> {
        self.state().store.committed_messages(filter)
    }

    pub fn handle_request_vote(&self, request: &VoteRequest) -> Result<VoteResponse, StoreError> {
        let mut guard = self.state();
        let inner = &mut *guard;
        inner
            .raft
            .handle_request_vote(Instant::now(), request, &mut inner.store)
    }

    pub fn handle_append_entries(
        &self,
        request: &AppendEntriesRequest<Message>,
    ) -> Result<AppendEntriesResponse, StoreError> {
        let mut guard = self.state();
        let inner = &mut *guard;
        inner
            .raft
            .handle_append_entries(Instant::now(), request, &mut inner.store)
    }

    /// The `/status` document.
    pub fn status(&self) -> serde_json::Value {
        let now = unix_now();
        let inner = self.state();
        json!({
            "node_id": self.config.node_id,
            "port": self.config.port,
            "peers": self.config.peers,
            "peer_status": inner.detector.status(),
            "replication_mode": self.config.replication_mode,
            "quorum": self.config.replication_quorum,
            "committed_seq": inner.store.committed_seq(),
            "commit_index": inner.store.committed_seq(),
            "metrics": {
                "average_store_latency": inner.metrics.average_store_latency(),
                "average_correction_magnitude": inner.metrics.average_correction_magnitude(),
                "last_recovery_time": inner.metrics.last_recovery_time,
            },
            "recent_deliveries": inner.metrics.recent(5),
            "consensus": {
                "role": inner.raft.role().as_str(),
                "current_term": inner.raft.current_term(),
                "voted_for": inner.raft.voted_for(),
                "leader_id": inner.raft.leader_id(),
                "leader_url": inner.raft.leader_url(),
            },
            "time_sync": inner.time.sync.status(now),
        })
    }
}

/// Fill defaults and stamp the correction fields. A message that already
/// carries `corrected_ts` (replication, catch-up) keeps it untouched;
/// correction happens exactly once, at first ingest.
fn prepare_message(inner: &mut NodeInner, incoming: IncomingMessage) -> PreparedMessage {
    let now = unix_now();
    let msg_id = incoming
        .msg_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let sender = incoming.sender.unwrap_or_else(|| "unknown".to_owned());
    let recipient = incoming.recipient.unwrap_or_else(|| "all".to_owned());
    let payload = incoming.payload.unwrap_or_default();
    let original_ts = incoming.original_ts.or(incoming.ts).unwrap_or(now);
    let receive_ts = incoming.receive_ts.unwrap_or(now);

    let (corrected_ts, correction_metadata) = match incoming.corrected_ts {
        Some(corrected_ts) => (
            corrected_ts,
            incoming.correction_metadata.unwrap_or_else(|| json!({})),
        ),
        None => {
            let (corrected_ts, info) = inner.time.corrector.correct(original_ts, Some(&sender));
            let accuracy = inner
                .time
                .corrector
                .estimate_accuracy(corrected_ts, original_ts, Some(&sender));
            let mut metadata = serde_json::to_value(&info).unwrap_or_else(|_| json!({}));
            if let (Ok(accuracy), Some(object)) =
                (serde_json::to_value(accuracy), metadata.as_object_mut())
            {
                object.insert("accuracy".to_owned(), accuracy);
            }
            (corrected_ts, metadata)
        }
    };

    PreparedMessage {
        msg_id,
        sender,
        recipient,
        payload,
        ts: corrected_ts,
        original_ts,
        corrected_ts,
        receive_ts,
        correction_metadata,
    }
}

/// Route a freshly inserted message into the delivery pipeline: the causal
/// path when it carries a vector clock, timestamp ordering otherwise.
fn register_for_ordering(
    inner: &mut NodeInner,
    message: &Message,
    vector_clock: Option<std::collections::BTreeMap<String, u64>>,
) {
    let now = unix_now();
    let timed = TimedMessage {
        msg_id: message.msg_id.clone(),
        sender: message.sender.clone(),
        recipient: message.recipient.clone(),
        payload: message.payload.clone(),
        original_ts: message.original_ts,
        corrected_ts: message.corrected_ts,
        receive_ts: message.receive_ts,
        seq: Some(message.seq),
        vector_clock,
    };
    if timed.vector_clock.is_some() {
        inner.time.causal.add_pending(timed);
        let delivered = inner.time.causal.take_deliverable();
        inner.metrics.record_deliveries(&delivered, now);
    } else if inner.time.buffer.add_message(timed) {
        let delivered = inner.time.buffer.get_deliverable(now);
        inner.metrics.record_deliveries(&delivered, now);
    }
}
