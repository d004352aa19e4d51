//! Durable message log for a cluster node.
//!
//! One SQLite database per node holds the ordered message log plus the
//! single-row consensus term state. [`LogStore`] owns the connection and is
//! the only writer; it also implements [`raft::Store`] so the consensus
//! engine reaches durable state through that seam alone.

mod sqlite;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use crate::sqlite::LogStore;

/// A stored log entry. `seq` is dense and assigned by the store at insert
/// time; `corrected_ts` is stamped once at first ingest and never rewritten.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub seq: u64,
    pub msg_id: String,
    pub sender: String,
    pub recipient: String,
    pub payload: String,
    /// Mirrors `corrected_ts`; kept as its own column for readers of the
    /// original schema.
    pub ts: f64,
    pub original_ts: f64,
    pub corrected_ts: f64,
    pub receive_ts: f64,
    #[serde(default)]
    pub correction_metadata: serde_json::Value,
}

/// A message as it arrives from a producer or a peer, before defaults and
/// timestamp correction are applied. Replicated messages arrive with
/// `corrected_ts` already set and keep it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub msg_id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub ts: Option<f64>,
    #[serde(default)]
    pub original_ts: Option<f64>,
    #[serde(default)]
    pub corrected_ts: Option<f64>,
    #[serde(default)]
    pub receive_ts: Option<f64>,
    #[serde(default)]
    pub correction_metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<BTreeMap<String, u64>>,
}

impl From<Message> for IncomingMessage {
    fn from(message: Message) -> Self {
        IncomingMessage {
            msg_id: Some(message.msg_id),
            sender: Some(message.sender),
            recipient: Some(message.recipient),
            payload: Some(message.payload),
            ts: Some(message.ts),
            original_ts: Some(message.original_ts),
            corrected_ts: Some(message.corrected_ts),
            receive_ts: Some(message.receive_ts),
            correction_metadata: Some(message.correction_metadata),
            vector_clock: None,
        }
    }
}

/// A fully defaulted and corrected message, ready for insertion.
#[derive(Clone, Debug)]
pub struct PreparedMessage {
    pub msg_id: String,
    pub sender: String,
    pub recipient: String,
    pub payload: String,
    pub ts: f64,
    pub original_ts: f64,
    pub corrected_ts: f64,
    pub receive_ts: f64,
    pub correction_metadata: serde_json::Value,
}

impl From<&Message> for PreparedMessage {
    fn from(message: &Message) -> Self {
        PreparedMessage {
            msg_id: message.msg_id.clone(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            payload: message.payload.clone(),
            ts: message.ts,
            original_ts: message.original_ts,
            corrected_ts: message.corrected_ts,
            receive_ts: message.receive_ts,
            correction_metadata: message.correction_metadata.clone(),
        }
    }
}

/// Filters for committed reads.
#[derive(Clone, Debug, Default)]
pub struct MessageFilter {
    pub limit: Option<usize>,
    pub after_seq: Option<u64>,
    pub sender: Option<String>,
    pub recipient: Option<String>,
}

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(err) => write!(f, "storage failure: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err)
    }
}
