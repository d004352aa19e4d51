//! RPC types exchanged between cluster nodes.
//!
//! Field names follow the JSON wire protocol, so the serde renames here are
//! part of the public contract and must not change.

use serde::{Deserialize, Serialize};

/// A vote solicitation broadcast by a candidate at the start of an election.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    #[serde(rename = "candidateId")]
    pub candidate_id: String,
    #[serde(rename = "candidateUrl")]
    pub candidate_url: String,
    #[serde(rename = "lastLogIndex")]
    pub last_log_index: u64,
    #[serde(rename = "lastLogTerm")]
    pub last_log_term: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    #[serde(rename = "voteGranted")]
    pub vote_granted: bool,
}

/// Replication request sent by the leader on every heartbeat tick. An empty
/// `entries` list still asserts leadership and carries the commit index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<M> {
    pub term: u64,
    #[serde(rename = "leaderId")]
    pub leader_id: String,
    #[serde(rename = "leaderUrl")]
    pub leader_url: String,
    #[serde(rename = "prevLogIndex")]
    pub prev_log_index: u64,
    #[serde(rename = "lastLogIndex")]
    pub last_log_index: u64,
    #[serde(rename = "lastLogTerm")]
    pub last_log_term: u64,
    pub entries: Vec<LogEntry<M>>,
    #[serde(rename = "leaderCommit")]
    pub leader_commit: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    #[serde(rename = "matchIndex")]
    pub match_index: u64,
}

/// A replicated log entry: the message payload together with the sequence
/// and term it was accepted under on the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry<M> {
    pub seq: u64,
    pub term: u64,
    pub message: M,
}
