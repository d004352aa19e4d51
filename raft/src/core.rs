//! The consensus state machine: roles, terms, votes, and the leader's
//! pending replication queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;

use crate::majority_threshold;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, VoteRequest, VoteResponse,
};
use crate::store::Store;

/// Timing and batching parameters. Every node in a group must run with the
/// same configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,
    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,
    /// Maximum number of pending entries shipped per heartbeat.
    pub max_batch_entries: usize,
    /// Capacity of the leader's pending replication queue.
    pub max_pending_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(200),
            max_batch_entries: 32,
            max_pending_entries: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "Follower",
            Role::Candidate => "Candidate",
            Role::Leader => "Leader",
        }
    }
}

/// Result of a leader replication round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    /// A reply carried a higher term; the node is a follower again.
    SteppedDown,
    /// A strict majority acknowledged the batch; the commit index now
    /// covers every delivered entry.
    Committed { up_to: u64 },
    /// The round fell short of a majority; the batch will be retried on the
    /// next heartbeat tick.
    NoQuorum,
}

struct PendingEntry<M> {
    seq: u64,
    term: u64,
    message: M,
    in_flight: bool,
}

/// Consensus state for one node. See the crate docs for the driving
/// contract; all methods expect the caller to hold whatever lock serializes
/// node state, and persistence happens through the supplied [`Store`]
/// before any reply is produced.
pub struct Consensus<M> {
    node_id: String,
    node_url: String,
    peer_count: usize,
    config: Config,

    current_term: u64,
    voted_for: Option<String>,

    role: Role,
    leader_id: Option<String>,
    leader_url: Option<String>,
    votes_received: usize,
    election_deadline: Instant,

    pending: VecDeque<PendingEntry<M>>,
}

impl<M: Clone> Consensus<M> {
    pub fn new(
        node_id: impl Into<String>,
        node_url: impl Into<String>,
        peer_count: usize,
        config: Config,
        now: Instant,
    ) -> Self {
        let mut consensus = Consensus {
            node_id: node_id.into(),
            node_url: node_url.into(),
            peer_count,
            config,
            current_term: 0,
            voted_for: None,
            role: Role::Follower,
            leader_id: None,
            leader_url: None,
            votes_received: 0,
            election_deadline: now,
            pending: VecDeque::new(),
        };
        consensus.reset_election_timer(now);
        consensus
    }

    /// Seed term and vote from the durable store after opening it.
    pub fn load_persisted(&mut self, current_term: u64, voted_for: Option<String>) {
        self.current_term = current_term;
        self.voted_for = voted_for;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn leader_url(&self) -> Option<&str> {
        self.leader_url.as_deref()
    }

    pub fn votes_received(&self) -> usize {
        self.votes_received
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn majority(&self) -> usize {
        majority_threshold(self.peer_count)
    }

    pub fn reset_election_timer(&mut self, now: Instant) {
        let span = self
            .config
            .election_timeout_max
            .saturating_sub(self.config.election_timeout_min);
        let jitter = if span.is_zero() {
            Duration::ZERO
        } else {
            span.mul_f64(rand::thread_rng().gen::<f64>())
        };
        self.election_deadline = now + self.config.election_timeout_min + jitter;
    }

    /// Whether the election timer has expired. Leaders never time out.
    pub fn election_due(&self, now: Instant) -> bool {
        self.role != Role::Leader && now >= self.election_deadline
    }

    /// Step up as a candidate for a new term. Returns the vote request to
    /// broadcast, or `None` when the node won outright (single-node group)
    /// or is already leader. Term and self-vote are durable before the
    /// request is handed back.
    pub fn start_election<S>(
        &mut self,
        now: Instant,
        store: &mut S,
    ) -> Result<Option<VoteRequest>, S::Error>
    where
        S: Store<Entry = M>,
    {
        if self.role == Role::Leader {
            return Ok(None);
        }
        self.current_term += 1;
        self.voted_for = Some(self.node_id.clone());
        store.save_term_state(self.current_term, self.voted_for.as_deref())?;
        self.role = Role::Candidate;
        self.votes_received = 1;
        self.reset_election_timer(now);
        info!("became candidate at term {}", self.current_term);

        if self.votes_received > self.majority() {
            self.become_leader();
            return Ok(None);
        }

        Ok(Some(VoteRequest {
            term: self.current_term,
            candidate_id: self.node_id.clone(),
            candidate_url: self.node_url.clone(),
            last_log_index: store.max_seq()?,
            last_log_term: 0,
        }))
    }

    /// Count one vote reply from the current election round. Returns `true`
    /// if this reply made the node leader.
    pub fn record_vote<S>(
        &mut self,
        now: Instant,
        reply: &VoteResponse,
        store: &mut S,
    ) -> Result<bool, S::Error>
    where
        S: Store<Entry = M>,
    {
        if reply.term > self.current_term {
            self.become_follower(now, reply.term, None, None, store)?;
            return Ok(false);
        }
        if self.role == Role::Candidate && reply.term == self.current_term && reply.vote_granted {
            self.votes_received += 1;
            if self.votes_received > self.majority() {
                self.become_leader();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Queue an accepted entry for replication. Called on the leader after
    /// a successful local insert.
    pub fn register_entry(&mut self, seq: u64, message: M) {
        if self.role != Role::Leader {
            return;
        }
        if self.pending.len() >= self.config.max_pending_entries {
            warn!("pending replication queue full, not queueing seq {}", seq);
            return;
        }
        self.pending.push_back(PendingEntry {
            seq,
            term: self.current_term,
            message,
            in_flight: false,
        });
    }

    /// Assemble the next replication heartbeat: up to
    /// [`Config::max_batch_entries`] undelivered entries, marked in flight
    /// until [`record_append_round`](Self::record_append_round) settles the
    /// round. Returns `None` on non-leaders. An empty batch still produces
    /// a request so followers see the leader and its commit index.
    pub fn heartbeat_batch<S>(
        &mut self,
        store: &mut S,
    ) -> Result<Option<AppendEntriesRequest<M>>, S::Error>
    where
        S: Store<Entry = M>,
    {
        if self.role != Role::Leader {
            return Ok(None);
        }
        let mut entries = Vec::new();
        for pending in self.pending.iter_mut() {
            if entries.len() == self.config.max_batch_entries {
                break;
            }
            if pending.in_flight {
                continue;
            }
            pending.in_flight = true;
            entries.push(LogEntry {
                seq: pending.seq,
                term: pending.term,
                message: pending.message.clone(),
            });
        }
        let last_log_index = store.max_seq()?;
        let prev_log_index = entries
            .first()
            .map(|entry| entry.seq.saturating_sub(1))
            .unwrap_or(last_log_index);
        Ok(Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.node_id.clone(),
            leader_url: self.node_url.clone(),
            prev_log_index,
            last_log_index,
            last_log_term: 0,
            entries,
            leader_commit: store.commit_index(),
        }))
    }

    /// Settle a replication round: `successes` is the number of peers that
    /// acknowledged, `highest_term` the largest term seen across replies.
    /// The local write counts as one supporter, so a batch commits when
    /// `successes + 1` is a strict majority.
    pub fn record_append_round<S>(
        &mut self,
        now: Instant,
        successes: usize,
        highest_term: u64,
        store: &mut S,
    ) -> Result<AppendOutcome, S::Error>
    where
        S: Store<Entry = M>,
    {
        if highest_term > self.current_term {
            self.become_follower(now, highest_term, None, None, store)?;
            return Ok(AppendOutcome::SteppedDown);
        }
        if self.role != Role::Leader {
            return Ok(AppendOutcome::SteppedDown);
        }
        if successes + 1 > self.majority() {
            let mut delivered_up_to = None;
            while matches!(self.pending.front(), Some(entry) if entry.in_flight) {
                delivered_up_to = self.pending.pop_front().map(|entry| entry.seq);
            }
            if let Some(seq) = delivered_up_to {
                store.commit(seq)?;
                debug!("replicated and committed through seq {}", seq);
            }
            Ok(AppendOutcome::Committed {
                up_to: store.commit_index(),
            })
        } else {
            for entry in self.pending.iter_mut() {
                entry.in_flight = false;
            }
            debug!(
                "replication round fell short of majority ({} acks), will retry",
                successes + 1
            );
            Ok(AppendOutcome::NoQuorum)
        }
    }

    /// Answer a vote solicitation. The vote (and any term bump) is durable
    /// before the response is returned.
    pub fn handle_request_vote<S>(
        &mut self,
        now: Instant,
        req: &VoteRequest,
        store: &mut S,
    ) -> Result<VoteResponse, S::Error>
    where
        S: Store<Entry = M>,
    {
        if req.term < self.current_term {
            debug!(
                "rejected vote for {}: stale term {} < {}",
                req.candidate_id, req.term, self.current_term
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }
        if req.term > self.current_term {
            self.become_follower(now, req.term, None, None, store)?;
        }

        let up_to_date = req.last_log_index >= store.max_seq()?;
        let can_vote = self
            .voted_for
            .as_deref()
            .map_or(true, |voted| voted == req.candidate_id);

        if can_vote && up_to_date {
            self.voted_for = Some(req.candidate_id.clone());
            store.save_term_state(self.current_term, self.voted_for.as_deref())?;
            self.reset_election_timer(now);
            info!(
                "granted vote to {} at term {}",
                req.candidate_id, self.current_term
            );
            Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            })
        } else {
            info!(
                "rejected vote for {} at term {} (voted_for={:?}, up_to_date={})",
                req.candidate_id, self.current_term, self.voted_for, up_to_date
            );
            Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            })
        }
    }

    /// Apply a replication request from a leader: record the leadership,
    /// insert the carried entries (idempotently), and advance the commit
    /// index to the smaller of the leader's commit and the local log end.
    pub fn handle_append_entries<S>(
        &mut self,
        now: Instant,
        req: &AppendEntriesRequest<M>,
        store: &mut S,
    ) -> Result<AppendEntriesResponse, S::Error>
    where
        S: Store<Entry = M>,
    {
        if req.term < self.current_term {
            debug!(
                "rejected append from {}: stale term {} < {}",
                req.leader_id, req.term, self.current_term
            );
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: store.max_seq()?,
            });
        }

        self.become_follower(
            now,
            req.term,
            Some(req.leader_id.as_str()),
            Some(req.leader_url.as_str()),
            store,
        )?;

        for entry in &req.entries {
            store.apply(&entry.message)?;
        }
        let max_seq = store.max_seq()?;
        store.commit(req.leader_commit.min(max_seq))?;

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: max_seq,
        })
    }

    /// Step down to follower under `term`, recording the leader when known.
    /// A term bump clears the vote and is persisted before returning.
    pub fn become_follower<S>(
        &mut self,
        now: Instant,
        term: u64,
        leader_id: Option<&str>,
        leader_url: Option<&str>,
        store: &mut S,
    ) -> Result<(), S::Error>
    where
        S: Store<Entry = M>,
    {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            store.save_term_state(self.current_term, None)?;
        }
        if self.role != Role::Follower {
            info!(
                "became follower at term {} (leader: {:?})",
                self.current_term, leader_id
            );
            for entry in self.pending.iter_mut() {
                entry.in_flight = false;
            }
        }
        self.role = Role::Follower;
        self.votes_received = 0;
        self.leader_id = leader_id.map(str::to_owned);
        self.leader_url = leader_url.map(str::to_owned);
        self.reset_election_timer(now);
        Ok(())
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = Some(self.node_id.clone());
        self.leader_url = Some(self.node_url.clone());
        info!("became leader at term {}", self.current_term);
    }
}
