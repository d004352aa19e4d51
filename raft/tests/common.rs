#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use raft::{AppendOutcome, Config, Consensus, Store};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TestMsg {
    pub id: String,
    pub body: String,
}

pub fn msg(id: &str, body: &str) -> TestMsg {
    TestMsg {
        id: id.to_owned(),
        body: body.to_owned(),
    }
}

/// In-memory store: dense sequences, dedup by message id, recorded term
/// persistence so tests can assert on write ordering.
#[derive(Default)]
pub struct MemStore {
    pub rows: Vec<TestMsg>,
    by_id: HashMap<String, u64>,
    pub committed: u64,
    pub saved_terms: Vec<(u64, Option<String>)>,
}

impl Store for MemStore {
    type Entry = TestMsg;
    type Error = std::convert::Infallible;

    fn max_seq(&mut self) -> Result<u64, Self::Error> {
        Ok(self.rows.len() as u64)
    }

    fn commit_index(&self) -> u64 {
        self.committed
    }

    fn apply(&mut self, entry: &TestMsg) -> Result<(u64, bool), Self::Error> {
        if let Some(seq) = self.by_id.get(&entry.id) {
            return Ok((*seq, false));
        }
        self.rows.push(entry.clone());
        let seq = self.rows.len() as u64;
        self.by_id.insert(entry.id.clone(), seq);
        Ok((seq, true))
    }

    fn commit(&mut self, seq: u64) -> Result<(), Self::Error> {
        if seq > self.committed {
            self.committed = seq;
        }
        Ok(())
    }

    fn save_term_state(
        &mut self,
        current_term: u64,
        voted_for: Option<&str>,
    ) -> Result<(), Self::Error> {
        self.saved_terms
            .push((current_term, voted_for.map(str::to_owned)));
        Ok(())
    }
}

pub struct Member {
    pub raft: Consensus<TestMsg>,
    pub store: MemStore,
}

/// A group of consensus state machines wired together directly: requests
/// produced by one member are applied to the others and the replies fed
/// back, with no transport in between. Members in `down` neither receive
/// nor reply.
pub struct Group {
    pub members: Vec<Member>,
    pub down: BTreeSet<usize>,
}

pub fn node_id(idx: usize) -> String {
    format!("node-{}", idx)
}

pub fn node_url(idx: usize) -> String {
    format!("http://127.0.0.1:{}", 9000 + idx)
}

pub fn group(size: usize) -> Group {
    let now = Instant::now();
    let members = (0..size)
        .map(|idx| Member {
            raft: Consensus::new(node_id(idx), node_url(idx), size - 1, Config::default(), now),
            store: MemStore::default(),
        })
        .collect();
    Group {
        members,
        down: BTreeSet::new(),
    }
}

impl Group {
    pub fn node_down(mut self, idx: usize) -> Self {
        self.down.insert(idx);
        self
    }

    pub fn revive(&mut self, idx: usize) {
        self.down.remove(&idx);
    }

    /// Run one full election round started by `idx`: broadcast the vote
    /// request to every live member and feed all replies back. Returns
    /// whether `idx` ended the round as leader.
    pub fn elect(&mut self, idx: usize) -> bool {
        let now = Instant::now();
        let member = &mut self.members[idx];
        let request = member
            .raft
            .start_election(now, &mut member.store)
            .expect("election start");
        let request = match request {
            Some(request) => request,
            None => return self.members[idx].raft.is_leader(),
        };

        let mut replies = Vec::new();
        for (peer_idx, peer) in self.members.iter_mut().enumerate() {
            if peer_idx == idx || self.down.contains(&peer_idx) {
                continue;
            }
            let reply = peer
                .raft
                .handle_request_vote(now, &request, &mut peer.store)
                .expect("vote handling");
            replies.push(reply);
        }

        let member = &mut self.members[idx];
        for reply in replies {
            if member
                .raft
                .record_vote(now, &reply, &mut member.store)
                .expect("vote recording")
            {
                break;
            }
        }
        self.members[idx].raft.is_leader()
    }

    /// Ingest a message on `idx` the way leader ingress does: insert into
    /// the local store and queue the stored entry for replication.
    pub fn ingest(&mut self, idx: usize, id: &str, body: &str) -> u64 {
        let member = &mut self.members[idx];
        let entry = msg(id, body);
        let (seq, inserted) = member.store.apply(&entry).expect("insert");
        if inserted {
            member.raft.register_entry(seq, entry);
        }
        seq
    }

    /// Run one leader replication round from `idx`: build the heartbeat
    /// batch, apply it on every live member, and settle the round from the
    /// collected replies.
    pub fn replicate(&mut self, idx: usize) -> AppendOutcome {
        let now = Instant::now();
        let member = &mut self.members[idx];
        let request = member
            .raft
            .heartbeat_batch(&mut member.store)
            .expect("heartbeat batch")
            .expect("only leaders replicate");

        let mut successes = 0;
        let mut highest_term = 0;
        for (peer_idx, peer) in self.members.iter_mut().enumerate() {
            if peer_idx == idx || self.down.contains(&peer_idx) {
                continue;
            }
            let reply = peer
                .raft
                .handle_append_entries(now, &request, &mut peer.store)
                .expect("append handling");
            highest_term = highest_term.max(reply.term);
            if reply.success {
                successes += 1;
            }
        }

        let member = &mut self.members[idx];
        member
            .raft
            .record_append_round(now, successes, highest_term, &mut member.store)
            .expect("append round")
    }

    pub fn leader_count(&self) -> usize {
        self.members
            .iter()
            .filter(|member| member.raft.is_leader())
            .count()
    }
}
