//! Per-peer liveness tracking driven by the heartbeat loop.

use std::collections::HashMap;

use serde::Serialize;

/// Liveness view of one peer.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PeerHealth {
    pub last_ok: f64,
    pub alive: bool,
}

/// Tracks which peers answered a probe recently. Peers start out alive:
/// until a failure is actually observed, replication and time sync must be
/// willing to talk to them, or a freshly started cluster deadlocks.
pub struct FailureDetector {
    peers: HashMap<String, PeerHealth>,
    timeout: f64,
}

impl FailureDetector {
    pub fn new(peers: &[String], timeout: f64) -> Self {
        let peers = peers
            .iter()
            .map(|peer| {
                (
                    peer.clone(),
                    PeerHealth {
                        last_ok: 0.0,
                        alive: true,
                    },
                )
            })
            .collect();
        FailureDetector { peers, timeout }
    }

    pub fn mark_alive(&mut self, peer: &str, at: f64) {
        if let Some(health) = self.peers.get_mut(peer) {
            health.last_ok = at;
            health.alive = true;
        }
    }

    /// Flip a peer down immediately after an observed failure (replication
    /// or time sync), without waiting for the probe timeout.
    pub fn mark_down(&mut self, peer: &str) {
        if let Some(health) = self.peers.get_mut(peer) {
            health.alive = false;
        }
    }

    /// Expire peers whose last successful probe is older than the timeout.
    /// Returns the peers that flipped from alive to down on this call.
    pub fn check_failures(&mut self, now: f64) -> Vec<String> {
        let mut newly_failed = Vec::new();
        for (peer, health) in self.peers.iter_mut() {
            if health.alive && health.last_ok > 0.0 && now - health.last_ok > self.timeout {
                health.alive = false;
                newly_failed.push(peer.clone());
            }
        }
        newly_failed
    }

    pub fn is_alive(&self, peer: &str) -> bool {
        self.peers.get(peer).map(|health| health.alive).unwrap_or(false)
    }

    pub fn alive_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, health)| health.alive)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn status(&self) -> HashMap<String, PeerHealth> {
        self.peers.clone()
    }
}
