//! A small client that follows leader changes transparently.

use std::fmt;
use std::time::Duration;

use log::debug;
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode};
use serde_json::Value;

use storage::IncomingMessage;

#[derive(Debug)]
pub enum ClientError {
    /// Construction requires at least one seed URL.
    NoSeeds,
    /// No reachable node would identify a leader.
    NoLeader,
    Http(reqwest::Error),
    Failed(u16),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NoSeeds => write!(f, "at least one seed endpoint must be provided"),
            ClientError::NoLeader => write!(f, "unable to determine cluster leader"),
            ClientError::Http(err) => write!(f, "request failed: {}", err),
            ClientError::Failed(code) => write!(f, "request failed with status {}", code),
        }
    }
}

impl std::error::Error for ClientError {}

/// Keeps a cached leader URL. On a 307 the leader cache is updated from
/// the response body and the request retried; on any other failure the
/// cache is dropped and the next seed probed via `/status`.
pub struct FailoverClient {
    seeds: Vec<String>,
    client: reqwest::Client,
    leader: Option<String>,
    seed_index: usize,
}

impl FailoverClient {
    pub fn new<I, S>(seeds: I) -> Result<Self, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let seeds: Vec<String> = seeds.into_iter().map(Into::into).collect();
        if seeds.is_empty() {
            return Err(ClientError::NoSeeds);
        }
        // redirects are handled here, from the body, not by reqwest
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(ClientError::Http)?;
        Ok(FailoverClient {
            seeds,
            client,
            leader: None,
            seed_index: 0,
        })
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    /// Send a message via `/send` with automatic leader failover.
    pub async fn send(&mut self, message: &IncomingMessage) -> Result<Value, ClientError> {
        let body = serde_json::to_value(message).map_err(|_| ClientError::NoLeader)?;
        self.request(Method::POST, "/send", Some(body)).await
    }

    /// Perform a request, retrying once per known seed. Every failure
    /// invalidates the cached leader so the next attempt re-probes.
    pub async fn request(
        &mut self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        let mut last_error = None;
        for _ in 0..self.seeds.len() + 1 {
            let Some(base_url) = self.active_leader().await else {
                continue;
            };
            let mut builder = self
                .client
                .request(method.clone(), format!("{}{}", base_url, path));
            if let Some(body) = &body {
                builder = builder.json(body);
            }
            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) => {
                    last_error = Some(ClientError::Http(err));
                    self.leader = None;
                    continue;
                }
            };
            if response.status().is_success() {
                return response.json().await.map_err(ClientError::Http);
            }
            if response.status() == StatusCode::TEMPORARY_REDIRECT {
                if let Ok(value) = response.json::<Value>().await {
                    if let Some(leader) = value.get("leader_url").and_then(Value::as_str) {
                        debug!("following leader redirect to {}", leader);
                        self.leader = Some(leader.to_owned());
                        continue;
                    }
                }
                self.leader = None;
                continue;
            }
            last_error = Some(ClientError::Failed(response.status().as_u16()));
            self.leader = None;
        }
        Err(last_error.unwrap_or(ClientError::NoLeader))
    }

    /// The cached leader, or the first leader any seed will admit to.
    async fn active_leader(&mut self) -> Option<String> {
        if let Some(leader) = &self.leader {
            return Some(leader.clone());
        }
        for _ in 0..self.seeds.len() {
            let seed = self.seeds[self.seed_index].clone();
            self.seed_index = (self.seed_index + 1) % self.seeds.len();
            let response = match self.client.get(format!("{}/status", seed)).send().await {
                Ok(response) if response.status().is_success() => response,
                _ => continue,
            };
            let Ok(value) = response.json::<Value>().await else {
                continue;
            };
            let consensus = value.get("consensus");
            let role = consensus
                .and_then(|c| c.get("role"))
                .and_then(Value::as_str);
            if role == Some("Leader") {
                self.leader = Some(seed.clone());
                return Some(seed);
            }
            if let Some(leader) = consensus
                .and_then(|c| c.get("leader_url"))
                .and_then(Value::as_str)
            {
                self.leader = Some(leader.to_owned());
                return Some(leader.to_owned());
            }
        }
        None
    }
}
