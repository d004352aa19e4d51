//! Outbound peer HTTP helpers. Every call carries an explicit timeout;
//! failures are reported, never propagated into a panic.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);
pub const REPLICATION_TIMEOUT: Duration = Duration::from_secs(3);
/// Vote solicitations wait at most one full election timeout.
pub const VOTE_TIMEOUT: Duration = Duration::from_millis(600);
/// AppendEntries must settle within roughly one heartbeat interval.
pub const APPEND_TIMEOUT: Duration = Duration::from_millis(200);
/// Time sync and catch-up sync calls.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum RpcError {
    Transport(reqwest::Error),
    Status(u16),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(err) => write!(f, "peer request failed: {}", err),
            RpcError::Status(code) => write!(f, "peer replied with status {}", code),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        RpcError::Transport(err)
    }
}

pub async fn post_json<B, R>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
    timeout: Duration,
) -> Result<R, RpcError>
where
    B: Serialize,
    R: DeserializeOwned,
{
    let response = client.post(url).timeout(timeout).json(body).send().await?;
    if !response.status().is_success() {
        return Err(RpcError::Status(response.status().as_u16()));
    }
    Ok(response.json().await?)
}

pub async fn get_json<R>(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<R, RpcError>
where
    R: DeserializeOwned,
{
    let response = client.get(url).timeout(timeout).send().await?;
    if !response.status().is_success() {
        return Err(RpcError::Status(response.status().as_u16()));
    }
    Ok(response.json().await?)
}
