//! courier: a replicated, ordered message log.
//!
//! Producers post messages to any node; a Raft-style leader replicates them
//! across the cluster; consumers read a committed stream whose order is
//! reconstructed from time-corrected timestamps. The consensus engine lives
//! in the `raft` crate, the durable log in `storage`, and the time pipeline
//! in `timesync`; this crate wires them into a node and puts the HTTP
//! surface on top.

pub mod client;
pub mod cluster;
pub mod node;
pub mod rpc;
pub mod server;

pub use client::FailoverClient;
pub use node::{Node, NodeConfig, ReplicationMode};
