//! The durable-state seam between the consensus engine and its owner.

use core::fmt;

/// Storage operations the consensus engine depends on.
///
/// The engine never opens files or sockets itself; the node supplies an
/// implementation backed by its durable log. Implementations must make
/// [`apply`](Store::apply) idempotent by message id and
/// [`commit`](Store::commit) monotonic, and must not return from
/// [`save_term_state`](Store::save_term_state) before the state is durable.
pub trait Store {
    /// The message payload type carried by log entries.
    type Entry: Clone;

    /// Error type surfaced by durable operations.
    type Error: fmt::Display;

    /// Largest sequence number present in the local log.
    fn max_seq(&mut self) -> Result<u64, Self::Error>;

    /// Highest sequence number known to be committed.
    fn commit_index(&self) -> u64;

    /// Insert a replicated entry, deduplicating by message id. Returns the
    /// sequence the entry holds locally and whether a new row was written.
    fn apply(&mut self, entry: &Self::Entry) -> Result<(u64, bool), Self::Error>;

    /// Raise the commit index to `seq`; lowering it is a no-op.
    fn commit(&mut self, seq: u64) -> Result<(), Self::Error>;

    /// Durably record `current_term` and `voted_for`.
    fn save_term_state(
        &mut self,
        current_term: u64,
        voted_for: Option<&str>,
    ) -> Result<(), Self::Error>;
}
