//! The multicast stage/commit protocol.
//!
//! Promotes the protocol spec.md describes as something "the messaging
//! layer ... partially in scope as a protocol" coordinates into a
//! first-class, independently testable type. A `Transaction` only
//! orchestrates: every actual tree mutation happens inside
//! [`crate::queue::Queue`] under that destination's own lock, and no two
//! destination locks are ever held at once — that is what makes the
//! protocol deadlock-free (see §4.2.7 of the crate's design notes).

use std::sync::Arc;

use crate::{node::Node, queue::Queue};

/// Coordinates a multicast send across destinations `D1..Dn`.
///
/// ```text
/// let mut txn = Transaction::new();
/// for dest in &destinations {
///     txn.stage(dest, Arc::clone(&node));
/// }
/// let commit_ts = txn.commit(); // re-queues `node` on every destination
/// ```
///
/// A real peer/transport layer (out of scope for this crate) constructs one
/// `Transaction` per multicast send and drives this loop; `Transaction`
/// borrows each destination for its own lifetime, so `commit`/`abort` can
/// replay the exact `(destination, node)` pairs `stage` was called with
/// without the caller needing to remember them.
#[derive(Default)]
pub struct Transaction<'a> {
    max_seen: Option<u64>,
    staged: Vec<(&'a Queue, Arc<Node>)>,
}

impl<'a> Transaction<'a> {
    #[inline]
    pub fn new() -> Self {
        Transaction {
            max_seen: None,
            staged: Vec::new(),
        }
    }

    /// Stages `node` on `destination`, folding the returned staging
    /// timestamp into this transaction's running maximum. Order across
    /// destinations does not matter, and destinations tick independently of
    /// each other during staging (§4.2.3 step 1) — only the commit
    /// timestamp, picked afterward, is shared.
    pub fn stage(&mut self, destination: &'a Queue, node: Arc<Node>) -> u64 {
        let staging_ts = destination.stage(Arc::clone(&node), 0);
        self.max_seen = Some(self.max_seen.map_or(staging_ts, |m| m.max(staging_ts)));
        self.staged.push((destination, node));
        staging_ts
    }

    /// Selects the commit timestamp — the smallest even number strictly
    /// greater than the highest staging timestamp seen across every
    /// destination — and re-queues every staged node on its destination at
    /// that timestamp (§4.2.3 steps 2 and 3). Returns the commit timestamp.
    ///
    /// # Panics
    ///
    /// Panics if nothing was staged; a transaction with no destinations is
    /// not a multicast.
    pub fn commit(self) -> u64 {
        let max_seen = self
            .max_seen
            .expect("commit() called on a transaction with no staged destinations");
        debug_assert!(max_seen % 2 == 1, "staging timestamps are always odd");
        let commit_ts = max_seen + 1;

        for (destination, node) in &self.staged {
            destination.commit_staged(node, commit_ts);
        }
        log::trace!(
            "transaction committed {} destination(s) at ts={commit_ts}",
            self.staged.len()
        );
        commit_ts
    }

    /// Aborts the transaction: removes every staged node from every
    /// destination it was staged on. No additional notification to peers is
    /// sent — a staged node is never readable, so no peer could have
    /// observed it (this crate's resolution of the open question in
    /// spec.md §9 about partial aborts; see `DESIGN.md`).
    pub fn abort(self) {
        for (destination, node) in &self.staged {
            destination.remove(node);
        }
    }
}

impl core::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("max_seen", &self.max_seen)
            .field("destinations", &self.staged.len())
            .finish()
    }
}
