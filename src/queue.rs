//! The per-peer ordered multicast queue.
//!
//! (You are highly encouraged to read up on Lamport timestamps and causal
//! ordering — this queue's design has its roots there, treating a peer's
//! destinations as a small distributed system so no global lock is ever
//! needed across queues.)
//!
//! A queue is a FIFO ordered by the Lamport timestamp its entries were
//! queued with, except that delivery of a single multicast message to
//! several destination queues must look consistent across all of them
//! without any synchronization *between* those queues. [`Queue`] solves this
//! with a distributed clock per queue (see [`Queue::tick`]/[`Queue::sync`])
//! and a two-phase stage/commit protocol (see [`crate::transaction`]):
//!
//! - A node is first queued as a **staging** entry with an odd timestamp
//!   while its transaction is in flight.
//! - Once the transaction picks its final (even) timestamp across every
//!   destination, each destination re-queues the node at that **commit**
//!   timestamp.
//! - A node is only ever dequeued once it is committed *and* nothing with a
//!   strictly smaller, still-staging timestamp could still displace it —
//!   i.e. once it is the minimum of the tree and that minimum is even.
//!
//! This means a fully committed node is not necessarily immediately visible:
//! an earlier staging entry can still block it. That window is bounded by
//! however long the slower transaction takes to reach commit, and it can
//! never deadlock, since staging and commit each only ever hold one queue's
//! lock at a time (see the crate's concurrency design notes).

use core::sync::atomic::{AtomicBool, Ordering::*};
use std::{
    collections::{BTreeMap, Bound},
    sync::Arc,
};

use spin::Mutex;

use crate::node::Node;

struct QueueInner {
    clock: u64,
    messages: BTreeMap<(u64, usize), Arc<Node>>,
    front: Option<Arc<Node>>,
}

/// An ordered, per-peer message queue. See the module docs for the ordering
/// protocol this implements.
pub struct Queue {
    inner: Mutex<QueueInner>,
    /// Published with `Release` by whichever operation last changed
    /// `front`, read with `Acquire` by [`Queue::is_readable`] so a poll/select
    /// style caller can test readability without taking the lock. This is
    /// the crate's implementation of the "RCU read of the front cache"
    /// design note: the underlying requirement is just that readers never
    /// observe a torn value, which a plain `AtomicBool` gives for free —
    /// there is no need to expose the node pointer itself lock-free, since
    /// any caller that wants the actual node calls `peek`, which takes the
    /// lock.
    readable: AtomicBool,
}

/// Returned by mutating queue operations: whether the queue transitioned
/// from non-readable to readable, i.e. whether a waiting consumer should be
/// woken.
pub type WakeSignal = bool;

impl Queue {
    #[inline]
    pub fn new() -> Self {
        Queue {
            inner: Mutex::new(QueueInner {
                clock: 0,
                messages: BTreeMap::new(),
                front: None,
            }),
            readable: AtomicBool::new(false),
        }
    }

    /// Lock-free readability test: true iff there is a node ready to be
    /// dequeued right now. May spuriously report `false` for an instant
    /// while an insert is in flight (never spuriously `true`); the actual
    /// dequeue path ([`Queue::peek`]) re-validates under the lock.
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.readable.load(Acquire)
    }

    /// Advances the local logical clock by a full tick (+2) and returns the
    /// new value. The caller may use both the returned even value and its
    /// odd predecessor (`result - 1`); both are uniquely allocated to this
    /// call.
    pub fn tick(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.clock += 2;
        inner.clock
    }

    /// Fast-forwards the local clock to `timestamp` if it is ahead of it.
    /// `timestamp` must be even.
    pub fn sync(&self, timestamp: u64) {
        debug_assert!(timestamp % 2 == 0, "sync() timestamp must be even");
        let mut inner = self.inner.lock();
        inner.clock = inner.clock.max(timestamp);
    }

    /// Recomputes `front` from the current minimum of `messages` and
    /// publishes `readable`. Returns whether this refresh is a non-readable
    /// → readable transition (a wake signal).
    fn refresh_front(inner: &mut QueueInner, readable: &AtomicBool) -> WakeSignal {
        let was_ready = inner.front.is_some();
        inner.front = inner
            .messages
            .iter()
            .next()
            .filter(|(key, _)| key.0 % 2 == 0)
            .map(|(_, node)| Arc::clone(node));
        let now_ready = inner.front.is_some();
        readable.store(now_ready, Release);
        now_ready && !was_ready
    }

    /// Stages `node` as an in-flight multicast entry: synchronizes the clock
    /// to at least `timestamp_hint` (a transaction's running maximum staging
    /// timestamp across earlier destinations, or `0` if this is the first
    /// destination), ticks, and inserts `node` at the resulting odd
    /// timestamp. Returns that staging timestamp; the caller (a
    /// [`crate::transaction::Transaction`]) folds it into the cross-queue
    /// maximum used to pick the eventual commit timestamp.
    pub fn stage(&self, node: Arc<Node>, timestamp_hint: u64) -> u64 {
        let floor = timestamp_hint + (timestamp_hint % 2);
        let mut inner = self.inner.lock();
        inner.clock = inner.clock.max(floor);
        inner.clock += 2;
        let staging_ts = inner.clock - 1;

        node.set_timestamp(staging_ts);
        node.set_queued(true);
        inner.messages.insert((staging_ts, node.sender()), node);
        // A new staging entry can never become the ready front (odd
        // timestamp), but it can become the *tree* minimum and thereby mask
        // a previously-ready front, so the cache still needs a refresh.
        Self::refresh_front(&mut inner, &self.readable);

        log::trace!("staged node at ts={staging_ts}");
        staging_ts
    }

    /// Commits a previously staged `node` at `commit_ts` (even, and greater
    /// than the staging timestamp it was given): removes it from its
    /// staging position, moves it to `commit_ts`, and synchronizes the
    /// clock. Returns whether the queue became readable by this operation.
    pub fn commit_staged(&self, node: &Arc<Node>, commit_ts: u64) -> WakeSignal {
        debug_assert!(commit_ts % 2 == 0, "commit timestamp must be even");
        let mut inner = self.inner.lock();

        let staging_ts = node.timestamp();
        debug_assert!(
            commit_ts > staging_ts,
            "commit timestamp must exceed the staging timestamp it replaces"
        );
        let removed = inner.messages.remove(&(staging_ts, node.sender()));
        debug_assert!(removed.is_some(), "commit_staged on a node not staged here");

        node.set_timestamp(commit_ts);
        inner
            .messages
            .insert((commit_ts, node.sender()), Arc::clone(node));
        inner.clock = inner.clock.max(commit_ts);

        let wake = Self::refresh_front(&mut inner, &self.readable);
        log::trace!("committed node at ts={commit_ts}");
        wake
    }

    /// Single-destination fast path: ticks once and inserts `node` directly
    /// at the resulting even (committed) timestamp, skipping the
    /// stage/commit dance entirely. Returns whether the queue became
    /// readable.
    pub fn commit_unstaged(&self, node: Arc<Node>) -> WakeSignal {
        let mut inner = self.inner.lock();
        inner.clock += 2;
        let commit_ts = inner.clock;

        node.set_timestamp(commit_ts);
        node.set_queued(true);
        inner.messages.insert((commit_ts, node.sender()), node);

        let wake = Self::refresh_front(&mut inner, &self.readable);
        log::trace!("committed unstaged node at ts={commit_ts}");
        wake
    }

    /// Unconditionally removes `node` from the queue (transaction abort,
    /// sender cancellation, peer flush of a single entry). A no-op if `node`
    /// is not currently queued (L3). Returns whether this removal unblocked
    /// the queue (a staging entry removed from in front of a committed
    /// node, newly making it readable).
    pub fn remove(&self, node: &Arc<Node>) -> WakeSignal {
        if !node.is_queued() {
            return false;
        }
        let mut inner = self.inner.lock();
        let key = (node.timestamp(), node.sender());
        if inner.messages.remove(&key).is_none() {
            return false;
        }
        node.set_queued(false);
        Self::refresh_front(&mut inner, &self.readable)
    }

    /// Returns the current ready front node, if any, without removing it,
    /// plus whether peeking again after the caller processes (typically:
    /// removes) this entry may yield another node without needing to
    /// re-enter any wake logic — i.e. whether the node immediately following
    /// the front in key order is itself already ready.
    pub fn peek(&self) -> (Option<Arc<Node>>, bool) {
        let inner = self.inner.lock();
        let Some(front) = inner.front.clone() else {
            return (None, false);
        };
        let front_key = (front.timestamp(), front.sender());
        let next_is_ready = inner
            .messages
            .range((Bound::Excluded(front_key), Bound::Unbounded))
            .next()
            .is_some_and(|(key, _)| key.0 % 2 == 0);
        (Some(front), next_is_ready)
    }

    /// Moves every queued node (staging or committed) off the tree and onto
    /// `collect`, leaving the queue empty. Used during peer teardown; the
    /// surrounding peer lock must exclude concurrent stage/commit calls, as
    /// this does not itself prevent a racing transaction from reinserting a
    /// node from another thread mid-flush.
    pub fn flush(&self, collect: &mut Vec<Arc<Node>>) {
        let mut inner = self.inner.lock();
        let messages = core::mem::take(&mut inner.messages);
        collect.reserve(messages.len());
        for (_, node) in messages {
            node.set_queued(false);
            collect.push(node);
        }
        inner.front = None;
        self.readable.store(false, Release);
    }
}

impl Default for Queue {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Queue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Queue")
            .field("clock", &inner.clock)
            .field("len", &inner.messages.len())
            .field("readable", &self.is_readable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::node::NodeKind;

    use super::*;

    fn msg(sender: usize) -> Arc<Node> {
        Arc::new(Node::new(sender, NodeKind::Message(bytes::Bytes::new())))
    }

    #[test]
    fn clock_is_monotonic_across_ticks() {
        // P4
        let queue = Queue::new();
        let mut last = 0;
        for _ in 0..8 {
            let t = queue.tick();
            assert!(t > last);
            assert_eq!(t % 2, 0);
            last = t;
        }
    }

    #[test]
    fn unicast_fast_path() {
        // Scenario 1: two-peer unicast.
        let queue = Queue::new();
        let node = msg(1);
        assert!(queue.commit_unstaged(Arc::clone(&node)));

        let (front, cont) = queue.peek();
        assert_eq!(front.unwrap().sender(), 1);
        assert!(!cont);

        assert!(queue.remove(&node));
        let (front, cont) = queue.peek();
        assert!(front.is_none());
        assert!(!cont);
    }

    #[test]
    fn staged_node_blocks_read_until_committed() {
        // Scenario 3: a staging entry with a lower timestamp than a
        // committed entry blocks the queue from being readable at all.
        crate::test_support::init_logging();
        let queue = Queue::new();

        let staging = msg(10 /* sender A */);
        let staging_ts = queue.stage(Arc::clone(&staging), 0);
        assert_eq!(staging_ts, 1);

        let committed = msg(20 /* sender B */);
        assert!(!queue.commit_unstaged(Arc::clone(&committed)));
        assert!(!queue.is_readable(), "staging entry at ts=1 blocks ts=2");

        let (front, _) = queue.peek();
        assert!(front.is_none());

        // A commits; its staging entry is replaced with ts=4 (next even
        // number >= 1+1), unblocking B's ts=2 entry.
        let wake = queue.commit_staged(&staging, 4);
        assert!(wake, "committing the blocker must report a wake");
        assert!(queue.is_readable());

        let (front, cont) = queue.peek();
        assert_eq!(front.unwrap().sender(), 20, "B's ts=2 node is now the front");
        assert!(cont, "A's ts=4 node is immediately next and ready");
    }

    #[test]
    fn remove_on_unqueued_node_is_a_no_op() {
        // L3
        let queue = Queue::new();
        let node = msg(1);
        assert!(!queue.remove(&node));
    }

    #[test]
    fn tie_break_by_sender_ascending() {
        let queue = Queue::new();
        let low = msg(1);
        let high = msg(2);
        queue.stage(Arc::clone(&low), 0);
        queue.stage(Arc::clone(&high), 0);

        // Both land on the same commit timestamp; the lower sender tag must
        // sort first (§4.2.6).
        queue.commit_staged(&low, 10);
        queue.commit_staged(&high, 10);

        let (front, cont) = queue.peek();
        assert_eq!(front.unwrap().sender(), 1, "lower sender tag sorts first on a tie");
        assert!(cont);
    }

    #[test]
    fn flush_empties_queue_and_clears_front() {
        // Scenario 5.
        let queue = Queue::new();
        let staging = msg(1);
        queue.stage(Arc::clone(&staging), 0);
        let a = msg(2);
        queue.commit_unstaged(Arc::clone(&a));
        let b = msg(3);
        queue.commit_unstaged(Arc::clone(&b));

        let mut collected = Vec::new();
        queue.flush(&mut collected);

        assert_eq!(collected.len(), 3);
        assert!(!queue.is_readable());
        let (front, _) = queue.peek();
        assert!(front.is_none());
        for node in &collected {
            assert!(!node.is_queued());
        }
    }

    #[test]
    fn minimum_and_maximum_timestamps_respect_ordering() {
        let queue = Queue::new();
        let low = msg(1);
        low.set_timestamp(0);
        low.set_queued(true);
        {
            let mut inner = queue.inner.lock();
            inner.messages.insert((0, 1), Arc::clone(&low));
            Queue::refresh_front(&mut inner, &queue.readable);
        }

        let high = msg(2);
        high.set_timestamp(crate::node::MAX_TIMESTAMP - 1);
        high.set_queued(true);
        {
            let mut inner = queue.inner.lock();
            inner
                .messages
                .insert((crate::node::MAX_TIMESTAMP - 1, 2), Arc::clone(&high));
            Queue::refresh_front(&mut inner, &queue.readable);
        }

        let (front, cont) = queue.peek();
        assert_eq!(front.unwrap().sender(), 1);
        assert!(cont);
    }
}
