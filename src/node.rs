//! Queue entries.
//!
//! Grounded on `original_source/ipc/bus1/util/queue.h`'s `bus1_queue_node`:
//! a 62-bit timestamp and a 2-bit type tag share one 64-bit word, the sender
//! tag tie-breaks nodes that land on the same timestamp, and a node's
//! reference count governs deallocation rather than the queue alone owning
//! it outright (a `Transaction` keeps its own reference to a staged node
//! until it is either committed or aborted).

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering::*};

use bytes::Bytes;

const TYPE_SHIFT: u32 = 62;
const TYPE_MASK: u64 = 0b11 << TYPE_SHIFT;
const TIMESTAMP_MASK: u64 = !TYPE_MASK;

/// Maximum timestamp representable in the low 62 bits. Wraparound is not a
/// practical concern: at one tick per nanosecond this takes over 146 years.
pub const MAX_TIMESTAMP: u64 = TIMESTAMP_MASK;

/// Stable wire values for [`Node`]'s type tag, packed in the top two bits of
/// the timestamp-and-type word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    Message = 0,
    HandleDestruction = 1,
    HandleRelease = 2,
}

impl NodeType {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => NodeType::Message,
            1 => NodeType::HandleDestruction,
            2 => NodeType::HandleRelease,
            other => unreachable!("corrupt node type tag {other}"),
        }
    }
}

/// The payload a node carries, keyed on [`NodeType`]. This is an ambient
/// addition beyond the core ordering primitive: a real queue has to carry
/// *something* to hand back to the peer once a node is dequeued, and message
/// bytes are delivered as [`Bytes`] the same way
/// `h2o_kernel::sched::ipc::channel::Packet` carries its buffer.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Message(Bytes),
    HandleDestruction,
    HandleRelease,
}

impl NodeKind {
    fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Message(_) => NodeType::Message,
            NodeKind::HandleDestruction => NodeType::HandleDestruction,
            NodeKind::HandleRelease => NodeType::HandleRelease,
        }
    }
}

/// A single entry in a [`crate::queue::Queue`].
///
/// Node type is immutable for the node's lifetime; timestamp moves
/// monotonically forward as the node goes from staging (odd) to committed
/// (even). `sender` must be unique among concurrently-live senders and
/// stable for the node's life — it is the tie-breaker when two committed
/// nodes land on the same timestamp (see [`crate::queue`] docs).
///
/// A `Node` belongs to exactly one queue. A multicast to several
/// destinations allocates one distinct `Node` per destination (all sharing
/// the same `sender` tag, since they came from the same send); it must not
/// `Arc::clone` a single node across multiple queues; the timestamp and
/// queued-state fields are per-destination state, not payload, and cloning
/// the `Arc` only shares the *same* underlying copy of them.
pub struct Node {
    sender: usize,
    timestamp_and_type: AtomicU64,
    queued: AtomicBool,
    kind: NodeKind,
}

impl Node {
    /// Initializes a node. The node starts out unqueued with timestamp 0;
    /// [`crate::queue::Queue::stage`] or
    /// [`crate::queue::Queue::commit_unstaged`] assigns its real timestamp
    /// when it is inserted.
    pub fn new(sender: usize, kind: NodeKind) -> Self {
        let type_bits = (kind.node_type() as u64) << TYPE_SHIFT;
        Node {
            sender,
            timestamp_and_type: AtomicU64::new(type_bits),
            queued: AtomicBool::new(false),
            kind,
        }
    }

    #[inline]
    pub fn sender(&self) -> usize {
        self.sender
    }

    #[inline]
    pub fn node_type(&self) -> NodeType {
        NodeType::from_bits((self.timestamp_and_type.load(Acquire) & TYPE_MASK) >> TYPE_SHIFT)
    }

    #[inline]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The timestamp currently assigned to this node. Meaningless (and
    /// racy to rely on) for a node that was never staged/committed and is
    /// not currently queued.
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp_and_type.load(Acquire) & TIMESTAMP_MASK
    }

    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Acquire)
    }

    /// A node is staging iff it is queued and its timestamp is odd.
    #[inline]
    pub fn is_staging(&self) -> bool {
        self.is_queued() && self.timestamp() % 2 == 1
    }

    /// Only [`crate::queue`] mutates a node's timestamp, always while
    /// holding the owning queue's lock.
    pub(crate) fn set_timestamp(&self, timestamp: u64) {
        debug_assert!(timestamp <= MAX_TIMESTAMP);
        let type_bits = self.timestamp_and_type.load(Acquire) & TYPE_MASK;
        self.timestamp_and_type.store(type_bits | timestamp, Release);
    }

    pub(crate) fn set_queued(&self, queued: bool) {
        self.queued.store(queued, Release);
    }
}

impl Drop for Node {
    /// Diagnostics only, mirroring `bus1_queue_node_deinit`: a node must not
    /// be dropped while still linked into a queue.
    fn drop(&mut self) {
        debug_assert!(
            !self.is_queued(),
            "node dropped while still linked into a queue"
        );
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("sender", &self.sender)
            .field("node_type", &self.node_type())
            .field("timestamp", &self.timestamp())
            .field("queued", &self.is_queued())
            .finish()
    }
}
