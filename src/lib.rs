//! Core primitives for a capability-based interprocess messaging subsystem.
//!
//! This crate implements the two hardest pieces of such a subsystem in
//! isolation from everything else (the device file, command dispatcher,
//! shared-memory pool, and node/handle tables are all external collaborators
//! that build on top of this crate, not part of it):
//!
//! - [`active`]: a reference-counted lifecycle gate ([`active::ActiveRef`])
//!   that every externally addressable object (notably a peer) uses to guard
//!   concurrent acquire/release against a one-shot teardown.
//! - [`queue`] and [`node`]: a per-peer ordered [`queue::Queue`] of
//!   [`node::Node`] entries that delivers a consistent partial order of
//!   multicast messages across many receivers without any global lock, using
//!   a distributed Lamport-clock protocol.
//! - [`transaction`]: the staging/commit protocol a multicast send runs
//!   across several destination queues to get that partial order.
//! - [`wait`]: the wait/notify primitive `drain` and the queue's blocking
//!   consumers are built on.
//!
//! There is no runtime configuration surface: admission control, backpressure
//! and message persistence are explicitly out of scope (see the crate's
//! design notes) and so there is nothing here to tune.

#![warn(missing_debug_implementations)]

pub mod active;
pub mod node;
pub mod queue;
pub mod transaction;
pub mod wait;

#[cfg(test)]
pub(crate) mod test_support;

pub use active::ActiveRef;
pub use node::{Node, NodeKind, NodeType};
pub use queue::Queue;
pub use transaction::Transaction;
pub use wait::WaitQueue;
