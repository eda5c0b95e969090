//! Central arbiter of the critical section.
//!
//! The coordinator:
//! - keeps every REQUEST in one queue ordered by `(lamport_time, pid)`
//! - grants the head of the queue whenever the section is free
//! - is the single writer of the canonical counter (one increment per DO_OP)
//! - replicates `(counter, timestamp)` to every joined node asynchronously
//!
//! # Invariants
//!
//! 1. **Single Holder**: the queue and the holder share one lock; at most one
//!    GRANT is outstanding.
//! 2. **Total Order**: grants follow `(lamport_time, pid)` ascending.
//! 3. **No Dead Grants**: a GRANT that cannot be delivered is rolled back and
//!    the next request is tried.
//! 4. **Clock Merge First**: every inbound message advances the coordinator
//!    clock before it is handled.

pub mod arbiter;
pub mod engine;
pub mod queue;
pub mod registry;
pub mod replication;
pub mod server;

#[cfg(test)]
mod tests;

pub use arbiter::{BoundedLease, GrantExpiry, Holder, NeverExpire};
pub use engine::{Coordinator, CoordinatorStatus};
pub use queue::{PendingRequest, RequestQueue};
pub use registry::{Connection, ConnectionId, NodeRegistry};
pub use replication::Replicator;
pub use server::{CoordinatorServer, ServerHandle};
