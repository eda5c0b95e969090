//! Centralized mutual exclusion ordered by Lamport clocks.
//!
//! A single coordinator arbitrates access to a shared counter. Nodes request
//! the critical section, the coordinator grants requests in
//! `(lamport_time, pid)` order, applies the canonical increment and replicates
//! the resulting state to every joined node asynchronously.
//!
//! # Invariants
//!
//! 1. **Monotonic Clocks**: every participant's Lamport clock only advances.
//! 2. **Total Grant Order**: critical-section entry follows `(lamport_time, pid)`.
//! 3. **Single Holder**: at most one GRANT is outstanding at any instant.
//! 4. **Monotonic Apply**: a node applies STATE only with a strictly newer timestamp.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod node;
pub mod protocol;
pub mod telemetry;


pub use clock::LamportClock;
pub use config::{CoordinatorConfig, CrashMode, NodeConfig, ReplicationConfig};
pub use coordinator::{Coordinator, CoordinatorServer, CoordinatorStatus};
pub use node::{NodeAgent, NodePhase, NodeRuntime, ReplicaState, StateSnapshot};
pub use protocol::{Message, MessageKind, ProtocolError};
