//! Participant side of the protocol.
//!
//! A node keeps a local replica of the counter, asks the coordinator for the
//! critical section, performs one increment per grant, and applies replicated
//! state in timestamp order. Its state survives restarts through a JSON
//! checkpoint file.
//!
//! - [`ReplicaState`]: counter, last applied timestamp, checkpoint files
//! - [`NodeAgent`]: transport-agnostic protocol state machine
//! - [`NodeRuntime`]: TCP connection and background threads around an agent

pub mod agent;
pub mod client;
pub mod state;


pub use agent::{Flow, NodeAgent, NodeError, NodePhase, NodeStatus};
pub use client::NodeRuntime;
pub use state::{
    checkpoint_path, precrash_path, read_checkpoint, read_precrash, ApplyOutcome, CheckpointError,
    CheckpointRecord, PreCrashRecord, ReplicaState, StateSnapshot,
};
