use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;

/// Identity the coordinator stamps on every message it sends.
pub const COORDINATOR_PID: u32 = 0;

/// Protocol message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Node announces itself for broadcast targeting.
    Join,
    /// Node asks for the critical section.
    Request,
    /// Coordinator authorizes one node to enter the critical section.
    Grant,
    /// Node reports the critical operation it performed.
    DoOp,
    /// Node leaves the critical section.
    Release,
    /// Coordinator replicates the canonical counter.
    State,
    /// Coordinator asks every node to restore its last checkpoint.
    Rollback,
    /// Any kind this build does not know. Receivers ignore it.
    #[serde(other)]
    Unknown,
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sender identity. The coordinator uses [`COORDINATOR_PID`].
    pub pid: u32,
    /// Sender's Lamport timestamp at send time.
    pub clock: u64,
    /// Kind-specific body.
    #[serde(default)]
    pub payload: Value,
}

/// Body of a DO_OP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpPayload {
    pub delta: i64,
}

/// Body of a STATE message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub counter: u64,
}

/// Body of a ROLLBACK message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPayload {
    pub reason: String,
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Message {
    fn with_payload<P: Serialize>(kind: MessageKind, pid: u32, clock: u64, payload: &P) -> Self {
        Message {
            kind,
            pid,
            clock,
            // Plain structs of integers and strings always serialize.
            payload: serde_json::to_value(payload).unwrap_or_else(|_| empty_payload()),
        }
    }

    fn bare(kind: MessageKind, pid: u32, clock: u64) -> Self {
        Message {
            kind,
            pid,
            clock,
            payload: empty_payload(),
        }
    }

    pub fn join(pid: u32, clock: u64) -> Self {
        Self::bare(MessageKind::Join, pid, clock)
    }

    pub fn request(pid: u32, clock: u64) -> Self {
        Self::bare(MessageKind::Request, pid, clock)
    }

    pub fn grant(clock: u64) -> Self {
        Self::bare(MessageKind::Grant, COORDINATOR_PID, clock)
    }

    pub fn do_op(pid: u32, clock: u64, delta: i64) -> Self {
        Self::with_payload(MessageKind::DoOp, pid, clock, &OpPayload { delta })
    }

    pub fn release(pid: u32, clock: u64) -> Self {
        Self::bare(MessageKind::Release, pid, clock)
    }

    pub fn state(clock: u64, counter: u64) -> Self {
        Self::with_payload(MessageKind::State, COORDINATOR_PID, clock, &StatePayload { counter })
    }

    pub fn rollback(clock: u64, reason: impl Into<String>) -> Self {
        Self::with_payload(
            MessageKind::Rollback,
            COORDINATOR_PID,
            clock,
            &RollbackPayload {
                reason: reason.into(),
            },
        )
    }

    /// Decode the STATE body, or `None` if it does not match the schema.
    pub fn state_payload(&self) -> Option<StatePayload> {
        StatePayload::deserialize(&self.payload).ok()
    }

    /// Decode the DO_OP body, or `None` if it does not match the schema.
    pub fn op_payload(&self) -> Option<OpPayload> {
        OpPayload::deserialize(&self.payload).ok()
    }

    /// Decode the ROLLBACK body, or `None` if it does not match the schema.
    pub fn rollback_payload(&self) -> Option<RollbackPayload> {
        RollbackPayload::deserialize(&self.payload).ok()
    }

    /// Serialize to a single JSON line (without the trailing newline).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse one JSON line.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(ProtocolError::Decode)
    }
}
