//! Wire protocol shared by the coordinator and the nodes.
//!
//! Messages travel as one JSON object per line over a persistent duplex
//! connection. Every message carries the sender's Lamport timestamp; the
//! receiver merges it into its own clock before acting on the body.

pub mod codec;
pub mod message;
pub mod transport;

use thiserror::Error;

pub use codec::{write_message, MessageReader};
pub use message::{
    Message, MessageKind, OpPayload, RollbackPayload, StatePayload, COORDINATOR_PID,
};
pub use transport::{ChannelSink, MessageSink, TcpSink};

/// Errors raised while moving messages across a connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Read or write failure on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line could not be decoded into a [`Message`].
    #[error("malformed message: {0}")]
    Decode(#[source] serde_json::Error),

    /// A message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// The peer (or our own side) has closed the connection.
    #[error("connection closed")]
    Closed,
}
