//! Connections and the pid → connection registry used for broadcasts.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::protocol::{Message, MessageSink, ProtocolError};

/// Coordinator-assigned identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound handle to one connected peer.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    sink: Arc<dyn MessageSink>,
}

impl Connection {
    pub fn new(id: ConnectionId, sink: Arc<dyn MessageSink>) -> Self {
        Connection { id, sink }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        self.sink.send(msg)
    }

    pub fn close(&self) {
        self.sink.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

/// Joined nodes, keyed by pid.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<u32, Connection>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        NodeRegistry {
            nodes: DashMap::new(),
        }
    }

    /// Register `pid`. A re-JOIN replaces the previous connection.
    ///
    /// Returns the replaced connection, if any.
    pub fn register(&self, pid: u32, conn: Connection) -> Option<Connection> {
        self.nodes.insert(pid, conn)
    }

    /// Remove every pid bound to `conn`. Returns the removed pids.
    pub fn remove_connection(&self, conn: ConnectionId) -> Vec<u32> {
        let pids: Vec<u32> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().id() == conn)
            .map(|entry| *entry.key())
            .collect();
        for pid in &pids {
            self.nodes.remove_if(pid, |_, c| c.id() == conn);
        }
        pids
    }

    /// Point-in-time copy of all broadcast targets.
    pub fn targets(&self) -> Vec<(u32, Connection)> {
        let mut targets: Vec<_> = self
            .nodes
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        targets.sort_by_key(|(pid, _)| *pid);
        targets
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.nodes.iter().map(|entry| *entry.key()).collect();
        pids.sort_unstable();
        pids
    }
}
