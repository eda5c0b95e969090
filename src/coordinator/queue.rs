//! Ordered request queue.
//!
//! Requests are granted strictly by `(lamport_time, pid)`. The pid tie-break
//! makes concurrent requests with equal timestamps deterministic.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use super::registry::{Connection, ConnectionId};

/// A REQUEST waiting for its GRANT.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Lamport timestamp carried by the REQUEST.
    pub lamport_time: u64,
    /// Requesting node.
    pub pid: u32,
    /// Connection the GRANT goes back to.
    pub conn: Connection,
}

impl PendingRequest {
    pub fn new(lamport_time: u64, pid: u32, conn: Connection) -> Self {
        PendingRequest {
            lamport_time,
            pid,
            conn,
        }
    }

    fn key(&self) -> (u64, u32, ConnectionId) {
        (self.lamport_time, self.pid, self.conn.id())
    }
}

impl PartialEq for PendingRequest {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for PendingRequest {}

impl PartialOrd for PendingRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // Connection id only separates a pid that re-requested on a new
        // connection with the same timestamp.
        self.key().cmp(&other.key())
    }
}

/// Min-ordered queue of pending requests.
#[derive(Debug, Default)]
pub struct RequestQueue {
    heap: BinaryHeap<Reverse<PendingRequest>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, request: PendingRequest) {
        self.heap.push(Reverse(request));
    }

    /// Remove and return the lowest `(lamport_time, pid)` request.
    pub fn pop_min(&mut self) -> Option<PendingRequest> {
        self.heap.pop().map(|Reverse(r)| r)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every request that would be answered on `conn`.
    ///
    /// Returns the number of evicted requests.
    pub fn purge_connection(&mut self, conn: ConnectionId) -> usize {
        let before = self.heap.len();
        self.heap.retain(|Reverse(r)| r.conn.id() != conn);
        before - self.heap.len()
    }

    /// Pids in grant order, for status reporting.
    pub fn pids_in_order(&self) -> Vec<u32> {
        let mut entries: Vec<_> = self.heap.iter().map(|Reverse(r)| r.key()).collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, pid, _)| pid).collect()
    }
}
