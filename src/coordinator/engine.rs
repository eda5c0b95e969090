use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::LamportClock;
use crate::config::{CoordinatorConfig, ReplicationConfig};
use crate::protocol::{Message, MessageKind, MessageSink};

use super::arbiter::{Arbiter, BoundedLease, GrantExpiry, Holder, NeverExpire};
use super::queue::PendingRequest;
use super::registry::{Connection, ConnectionId, NodeRegistry};
use super::replication::Replicator;

/// Read-only view of the coordinator for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    /// Canonical shared counter.
    pub counter: u64,
    /// Current coordinator Lamport time.
    pub clock: u64,
    /// Pid inside the critical section, if any.
    pub holder: Option<u32>,
    /// Pids waiting, in grant order.
    pub queued: Vec<u32>,
    /// Joined pids.
    pub nodes: Vec<u32>,
}

/// The central arbiter.
///
/// One instance owns all coordinator state; connection threads share it
/// through an `Arc`.
#[derive(Debug)]
pub struct Coordinator {
    clock: LamportClock,
    /// Canonical counter. Single writer: the DO_OP handler.
    counter: Mutex<u64>,
    arbiter: Mutex<Arbiter>,
    registry: NodeRegistry,
    replicator: Replicator,
    expiry: Box<dyn GrantExpiry>,
    next_conn_id: AtomicU64,
}

impl Coordinator {
    pub fn new(config: &CoordinatorConfig) -> Self {
        let expiry: Box<dyn GrantExpiry> = match config.grant_lease {
            Some(lease) => Box::new(BoundedLease(lease)),
            None => Box::new(NeverExpire),
        };
        Self::with_expiry(config.replication.clone(), expiry)
    }

    pub fn with_expiry(replication: ReplicationConfig, expiry: Box<dyn GrantExpiry>) -> Self {
        Coordinator {
            clock: LamportClock::new(),
            counter: Mutex::new(0),
            arbiter: Mutex::new(Arbiter::new()),
            registry: NodeRegistry::new(),
            replicator: Replicator::new(replication),
            expiry,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Wrap a freshly accepted peer in a [`Connection`] with a unique id.
    pub fn open_connection(&self, sink: Arc<dyn MessageSink>) -> Connection {
        let id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::SeqCst));
        Connection::new(id, sink)
    }

    /// Handle one inbound message from `conn`.
    ///
    /// The coordinator clock always merges the sender's timestamp first.
    pub fn handle_message(&self, conn: &Connection, msg: Message) {
        let now = self.clock.update(msg.clock);
        debug!(kind = ?msg.kind, pid = msg.pid, remote_clock = msg.clock, clock = now, "inbound");

        match msg.kind {
            MessageKind::Join => self.on_join(conn, msg.pid),
            MessageKind::Request => self.on_request(conn, msg.pid, msg.clock),
            MessageKind::DoOp => self.on_do_op(&msg),
            MessageKind::Release => self.on_release(msg.pid),
            MessageKind::Grant
            | MessageKind::State
            | MessageKind::Rollback
            | MessageKind::Unknown => {
                debug!(kind = ?msg.kind, pid = msg.pid, "ignored");
            }
        }
    }

    fn on_join(&self, conn: &Connection, pid: u32) {
        if let Some(previous) = self.registry.register(pid, conn.clone()) {
            if previous.id() != conn.id() {
                warn!(pid, old = %previous.id(), new = %conn.id(), "pid re-joined on a new connection");
            }
        }
        info!(pid, conn = %conn.id(), "JOIN");
    }

    fn on_request(&self, conn: &Connection, pid: u32, lamport_time: u64) {
        {
            let mut arbiter = self.arbiter.lock();
            arbiter.enqueue(PendingRequest::new(lamport_time, pid, conn.clone()));
            info!(pid, lamport_time, queued = arbiter.queue.len(), "REQUEST");
        }
        self.try_grant_next();
    }

    fn on_do_op(&self, msg: &Message) {
        let holder = self.arbiter.lock().holder.as_ref().map(|h| h.pid);
        if holder != Some(msg.pid) {
            warn!(pid = msg.pid, holder = ?holder, "DO_OP from a node that does not hold the critical section");
        }
        if let Some(op) = msg.op_payload() {
            if op.delta != 1 {
                debug!(pid = msg.pid, delta = op.delta, "non-unit delta; canonical step is +1");
            }
        }

        // Stamp under the counter lock so timestamps follow counter order.
        let (counter, timestamp) = {
            let mut counter = self.counter.lock();
            *counter += 1;
            (*counter, self.clock.increment())
        };
        info!(pid = msg.pid, counter, clock = timestamp, "DO_OP applied");
        self.broadcast_state(counter, timestamp);
    }

    fn on_release(&self, pid: u32) {
        let released = {
            let mut arbiter = self.arbiter.lock();
            let released = arbiter.release(pid);
            if !released {
                let holder = arbiter.holder.as_ref().map(|h| h.pid);
                warn!(pid, holder = ?holder, "RELEASE from a node that does not hold the critical section");
            }
            released
        };
        if released {
            info!(pid, "RELEASE");
            self.try_grant_next();
        }
    }

    /// Grant the critical section to the head of the queue if it is free.
    ///
    /// The holder is staged under the arbiter lock and the GRANT is written
    /// after the lock is dropped, so a peer with a full socket buffer only
    /// stalls the thread granting to it. A dead connection must not stall the
    /// section: on a failed send the staged holder is withdrawn and the next
    /// request is tried.
    pub fn try_grant_next(&self) {
        loop {
            let (request, grant_clock) = {
                let mut arbiter = self.arbiter.lock();
                if let Some(expired) = arbiter.expire(self.expiry.as_ref(), Instant::now()) {
                    warn!(pid = expired.pid, grant_clock = expired.grant_clock, "grant lease expired");
                }
                let Some(request) = arbiter.next_candidate() else {
                    return;
                };
                let grant_clock = self.clock.increment();
                arbiter.holder = Some(Holder {
                    pid: request.pid,
                    conn: request.conn.id(),
                    grant_clock,
                    granted_at: Instant::now(),
                });
                (request, grant_clock)
            };

            match request.conn.send(&Message::grant(grant_clock)) {
                Ok(()) => {
                    info!(pid = request.pid, lamport_time = request.lamport_time, clock = grant_clock, "GRANT");
                    return;
                }
                Err(e) => {
                    warn!(pid = request.pid, error = %e, "GRANT failed; trying next request");
                    let mut arbiter = self.arbiter.lock();
                    let still_staged = arbiter
                        .holder
                        .as_ref()
                        .is_some_and(|h| h.pid == request.pid && h.grant_clock == grant_clock);
                    if !still_staged {
                        // Already reclaimed and regranted elsewhere.
                        return;
                    }
                    arbiter.holder = None;
                }
            }
        }
    }

    /// Replicate `(counter, timestamp)` to every joined node.
    pub fn broadcast_state(&self, counter: u64, timestamp: u64) -> usize {
        let targets = self.registry.targets();
        self.replicator
            .fan_out(targets, Message::state(timestamp, counter), true)
    }

    /// Ask every joined node to restore its last checkpoint.
    ///
    /// Best effort: no acknowledgement, no retry. Returns the number of
    /// targets the ROLLBACK was submitted to.
    pub fn request_global_rollback(&self, reason: &str) -> usize {
        let clock = self.clock.increment();
        info!(reason, clock, "requesting global rollback");
        let targets = self.registry.targets();
        self.replicator
            .fan_out(targets, Message::rollback(clock, reason), false)
    }

    /// Forget a connection after an I/O failure or a clean close.
    ///
    /// Broadcast registrations and still-queued requests are purged. A
    /// holder on this connection keeps the section unless the expiry policy
    /// reclaims it.
    pub fn disconnect(&self, conn: &Connection) {
        conn.close();
        let pids = self.registry.remove_connection(conn.id());

        let mut arbiter = self.arbiter.lock();
        let purged = arbiter.queue.purge_connection(conn.id());
        let held = arbiter
            .holder
            .as_ref()
            .filter(|h| h.conn == conn.id())
            .map(|h| h.pid);
        drop(arbiter);

        info!(conn = %conn.id(), pids = ?pids, purged, "disconnected");
        if let Some(pid) = held {
            warn!(pid, "holder disconnected inside the critical section");
        }
    }

    /// Reclaim an expired grant and hand the section to the next request.
    ///
    /// Returns the pid that lost the section, if any.
    pub fn expire_stale_grant(&self) -> Option<u32> {
        let expired = self.arbiter.lock().expire(self.expiry.as_ref(), Instant::now())?;
        warn!(pid = expired.pid, grant_clock = expired.grant_clock, "grant lease expired");
        self.try_grant_next();
        Some(expired.pid)
    }

    /// Lease configured by the expiry policy.
    pub fn grant_lease(&self) -> Option<Duration> {
        self.expiry.lease()
    }

    pub fn is_busy(&self) -> bool {
        self.arbiter.lock().is_busy()
    }

    pub fn holder(&self) -> Option<u32> {
        self.arbiter.lock().holder.as_ref().map(|h| h.pid)
    }

    pub fn counter(&self) -> u64 {
        *self.counter.lock()
    }

    pub fn clock(&self) -> u64 {
        self.clock.current()
    }

    pub fn joined(&self) -> Vec<u32> {
        self.registry.pids()
    }

    /// Wait for outstanding replication tasks. Returns false on timeout.
    pub fn wait_replication_idle(&self, timeout: Duration) -> bool {
        self.replicator.wait_idle(timeout)
    }

    pub fn status(&self) -> CoordinatorStatus {
        let counter = self.counter();
        let (holder, queued) = {
            let arbiter = self.arbiter.lock();
            (
                arbiter.holder.as_ref().map(|h| h.pid),
                arbiter.queue.pids_in_order(),
            )
        };
        CoordinatorStatus {
            counter,
            clock: self.clock.current(),
            holder,
            queued,
            nodes: self.registry.pids(),
        }
    }
}
