//! Coordinator tests over in-memory connections.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::config::ReplicationConfig;
use crate::protocol::{ChannelSink, Message, MessageKind, MessageSink};

use super::arbiter::{BoundedLease, GrantExpiry, NeverExpire};
use super::engine::Coordinator;
use super::registry::Connection;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// One simulated node: the coordinator-side connection plus what it received.
struct Peer {
    pid: u32,
    conn: Connection,
    sink: Arc<ChannelSink>,
    rx: Receiver<Message>,
}

impl Peer {
    fn connect(coordinator: &Coordinator, pid: u32) -> Self {
        let (sink, rx) = ChannelSink::pair();
        let conn = coordinator.open_connection(sink.clone());
        Peer {
            pid,
            conn,
            sink,
            rx,
        }
    }

    fn send(&self, coordinator: &Coordinator, msg: Message) {
        coordinator.handle_message(&self.conn, msg);
    }

    fn join(&self, coordinator: &Coordinator) {
        self.send(coordinator, Message::join(self.pid, 1));
    }

    fn request(&self, coordinator: &Coordinator, clock: u64) {
        self.send(coordinator, Message::request(self.pid, clock));
    }

    fn release(&self, coordinator: &Coordinator, clock: u64) {
        self.send(coordinator, Message::release(self.pid, clock));
    }

    /// Next message of `kind`, skipping others.
    fn expect(&self, kind: MessageKind) -> Message {
        loop {
            let msg = self
                .rx
                .recv_timeout(RECV_TIMEOUT)
                .unwrap_or_else(|_| panic!("pid {} never received {:?}", self.pid, kind));
            if msg.kind == kind {
                return msg;
            }
        }
    }

    fn has_pending(&self, kind: MessageKind) -> bool {
        self.rx.try_iter().any(|m| m.kind == kind)
    }
}

fn coordinator_with(expiry: Box<dyn GrantExpiry>) -> Coordinator {
    Coordinator::with_expiry(
        ReplicationConfig {
            max_delay: Duration::ZERO,
        },
        expiry,
    )
}

fn coordinator() -> Coordinator {
    coordinator_with(Box::new(NeverExpire))
}

#[test]
fn test_clock_merges_before_handling() {
    let coordinator = coordinator();
    let peer = Peer::connect(&coordinator, 1);

    peer.send(&coordinator, Message::join(1, 50));
    assert_eq!(coordinator.clock(), 51);

    // Older remote clock still advances by one.
    peer.send(&coordinator, Message::join(1, 3));
    assert_eq!(coordinator.clock(), 52);
}

#[test]
fn test_grant_stamped_after_request() {
    let coordinator = coordinator();
    let peer = Peer::connect(&coordinator, 1);

    peer.request(&coordinator, 40);
    let grant = peer.expect(MessageKind::Grant);
    assert!(grant.clock > 40);
    assert_eq!(grant.pid, 0);
    assert_eq!(coordinator.holder(), Some(1));
}

/// Requests `[(3, A), (3, B), (1, C)]` are granted C, A, B.
#[test]
fn test_grant_order_follows_lamport_then_pid() {
    let coordinator = coordinator();
    let blocker = Peer::connect(&coordinator, 9);
    let a = Peer::connect(&coordinator, 1);
    let b = Peer::connect(&coordinator, 2);
    let c = Peer::connect(&coordinator, 3);

    // Hold the section so all three requests queue up.
    blocker.request(&coordinator, 1);
    blocker.expect(MessageKind::Grant);

    a.request(&coordinator, 3);
    b.request(&coordinator, 3);
    c.request(&coordinator, 1);
    assert_eq!(coordinator.status().queued, vec![3, 1, 2]);

    let peers = [&a, &b, &c];
    let mut order = Vec::new();
    let mut releasing = &blocker;
    for _ in 0..3 {
        releasing.release(&coordinator, 100);
        let next = peers
            .iter()
            .find(|p| p.has_pending(MessageKind::Grant))
            .expect("someone must be granted");
        order.push(next.pid);
        releasing = *next;
    }
    assert_eq!(order, vec![3, 1, 2]);
}

#[test]
fn test_single_holder() {
    let coordinator = coordinator();
    let first = Peer::connect(&coordinator, 1);
    let second = Peer::connect(&coordinator, 2);

    first.request(&coordinator, 2);
    second.request(&coordinator, 1);

    // The first arrival took the free section; the second waits even though
    // its timestamp is lower.
    first.expect(MessageKind::Grant);
    assert!(!second.has_pending(MessageKind::Grant));
    assert!(coordinator.is_busy());
    assert_eq!(coordinator.holder(), Some(1));
    assert_eq!(coordinator.status().queued, vec![2]);

    first.release(&coordinator, 10);
    second.expect(MessageKind::Grant);
    assert_eq!(coordinator.holder(), Some(2));
}

#[test]
fn test_failed_grant_moves_to_next_request() {
    let coordinator = coordinator();
    let blocker = Peer::connect(&coordinator, 9);
    let dead = Peer::connect(&coordinator, 1);
    let live = Peer::connect(&coordinator, 2);

    blocker.request(&coordinator, 1);
    dead.request(&coordinator, 2);
    live.request(&coordinator, 3);

    dead.sink.close();
    blocker.release(&coordinator, 10);

    live.expect(MessageKind::Grant);
    assert_eq!(coordinator.holder(), Some(2));
    assert!(coordinator.status().queued.is_empty());
}

#[test]
fn test_failed_grant_with_empty_queue_frees_section() {
    let coordinator = coordinator();
    let dead = Peer::connect(&coordinator, 1);
    dead.sink.close();

    dead.request(&coordinator, 1);
    assert!(!coordinator.is_busy());
}

#[test]
fn test_do_op_updates_counter_and_replicates() {
    let coordinator = coordinator();
    let one = Peer::connect(&coordinator, 1);
    let two = Peer::connect(&coordinator, 2);
    one.join(&coordinator);
    two.join(&coordinator);

    one.request(&coordinator, 2);
    one.expect(MessageKind::Grant);
    one.send(&coordinator, Message::do_op(1, 7, 1));
    assert_eq!(coordinator.counter(), 1);
    assert!(coordinator.wait_replication_idle(RECV_TIMEOUT));

    let s1 = one.expect(MessageKind::State);
    let s2 = two.expect(MessageKind::State);
    assert_eq!(s1.state_payload().unwrap().counter, 1);
    assert_eq!(s2.state_payload().unwrap().counter, 1);
    assert_eq!(s1.clock, s2.clock);
    assert!(s1.clock > 7);

    // DO_OP does not release the section by itself.
    assert_eq!(coordinator.holder(), Some(1));
}

#[test]
fn test_state_timestamps_follow_counter() {
    let coordinator = coordinator();
    let peer = Peer::connect(&coordinator, 1);
    peer.join(&coordinator);

    let mut last = 0;
    for expected in 1..=3u64 {
        peer.request(&coordinator, coordinator.clock());
        peer.expect(MessageKind::Grant);
        peer.send(&coordinator, Message::do_op(1, coordinator.clock(), 1));
        let state = peer.expect(MessageKind::State);
        assert_eq!(state.state_payload().unwrap().counter, expected);
        assert!(state.clock > last);
        last = state.clock;
        peer.release(&coordinator, state.clock + 1);
    }
    assert_eq!(coordinator.counter(), 3);
}

#[test]
fn test_release_from_non_holder_is_ignored() {
    let coordinator = coordinator();
    let holder = Peer::connect(&coordinator, 1);
    let other = Peer::connect(&coordinator, 2);

    holder.request(&coordinator, 1);
    holder.expect(MessageKind::Grant);
    other.request(&coordinator, 2);

    other.release(&coordinator, 3);
    assert_eq!(coordinator.holder(), Some(1));
    assert!(!other.has_pending(MessageKind::Grant));

    holder.release(&coordinator, 4);
    other.expect(MessageKind::Grant);
}

#[test]
fn test_disconnect_purges_queue_and_registry() {
    let coordinator = coordinator();
    let blocker = Peer::connect(&coordinator, 9);
    let leaving = Peer::connect(&coordinator, 1);
    let staying = Peer::connect(&coordinator, 2);
    leaving.join(&coordinator);
    staying.join(&coordinator);

    blocker.request(&coordinator, 1);
    leaving.request(&coordinator, 2);
    assert_eq!(coordinator.status().queued, vec![1]);

    coordinator.disconnect(&leaving.conn);
    assert!(leaving.sink.is_closed());

    let status = coordinator.status();
    assert!(status.queued.is_empty());
    assert_eq!(status.nodes, vec![2]);

    blocker.release(&coordinator, 5);
    assert!(!coordinator.is_busy());
}

#[test]
fn test_holder_disconnect_keeps_section_busy() {
    let coordinator = coordinator();
    let holder = Peer::connect(&coordinator, 3);
    let waiter = Peer::connect(&coordinator, 4);

    holder.request(&coordinator, 1);
    holder.expect(MessageKind::Grant);
    waiter.request(&coordinator, 2);

    coordinator.disconnect(&holder.conn);

    // No lease by default: the section stays held by the dead node.
    assert!(coordinator.is_busy());
    assert_eq!(coordinator.holder(), Some(3));
    assert_eq!(coordinator.expire_stale_grant(), None);
    assert!(!waiter.has_pending(MessageKind::Grant));
}

#[test]
fn test_bounded_lease_reclaims_section() {
    let coordinator = coordinator_with(Box::new(BoundedLease(Duration::from_millis(20))));
    assert_eq!(coordinator.grant_lease(), Some(Duration::from_millis(20)));
    let holder = Peer::connect(&coordinator, 3);
    let waiter = Peer::connect(&coordinator, 4);

    holder.request(&coordinator, 1);
    holder.expect(MessageKind::Grant);
    waiter.request(&coordinator, 2);
    assert_eq!(coordinator.expire_stale_grant(), None);

    thread::sleep(Duration::from_millis(40));
    assert_eq!(coordinator.expire_stale_grant(), Some(3));
    waiter.expect(MessageKind::Grant);
    assert_eq!(coordinator.holder(), Some(4));

    // The late RELEASE from the expired holder changes nothing.
    holder.release(&coordinator, 10);
    assert_eq!(coordinator.holder(), Some(4));
}

#[test]
fn test_global_rollback_reaches_joined_nodes() {
    let coordinator = coordinator();
    let one = Peer::connect(&coordinator, 1);
    let two = Peer::connect(&coordinator, 2);
    let stranger = Peer::connect(&coordinator, 3);
    one.join(&coordinator);
    two.join(&coordinator);

    let before = coordinator.clock();
    assert_eq!(coordinator.request_global_rollback("bad batch"), 2);
    assert!(coordinator.wait_replication_idle(RECV_TIMEOUT));

    for peer in [&one, &two] {
        let msg = peer.expect(MessageKind::Rollback);
        assert_eq!(msg.clock, before + 1);
        assert_eq!(msg.rollback_payload().unwrap().reason, "bad batch");
    }
    assert!(!stranger.has_pending(MessageKind::Rollback));
}

#[test]
fn test_node_only_kinds_are_ignored() {
    let coordinator = coordinator();
    let peer = Peer::connect(&coordinator, 1);

    peer.send(&coordinator, Message::grant(5));
    peer.send(&coordinator, Message::state(6, 99));
    peer.send(
        &coordinator,
        Message::decode(r#"{"type":"PING","pid":1,"clock":7,"payload":{}}"#).unwrap(),
    );

    let status = coordinator.status();
    assert_eq!(status.counter, 0);
    assert_eq!(status.holder, None);
    assert!(status.nodes.is_empty());
    assert_eq!(status.clock, 8);
}

#[test]
fn test_replication_send_failure_is_isolated() {
    let coordinator = coordinator();
    let broken = Peer::connect(&coordinator, 1);
    let healthy = Peer::connect(&coordinator, 2);
    broken.join(&coordinator);
    healthy.join(&coordinator);
    broken.sink.close();

    assert_eq!(coordinator.broadcast_state(5, 42), 2);
    assert!(coordinator.wait_replication_idle(RECV_TIMEOUT));
    let state = healthy.expect(MessageKind::State);
    assert_eq!(state.clock, 42);
    assert!(broken.sink.send(&Message::grant(1)).is_err());
}

/// Sink whose writes block until the gate opens, like a peer with a full
/// socket buffer.
struct GatedSink {
    entered: crossbeam_channel::Sender<()>,
    gate: Receiver<()>,
    inner: Arc<ChannelSink>,
}

impl MessageSink for GatedSink {
    fn send(&self, msg: &Message) -> Result<(), crate::protocol::ProtocolError> {
        let _ = self.entered.send(());
        let _ = self.gate.recv();
        self.inner.send(msg)
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[test]
fn test_blocked_grant_write_does_not_hold_arbiter() {
    let coordinator = Arc::new(coordinator());
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
    let (inner, slow_rx) = ChannelSink::pair();
    let slow_conn = coordinator.open_connection(Arc::new(GatedSink {
        entered: entered_tx,
        gate: gate_rx,
        inner,
    }));

    let granting = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.handle_message(&slow_conn, Message::request(1, 1)))
    };
    entered_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    // Other connections keep being served while the GRANT write is stuck.
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    {
        let coordinator = coordinator.clone();
        thread::spawn(move || {
            let other = Peer::connect(&coordinator, 2);
            other.join(&coordinator);
            other.request(&coordinator, 2);
            let _ = done_tx.send(coordinator.status());
        });
    }
    let status = done_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(status.holder, Some(1));
    assert_eq!(status.queued, vec![2]);
    assert_eq!(status.nodes, vec![2]);

    drop(gate_tx);
    granting.join().unwrap();
    assert_eq!(slow_rx.try_recv().unwrap().kind, MessageKind::Grant);
}

#[test]
fn test_try_grant_next_respects_live_holder() {
    let coordinator = coordinator();
    coordinator.try_grant_next();
    assert!(!coordinator.is_busy());

    let holder = Peer::connect(&coordinator, 1);
    let waiter = Peer::connect(&coordinator, 2);
    holder.request(&coordinator, 1);
    holder.expect(MessageKind::Grant);
    waiter.request(&coordinator, 2);

    coordinator.try_grant_next();
    assert_eq!(coordinator.holder(), Some(1));
    assert!(!waiter.has_pending(MessageKind::Grant));
}

#[test]
fn test_try_grant_next_reclaims_expired_lease() {
    let coordinator = coordinator_with(Box::new(BoundedLease(Duration::from_millis(20))));
    let holder = Peer::connect(&coordinator, 1);
    let waiter = Peer::connect(&coordinator, 2);
    holder.request(&coordinator, 1);
    holder.expect(MessageKind::Grant);
    waiter.request(&coordinator, 2);

    thread::sleep(Duration::from_millis(40));
    coordinator.try_grant_next();
    waiter.expect(MessageKind::Grant);
    assert_eq!(coordinator.holder(), Some(2));
}

#[test]
fn test_max_remote_clock_does_not_wrap() {
    let coordinator = coordinator();
    let peer = Peer::connect(&coordinator, 1);
    peer.send(&coordinator, Message::join(1, 4));
    let before = coordinator.clock();

    peer.send(&coordinator, Message::request(1, u64::MAX));
    let grant = peer.expect(MessageKind::Grant);
    assert!(grant.clock >= before);
    assert_eq!(coordinator.clock(), u64::MAX);
    assert_eq!(coordinator.holder(), Some(1));
}
