use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::LamportClock;
use crate::config::NodeConfig;
use crate::protocol::{Message, MessageKind, MessageSink, ProtocolError};

use super::state::{ApplyOutcome, CheckpointError, ReplicaState, StateSnapshot};

/// Errors surfaced by the node agent.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to reach coordinator at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Where a node is in the request/grant/release cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodePhase {
    Idle,
    Requesting,
    WaitingGrant,
    InCriticalSection,
    WaitingStateConfirm,
}

/// What the listener should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// The agent crashed (simulated) or was stopped; stop reading.
    Halt,
}

/// Read-only view of a node for operators and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub pid: u32,
    pub phase: NodePhase,
    pub clock: u64,
    pub counter: u64,
    pub last_applied: u64,
}

/// Protocol state machine of one participant.
///
/// Transport-agnostic: outbound messages go to a [`MessageSink`], inbound
/// ones are fed to [`NodeAgent::handle_message`] by whoever owns the
/// connection.
pub struct NodeAgent {
    pid: u32,
    clock: LamportClock,
    replica: ReplicaState,
    phase: Mutex<NodePhase>,
    outbound: Arc<dyn MessageSink>,
    op_delay: Option<Duration>,
    crash_armed: AtomicBool,
    crashed: AtomicBool,
    stopped: AtomicBool,
    /// Dropped on stop; background loops select on the receiver.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl NodeAgent {
    /// Build an agent, loading the latest checkpoint.
    ///
    /// An unreadable checkpoint is logged and the node cold-starts at zero.
    pub fn new(config: &NodeConfig, outbound: Arc<dyn MessageSink>) -> Self {
        let replica = match ReplicaState::open(config.pid, &config.checkpoint_dir) {
            Ok(replica) => replica,
            Err(e) => {
                warn!(pid = config.pid, error = %e, "checkpoint unreadable; starting from zero");
                ReplicaState::new(config.pid, &config.checkpoint_dir)
            }
        };
        Self::with_replica(config, replica, outbound)
    }

    pub fn with_replica(config: &NodeConfig, replica: ReplicaState, outbound: Arc<dyn MessageSink>) -> Self {
        let (stop_tx, stop_rx) = bounded(0);
        NodeAgent {
            pid: config.pid,
            // Resume logical time from the recovered state.
            clock: LamportClock::with_initial(replica.last_applied()),
            replica,
            phase: Mutex::new(NodePhase::Idle),
            outbound,
            op_delay: config.op_delay,
            crash_armed: AtomicBool::new(config.crash_on_next_entry),
            crashed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn phase(&self) -> NodePhase {
        *self.phase.lock()
    }

    pub fn clock(&self) -> u64 {
        self.clock.current()
    }

    pub fn replica(&self) -> &ReplicaState {
        &self.replica
    }

    pub fn status(&self) -> NodeStatus {
        let snap = self.replica.snapshot();
        NodeStatus {
            pid: self.pid,
            phase: self.phase(),
            clock: self.clock.current(),
            counter: snap.counter,
            last_applied: snap.lamport,
        }
    }

    /// True once a simulated crash has happened.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop all agent activity. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_tx.lock().take();
    }

    /// Receiver that disconnects once the agent stops.
    pub fn stop_signal(&self) -> Receiver<()> {
        self.stop_rx.clone()
    }

    /// Announce this node to the coordinator.
    pub fn join(&self) -> Result<(), ProtocolError> {
        let clock = self.clock.increment();
        self.outbound.send(&Message::join(self.pid, clock))?;
        info!(pid = self.pid, clock, "JOIN sent");
        Ok(())
    }

    /// Ask for the critical section.
    ///
    /// Only an idle node requests; returns `Ok(false)` otherwise.
    pub fn request_critical_section(&self) -> Result<bool, ProtocolError> {
        if self.is_stopped() {
            return Ok(false);
        }
        // Held across the send so a fast GRANT sees WaitingGrant.
        let mut phase = self.phase.lock();
        if *phase != NodePhase::Idle {
            debug!(pid = self.pid, phase = ?*phase, "not idle; skipping request");
            return Ok(false);
        }
        *phase = NodePhase::Requesting;

        let clock = self.clock.increment();
        match self.outbound.send(&Message::request(self.pid, clock)) {
            Ok(()) => {
                *phase = NodePhase::WaitingGrant;
                info!(pid = self.pid, clock, "REQUEST sent");
                Ok(true)
            }
            Err(e) => {
                *phase = NodePhase::Idle;
                Err(e)
            }
        }
    }

    /// Handle one inbound message.
    ///
    /// The local clock always merges the sender's timestamp first.
    pub fn handle_message(&self, msg: Message) -> Result<Flow, NodeError> {
        if self.is_stopped() {
            return Ok(Flow::Halt);
        }
        let now = self.clock.update(msg.clock);
        debug!(pid = self.pid, kind = ?msg.kind, remote_clock = msg.clock, clock = now, "inbound");

        match msg.kind {
            MessageKind::Grant => self.on_grant(),
            MessageKind::State => {
                self.on_state(&msg)?;
                Ok(Flow::Continue)
            }
            MessageKind::Rollback => {
                self.on_rollback(&msg);
                Ok(Flow::Continue)
            }
            MessageKind::Join
            | MessageKind::Request
            | MessageKind::DoOp
            | MessageKind::Release
            | MessageKind::Unknown => {
                debug!(pid = self.pid, kind = ?msg.kind, "ignored");
                Ok(Flow::Continue)
            }
        }
    }

    fn set_phase(&self, next: NodePhase) {
        *self.phase.lock() = next;
    }

    fn on_grant(&self) -> Result<Flow, NodeError> {
        let previous = self.phase();
        if previous != NodePhase::WaitingGrant {
            warn!(pid = self.pid, phase = ?previous, "GRANT while not waiting; entering anyway");
        }
        self.set_phase(NodePhase::InCriticalSection);
        info!(pid = self.pid, clock = self.clock.current(), "GRANT received; entering critical section");

        let pre_image = self.replica.snapshot();

        if let Some(delay) = self.op_delay {
            info!(pid = self.pid, delay_ms = delay.as_millis() as u64, "simulating slow operation");
            thread::sleep(delay);
        }

        if self.crash_armed.swap(false, Ordering::SeqCst) {
            self.crash(pre_image);
            return Ok(Flow::Halt);
        }

        let timestamp = self.clock.increment();
        let after = self.replica.apply_local(1, timestamp);
        self.checkpoint();
        self.set_phase(NodePhase::WaitingStateConfirm);
        self.outbound.send(&Message::do_op(self.pid, timestamp, 1))?;
        info!(
            pid = self.pid,
            clock = timestamp,
            pre_counter = pre_image.counter,
            counter = after.counter,
            "DO_OP sent"
        );
        Ok(Flow::Continue)
    }

    /// Simulated failure inside the critical section: record the pre-image
    /// and stop without DO_OP or RELEASE.
    fn crash(&self, pre_image: StateSnapshot) {
        if let Err(e) = self.replica.write_precrash(pre_image) {
            error!(pid = self.pid, error = %e, "failed to write pre-crash record");
        }
        error!(
            pid = self.pid,
            pre_counter = pre_image.counter,
            pre_lamport = pre_image.lamport,
            "simulated crash inside critical section"
        );
        self.crashed.store(true, Ordering::SeqCst);
        self.stop();
    }

    fn on_state(&self, msg: &Message) -> Result<(), NodeError> {
        let current = self.replica.counter();
        let counter = match msg.state_payload() {
            Some(payload) => payload.counter,
            None => {
                warn!(pid = self.pid, payload = %msg.payload, "malformed STATE payload; keeping current counter");
                current
            }
        };

        match self.replica.apply_remote(counter, msg.clock) {
            ApplyOutcome::Applied => {
                info!(pid = self.pid, counter, clock = msg.clock, "STATE applied");
                self.checkpoint();
            }
            ApplyOutcome::Stale { last_applied } => {
                debug!(pid = self.pid, clock = msg.clock, last_applied, "stale STATE discarded");
            }
        }

        // Only the node that performed the operation releases.
        let mut phase = self.phase.lock();
        if *phase == NodePhase::WaitingStateConfirm {
            let clock = self.clock.increment();
            self.outbound.send(&Message::release(self.pid, clock))?;
            *phase = NodePhase::Idle;
            info!(pid = self.pid, clock, "RELEASE sent");
        }
        Ok(())
    }

    fn on_rollback(&self, msg: &Message) {
        let reason = msg
            .rollback_payload()
            .map(|p| p.reason)
            .unwrap_or_else(|| "unspecified".to_string());
        match self.replica.rollback_to_checkpoint() {
            Ok(snap) => warn!(
                pid = self.pid,
                reason = %reason,
                counter = snap.counter,
                lamport = snap.lamport,
                "rolled back to checkpoint"
            ),
            Err(e) => error!(pid = self.pid, reason = %reason, error = %e, "rollback failed"),
        }
    }

    /// Best-effort checkpoint: failures are logged, never propagated.
    pub fn checkpoint(&self) {
        if let Err(e) = self.replica.save_checkpoint() {
            warn!(pid = self.pid, error = %e, "checkpoint failed");
        }
    }
}
