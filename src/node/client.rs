//! TCP runtime around a [`NodeAgent`].
//!
//! Two background threads per node: the listener decodes coordinator
//! messages and the checkpointer persists state on a fixed period. The
//! request loop runs on the caller's thread and asks for the critical
//! section after a random think time.

use std::io::BufReader;
use std::net::TcpStream;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{after, select, tick, Receiver};
use rand::Rng;
use tracing::{debug, error, info, info_span, warn};

use crate::config::{CrashMode, NodeConfig, CRASH_EXIT_CODE};
use crate::protocol::{MessageReader, MessageSink, TcpSink};

use super::agent::{Flow, NodeAgent, NodeError};

/// A connected node and its background threads.
pub struct NodeRuntime {
    agent: Arc<NodeAgent>,
    sink: Arc<TcpSink>,
    think_time: (Duration, Duration),
    threads: Vec<JoinHandle<()>>,
}

impl NodeRuntime {
    /// Connect to the coordinator, JOIN, and start the listener and
    /// checkpointer threads.
    pub fn connect(config: NodeConfig) -> Result<Self, NodeError> {
        let stream =
            TcpStream::connect(&config.coordinator_addr).map_err(|source| NodeError::Connect {
                addr: config.coordinator_addr.clone(),
                source,
            })?;
        stream.set_nodelay(true).ok();
        let read_half = stream.try_clone()?;
        let sink = Arc::new(TcpSink::new(stream)?);

        let agent = Arc::new(NodeAgent::new(&config, sink.clone()));
        let snap = agent.replica().snapshot();
        info!(
            pid = config.pid,
            coordinator = %config.coordinator_addr,
            counter = snap.counter,
            lamport = snap.lamport,
            "node starting"
        );
        agent.join()?;

        let listener = spawn_listener(agent.clone(), sink.clone(), read_half, config.crash_mode)?;
        let checkpointer = spawn_checkpointer(agent.clone(), config.checkpoint_interval)?;

        Ok(NodeRuntime {
            agent,
            sink,
            think_time: config.think_time,
            threads: vec![listener, checkpointer],
        })
    }

    pub fn agent(&self) -> &Arc<NodeAgent> {
        &self.agent
    }

    /// Request the critical section repeatedly until the agent stops
    /// (crash, lost connection, or shutdown from another thread).
    pub fn run_request_loop(&self) {
        request_loop(&self.agent, self.think_time);
    }

    /// Stop the agent, close the connection and join every thread.
    pub fn shutdown(self) {
        self.agent.stop();
        self.sink.close();
        for handle in self.threads {
            let _ = handle.join();
        }
        let status = self.agent.status();
        info!(
            pid = status.pid,
            phase = ?status.phase,
            counter = status.counter,
            last_applied = status.last_applied,
            "node stopped"
        );
    }
}

fn spawn_listener(
    agent: Arc<NodeAgent>,
    sink: Arc<TcpSink>,
    stream: TcpStream,
    crash_mode: CrashMode,
) -> Result<JoinHandle<()>, NodeError> {
    let name = format!("node-{}-listener", agent.pid());
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            let span = info_span!("node", pid = agent.pid());
            let _enter = span.enter();
            let mut reader = MessageReader::new(BufReader::new(stream));
            loop {
                let msg = match reader.next_message() {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        if !agent.is_stopped() {
                            warn!("coordinator closed the connection");
                        }
                        break;
                    }
                    Err(e) => {
                        if !agent.is_stopped() {
                            warn!(error = %e, "connection to coordinator failed");
                        }
                        break;
                    }
                };
                match agent.handle_message(msg) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Halt) => {
                        if crash_mode == CrashMode::ExitProcess && agent.has_crashed() {
                            error!(code = CRASH_EXIT_CODE, "exiting after simulated crash");
                            process::exit(CRASH_EXIT_CODE);
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to handle message");
                        break;
                    }
                }
            }
            agent.stop();
            sink.close();
            debug!("listener exited");
        })?;
    Ok(handle)
}

fn spawn_checkpointer(
    agent: Arc<NodeAgent>,
    interval: Duration,
) -> Result<JoinHandle<()>, NodeError> {
    let stop = agent.stop_signal();
    let handle = thread::Builder::new()
        .name(format!("node-{}-checkpoint", agent.pid()))
        .spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(stop) -> _ => break,
                    recv(ticker) -> _ => agent.checkpoint(),
                }
            }
        })?;
    Ok(handle)
}

fn request_loop(agent: &NodeAgent, think_time: (Duration, Duration)) {
    let stop: Receiver<()> = agent.stop_signal();
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(after(think(think_time))) -> _ => {}
        }
        if let Err(e) = agent.request_critical_section() {
            warn!(pid = agent.pid(), error = %e, "request failed; stopping request loop");
            break;
        }
    }
}

fn think((min, max): (Duration, Duration)) -> Duration {
    let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
    if hi <= lo {
        return min;
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo..hi))
}
