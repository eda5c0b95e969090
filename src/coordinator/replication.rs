//! Asynchronous fan-out.
//!
//! Every target gets its own short-lived thread that optionally sleeps a
//! random delay (simulated network latency) and then sends. Targets are
//! deliberately not synchronized with each other: different nodes observe
//! the same update at different real times. A failed send is logged and
//! affects nobody else.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, warn};

use crate::config::ReplicationConfig;
use crate::protocol::Message;

use super::registry::Connection;

/// Unbounded pool of one-shot delivery tasks.
#[derive(Debug)]
pub struct Replicator {
    config: ReplicationConfig,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter when a task finishes, even by panic.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Replicator {
    pub fn new(config: ReplicationConfig) -> Self {
        Replicator {
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Random latency in `[0, max_delay)`.
    fn sample_delay(&self) -> Duration {
        let max_ms = self.config.max_delay.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }

    /// Send `msg` to every target on its own task.
    ///
    /// `with_latency` applies the simulated delay before each send. Returns
    /// the number of tasks submitted.
    pub fn fan_out(&self, targets: Vec<(u32, Connection)>, msg: Message, with_latency: bool) -> usize {
        let mut submitted = 0;
        for (pid, conn) in targets {
            let delay = if with_latency {
                self.sample_delay()
            } else {
                Duration::ZERO
            };
            let msg = msg.clone();
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let guard = InFlightGuard(self.in_flight.clone());

            let spawned = thread::Builder::new()
                .name(format!("replicate-{}", pid))
                .spawn(move || {
                    let _guard = guard;
                    if delay > Duration::ZERO {
                        thread::sleep(delay);
                    }
                    match conn.send(&msg) {
                        Ok(()) => debug!(
                            target_pid = pid,
                            kind = ?msg.kind,
                            clock = msg.clock,
                            delay_ms = delay.as_millis() as u64,
                            "delivered"
                        ),
                        Err(e) => warn!(target_pid = pid, kind = ?msg.kind, error = %e, "delivery failed"),
                    }
                });

            match spawned {
                Ok(_) => submitted += 1,
                // The closure (and its guard) was dropped, so the counter is already back.
                Err(e) => error!(target_pid = pid, error = %e, "failed to spawn replication task"),
            }
        }
        submitted
    }

    /// Tasks submitted but not finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no task is in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }
}
