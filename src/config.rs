//! Runtime configuration for the coordinator and the nodes.
//!
//! Defaults reproduce the reference timings; the binary overrides them from
//! command-line flags and tests shrink them to keep runs short.

use std::path::PathBuf;
use std::time::Duration;

/// Fixed coordinator port.
pub const DEFAULT_PORT: u16 = 5000;

/// Exit status used when a node simulates a crash.
pub const CRASH_EXIT_CODE: i32 = 86;

/// Asynchronous replication behavior.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Upper bound (exclusive) of the random delay before each STATE send.
    /// Zero disables the simulated latency.
    pub max_delay: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            max_delay: Duration::from_millis(2000),
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address the listener binds to.
    pub bind_addr: String,
    pub replication: ReplicationConfig,
    /// Lease on a granted critical section. `None` keeps the holder forever.
    pub grant_lease: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            replication: ReplicationConfig::default(),
            grant_lease: None,
        }
    }
}

/// How a node carries out a simulated crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashMode {
    /// Terminate the whole process with [`CRASH_EXIT_CODE`].
    ExitProcess,
    /// Stop the agent's threads and drop its connection, leaving the
    /// process alive. Used when several nodes share one process.
    Halt,
}

/// Node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Positive identity, unique among participants.
    pub pid: u32,
    /// Coordinator address (`host:port`).
    pub coordinator_addr: String,
    /// Directory holding the checkpoint and pre-crash records.
    pub checkpoint_dir: PathBuf,
    /// Think time between requests, drawn uniformly from `[min, max)`.
    pub think_time: (Duration, Duration),
    /// Period of the background checkpoint thread.
    pub checkpoint_interval: Duration,
    /// Simulated slow critical section.
    pub op_delay: Option<Duration>,
    /// Crash on the next critical-section entry.
    pub crash_on_next_entry: bool,
    pub crash_mode: CrashMode,
}

impl NodeConfig {
    /// Defaults for `pid` against a coordinator on localhost.
    pub fn new(pid: u32) -> Self {
        NodeConfig {
            pid,
            coordinator_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            checkpoint_dir: PathBuf::from("."),
            think_time: (Duration::from_millis(2000), Duration::from_millis(4000)),
            checkpoint_interval: Duration::from_secs(5),
            op_delay: None,
            crash_on_next_entry: false,
            crash_mode: CrashMode::ExitProcess,
        }
    }
}
