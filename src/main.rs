//! Command line entry point.
//!
//! ```sh
//! lamport-mutex coordinator --bind 0.0.0.0:5000
//! lamport-mutex node 1 --coordinator 127.0.0.1:5000
//! lamport-mutex node 2 --delay --crash
//! ```

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use lamport_mutex::config::DEFAULT_PORT;
use lamport_mutex::{
    telemetry, Coordinator, CoordinatorConfig, CoordinatorServer, NodeConfig, NodeRuntime,
    ReplicationConfig,
};

/// Default simulated critical-section delay for `--delay`.
const DEFAULT_OP_DELAY_MS: u64 = 3000;

#[derive(Parser, Debug)]
#[command(name = "lamport-mutex")]
#[command(about = "Centralized mutual exclusion over a shared counter")]
struct Cli {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator. Reads `rollback <reason>` and `status` from stdin.
    Coordinator(CoordinatorArgs),
    /// Run a node that repeatedly requests the critical section.
    Node(NodeArgs),
}

#[derive(Args, Debug)]
struct CoordinatorArgs {
    /// Listen address.
    #[arg(long, default_value_t = format!("0.0.0.0:{}", DEFAULT_PORT))]
    bind: String,

    /// Upper bound of the simulated replication latency.
    #[arg(long, default_value_t = 2000)]
    max_replication_delay_ms: u64,

    /// Reclaim a grant held longer than this. Unset means never.
    #[arg(long)]
    grant_lease_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// Node identity, unique and positive.
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    pid: u32,

    /// Coordinator address.
    #[arg(long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    coordinator: String,

    /// Directory for checkpoint and pre-crash files.
    #[arg(long, default_value = ".")]
    checkpoint_dir: PathBuf,

    /// Sleep inside the critical section before operating.
    #[arg(long)]
    delay: bool,

    /// Length of the `--delay` sleep.
    #[arg(long, default_value_t = DEFAULT_OP_DELAY_MS)]
    delay_ms: u64,

    /// Crash on the next critical-section entry.
    #[arg(long)]
    crash: bool,

    /// Period of the background checkpoint.
    #[arg(long, default_value_t = 5000)]
    checkpoint_interval_ms: u64,

    /// Minimum think time between requests.
    #[arg(long, default_value_t = 2000)]
    think_min_ms: u64,

    /// Maximum think time between requests (exclusive).
    #[arg(long, default_value_t = 4000)]
    think_max_ms: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_level, cli.json)?;

    match cli.command {
        Command::Coordinator(args) => run_coordinator(args),
        Command::Node(args) => run_node(args),
    }
}

fn run_coordinator(args: CoordinatorArgs) -> Result<()> {
    let config = CoordinatorConfig {
        bind_addr: args.bind,
        replication: ReplicationConfig {
            max_delay: Duration::from_millis(args.max_replication_delay_ms),
        },
        grant_lease: args.grant_lease_ms.map(Duration::from_millis),
    };
    let server = CoordinatorServer::bind(&config)
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    let coordinator = server.coordinator();
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || operator_console(&coordinator))
        .context("failed to start operator console")?;

    server.run().context("coordinator accept loop failed")
}

/// Operator commands read line by line from stdin.
fn operator_console(coordinator: &Arc<Coordinator>) {
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "console input failed");
                return;
            }
        };
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "" => {}
            "rollback" => {
                let reason = match rest.trim() {
                    "" => "operator request",
                    reason => reason,
                };
                let targets = coordinator.request_global_rollback(reason);
                info!(reason, targets, "global rollback requested");
            }
            "status" => match serde_json::to_string(&coordinator.status()) {
                Ok(status) => info!(%status, "coordinator status"),
                Err(e) => warn!(error = %e, "failed to render status"),
            },
            other => warn!(command = other, "unknown console command; try `rollback <reason>` or `status`"),
        }
    }
}

fn run_node(args: NodeArgs) -> Result<()> {
    anyhow::ensure!(
        args.think_min_ms <= args.think_max_ms,
        "--think-min-ms must not exceed --think-max-ms"
    );
    let mut config = NodeConfig::new(args.pid);
    config.coordinator_addr = args.coordinator;
    config.checkpoint_dir = args.checkpoint_dir;
    config.checkpoint_interval = Duration::from_millis(args.checkpoint_interval_ms);
    config.think_time = (
        Duration::from_millis(args.think_min_ms),
        Duration::from_millis(args.think_max_ms),
    );
    config.op_delay = args.delay.then(|| Duration::from_millis(args.delay_ms));
    config.crash_on_next_entry = args.crash;

    std::fs::create_dir_all(&config.checkpoint_dir).with_context(|| {
        format!("failed to create checkpoint directory {}", config.checkpoint_dir.display())
    })?;

    let runtime = NodeRuntime::connect(config).context("node failed to start")?;
    runtime.run_request_loop();
    runtime.shutdown();
    Ok(())
}
