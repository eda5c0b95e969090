//! TCP front end for the [`Coordinator`].
//!
//! One thread accepts connections; each accepted connection gets its own
//! handler thread that decodes JSON lines and feeds them to the shared
//! coordinator. Any failure on a connection tears down that connection only.

use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

use crate::config::CoordinatorConfig;
use crate::protocol::{MessageReader, TcpSink};

use super::engine::Coordinator;
use super::registry::Connection;

/// Minimum pause between lease checks.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// A bound, not yet running, coordinator listener.
pub struct CoordinatorServer {
    coordinator: Arc<Coordinator>,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
}

/// Handle to a server running on a background thread.
pub struct ServerHandle {
    coordinator: Arc<Coordinator>,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl CoordinatorServer {
    /// Bind the listening socket and build the coordinator.
    pub fn bind(config: &CoordinatorConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)?;
        let coordinator = Arc::new(Coordinator::new(config));
        info!(addr = %listener.local_addr()?, lease = ?coordinator.grant_lease(), "coordinator listening");
        Ok(CoordinatorServer {
            coordinator,
            listener,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Run the accept loop on the calling thread until shutdown.
    pub fn run(self) -> io::Result<()> {
        let reaper = spawn_lease_reaper(self.coordinator.clone(), self.shutdown.clone())?;

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let coordinator = self.coordinator.clone();
                    let spawned = thread::Builder::new()
                        .name("coord-conn".to_string())
                        .spawn(move || serve_connection(&coordinator, stream));
                    if let Err(e) = spawned {
                        error!(error = %e, "failed to spawn connection handler");
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }

        if let Some(reaper) = reaper {
            let _ = reaper.join();
        }
        info!("coordinator stopped");
        Ok(())
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let coordinator = self.coordinator.clone();
        let local_addr = self.listener.local_addr()?;
        let shutdown = self.shutdown.clone();
        let accept_thread = thread::Builder::new()
            .name("coord-accept".to_string())
            .spawn(move || {
                if let Err(e) = self.run() {
                    error!(error = %e, "coordinator accept loop failed");
                }
            })?;
        Ok(ServerHandle {
            coordinator,
            local_addr,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }
}

impl ServerHandle {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and join the accept thread.
    ///
    /// Connections already being served run until their peers hang up.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept().
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Deregisters the connection however the handler exits.
struct ConnectionGuard<'a> {
    coordinator: &'a Coordinator,
    conn: Connection,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.disconnect(&self.conn);
    }
}

fn serve_connection(coordinator: &Coordinator, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    let sink = match stream.try_clone().and_then(TcpSink::new) {
        Ok(sink) => sink,
        Err(e) => {
            warn!(peer = ?peer, error = %e, "failed to set up connection");
            return;
        }
    };

    let conn = coordinator.open_connection(Arc::new(sink));
    let span = info_span!("conn", id = conn.id().0);
    let _enter = span.enter();
    debug!(peer = ?peer, "accepted");

    let guard = ConnectionGuard {
        coordinator,
        conn: conn.clone(),
    };
    let mut reader = MessageReader::new(BufReader::new(stream));
    loop {
        match reader.next_message() {
            Ok(Some(msg)) => coordinator.handle_message(&conn, msg),
            Ok(None) => {
                debug!("peer closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "connection failed");
                break;
            }
        }
    }
    drop(guard);
}

/// Periodically reclaim expired grants when a lease is configured.
fn spawn_lease_reaper(
    coordinator: Arc<Coordinator>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<Option<JoinHandle<()>>> {
    let Some(lease) = coordinator.grant_lease() else {
        return Ok(None);
    };
    let interval = (lease / 4).max(MIN_REAP_INTERVAL);
    let handle = thread::Builder::new()
        .name("coord-lease".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                thread::sleep(interval);
                coordinator.expire_stale_grant();
            }
        })?;
    Ok(Some(handle))
}
