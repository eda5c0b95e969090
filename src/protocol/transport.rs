//! Outbound message sinks.
//!
//! The coordinator and the node agent only ever talk to a [`MessageSink`]:
//! - [`TcpSink`] writes JSON lines to a TCP stream
//! - [`ChannelSink`] pushes messages into a crossbeam channel (in-memory wiring)

use std::io::BufWriter;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use super::codec::write_message;
use super::message::Message;
use super::ProtocolError;

/// Destination for outbound protocol messages.
pub trait MessageSink: Send + Sync {
    /// Deliver a message. Fails once the connection is gone.
    fn send(&self, msg: &Message) -> Result<(), ProtocolError>;

    /// Close the connection. Further sends fail.
    fn close(&self);
}

/// Line-oriented writer half of a TCP connection.
pub struct TcpSink {
    writer: Mutex<BufWriter<TcpStream>>,
    /// Clone kept only to shut the socket down from any thread.
    control: TcpStream,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
}

impl TcpSink {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let control = stream.try_clone()?;
        let peer = stream.peer_addr().ok();
        Ok(TcpSink {
            writer: Mutex::new(BufWriter::new(stream)),
            control,
            peer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl MessageSink for TcpSink {
    fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        let mut writer = self.writer.lock();
        write_message(&mut *writer, msg)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }
}

/// In-memory sink backed by an unbounded crossbeam channel.
pub struct ChannelSink {
    tx: Sender<Message>,
    closed: AtomicBool,
}

impl ChannelSink {
    /// Create a sink and the receiver that observes everything sent to it.
    pub fn pair() -> (Arc<ChannelSink>, Receiver<Message>) {
        let (tx, rx) = unbounded();
        let sink = Arc::new(ChannelSink {
            tx,
            closed: AtomicBool::new(false),
        });
        (sink, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl MessageSink for ChannelSink {
    fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        self.tx.send(msg.clone()).map_err(|_| ProtocolError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
