//! Newline-delimited JSON framing.

use std::io::{BufRead, Write};

use super::message::Message;
use super::ProtocolError;

/// Reads one [`Message`] per line from a buffered stream.
pub struct MessageReader<R> {
    inner: R,
    line: String,
}

impl<R: BufRead> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        MessageReader {
            inner,
            line: String::new(),
        }
    }

    /// Block until the next message arrives.
    ///
    /// Returns `Ok(None)` on a clean end of stream. Blank lines are skipped.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            self.line.clear();
            if self.inner.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Message::decode(trimmed).map(Some);
        }
    }
}

/// Write `msg` as a single line and flush.
pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError> {
    let mut line = msg.encode()?;
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}
