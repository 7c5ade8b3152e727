use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::Error;
use crate::io::Transport;

/// In-memory scripted [`Transport`] for tests.
///
/// Bytes queued with [`MockTransport::feed`] are handed to the reader thread as if the
/// board had sent them; everything written by the client is captured and inspectable
/// through [`MockTransport::written`]. The state is shared behind an `Arc`, so tests
/// keep a clone of the mock while the client owns the original.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    read_buf: VecDeque<u8>,
    write_buf: Vec<u8>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts inbound bytes, delivered by the next `poll_read` calls.
    pub fn feed(&self, bytes: &[u8]) {
        self.state.lock().read_buf.extend(bytes.iter().copied());
    }

    /// Returns everything the client wrote so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().write_buf.clone()
    }

    /// Clears the outbound capture buffer.
    pub fn clear_written(&self) {
        self.state.lock().write_buf.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

impl Debug for MockTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("connected", &state.connected)
            .field("pending_reads", &state.read_buf.len())
            .field("written", &state.write_buf.len())
            .finish()
    }
}

impl Display for MockTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockTransport")
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), Error> {
        self.state.lock().connected = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.state.lock().connected = false;
        Ok(())
    }

    fn set_timeout(&mut self, _: Duration) -> Result<(), Error> {
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.state.lock().write_buf.extend_from_slice(buf);
        Ok(())
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut state = self.state.lock();
        let mut count = 0;
        while count < buf.len() {
            match state.read_buf.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}
