use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Unbounded FIFO byte queue hand-off between the transport reader and the protocol engine.
///
/// [`ByteQueue::push`] never blocks and never fails; [`ByteQueue::pop`] parks the calling
/// thread on a condition variable until a byte is available. Closing the queue wakes every
/// waiter: remaining bytes are still drained in order, then `pop` returns `None` - this is
/// the cooperative shutdown signal observed by the engine loop.
#[derive(Debug, Default)]
pub struct ByteQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct Inner {
    bytes: VecDeque<u8>,
    closed: bool,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a byte at the back of the queue. Bytes pushed after [`ByteQueue::close`]
    /// are discarded.
    pub fn push(&self, byte: u8) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.bytes.push_back(byte);
        self.available.notify_one();
    }

    /// Appends a whole slice, preserving order.
    pub fn extend(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.bytes.extend(bytes.iter().copied());
        self.available.notify_one();
    }

    /// Removes and returns the front byte, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub fn pop(&self) -> Option<u8> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(byte) = inner.bytes.pop_front() {
                return Some(byte);
            }
            if inner.closed {
                return None;
            }
            self.available.wait(&mut inner);
        }
    }

    /// Closes the queue and wakes all blocked consumers.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().bytes.is_empty()
    }
}
