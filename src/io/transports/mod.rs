use std::fmt::{Debug, Display};
use std::time::Duration;

use crate::errors::Error;

pub mod serial;

/// A byte-oriented transport carrying the protocol to and from the board.
///
/// The physical connection (serial today, possibly others later) is an external
/// collaborator of the protocol core: it only has to produce raw inbound bytes and
/// accept raw outbound writes. A background reader thread owns the inbound side and
/// pushes every byte into the engine's ingress queue.
pub trait Transport: Debug + Display + Send {
    /// Opens the connection (in a blocking way).
    fn open(&mut self) -> Result<(), Error>;

    /// Gracefully shuts down the connection.
    fn close(&mut self) -> Result<(), Error>;

    /// Sets the timeout used by the underlying reads.
    ///
    /// # Notes
    /// This function is optional and may not be supported by all transport layers.
    fn set_timeout(&mut self, duration: Duration) -> Result<(), Error>;

    /// Writes bytes to the connection. For more details see [`std::io::Write::write`].
    ///
    /// # Notes
    /// This function blocks until the write operation is complete. Ensure proper error
    /// handling in calling code.
    fn write(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Reads whatever bytes are currently available into `buf`, returning how many were
    /// read. Returns `Ok(0)` when nothing is pending - it never blocks waiting for data,
    /// so outbound writes are not starved while the reader polls.
    fn poll_read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}
