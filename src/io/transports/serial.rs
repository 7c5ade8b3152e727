use std::fmt::{Debug, Display, Formatter};
use std::io::{Read, Write};
use std::time::Duration;

use log::trace;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::errors::Error;
use crate::errors::ProtocolError::NotInitialized;
use crate::io::transports::Transport;

/// [`Transport`] implementation over a serial port (57600 bauds, 8N1).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Default)]
pub struct Serial {
    /// The connection port.
    port: String,
    /// The open serial handle, `None` until [`Transport::open`] succeeds.
    #[cfg_attr(feature = "serde", serde(skip))]
    io: Option<Box<dyn SerialPort>>,
}

impl Serial {
    /// Constructs a new `Serial` transport for communication through the specified port.
    ///
    /// # Arguments
    /// * `port` - The serial port to use for communication, "/dev/ttyACM0" for instance.
    pub fn new<P: Into<String>>(port: P) -> Self {
        Self {
            port: port.into(),
            io: None,
        }
    }

    /// Creates a serial transport on the first available port, or with an empty port
    /// name if none is detected (which will lead to an error during the open phase).
    #[cfg(not(tarpaulin_include))]
    pub fn first_available() -> Self {
        let ports = serialport::available_ports().unwrap_or_else(|_| vec![]);
        match ports.first() {
            Some(port) => Self::new(&port.port_name),
            None => Self::new(""),
        }
    }

    /// Retrieves the configured port.
    pub fn get_port(&self) -> String {
        self.port.clone()
    }
}

impl Debug for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serial")
            .field("port", &self.port)
            .field("open", &self.io.is_some())
            .finish()
    }
}

impl Display for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Serial({})", self.port)
    }
}

impl Transport for Serial {
    #[cfg(not(tarpaulin_include))]
    fn open(&mut self) -> Result<(), Error> {
        let connexion = serialport::new(self.port.clone(), 57_600)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()?;
        trace!("Serial port is now opened: {:?}", self.port);
        self.io = Some(connexion);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.io = None;
        Ok(())
    }

    fn set_timeout(&mut self, duration: Duration) -> Result<(), Error> {
        self.io
            .as_mut()
            .ok_or(NotInitialized)?
            .set_timeout(duration)?;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.io.as_mut().ok_or(NotInitialized)?.write_all(buf)?;
        Ok(())
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let port = self.io.as_mut().ok_or(NotInitialized)?;
        let pending = port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let wanted = pending.min(buf.len());
        port.read_exact(&mut buf[..wanted])?;
        Ok(wanted)
    }
}

impl From<serialport::Error> for Error {
    fn from(value: serialport::Error) -> Self {
        std::io::Error::from(value).into()
    }
}
