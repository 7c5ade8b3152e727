use log::error;
use snafu::Snafu;

pub use crate::errors::Error::*;
use crate::errors::ProtocolError::IoException;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Protocol error: {source}.
    Protocol { source: ProtocolError },
    /// Hardware error: {source}.
    Hardware { source: HardwareError },
    /// Unknown error: {info}.
    Unknown { info: String },
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        error!("std::io error {:?}", error);
        let info = match error.kind() {
            std::io::ErrorKind::NotFound => String::from("Board not found or already in use"),
            std::io::ErrorKind::PermissionDenied => String::from("Board connection lost"),
            _ => error.to_string(),
        };
        Self::Protocol {
            source: IoException { info },
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(value: ProtocolError) -> Self {
        Self::Protocol { source: value }
    }
}

impl From<HardwareError> for Error {
    fn from(value: HardwareError) -> Self {
        Self::Hardware { source: value }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtocolError {
    /// {info}
    IoException { info: String },
    /// Connection has not been initialized
    NotInitialized,
    /// Board discovery timed out after {waited} seconds
    DiscoveryTimeout { waited: u64 },
    /// Stepper library version not received within {waited} seconds
    StepperVersionTimeout { waited: u64 },
    /// Not enough bytes received - '{operation}' expected {expected} bytes, {received} received
    MessageTooShort {
        operation: &'static str,
        expected: usize,
        received: usize,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HardwareError {
    /// Unknown pin {pin}
    UnknownPin { pin: u8 },
    /// Value {value} out of range (max {max})
    ValueOutOfRange { value: u16, max: u16 },
    /// Sonar device limit reached ({active} active)
    SonarCapacity { active: usize },
}
