//! Defines the protocol core: frame decoding, state tables and the transport seam.

pub mod constants;
mod data;
mod engine;
mod events;
mod queue;
mod transports;

pub use data::*;
pub(crate) use engine::Engine;
pub use events::*;
pub use queue::*;
pub use transports::serial::Serial;
pub use transports::Transport;
