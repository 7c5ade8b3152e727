//! Defines mocked entities (useful for tests mostly).

pub mod transport;

pub use transport::MockTransport;
