#![doc(html_root_url = "https://docs.rs/rustmata/0.1.0")]

//! <h1 align="center">RUSTMATA - Firmata host client for Rust</h1>
//! <div style="text-align:center;font-style:italic;">Rustmata is an open-source host-side client for the Firmata microcontroller protocol - written in Rust.</div>
//! <br/>
//!
//! # Features
//!
//! **Rustmata** is a Rust library that talks to Arduino (or compatible) boards running a
//! Firmata sketch over a serial connection, and keeps a live, thread-safe image of the
//! board state on the host side.
//!
//! - Decodes the full inbound Firmata byte stream (fixed-length messages and sysex
//!   envelopes) on a dedicated background thread
//! - Maintains per-pin response tables (mode, last value, optional change callback)
//!   sized automatically by the board [discovery](client::Rustmata::discover) handshake
//! - One-shot data [latches](io::LatchState) per pin with six threshold policies,
//!   fired either into a callback or left for later polling
//! - I2C, sonar and stepper sub-protocol plumbing (request/reply state maps)
//! - Outbound command/sysex primitives for building higher-level device APIs
//!
//! # Prerequisites
//!
//! - A board attached via a serial port of the machine running your code.
//! - A [StandardFirmata-compatible sketch](https://github.com/firmata/arduino) installed
//!   on the board. _Uploading the sketch to the board needs to be done once only._
//!
//! # Getting Started
//!
//! ```no_run
//! use rustmata::Rustmata;
//! use rustmata::io::Event;
//!
//! fn main() -> Result<(), rustmata::errors::Error> {
//!     // Open the board on the first available serial port and run discovery.
//!     let mut board = Rustmata::default();
//!     board.open()?;
//!
//!     // Blink the embedded led on pin 13.
//!     board.digital_write(13, true)?;
//!
//!     // Watch an analog input.
//!     board.set_analog_callback(0, |event: Event| println!("{:?}", event))?;
//!     board.enable_analog_reporting(0)?;
//!
//!     board.close()
//! }
//! ```
//!
//! # Concurrency model
//!
//! Two background threads run while the board is open: a transport reader that feeds
//! raw bytes into an internal queue, and a protocol engine that decodes them and
//! updates the state tables. User callbacks run synchronously on the engine thread:
//! they must not block, or they will delay processing of subsequent inbound bytes.
//! All caller-facing operations are synchronous; only [`Rustmata::discover`](client::Rustmata::discover)
//! and [`Rustmata::stepper_version`](client::Rustmata::stepper_version) block for a
//! bounded period.
//!
//! # Feature flags
//!
//! - **libudev** -- (enabled by default) Activates the `serialport` crate _libudev_
//!   feature under-the-hood (required on Linux only for port listing).
//! - **serde** -- Enables serialize/deserialize capabilities for the data-model types.
//! - **mocks** -- Provides a mocked transport (useful for tests mostly).

pub mod client;
pub mod errors;
pub mod io;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod utils;

pub use client::Rustmata;
