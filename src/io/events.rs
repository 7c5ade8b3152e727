//! Typed events dispatched to user callbacks by the protocol engine.

use std::sync::Arc;
use std::time::SystemTime;

/// An event reported to a user callback.
///
/// Every inbound message that changes observable state is materialized as one of these
/// variants; the variant tag replaces the numeric "domain" byte of older Firmata clients.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A new value for an analog input channel.
    Analog { channel: u8, value: u16 },
    /// A new level for a digital input pin.
    Digital { pin: u8, value: u8 },
    /// A new (signed) position for an encoder pin.
    Encoder { pin: u8, value: i32 },
    /// A new distance reading (cm) for a sonar trigger pin.
    Sonar { trigger_pin: u8, distance: u16 },
    /// A reply to an earlier I2C read request.
    I2c {
        address: u16,
        register: u16,
        data: Vec<u16>,
    },
    /// An armed analog latch crossed its threshold.
    LatchAnalog {
        channel: u8,
        value: u16,
        timestamp: SystemTime,
    },
    /// An armed digital latch matched its level.
    LatchDigital {
        pin: u8,
        value: u8,
        timestamp: SystemTime,
    },
}

/// A user callback attached to a pin, latch or sub-protocol entry.
///
/// Callbacks are invoked synchronously on the protocol engine thread, in arrival order.
/// They must not block: a slow callback delays the processing of every subsequent
/// inbound byte.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Wraps a closure into an [`EventCallback`].
pub fn callback<F>(f: F) -> EventCallback
where
    F: Fn(Event) + Send + Sync + 'static,
{
    Arc::new(f)
}
