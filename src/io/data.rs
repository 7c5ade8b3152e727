use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::time::SystemTime;

use log::trace;

use crate::errors::HardwareError::{UnknownPin, ValueOutOfRange};
use crate::errors::*;
use crate::io::constants::{MAX_ANALOG_LATCH_TARGET, SONAR_NO_DATA};
use crate::io::events::{Event, EventCallback};

/// Enumerates the possible modes for a pin.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[repr(u8)]
pub enum PinMode {
    /// Same as INPUT defined in Arduino.h
    #[default]
    Input = 0,
    /// Same as OUTPUT defined in Arduino.h
    Output = 1,
    /// Analog pin in analogInput mode
    Analog = 2,
    /// Digital pin in PWM output mode
    Pwm = 3,
    /// Digital pin in Servo output mode
    Servo = 4,
    /// Pin included in I2C setup
    I2c = 6,
    /// Pin configured for 1-wire
    OneWire = 7,
    /// Pin configured for stepper motor
    Stepper = 8,
    /// Pin configured for piezzo buzzer tone generation
    Tone = 9,
    /// Pin configured for rotary encoders
    Encoder = 0x0A,
    /// Pin configured for proximity sensors
    Sonar = 0x0B,
    /// Pin to be ignored by digitalWrite and capabilityResponse
    Ignore = 0x7F,
}

impl PinMode {
    /// Converts a `u8` byte value into a `PinMode`.
    ///
    /// # Errors
    /// * `Unknown`: The value does not match any known pin mode.
    pub fn from_u8(value: u8) -> Result<PinMode, Error> {
        match value {
            0 => Ok(PinMode::Input),
            1 => Ok(PinMode::Output),
            2 => Ok(PinMode::Analog),
            3 => Ok(PinMode::Pwm),
            4 => Ok(PinMode::Servo),
            6 => Ok(PinMode::I2c),
            7 => Ok(PinMode::OneWire),
            8 => Ok(PinMode::Stepper),
            9 => Ok(PinMode::Tone),
            0x0A => Ok(PinMode::Encoder),
            0x0B => Ok(PinMode::Sonar),
            0x7F => Ok(PinMode::Ignore),
            x => Err(Unknown {
                info: format!("PinMode not found with value: {}", x),
            }),
        }
    }
}

impl From<PinMode> for u8 {
    fn from(mode: PinMode) -> u8 {
        mode as u8
    }
}

impl Display for PinMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ########################################

/// Represents the current state of a single pin in a response table.
///
/// One array of these exists for digital pins and one for analog channels, both sized
/// once at discovery time and reinitialized (never resized) by a full reset.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Default)]
pub struct PinEntry {
    /// Currently configured mode.
    pub mode: PinMode,
    /// Last observed (input) or last commanded (output) value.
    pub value: i32,
    /// Optional user callback, invoked when the observed value changes.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub callback: Option<EventCallback>,
}

impl Debug for PinEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinEntry")
            .field("mode", &self.mode)
            .field("value", &self.value)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// ########################################

/// The arm/fire state of a data latch.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LatchState {
    /// This pin is ignored for latching (initial and post-read state).
    #[default]
    Ignore,
    /// The next matching value will be latched (or fired through the callback).
    Armed,
    /// Data has been latched; read it to clear and re-arm manually.
    Latched,
}

/// Threshold comparison for an analog latch.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AnalogThreshold {
    #[default]
    Gt,
    Lt,
    Gte,
    Lte,
}

/// Level match for a digital latch.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DigitalThreshold {
    #[default]
    Low,
    High,
}

/// One-shot capture state machine for an analog channel.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Default)]
pub struct AnalogLatch {
    pub state: LatchState,
    pub threshold: AnalogThreshold,
    /// Threshold value the samples are compared against (0-1023).
    pub target: u16,
    /// Value captured when the latch fired without a callback.
    pub value: u16,
    /// Capture time, set together with `value`.
    pub timestamp: Option<SystemTime>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub callback: Option<EventCallback>,
}

impl AnalogLatch {
    /// Evaluates an armed latch against a fresh sample.
    ///
    /// On a threshold match: a registered callback is returned for the engine to fire
    /// (entry reset to [`LatchState::Ignore`], never reaching `Latched`); without a
    /// callback the value and timestamp are stored and the state becomes `Latched`.
    /// A non-matching sample leaves the entry untouched.
    pub(crate) fn evaluate(&mut self, channel: u8, value: u16) -> Option<(EventCallback, Event)> {
        if self.state != LatchState::Armed {
            return None;
        }
        let hit = match self.threshold {
            AnalogThreshold::Gt => value > self.target,
            AnalogThreshold::Lt => value < self.target,
            AnalogThreshold::Gte => value >= self.target,
            AnalogThreshold::Lte => value <= self.target,
        };
        if !hit {
            return None;
        }
        let timestamp = SystemTime::now();
        match self.callback.take() {
            Some(callback) => {
                *self = Self::default();
                Some((
                    callback,
                    Event::LatchAnalog {
                        channel,
                        value,
                        timestamp,
                    },
                ))
            }
            None => {
                self.state = LatchState::Latched;
                self.value = value;
                self.timestamp = Some(timestamp);
                None
            }
        }
    }
}

impl Debug for AnalogLatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalogLatch")
            .field("state", &self.state)
            .field("threshold", &self.threshold)
            .field("target", &self.target)
            .field("value", &self.value)
            .field("timestamp", &self.timestamp)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// One-shot capture state machine for a digital pin.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Default)]
pub struct DigitalLatch {
    pub state: LatchState,
    pub threshold: DigitalThreshold,
    /// Level captured when the latch fired without a callback.
    pub value: u8,
    /// Capture time, set together with `value`.
    pub timestamp: Option<SystemTime>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub callback: Option<EventCallback>,
}

impl DigitalLatch {
    /// Digital twin of [`AnalogLatch::evaluate`]: matches exact levels instead of
    /// threshold comparisons.
    pub(crate) fn evaluate(&mut self, pin: u8, level: u8) -> Option<(EventCallback, Event)> {
        if self.state != LatchState::Armed {
            return None;
        }
        let hit = match self.threshold {
            DigitalThreshold::Low => level == 0,
            DigitalThreshold::High => level == 1,
        };
        if !hit {
            return None;
        }
        let timestamp = SystemTime::now();
        match self.callback.take() {
            Some(callback) => {
                *self = Self::default();
                Some((
                    callback,
                    Event::LatchDigital {
                        pin,
                        value: level,
                        timestamp,
                    },
                ))
            }
            None => {
                self.state = LatchState::Latched;
                self.value = level;
                self.timestamp = Some(timestamp);
                None
            }
        }
    }
}

impl Debug for DigitalLatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalLatch")
            .field("state", &self.state)
            .field("threshold", &self.threshold)
            .field("value", &self.value)
            .field("timestamp", &self.timestamp)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Snapshot returned by the latch read operations.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatchSnapshot {
    pub state: LatchState,
    pub value: u16,
    pub timestamp: Option<SystemTime>,
}

// ########################################

/// Firmware name and version reported by the board.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Firmware {
    pub major: u8,
    pub minor: u8,
    pub name: String,
}

/// Defines an I2C reply.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct I2cReply {
    pub address: u16,
    pub register: u16,
    pub data: Vec<u16>,
}

/// Per-address I2C request/reply state.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Default)]
pub struct I2cEntry {
    #[cfg_attr(feature = "serde", serde(skip))]
    pub callback: Option<EventCallback>,
    /// Last reply received for this address, `None` until one arrives.
    pub reply: Option<I2cReply>,
}

impl Debug for I2cEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I2cEntry")
            .field("callback", &self.callback.is_some())
            .field("reply", &self.reply)
            .finish()
    }
}

/// Per-trigger-pin sonar device state.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone)]
pub struct SonarEntry {
    #[cfg_attr(feature = "serde", serde(skip))]
    pub callback: Option<EventCallback>,
    /// Last measured distance in centimeters ([`SONAR_NO_DATA`] until the first reading).
    pub distance: u16,
}

impl Default for SonarEntry {
    fn default() -> Self {
        Self {
            callback: None,
            distance: SONAR_NO_DATA,
        }
    }
}

impl Debug for SonarEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SonarEntry")
            .field("callback", &self.callback.is_some())
            .field("distance", &self.distance)
            .finish()
    }
}

// ########################################

/// Events collected under the data lock, fired by the engine after it is released.
pub(crate) type PendingEvents = Vec<(EventCallback, Event)>;

/// The complete board-side state image owned by one client instance.
///
/// This struct sits behind an `Arc<RwLock<ClientData>>`: the protocol engine mutates it
/// as messages arrive, caller threads read and arm it through the accessors. The tables
/// are empty until [`ClientData::configure_from_mapping`] runs during discovery, and are
/// only ever reinitialized at their discovered sizes afterward.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default)]
pub struct ClientData {
    /// Digital response table, indexed by pin number.
    pub digital: Vec<PinEntry>,
    /// Analog response table, indexed by analog channel number (A0 => 0).
    pub analog: Vec<PinEntry>,
    /// Digital latch table, same indexing as `digital`.
    pub digital_latches: Vec<DigitalLatch>,
    /// Analog latch table, same indexing as `analog`.
    pub analog_latches: Vec<AnalogLatch>,
    /// Cached output bit mask per digital port, used to build digital write messages.
    pub(crate) port_masks: Vec<u8>,
    /// I2C address => request/reply state.
    pub i2c: HashMap<u16, I2cEntry>,
    /// Sonar trigger pin => device state (at most [`MAX_SONAR_DEVICES`] entries).
    ///
    /// [`MAX_SONAR_DEVICES`]: crate::io::constants::MAX_SONAR_DEVICES
    pub sonar: HashMap<u8, SonarEntry>,
    /// Stepper library version, 0 until a response arrives.
    pub stepper_library_version: u16,
    /// Protocol version `(major, minor)` reported by the board.
    pub protocol_version: Option<(u8, u8)>,
    /// Firmware name and version reported by the board.
    pub firmware: Option<Firmware>,
    /// Raw payload of the last capability response.
    pub capability_response: Option<Vec<u8>>,
    /// Raw payload of the last pin state response.
    pub pin_state_response: Option<Vec<u8>>,
    /// Raw payload of the last analog mapping response (drives discovery).
    pub analog_mapping: Option<Vec<u8>>,
    /// Last STRING_DATA message received from the firmware.
    pub last_string_message: Option<String>,
    /// Whether the client currently considers the board reachable.
    pub connected: bool,
}

impl ClientData {
    // ########################################
    // Table sizing

    /// Sizes every table from an analog mapping response: one digital entry per mapping
    /// byte, one analog entry per byte that is not the reserved ignore marker. All
    /// entries start at their defaults (mode Input, value 0, no callback, latch Ignore).
    pub fn configure_from_mapping(&mut self, mapping: &[u8]) {
        let total_pins = mapping.len();
        let total_analog = mapping
            .iter()
            .filter(|&&byte| byte != PinMode::Ignore as u8)
            .count();

        self.digital = vec![PinEntry::default(); total_pins];
        self.analog = vec![PinEntry::default(); total_analog];
        self.digital_latches = vec![DigitalLatch::default(); total_pins];
        self.analog_latches = vec![AnalogLatch::default(); total_analog];
        self.port_masks = vec![0; total_pins.div_ceil(8)];
    }

    /// Reinitializes every entry to its default without changing the table sizes, and
    /// clears the sub-protocol maps. Discovery results (mapping, firmware) are kept.
    pub fn reset_tables(&mut self) {
        self.digital.fill_with(PinEntry::default);
        self.analog.fill_with(PinEntry::default);
        self.digital_latches.fill_with(DigitalLatch::default);
        self.analog_latches.fill_with(AnalogLatch::default);
        self.port_masks.fill(0);
        self.i2c.clear();
        self.sonar.clear();
        self.stepper_library_version = 0;
    }

    // ########################################
    // Response table accessors

    /// Retrieves a reference to a digital pin entry.
    ///
    /// # Errors
    /// * `UnknownPin` - the pin index is outside the discovered range.
    pub fn digital_entry(&self, pin: u8) -> Result<&PinEntry, Error> {
        self.digital
            .get(pin as usize)
            .ok_or(Error::from(UnknownPin { pin }))
    }

    /// Retrieves a mutable reference to a digital pin entry.
    pub fn digital_entry_mut(&mut self, pin: u8) -> Result<&mut PinEntry, Error> {
        self.digital
            .get_mut(pin as usize)
            .ok_or(Error::from(UnknownPin { pin }))
    }

    /// Retrieves a reference to an analog channel entry.
    pub fn analog_entry(&self, channel: u8) -> Result<&PinEntry, Error> {
        self.analog
            .get(channel as usize)
            .ok_or(Error::from(UnknownPin { pin: channel }))
    }

    /// Retrieves a mutable reference to an analog channel entry.
    pub fn analog_entry_mut(&mut self, channel: u8) -> Result<&mut PinEntry, Error> {
        self.analog
            .get_mut(channel as usize)
            .ok_or(Error::from(UnknownPin { pin: channel }))
    }

    // ########################################
    // Inbound value recording (engine side)

    /// Records a fresh analog sample: updates the response table, queues a change
    /// callback when the value differs from the previous one, and evaluates the latch.
    pub(crate) fn record_analog(&mut self, channel: u8, value: u16) -> Result<PendingEvents, Error> {
        let mut events = PendingEvents::new();

        let entry = self.analog_entry_mut(channel)?;
        let previous = entry.value;
        entry.value = value as i32;
        if previous != value as i32 {
            if let Some(callback) = &entry.callback {
                events.push((callback.clone(), Event::Analog { channel, value }));
            }
        }

        if let Some(fired) = self.analog_latches[channel as usize].evaluate(channel, value) {
            events.push(fired);
        }
        Ok(events)
    }

    /// Records a digital port report: unpacks all 8 bits and updates up to 8 consecutive
    /// pin entries, queuing change callbacks and latch evaluations for each.
    pub(crate) fn record_digital_port(&mut self, port: u8, bits: u16) -> PendingEvents {
        let mut events = PendingEvents::new();
        let first = port as usize * 8;

        for i in 0..8 {
            let pin = first + i;
            if pin >= self.digital.len() {
                break;
            }
            let level = ((bits >> i) & 0x01) as u8;

            let entry = &mut self.digital[pin];
            let previous = entry.value;
            entry.value = level as i32;
            if previous != level as i32 {
                if let Some(callback) = &entry.callback {
                    events.push((
                        callback.clone(),
                        Event::Digital {
                            pin: pin as u8,
                            value: level,
                        },
                    ));
                }
            }

            if let Some(fired) = self.digital_latches[pin].evaluate(pin as u8, level) {
                events.push(fired);
            }
        }
        events
    }

    /// Records a signed encoder position into the digital response table.
    pub(crate) fn record_encoder(&mut self, pin: u8, value: i32) -> Result<PendingEvents, Error> {
        let mut events = PendingEvents::new();
        let entry = self.digital_entry_mut(pin)?;
        let previous = entry.value;
        entry.value = value;
        if previous != value {
            if let Some(callback) = &entry.callback {
                events.push((callback.clone(), Event::Encoder { pin, value }));
            }
        }
        Ok(events)
    }

    /// Records a sonar distance reading: mirrors it into the digital response table and
    /// updates the active sonar map, queuing the device callback when the value changed.
    pub(crate) fn record_sonar(&mut self, trigger_pin: u8, distance: u16) -> Result<PendingEvents, Error> {
        let mut events = PendingEvents::new();

        if let Some(entry) = self.digital.get_mut(trigger_pin as usize) {
            entry.value = distance as i32;
        }

        let device = self
            .sonar
            .get_mut(&trigger_pin)
            .ok_or(Error::from(UnknownPin { pin: trigger_pin }))?;
        if device.distance != distance {
            if let Some(callback) = &device.callback {
                events.push((
                    callback.clone(),
                    Event::Sonar {
                        trigger_pin,
                        distance,
                    },
                ));
            }
        }
        device.distance = distance;
        Ok(events)
    }

    /// Stores an I2C reply for its address and queues the registered callback, if any.
    /// Replies for addresses never requested are dropped.
    pub(crate) fn record_i2c_reply(&mut self, reply: I2cReply) -> PendingEvents {
        let mut events = PendingEvents::new();
        match self.i2c.get_mut(&reply.address) {
            None => trace!("i2c reply for unrequested address {}", reply.address),
            Some(entry) => {
                if let Some(callback) = &entry.callback {
                    events.push((
                        callback.clone(),
                        Event::I2c {
                            address: reply.address,
                            register: reply.register,
                            data: reply.data.clone(),
                        },
                    ));
                }
                entry.reply = Some(reply);
            }
        }
        events
    }

    // ########################################
    // Latch arm/read (caller side)

    /// Arms the latch of an analog channel: stores the threshold parameters and clears
    /// any previously latched value and timestamp.
    ///
    /// # Errors
    /// * `UnknownPin` - the channel is outside the discovered range.
    /// * `ValueOutOfRange` - the target is above 1023.
    pub fn arm_analog_latch(
        &mut self,
        channel: u8,
        threshold: AnalogThreshold,
        target: u16,
        callback: Option<EventCallback>,
    ) -> Result<(), Error> {
        if target > MAX_ANALOG_LATCH_TARGET {
            return Err(Error::from(ValueOutOfRange {
                value: target,
                max: MAX_ANALOG_LATCH_TARGET,
            }));
        }
        let latch = self
            .analog_latches
            .get_mut(channel as usize)
            .ok_or(Error::from(UnknownPin { pin: channel }))?;
        *latch = AnalogLatch {
            state: LatchState::Armed,
            threshold,
            target,
            value: 0,
            timestamp: None,
            callback,
        };
        Ok(())
    }

    /// Arms the latch of a digital pin.
    pub fn arm_digital_latch(
        &mut self,
        pin: u8,
        threshold: DigitalThreshold,
        callback: Option<EventCallback>,
    ) -> Result<(), Error> {
        let latch = self
            .digital_latches
            .get_mut(pin as usize)
            .ok_or(Error::from(UnknownPin { pin }))?;
        *latch = DigitalLatch {
            state: LatchState::Armed,
            threshold,
            value: 0,
            timestamp: None,
            callback,
        };
        Ok(())
    }

    /// Returns the current analog latch state, value and capture time.
    ///
    /// Reading a [`LatchState::Latched`] entry atomically resets it to
    /// [`LatchState::Ignore`] (value and timestamp cleared): an immediate second read
    /// reports the cleared entry. Reading an `Armed` or `Ignore` entry has no side effect.
    pub fn analog_latch_read(&mut self, channel: u8) -> Result<LatchSnapshot, Error> {
        let latch = self
            .analog_latches
            .get_mut(channel as usize)
            .ok_or(Error::from(UnknownPin { pin: channel }))?;
        let snapshot = LatchSnapshot {
            state: latch.state,
            value: latch.value,
            timestamp: latch.timestamp,
        };
        if latch.state == LatchState::Latched {
            *latch = AnalogLatch::default();
        }
        Ok(snapshot)
    }

    /// Digital twin of [`ClientData::analog_latch_read`].
    pub fn digital_latch_read(&mut self, pin: u8) -> Result<LatchSnapshot, Error> {
        let latch = self
            .digital_latches
            .get_mut(pin as usize)
            .ok_or(Error::from(UnknownPin { pin }))?;
        let snapshot = LatchSnapshot {
            state: latch.state,
            value: latch.value as u16,
            timestamp: latch.timestamp,
        };
        if latch.state == LatchState::Latched {
            *latch = DigitalLatch::default();
        }
        Ok(snapshot)
    }
}
