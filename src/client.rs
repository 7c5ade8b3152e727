//! The board client: owns the transport, the background threads and the state tables.

use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use parking_lot::{Mutex, RwLock};

use crate::errors::HardwareError::SonarCapacity;
use crate::errors::ProtocolError::{DiscoveryTimeout, StepperVersionTimeout};
use crate::errors::*;
use crate::io::constants::*;
use crate::io::{
    AnalogThreshold, ByteQueue, ClientData, DigitalThreshold, Engine, Event, EventCallback,
    Firmware, I2cEntry, I2cReply, LatchSnapshot, PinMode, Serial, SonarEntry, Transport,
};
use crate::utils::format_as_hex;

/// Selects which response table an operation targets.
///
/// Analog channels are indexed by their analog-only number (A0 => 0), not by their
/// digital pin number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinDomain {
    Digital,
    Analog,
}

/// I2C read request operation modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum I2cReadMode {
    /// Single read.
    Read = 0x08,
    /// Read continuously at the sampling interval.
    ReadContinuously = 0x10,
}

/// A Firmata board client.
///
/// One instance exclusively owns the complete board-side state: the response and latch
/// tables, the sub-protocol maps and the ingress byte queue. While the board is
/// [open](Rustmata::open), two background threads run: the transport reader (raw bytes
/// into the queue) and the protocol engine (queue into the tables). All methods are
/// callable concurrently from any thread; table access is serialized through one shared
/// lock, outbound writes through the transport lock.
pub struct Rustmata {
    /// Transport layer used to communicate with the board.
    transport: Arc<Mutex<Box<dyn Transport>>>,
    /// Shared board state image, mutated by the engine and read/armed by callers.
    data: Arc<RwLock<ClientData>>,
    /// Ingress byte queue between the reader and the engine.
    queue: Arc<ByteQueue>,
    /// Cooperative stop flag checked by both background loops.
    stop: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
    engine_handle: Option<JoinHandle<()>>,
}

impl Rustmata {
    /// Creates a client communicating through the specified serial port.
    pub fn new<P: Into<String>>(port: P) -> Self {
        Self::from(Serial::new(port))
    }

    /// Returns a protected reference to the inner [`ClientData`].
    pub fn get_data(&self) -> &Arc<RwLock<ClientData>> {
        &self.data
    }

    /// Checks if the board is currently considered reachable.
    pub fn is_connected(&self) -> bool {
        self.data.read().connected
    }

    // ########################################
    // Lifecycle

    /// Opens the transport, starts the two background threads and runs the discovery
    /// handshake (up to 30 seconds).
    ///
    /// # Errors
    /// * `DiscoveryTimeout` - the board never answered the analog mapping query; the
    ///   caller is expected to [`close`](Rustmata::close) and abort startup.
    pub fn open(&mut self) -> Result<(), Error> {
        self.transport.lock().open()?;

        self.stop = Arc::new(AtomicBool::new(false));
        self.queue = Arc::new(ByteQueue::new());

        let transport = self.transport.clone();
        let queue = self.queue.clone();
        let stop = self.stop.clone();
        self.reader_handle = Some(
            std::thread::Builder::new()
                .name(String::from("rustmata-reader"))
                .spawn(move || {
                    let mut buf = [0u8; 64];
                    while !stop.load(Ordering::Relaxed) {
                        let read = { transport.lock().poll_read(&mut buf) };
                        match read {
                            Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                            Ok(count) => queue.extend(&buf[..count]),
                            Err(err) => {
                                error!("transport read failed: {}", err);
                                break;
                            }
                        }
                    }
                    // Closing the queue is the signal the engine loop observes.
                    queue.close();
                })?,
        );

        let engine = Engine::new(self.queue.clone(), self.data.clone(), self.stop.clone());
        self.engine_handle = Some(
            std::thread::Builder::new()
                .name(String::from("rustmata-engine"))
                .spawn(move || engine.run())?,
        );

        // Force a software reset: some boards do not restart automatically when the
        // connection is opened, and leftover reporting settings from a previous run
        // would otherwise keep streaming.
        self.send_command(&[SYSTEM_RESET])?;
        self.discover(DISCOVERY_TIMEOUT)?;

        self.data.write().connected = true;
        Ok(())
    }

    /// Stops both background threads, waits for them to exit, then closes the transport.
    pub fn close(&mut self) -> Result<(), Error> {
        self.stop.store(true, Ordering::Relaxed);
        self.queue.close();
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.engine_handle.take() {
            let _ = handle.join();
        }
        self.data.write().connected = false;
        self.transport.lock().close()?;
        debug!("board connection closed");
        Ok(())
    }

    /// Runs the board auto-discovery handshake: an analog mapping query is sent every
    /// 100 ms until the mapping response arrives or `timeout` elapses. On success the
    /// response and latch tables are allocated at their discovered sizes, every entry
    /// at its default.
    pub fn discover(&self, timeout: Duration) -> Result<(), Error> {
        let start = Instant::now();
        let mapping = loop {
            if let Some(mapping) = self.data.read().analog_mapping.clone() {
                break mapping;
            }
            if start.elapsed() >= timeout {
                return Err(Error::from(DiscoveryTimeout {
                    waited: timeout.as_secs(),
                }));
            }
            self.send_sysex(ANALOG_MAPPING_QUERY, &[])?;
            std::thread::sleep(DISCOVERY_RETRY_INTERVAL);
        };

        let mut lock = self.data.write();
        lock.configure_from_mapping(&mapping);
        debug!(
            "board discovered: {} pins, {} analog channels",
            lock.digital.len(),
            lock.analog.len()
        );
        Ok(())
    }

    /// Sends a reset message to the board and reinitializes the state tables.
    ///
    /// Every output pin is quiesced first (by pin index, according to its current mode):
    /// PWM and servo pins are written 0, tone pins silenced, everything else driven low.
    /// The tables keep their discovered sizes; sub-protocol maps are cleared.
    pub fn reset(&self) -> Result<(), Error> {
        let modes: Vec<(u8, PinMode)> = self
            .data
            .read()
            .digital
            .iter()
            .enumerate()
            .map(|(pin, entry)| (pin as u8, entry.mode))
            .collect();
        for (pin, mode) in modes {
            match mode {
                PinMode::Pwm | PinMode::Servo => self.analog_write(pin, 0)?,
                PinMode::Tone => self.stop_tone(pin)?,
                _ => self.digital_write(pin, false)?,
            }
        }
        self.send_command(&[SYSTEM_RESET])?;
        self.data.write().reset_tables();
        Ok(())
    }

    // ########################################
    // Outbound primitives

    /// Transmits a non-sysex command: command byte plus data, formatted by the caller.
    pub fn send_command(&self, command: &[u8]) -> Result<(), Error> {
        trace!("TX command: [{}]", format_as_hex(command));
        self.transport.lock().write(command)
    }

    /// Wraps `payload` in a sysex envelope for `command` and transmits it.
    pub fn send_sysex(&self, command: u8, payload: &[u8]) -> Result<(), Error> {
        let mut frame = Vec::with_capacity(payload.len() + 3);
        frame.push(START_SYSEX);
        frame.push(command);
        frame.extend_from_slice(payload);
        frame.push(END_SYSEX);
        trace!("TX sysex: [{}]", format_as_hex(&frame));
        self.transport.lock().write(&frame)
    }

    // ########################################
    // Response tables

    /// Retrieves the last value received (or commanded) for the specified analog channel.
    pub fn analog_read(&self, channel: u8) -> Result<i32, Error> {
        Ok(self.data.read().analog_entry(channel)?.value)
    }

    /// Retrieves the last value received (or commanded) for the specified digital pin.
    pub fn digital_read(&self, pin: u8) -> Result<i32, Error> {
        Ok(self.data.read().digital_entry(pin)?.value)
    }

    /// Retrieves the currently configured mode of the specified analog channel.
    pub fn analog_mode(&self, channel: u8) -> Result<PinMode, Error> {
        Ok(self.data.read().analog_entry(channel)?.mode)
    }

    /// Retrieves the currently configured mode of the specified digital pin.
    pub fn digital_mode(&self, pin: u8) -> Result<PinMode, Error> {
        Ok(self.data.read().digital_entry(pin)?.mode)
    }

    /// Sets a pin to the desired mode and sends the matching SET_PIN_MODE command.
    ///
    /// For [`PinMode::Input`] the optional callback is attached and reporting is enabled
    /// automatically; for other modes the callback argument is ignored.
    ///
    /// NOTE: do not call this for I2C pins, see [`Rustmata::i2c_config`].
    pub fn set_pin_mode(
        &self,
        pin: u8,
        mode: PinMode,
        domain: PinDomain,
        callback: Option<EventCallback>,
    ) -> Result<(), Error> {
        {
            let mut lock = self.data.write();
            let entry = match domain {
                PinDomain::Analog => lock.analog_entry_mut(pin)?,
                PinDomain::Digital => lock.digital_entry_mut(pin)?,
            };
            entry.mode = mode;
            if mode == PinMode::Input {
                entry.callback = callback;
            }
        }
        self.send_command(&[SET_PIN_MODE, pin, mode as u8])?;
        if mode == PinMode::Input {
            match domain {
                PinDomain::Analog => self.enable_analog_reporting(pin)?,
                PinDomain::Digital => self.enable_digital_reporting(pin)?,
            }
        }
        Ok(())
    }

    /// Attaches a value-change callback to an analog channel (at most one per channel).
    pub fn set_analog_callback<F>(&self, channel: u8, callback: F) -> Result<(), Error>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.data.write().analog_entry_mut(channel)?.callback = Some(Arc::new(callback));
        Ok(())
    }

    /// Attaches a value-change callback to a digital pin (at most one per pin).
    pub fn set_digital_callback<F>(&self, pin: u8, callback: F) -> Result<(), Error>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.data.write().digital_entry_mut(pin)?.callback = Some(Arc::new(callback));
        Ok(())
    }

    // ########################################
    // Data latches

    /// Arms an analog channel for one-shot data latching.
    ///
    /// When a sample crosses the threshold: with a callback the event is fired once and
    /// the latch disarms; without one the value and timestamp are stored until
    /// [`Rustmata::analog_latch_read`] picks them up.
    pub fn set_analog_latch(
        &self,
        channel: u8,
        threshold: AnalogThreshold,
        target: u16,
        callback: Option<EventCallback>,
    ) -> Result<(), Error> {
        self.data
            .write()
            .arm_analog_latch(channel, threshold, target, callback)
    }

    /// Arms a digital pin for one-shot data latching on the given level.
    pub fn set_digital_latch(
        &self,
        pin: u8,
        threshold: DigitalThreshold,
        callback: Option<EventCallback>,
    ) -> Result<(), Error> {
        self.data.write().arm_digital_latch(pin, threshold, callback)
    }

    /// Returns the latch state of an analog channel; reading a latched entry clears it.
    pub fn analog_latch_read(&self, channel: u8) -> Result<LatchSnapshot, Error> {
        self.data.write().analog_latch_read(channel)
    }

    /// Returns the latch state of a digital pin; reading a latched entry clears it.
    pub fn digital_latch_read(&self, pin: u8) -> Result<LatchSnapshot, Error> {
        self.data.write().digital_latch_read(pin)
    }

    // ########################################
    // Pin writes

    /// Writes `level` to the digital `pin`.
    ///
    /// The whole 8-pin port is re-sent from the cached output masks, as the protocol
    /// requires (DIGITAL_MESSAGE carries a full port).
    pub fn digital_write(&self, pin: u8, level: bool) -> Result<(), Error> {
        let port = pin / 8;
        let bits = {
            let mut lock = self.data.write();
            lock.digital_entry_mut(pin)?.value = i32::from(level);
            let mask = 1u8 << (pin % 8);
            let port_mask = &mut lock.port_masks[port as usize];
            match level {
                true => *port_mask |= mask,
                false => *port_mask &= !mask,
            }
            *port_mask
        };
        self.send_command(&[DIGITAL_MESSAGE | port, bits & SYSEX_REALTIME, bits >> 7])
    }

    /// Writes an analog `value` (PWM, servo position, etc.) to the digital `pin`.
    ///
    /// Pins above 15 cannot be addressed by the standard message and switch to the
    /// EXTENDED_ANALOG sysex; so do values wider than 14 bits, which travel as three
    /// 7-bit bytes.
    pub fn analog_write(&self, pin: u8, value: u16) -> Result<(), Error> {
        self.data.write().digital_entry_mut(pin)?.value = value as i32;

        if pin > 15 || value > 0x3FFF {
            let mut payload = vec![
                pin,
                value as u8 & SYSEX_REALTIME,
                (value >> 7) as u8 & SYSEX_REALTIME,
            ];
            if value > 0x3FFF {
                payload.push((value >> 14) as u8 & SYSEX_REALTIME);
            }
            self.send_sysex(EXTENDED_ANALOG, &payload)
        } else {
            self.send_command(&[
                ANALOG_MESSAGE | pin,
                value as u8 & SYSEX_REALTIME,
                (value >> 7) as u8,
            ])
        }
    }

    // ########################################
    // Reporting

    /// Enables periodic reporting for a single analog channel.
    pub fn enable_analog_reporting(&self, channel: u8) -> Result<(), Error> {
        self.send_command(&[REPORT_ANALOG | channel, REPORTING_ENABLE])
    }

    /// Disables reporting for a single analog channel.
    pub fn disable_analog_reporting(&self, channel: u8) -> Result<(), Error> {
        self.send_command(&[REPORT_ANALOG | channel, REPORTING_DISABLE])
    }

    /// Enables digital reporting for the whole port containing `pin`.
    pub fn enable_digital_reporting(&self, pin: u8) -> Result<(), Error> {
        self.send_command(&[REPORT_DIGITAL | (pin / 8), REPORTING_ENABLE])
    }

    /// Disables digital reporting for the whole port containing `pin`.
    pub fn disable_digital_reporting(&self, pin: u8) -> Result<(), Error> {
        self.send_command(&[REPORT_DIGITAL | (pin / 8), REPORTING_DISABLE])
    }

    /// Sets how often (in ms) analog and continuous i2c data is reported.
    ///
    /// Note: standard firmwares ignore any interval below 10 milliseconds.
    pub fn set_sampling_interval(&self, interval: u16) -> Result<(), Error> {
        self.send_sysex(
            SAMPLING_INTERVAL,
            &[interval as u8 & SYSEX_REALTIME, (interval >> 7) as u8],
        )
    }

    // ########################################
    // Servo / tone

    /// Configures a pin as a servo pin with the given pulse range (in microseconds).
    pub fn servo_config(&self, pin: u8, min_pulse: u16, max_pulse: u16) -> Result<(), Error> {
        self.data.write().digital_entry_mut(pin)?.mode = PinMode::Servo;
        self.send_command(&[SET_PIN_MODE, pin, PinMode::Servo as u8])?;
        self.send_sysex(
            SERVO_CONFIG,
            &[
                pin,
                min_pulse as u8 & SYSEX_REALTIME,
                (min_pulse >> 7) as u8 & SYSEX_REALTIME,
                max_pulse as u8 & SYSEX_REALTIME,
                (max_pulse >> 7) as u8 & SYSEX_REALTIME,
            ],
        )
    }

    /// Plays a tone of `frequency` Hz for `duration` ms on the selected pin
    /// (0 duration plays until [`Rustmata::stop_tone`]).
    pub fn play_tone(&self, pin: u8, frequency: u16, duration: u16) -> Result<(), Error> {
        self.data.write().digital_entry_mut(pin)?.mode = PinMode::Tone;
        self.send_sysex(
            TONE_PLAY,
            &[
                TONE_TONE,
                pin,
                frequency as u8 & SYSEX_REALTIME,
                (frequency >> 7) as u8,
                duration as u8 & SYSEX_REALTIME,
                (duration >> 7) as u8,
            ],
        )
    }

    /// Turns off any tone currently playing on the selected pin.
    pub fn stop_tone(&self, pin: u8) -> Result<(), Error> {
        self.send_sysex(TONE_PLAY, &[TONE_NO_TONE, pin])
    }

    // ########################################
    // Encoder

    /// Enables a rotary encoder on the given pin pair and starts reporting.
    ///
    /// Position data is then retrieved with [`Rustmata::digital_read`] on `pin_a`, or
    /// through the optional callback.
    pub fn encoder_config(
        &self,
        pin_a: u8,
        pin_b: u8,
        callback: Option<EventCallback>,
    ) -> Result<(), Error> {
        {
            let mut lock = self.data.write();
            lock.digital_entry(pin_b)?;
            let entry = lock.digital_entry_mut(pin_a)?;
            entry.mode = PinMode::Encoder;
            entry.callback = callback.clone();
            let entry = lock.digital_entry_mut(pin_b)?;
            entry.mode = PinMode::Encoder;
            entry.callback = callback;
        }
        self.enable_digital_reporting(pin_a)?;
        self.enable_digital_reporting(pin_b)?;
        self.send_sysex(ENCODER_CONFIG, &[pin_a, pin_b])
    }

    // ########################################
    // I2C

    /// Initializes the firmware for I2C operations with an optional read delay
    /// (microseconds between register write and data read).
    ///
    /// NOTE: this must be called before any other I2C request.
    pub fn i2c_config(&self, delay: u16) -> Result<(), Error> {
        self.send_sysex(
            I2C_CONFIG,
            &[delay as u8 & SYSEX_REALTIME, (delay >> 7) as u8],
        )
    }

    /// Requests a read of `bytes` bytes from register `register` of the i2c device at
    /// `address`. The reply is delivered to the callback (if any) and retrievable with
    /// [`Rustmata::i2c_read_data`].
    pub fn i2c_read(
        &self,
        address: u8,
        register: u16,
        bytes: u16,
        mode: I2cReadMode,
        callback: Option<EventCallback>,
    ) -> Result<(), Error> {
        self.data.write().i2c.insert(
            address as u16,
            I2cEntry {
                callback,
                reply: None,
            },
        );
        self.send_sysex(
            I2C_REQUEST,
            &[
                address,
                mode as u8,
                register as u8 & SYSEX_REALTIME,
                (register >> 7) as u8,
                bytes as u8 & SYSEX_REALTIME,
                (bytes >> 7) as u8,
            ],
        )
    }

    /// Writes `data` to the i2c device at `address`.
    pub fn i2c_write(&self, address: u8, data: &[u8]) -> Result<(), Error> {
        let mut payload = vec![address, I2C_WRITE];
        payload.extend_from_slice(data);
        self.send_sysex(I2C_REQUEST, &payload)
    }

    /// Stops an [`I2cReadMode::ReadContinuously`] operation for the given device.
    pub fn i2c_stop_reading(&self, address: u8) -> Result<(), Error> {
        self.send_sysex(I2C_REQUEST, &[address, I2C_STOP_READING])
    }

    /// Retrieves the last reply received for the given i2c device, if any.
    pub fn i2c_read_data(&self, address: u8) -> Option<I2cReply> {
        self.data
            .read()
            .i2c
            .get(&(address as u16))
            .and_then(|entry| entry.reply.clone())
    }

    // ########################################
    // Sonar

    /// Configures an HC-SR04 type device on the given trigger/echo pin pair.
    ///
    /// Single pin devices use the same pin for both. Distances are measured in
    /// centimeters, capped at 200 cm; `ping_interval` is the minimum delay between
    /// pings in milliseconds (33 to 127). At most 6 devices can be active: the next
    /// configuration of a new trigger pin is rejected with `SonarCapacity` and leaves
    /// the existing devices untouched.
    pub fn sonar_config(
        &self,
        trigger_pin: u8,
        echo_pin: u8,
        callback: Option<EventCallback>,
        ping_interval: u8,
        max_distance: u16,
    ) -> Result<(), Error> {
        let max_distance = max_distance.min(MAX_SONAR_DISTANCE);
        {
            let mut lock = self.data.write();
            lock.digital_entry(trigger_pin)?;
            lock.digital_entry(echo_pin)?;
            if !lock.sonar.contains_key(&trigger_pin) && lock.sonar.len() >= MAX_SONAR_DEVICES {
                return Err(Error::from(SonarCapacity {
                    active: lock.sonar.len(),
                }));
            }
            lock.digital_entry_mut(trigger_pin)?.mode = PinMode::Sonar;
            lock.digital_entry_mut(echo_pin)?.mode = PinMode::Sonar;
            lock.sonar.insert(
                trigger_pin,
                SonarEntry {
                    callback,
                    distance: SONAR_NO_DATA,
                },
            );
        }
        self.send_command(&[SET_PIN_MODE, trigger_pin, PinMode::Sonar as u8])?;
        self.send_command(&[SET_PIN_MODE, echo_pin, PinMode::Sonar as u8])?;
        self.send_sysex(
            SONAR_CONFIG,
            &[
                trigger_pin,
                echo_pin,
                ping_interval,
                max_distance as u8 & SYSEX_REALTIME,
                (max_distance >> 7) as u8,
            ],
        )
    }

    /// Retrieves the last measured distance (cm) for the given sonar trigger pin
    /// ([`SONAR_NO_DATA`] until the first reading arrives).
    pub fn sonar_distance(&self, trigger_pin: u8) -> Result<u16, Error> {
        self.data
            .read()
            .sonar
            .get(&trigger_pin)
            .map(|entry| entry.distance)
            .ok_or(Error::from(HardwareError::UnknownPin { pin: trigger_pin }))
    }

    // ########################################
    // Stepper

    /// Configures a stepper motor prior to operation: steps per revolution and either
    /// 2 or 4 control pins.
    pub fn stepper_config(&self, steps_per_revolution: u16, pins: &[u8]) -> Result<(), Error> {
        let mut payload = vec![
            STEPPER_CONFIGURE,
            steps_per_revolution as u8 & SYSEX_REALTIME,
            (steps_per_revolution >> 7) as u8,
        ];
        payload.extend_from_slice(pins);
        self.send_sysex(STEPPER_DATA, &payload)
    }

    /// Moves a stepper motor: `speed` is 21 bits of motor speed, `steps` the signed
    /// number of steps (positive forward, negative reverse, 14 bits).
    pub fn stepper_step(&self, speed: u32, steps: i32) -> Result<(), Error> {
        let direction = u8::from(steps > 0);
        let steps = steps.unsigned_abs();
        self.send_sysex(
            STEPPER_DATA,
            &[
                STEPPER_STEP,
                speed as u8 & SYSEX_REALTIME,
                (speed >> 7) as u8 & SYSEX_REALTIME,
                (speed >> 14) as u8 & SYSEX_REALTIME,
                steps as u8 & SYSEX_REALTIME,
                (steps >> 7) as u8 & SYSEX_REALTIME,
                direction,
            ],
        )
    }

    /// Requests the stepper library version from the firmware. Retrieve it afterward
    /// with [`Rustmata::stepper_version`].
    pub fn stepper_request_library_version(&self) -> Result<(), Error> {
        self.send_sysex(STEPPER_DATA, &[STEPPER_LIBRARY_VERSION])
    }

    /// Waits up to `timeout` for the stepper library version to arrive.
    ///
    /// # Errors
    /// * `StepperVersionTimeout` - no response in time (non-fatal; did you send a
    ///   [`Rustmata::stepper_request_library_version`] first?).
    pub fn stepper_version(&self, timeout: Duration) -> Result<u16, Error> {
        let start = Instant::now();
        loop {
            let version = self.data.read().stepper_library_version;
            if version > 0 {
                return Ok(version);
            }
            if start.elapsed() >= timeout {
                return Err(Error::from(StepperVersionTimeout {
                    waited: timeout.as_secs(),
                }));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    // ########################################
    // Queries

    /// Queries the protocol version; read it back with [`Rustmata::protocol_version`].
    pub fn refresh_report_version(&self) -> Result<(), Error> {
        self.send_command(&[REPORT_VERSION])
    }

    /// Queries the firmware name and version; read it back with [`Rustmata::firmware`].
    pub fn refresh_report_firmware(&self) -> Result<(), Error> {
        self.send_sysex(REPORT_FIRMWARE, &[])
    }

    /// The protocol version `(major, minor)` last reported by the board.
    pub fn protocol_version(&self) -> Option<(u8, u8)> {
        self.data.read().protocol_version
    }

    /// The firmware name and version last reported by the board.
    pub fn firmware(&self) -> Option<Firmware> {
        self.data.read().firmware.clone()
    }

    /// Sends a capability query. The board can be slow to answer this one (tens of
    /// seconds on some hardware); poll [`Rustmata::capability_data`] for the reply.
    pub fn capability_query(&self) -> Result<(), Error> {
        self.send_sysex(CAPABILITY_QUERY, &[])
    }

    /// Raw payload of the last capability response, if any.
    pub fn capability_data(&self) -> Option<Vec<u8>> {
        self.data.read().capability_response.clone()
    }

    /// Queries the current mode and value of a pin; the reply is consumed through
    /// [`Rustmata::pin_state_data`].
    pub fn pin_state_query(&self, pin: u8) -> Result<(), Error> {
        self.send_sysex(PIN_STATE_QUERY, &[pin])
    }

    /// Takes the last pin state response, clearing it for the next query.
    pub fn pin_state_data(&self) -> Option<Vec<u8>> {
        self.data.write().pin_state_response.take()
    }

    /// Sends an analog mapping query outside of discovery.
    pub fn analog_mapping_query(&self) -> Result<(), Error> {
        self.send_sysex(ANALOG_MAPPING_QUERY, &[])
    }

    /// Raw payload of the last analog mapping response, if any.
    pub fn analog_mapping_data(&self) -> Option<Vec<u8>> {
        self.data.read().analog_mapping.clone()
    }

    /// The last STRING_DATA message received from the firmware, if any.
    pub fn last_string_message(&self) -> Option<String> {
        self.data.read().last_string_message.clone()
    }
}

impl Default for Rustmata {
    /// Creates a client on the first available serial port (or an empty port name when
    /// none is detected, which will fail during the open phase).
    #[cfg(not(tarpaulin_include))]
    fn default() -> Self {
        Self::from(Serial::first_available())
    }
}

impl<T: Transport + 'static> From<T> for Rustmata {
    fn from(transport: T) -> Self {
        Self {
            transport: Arc::new(Mutex::new(Box::new(transport))),
            data: Arc::new(RwLock::new(ClientData::default())),
            queue: Arc::new(ByteQueue::new()),
            stop: Arc::new(AtomicBool::new(false)),
            reader_handle: None,
            engine_handle: None,
        }
    }
}

impl Debug for Rustmata {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rustmata")
            .field("transport", &self.transport.lock())
            .field("data", &self.data.read())
            .field("running", &self.engine_handle.is_some())
            .finish()
    }
}

impl Display for Rustmata {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let data = self.data.read();
        let firmware = data.firmware.clone().unwrap_or_default();
        write!(
            f,
            "Rustmata [firmware={} v{}.{}, transport={}]",
            firmware.name,
            firmware.major,
            firmware.minor,
            self.transport.lock()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serial_test::serial;

    use crate::io::callback;
    use crate::io::LatchState;
    use crate::mocks::MockTransport;

    use super::*;

    /// Analog mapping of a 20 pin / 6 analog channel board.
    fn test_mapping() -> Vec<u8> {
        let mut mapping = vec![0x7F; 14];
        mapping.extend_from_slice(&[0, 1, 2, 3, 4, 5]);
        mapping
    }

    /// A client over a mock transport with discovery already applied (no threads).
    fn mock_client() -> (Rustmata, MockTransport) {
        let mock = MockTransport::new();
        let client = Rustmata::from(mock.clone());
        client.get_data().write().configure_from_mapping(&test_mapping());
        (client, mock)
    }

    /// Polls `predicate` until it holds or the deadline expires.
    fn wait_until<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    #[test]
    fn test_send_command_and_sysex_framing() {
        let (client, mock) = mock_client();
        client.send_command(&[0xF9]).unwrap();
        client.send_sysex(0x79, &[]).unwrap();
        client.send_sysex(0x71, &[0x01, 0x02]).unwrap();
        assert_eq!(
            mock.written(),
            vec![0xF9, 0xF0, 0x79, 0xF7, 0xF0, 0x71, 0x01, 0x02, 0xF7]
        );
    }

    #[test]
    fn test_defaults_before_any_message() {
        let (client, _) = mock_client();
        for pin in 0..20 {
            assert_eq!(client.digital_read(pin).unwrap(), 0);
            assert_eq!(client.digital_mode(pin).unwrap(), PinMode::Input);
        }
        for channel in 0..6 {
            assert_eq!(client.analog_read(channel).unwrap(), 0);
            assert_eq!(client.analog_mode(channel).unwrap(), PinMode::Input);
        }
        assert!(client.analog_read(6).is_err());
        assert!(client.digital_read(20).is_err());
    }

    #[test]
    fn test_digital_write() {
        let (client, mock) = mock_client();
        client.digital_write(13, true).unwrap();
        // Port 1, bit 5 set.
        assert_eq!(mock.written(), vec![0x91, 0x20, 0x00]);
        assert_eq!(client.digital_read(13).unwrap(), 1);

        mock.clear_written();
        client.digital_write(8, true).unwrap();
        // The cached port mask keeps pin 13 high.
        assert_eq!(mock.written(), vec![0x91, 0x21, 0x00]);

        mock.clear_written();
        client.digital_write(13, false).unwrap();
        assert_eq!(mock.written(), vec![0x91, 0x01, 0x00]);

        let result = client.digital_write(66, true);
        assert!(result.is_err());
        assert_eq!(
            result.err().unwrap().to_string(),
            "Hardware error: Unknown pin 66."
        );
    }

    #[test]
    fn test_analog_write_standard_message() {
        let (client, mock) = mock_client();
        client.analog_write(3, 170).unwrap();
        assert_eq!(mock.written(), vec![0xE3, 0x2A, 0x01]);
        assert_eq!(client.digital_read(3).unwrap(), 170);
    }

    #[test]
    fn test_analog_write_extended_message() {
        let (client, mock) = mock_client();
        // Pin over 15 and value over 14 bits: extended sysex with three value bytes.
        client.analog_write(17, 17000).unwrap();
        assert_eq!(
            mock.written(),
            vec![0xF0, 0x6F, 0x11, 0x68, 0x04, 0x01, 0xF7]
        );

        mock.clear_written();
        // Pin over 15 with a small value: two value bytes only.
        client.analog_write(16, 100).unwrap();
        assert_eq!(mock.written(), vec![0xF0, 0x6F, 0x10, 0x64, 0x00, 0xF7]);
    }

    #[test]
    fn test_set_pin_mode_input_enables_reporting() {
        let (client, mock) = mock_client();
        client
            .set_pin_mode(2, PinMode::Input, PinDomain::Digital, Some(callback(|_| {})))
            .unwrap();
        assert_eq!(mock.written(), vec![0xF4, 0x02, 0x00, 0xD0, 0x01]);
        assert_eq!(client.digital_mode(2).unwrap(), PinMode::Input);
        assert!(client.get_data().read().digital_entry(2).unwrap().callback.is_some());

        mock.clear_written();
        client
            .set_pin_mode(1, PinMode::Input, PinDomain::Analog, None)
            .unwrap();
        assert_eq!(mock.written(), vec![0xF4, 0x01, 0x00, 0xC1, 0x01]);
    }

    #[test]
    fn test_set_pin_mode_output() {
        let (client, mock) = mock_client();
        client
            .set_pin_mode(5, PinMode::Output, PinDomain::Digital, None)
            .unwrap();
        assert_eq!(mock.written(), vec![0xF4, 0x05, 0x01]);
        assert_eq!(client.digital_mode(5).unwrap(), PinMode::Output);
    }

    #[test]
    fn test_reporting_commands() {
        let (client, mock) = mock_client();
        client.enable_analog_reporting(2).unwrap();
        client.disable_analog_reporting(2).unwrap();
        client.enable_digital_reporting(13).unwrap();
        client.disable_digital_reporting(13).unwrap();
        assert_eq!(
            mock.written(),
            vec![0xC2, 0x01, 0xC2, 0x00, 0xD1, 0x01, 0xD1, 0x00]
        );
    }

    #[test]
    fn test_sampling_interval() {
        let (client, mock) = mock_client();
        client.set_sampling_interval(100).unwrap();
        assert_eq!(mock.written(), vec![0xF0, 0x7A, 0x64, 0x00, 0xF7]);
    }

    #[test]
    fn test_servo_config() {
        let (client, mock) = mock_client();
        client.servo_config(8, 500, 2500).unwrap();
        assert_eq!(
            mock.written(),
            vec![0xF4, 0x08, 0x04, 0xF0, 0x70, 0x08, 0x74, 0x03, 0x44, 0x13, 0xF7]
        );
        assert_eq!(client.digital_mode(8).unwrap(), PinMode::Servo);
    }

    #[test]
    fn test_play_and_stop_tone() {
        let (client, mock) = mock_client();
        client.play_tone(3, 440, 1000).unwrap();
        assert_eq!(
            mock.written(),
            vec![0xF0, 0x5F, 0x00, 0x03, 0x38, 0x03, 0x68, 0x07, 0xF7]
        );
        assert_eq!(client.digital_mode(3).unwrap(), PinMode::Tone);

        mock.clear_written();
        client.stop_tone(3).unwrap();
        assert_eq!(mock.written(), vec![0xF0, 0x5F, 0x01, 0x03, 0xF7]);
    }

    #[test]
    fn test_encoder_config() {
        let (client, mock) = mock_client();
        client.encoder_config(2, 3, None).unwrap();
        assert_eq!(
            mock.written(),
            vec![0xD0, 0x01, 0xD0, 0x01, 0xF0, 0x60, 0x02, 0x03, 0xF7]
        );
        assert_eq!(client.digital_mode(2).unwrap(), PinMode::Encoder);
        assert_eq!(client.digital_mode(3).unwrap(), PinMode::Encoder);
    }

    #[test]
    fn test_i2c_commands() {
        let (client, mock) = mock_client();
        client.i2c_config(100).unwrap();
        assert_eq!(mock.written(), vec![0xF0, 0x78, 0x64, 0x00, 0xF7]);

        mock.clear_written();
        client
            .i2c_read(0x40, 8, 4, I2cReadMode::Read, None)
            .unwrap();
        assert_eq!(
            mock.written(),
            vec![0xF0, 0x76, 0x40, 0x08, 0x08, 0x00, 0x04, 0x00, 0xF7]
        );
        assert!(client.get_data().read().i2c.contains_key(&0x40));
        assert_eq!(client.i2c_read_data(0x40), None);

        mock.clear_written();
        client.i2c_write(0x40, &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(
            mock.written(),
            vec![0xF0, 0x76, 0x40, 0x00, 0x01, 0x02, 0x03, 0xF7]
        );

        mock.clear_written();
        client.i2c_stop_reading(0x40).unwrap();
        assert_eq!(mock.written(), vec![0xF0, 0x76, 0x40, 0x18, 0xF7]);
    }

    #[test]
    fn test_sonar_config_and_capacity() {
        let (client, mock) = mock_client();

        client.sonar_config(12, 13, None, 50, 250).unwrap();
        // Distance capped at 200 (0x48 | 0x01 << 7).
        assert_eq!(
            mock.written(),
            vec![
                0xF4, 0x0C, 0x0B, 0xF4, 0x0D, 0x0B, 0xF0, 0x62, 0x0C, 0x0D, 0x32, 0x48, 0x01, 0xF7
            ]
        );
        assert_eq!(client.digital_mode(12).unwrap(), PinMode::Sonar);
        assert_eq!(client.sonar_distance(12).unwrap(), SONAR_NO_DATA);

        // Fill the capacity: 6 distinct trigger pins in total.
        for pin in 0..5u8 {
            client.sonar_config(pin, pin, None, 50, 200).unwrap();
        }
        let result = client.sonar_config(6, 7, None, 50, 200);
        assert!(result.is_err());
        assert_eq!(
            result.err().unwrap().to_string(),
            "Hardware error: Sonar device limit reached (6 active)."
        );
        assert_eq!(client.get_data().read().sonar.len(), 6);

        // Reconfiguring an existing trigger pin never counts against the cap.
        client.sonar_config(12, 13, None, 40, 100).unwrap();
        assert_eq!(client.get_data().read().sonar.len(), 6);

        // Unknown distances are reported as errors, not silently defaulted.
        assert!(client.sonar_distance(9).is_err());
    }

    #[test]
    fn test_stepper_commands() {
        let (client, mock) = mock_client();
        client.stepper_config(512, &[2, 3, 4, 5]).unwrap();
        assert_eq!(
            mock.written(),
            vec![0xF0, 0x72, 0x00, 0x00, 0x04, 0x02, 0x03, 0x04, 0x05, 0xF7]
        );

        mock.clear_written();
        client.stepper_step(100_000, -5).unwrap();
        assert_eq!(
            mock.written(),
            vec![0xF0, 0x72, 0x01, 0x20, 0x0D, 0x06, 0x05, 0x00, 0x00, 0xF7]
        );

        mock.clear_written();
        client.stepper_request_library_version().unwrap();
        assert_eq!(mock.written(), vec![0xF0, 0x72, 0x02, 0xF7]);
    }

    #[test]
    fn test_stepper_version_polling() {
        let (client, _) = mock_client();

        let result = client.stepper_version(Duration::from_millis(50));
        assert!(result.is_err());
        assert_eq!(
            result.err().unwrap().to_string(),
            "Protocol error: Stepper library version not received within 0 seconds."
        );

        client.get_data().write().stepper_library_version = 7;
        assert_eq!(client.stepper_version(Duration::from_millis(50)).unwrap(), 7);
    }

    #[test]
    fn test_latch_api() {
        let (client, _) = mock_client();

        assert!(client
            .set_analog_latch(0, AnalogThreshold::Gte, 1024, None)
            .is_err());
        client
            .set_analog_latch(0, AnalogThreshold::Gte, 1000, None)
            .unwrap();
        client
            .set_digital_latch(5, DigitalThreshold::High, None)
            .unwrap();

        let snapshot = client.analog_latch_read(0).unwrap();
        assert_eq!(snapshot.state, LatchState::Armed);
        let snapshot = client.digital_latch_read(5).unwrap();
        assert_eq!(snapshot.state, LatchState::Armed);
    }

    #[test]
    fn test_reset_quiesces_outputs_and_reinitializes() {
        let (client, mock) = mock_client();
        {
            let mut lock = client.get_data().write();
            lock.digital[2].mode = PinMode::Pwm;
            lock.digital[2].value = 128;
            lock.digital[3].mode = PinMode::Tone;
            lock.i2c.insert(0x40, I2cEntry::default());
            lock.stepper_library_version = 5;
        }
        mock.clear_written();

        client.reset().unwrap();

        let written = mock.written();
        // PWM pin 2 written 0, tone pin 3 silenced, and the reset byte closes the batch.
        assert!(written
            .windows(3)
            .any(|window| window == [0xE2, 0x00, 0x00]));
        assert!(written
            .windows(5)
            .any(|window| window == [0xF0, 0x5F, 0x01, 0x03, 0xF7]));
        assert_eq!(written.last(), Some(&0xFF));

        let lock = client.get_data().read();
        assert_eq!(lock.digital.len(), 20);
        assert_eq!(lock.digital_entry(2).unwrap().value, 0);
        assert_eq!(lock.digital_entry(2).unwrap().mode, PinMode::Input);
        assert!(lock.i2c.is_empty());
        assert_eq!(lock.stepper_library_version, 0);
    }

    #[test]
    fn test_discover_timeout_without_board() {
        let (client, mock) = mock_client();
        let result = client.discover(Duration::from_millis(250));
        assert!(result.is_err());
        assert_eq!(
            result.err().unwrap().to_string(),
            "Protocol error: Board discovery timed out after 0 seconds."
        );
        // The mapping query was retried on its fixed interval.
        let written = mock.written();
        let queries = written
            .windows(3)
            .filter(|window| *window == [0xF0, 0x69, 0xF7])
            .count();
        assert!(queries >= 2, "expected retries, got {}", queries);
    }

    #[test]
    #[serial]
    fn test_open_discovers_board() {
        let mock = MockTransport::new();
        // Script the mapping response: 14 ignored pins then channels 0-5.
        let mut response = vec![0xF0, 0x6A];
        response.extend_from_slice(&test_mapping());
        response.push(0xF7);
        mock.feed(&response);

        let mut client = Rustmata::from(mock.clone());
        client.open().unwrap();

        assert!(client.is_connected());
        assert!(mock.is_connected());
        {
            let lock = client.get_data().read();
            assert_eq!(lock.digital.len(), 20);
            assert_eq!(lock.analog.len(), 6);
        }
        let written = mock.written();
        assert_eq!(written[0], 0xFF, "a software reset opens the conversation");

        client.close().unwrap();
        assert!(!client.is_connected());
        assert!(!mock.is_connected());
    }

    #[test]
    #[serial]
    fn test_inbound_stream_updates_tables_live() {
        let mock = MockTransport::new();
        let mut response = vec![0xF0, 0x6A];
        response.extend_from_slice(&test_mapping());
        response.push(0xF7);
        mock.feed(&response);

        let mut client = Rustmata::from(mock.clone());
        client.open().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        client
            .set_digital_callback(0, move |_| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // The board reports port 0 with pin 0 high, then an analog sample on channel 2.
        mock.feed(&[0x90, 0x01, 0x00, 0xE2, 0x2A, 0x01]);

        assert!(wait_until(
            || client.digital_read(0).unwrap() == 1,
            Duration::from_secs(2)
        ));
        assert!(wait_until(
            || client.analog_read(2).unwrap() == 170,
            Duration::from_secs(2)
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        client.close().unwrap();
    }

    #[test]
    #[serial]
    fn test_latch_end_to_end() {
        let mock = MockTransport::new();
        let mut response = vec![0xF0, 0x6A];
        response.extend_from_slice(&test_mapping());
        response.push(0xF7);
        mock.feed(&response);

        let mut client = Rustmata::from(mock.clone());
        client.open().unwrap();

        client
            .set_analog_latch(1, AnalogThreshold::Gte, 1000, None)
            .unwrap();
        // 999 does not latch, 1023 does.
        mock.feed(&[0xE1, 0x67, 0x07, 0xE1, 0x7F, 0x07]);

        assert!(wait_until(
            || client.analog_read(1).unwrap() == 1023,
            Duration::from_secs(2)
        ));

        let snapshot = client.analog_latch_read(1).unwrap();
        assert_eq!(snapshot.state, LatchState::Latched);
        assert_eq!(snapshot.value, 1023);
        assert!(snapshot.timestamp.is_some());
        // The read cleared the latch.
        let snapshot = client.analog_latch_read(1).unwrap();
        assert_eq!(snapshot.state, LatchState::Ignore);

        client.close().unwrap();
    }
}
