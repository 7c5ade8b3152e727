//! Inbound frame decoder and dispatcher.
//!
//! Official Firmata documentation: <https://github.com/firmata/protocol>

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::RwLock;

use crate::errors::ProtocolError::MessageTooShort;
use crate::errors::*;
use crate::io::constants::*;
use crate::io::data::{ClientData, I2cReply, PendingEvents};
use crate::utils::{combine_7bit, decode_wide_string};

/// The protocol engine: drains the ingress queue, reassembles frames and dispatches
/// decoded messages into [`ClientData`].
///
/// The decoder is a three state machine: idle (waiting for a command byte in
/// 0x80..=0xFF), collecting a fixed number of argument bytes, or collecting a sysex
/// body up to the end marker. Commands 0x90-0x9F and 0xE0-0xEF carry a port/channel
/// index in their low nibble; the index is extracted and treated as the first data
/// byte of the message.
///
/// [`Engine::run`] loops on the current thread until the queue closes or the stop
/// flag is raised. Decoding errors never unwind out of the loop: malformed or unknown
/// messages are logged and the decoder resynchronizes on the next command byte.
pub(crate) struct Engine {
    queue: Arc<crate::io::queue::ByteQueue>,
    data: Arc<RwLock<ClientData>>,
    stop: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        queue: Arc<crate::io::queue::ByteQueue>,
        data: Arc<RwLock<ClientData>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self { queue, data, stop }
    }

    /// Consumes the queue until it closes or the stop flag is observed.
    pub fn run(&self) {
        while !self.stop.load(Ordering::Relaxed) {
            let Some(byte) = self.queue.pop() else {
                break;
            };
            self.dispatch(byte);
        }
        debug!("protocol engine stopped");
    }

    /// Collects exactly `n` argument bytes, blocking on the queue as needed.
    fn take(&self, n: usize) -> Option<Vec<u8>> {
        let mut args = Vec::with_capacity(n);
        for _ in 0..n {
            args.push(self.queue.pop()?);
        }
        Some(args)
    }

    /// Collects a sysex payload up to (and excluding) the end marker.
    fn take_sysex_body(&self) -> Option<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let byte = self.queue.pop()?;
            if byte == END_SYSEX {
                return Some(payload);
            }
            payload.push(byte);
        }
    }

    fn dispatch(&self, command: u8) {
        let result = match command {
            START_SYSEX => self.dispatch_sysex(),
            REPORT_VERSION => match self.take(2) {
                Some(args) => self.handle_protocol_version(&args),
                None => Ok(()),
            },
            DIGITAL_MESSAGE..=DIGITAL_MESSAGE_BOUND => {
                let port = command & 0x0F;
                match self.take(2) {
                    Some(args) => self.handle_digital_message(port, &args),
                    None => Ok(()),
                }
            }
            ANALOG_MESSAGE..=ANALOG_MESSAGE_BOUND => {
                let channel = command & 0x0F;
                match self.take(2) {
                    Some(args) => self.handle_analog_message(channel, &args),
                    None => Ok(()),
                }
            }
            0x80..=u8::MAX => {
                // Command byte absent from the dispatch table: resynchronize on the
                // next command byte instead of guessing an argument count.
                warn!("unknown command byte 0x{:02X}: dropped", command);
                Ok(())
            }
            _ => {
                trace!("stray data byte 0x{:02X} outside any frame", command);
                Ok(())
            }
        };
        if let Err(error) = result {
            warn!("inbound message dropped: {}", error);
        }
    }

    fn dispatch_sysex(&self) -> Result<(), Error> {
        let Some(sub_command) = self.queue.pop() else {
            return Ok(());
        };
        if sub_command == END_SYSEX {
            // Empty envelope.
            return Ok(());
        }
        let Some(payload) = self.take_sysex_body() else {
            return Ok(());
        };
        match sub_command {
            ANALOG_MAPPING_RESPONSE => self.handle_analog_mapping_response(payload),
            CAPABILITY_RESPONSE => self.handle_capability_response(payload),
            PIN_STATE_RESPONSE => self.handle_pin_state_response(payload),
            REPORT_FIRMWARE => self.handle_firmware_report(&payload),
            STRING_DATA => self.handle_string_data(&payload),
            I2C_REPLY => self.handle_i2c_reply(&payload),
            ENCODER_DATA => self.handle_encoder_data(&payload),
            SONAR_DATA => self.handle_sonar_data(&payload),
            STEPPER_DATA => self.handle_stepper_version_response(&payload),
            _ => {
                warn!(
                    "unknown sysex sub-command 0x{:02X}: {} payload byte(s) dropped",
                    sub_command,
                    payload.len()
                );
                Ok(())
            }
        }
    }

    /// Fires queued callbacks, in order, on this (the engine) thread.
    ///
    /// Events are collected under the data lock but fired after it is released, so a
    /// callback may call back into the table accessors without deadlocking.
    fn emit(&self, events: PendingEvents) {
        for (callback, event) in events {
            callback(event);
        }
    }

    /// Handle a REPORT_VERSION message (0xF9 - report protocol version).
    fn handle_protocol_version(&self, args: &[u8]) -> Result<(), Error> {
        let mut lock = self.data.write();
        lock.protocol_version = Some((args[0], args[1]));
        trace!("received protocol version: {}.{}", args[0], args[1]);
        Ok(())
    }

    /// Handle an ANALOG_MESSAGE message (0xE0 - report state of an analog channel).
    fn handle_analog_message(&self, channel: u8, args: &[u8]) -> Result<(), Error> {
        let value = combine_7bit(args[0], args[1]);
        let events = self.data.write().record_analog(channel, value)?;
        self.emit(events);
        Ok(())
    }

    /// Handle a DIGITAL_MESSAGE message (0x90 - report state of a digital port).
    fn handle_digital_message(&self, port: u8, args: &[u8]) -> Result<(), Error> {
        let bits = combine_7bit(args[0], args[1]);
        let events = self.data.write().record_digital_port(port, bits);
        self.emit(events);
        Ok(())
    }

    /// Handle an ANALOG_MAPPING_RESPONSE message (0x6A - reply with analog mapping info).
    ///
    /// The raw payload is retained: discovery polls for it and derives the table sizes.
    fn handle_analog_mapping_response(&self, payload: Vec<u8>) -> Result<(), Error> {
        trace!("received analog mapping for {} pins", payload.len());
        self.data.write().analog_mapping = Some(payload);
        Ok(())
    }

    /// Handle a CAPABILITY_RESPONSE message (0x6C - reply with supported modes).
    fn handle_capability_response(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.data.write().capability_response = Some(payload);
        Ok(())
    }

    /// Handle a PIN_STATE_RESPONSE message (0x6E - report pin current mode and state).
    fn handle_pin_state_response(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.data.write().pin_state_response = Some(payload);
        Ok(())
    }

    /// Handle a REPORT_FIRMWARE message (0x79 - report name and version of the firmware).
    fn handle_firmware_report(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() < 2 {
            return Err(Error::from(MessageTooShort {
                operation: "handle_firmware_report",
                expected: 2,
                received: payload.len(),
            }));
        }
        let firmware = crate::io::data::Firmware {
            major: payload[0],
            minor: payload[1],
            name: decode_wide_string(&payload[2..]),
        };
        trace!(
            "received firmware: {} v{}.{}",
            firmware.name,
            firmware.major,
            firmware.minor
        );
        self.data.write().firmware = Some(firmware);
        Ok(())
    }

    /// Handle a STRING_DATA message (0x71 - string message with 14-bits per char).
    fn handle_string_data(&self, payload: &[u8]) -> Result<(), Error> {
        let message = decode_wide_string(payload);
        debug!("firmware says: {}", message);
        self.data.write().last_string_message = Some(message);
        Ok(())
    }

    /// Handle an I2C_REPLY message (0x77 - read and decode an i2c message).
    fn handle_i2c_reply(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() < 4 {
            return Err(Error::from(MessageTooShort {
                operation: "handle_i2c_reply",
                expected: 4,
                received: payload.len(),
            }));
        }
        let mut reply = I2cReply {
            address: combine_7bit(payload[0], payload[1]),
            register: combine_7bit(payload[2], payload[3]),
            data: vec![],
        };
        let mut i = 4;
        while i + 1 < payload.len() {
            reply.data.push(combine_7bit(payload[i], payload[i + 1]));
            i += 2;
        }
        let events = self.data.write().record_i2c_reply(reply);
        self.emit(events);
        Ok(())
    }

    /// Handle an ENCODER_DATA message (0x61 - current encoder position).
    ///
    /// The 14-bit field is sign-folded: raw values above 8192 represent negative
    /// positions, recovered by subtracting 16384.
    fn handle_encoder_data(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() < 3 {
            return Err(Error::from(MessageTooShort {
                operation: "handle_encoder_data",
                expected: 3,
                received: payload.len(),
            }));
        }
        let pin = payload[0];
        let mut value = combine_7bit(payload[1], payload[2]) as i32;
        if value > 8192 {
            value -= 16384;
        }
        let events = self.data.write().record_encoder(pin, value)?;
        self.emit(events);
        Ok(())
    }

    /// Handle a SONAR_DATA message (0x63 - distance data returned).
    fn handle_sonar_data(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() < 3 {
            return Err(Error::from(MessageTooShort {
                operation: "handle_sonar_data",
                expected: 3,
                received: payload.len(),
            }));
        }
        let trigger_pin = payload[0];
        let distance = combine_7bit(payload[1], payload[2]);
        let events = self.data.write().record_sonar(trigger_pin, distance)?;
        self.emit(events);
        Ok(())
    }

    /// Handle a STEPPER_DATA response (0x72 - stepper library version).
    fn handle_stepper_version_response(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() < 2 {
            return Err(Error::from(MessageTooShort {
                operation: "handle_stepper_version_response",
                expected: 2,
                received: payload.len(),
            }));
        }
        let version = combine_7bit(payload[0], payload[1]);
        trace!("received stepper library version: {}", version);
        self.data.write().stepper_library_version = version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::io::data::{I2cEntry, LatchState, SonarEntry};
    use crate::io::events::{callback, Event};
    use crate::io::queue::ByteQueue;

    use super::*;

    /// Builds an engine over a 20 pin / 6 analog channel board and feeds it the given
    /// bytes; returns once every byte is decoded.
    fn run_engine(data: &Arc<RwLock<ClientData>>, bytes: &[u8]) {
        let queue = Arc::new(ByteQueue::new());
        queue.extend(bytes);
        queue.close();
        let engine = Engine::new(
            queue,
            data.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        engine.run();
    }

    fn discovered_data() -> Arc<RwLock<ClientData>> {
        let mut mapping = vec![0x7F; 14];
        mapping.extend_from_slice(&[0, 1, 2, 3, 4, 5]);
        let mut data = ClientData::default();
        data.configure_from_mapping(&mapping);
        Arc::new(RwLock::new(data))
    }

    #[test]
    fn test_digital_message_updates_port_pins() {
        let data = discovered_data();
        // Digital message, port 0, bit pattern 5: pins 0 and 2 high, 1 and 3-7 low.
        run_engine(&data, &[0x90, 0x05, 0x00]);

        let lock = data.read();
        assert_eq!(lock.digital_entry(0).unwrap().value, 1);
        assert_eq!(lock.digital_entry(1).unwrap().value, 0);
        assert_eq!(lock.digital_entry(2).unwrap().value, 1);
        for pin in 3..8 {
            assert_eq!(lock.digital_entry(pin).unwrap().value, 0);
        }
    }

    #[test]
    fn test_analog_message_reassembles_14bit_value() {
        let data = discovered_data();
        // Analog message for channel 3, value 1023 (0x7F | 0x07 << 7).
        run_engine(&data, &[0xE3, 0x7F, 0x07]);
        assert_eq!(data.read().analog_entry(3).unwrap().value, 1023);
    }

    #[test]
    fn test_analog_message_fires_change_callback_once() {
        let data = discovered_data();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        data.write().analog[0].callback = Some(callback(move |event| {
            assert_eq!(
                event,
                Event::Analog {
                    channel: 0,
                    value: 170
                }
            );
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        // Same value twice: the callback only fires on the change.
        run_engine(&data, &[0xE0, 0x2A, 0x01, 0xE0, 0x2A, 0x01]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_protocol_version_report() {
        let data = discovered_data();
        run_engine(&data, &[0xF9, 0x02, 0x05]);
        assert_eq!(data.read().protocol_version, Some((2, 5)));
    }

    #[test]
    fn test_firmware_report_decodes_wide_name() {
        let data = discovered_data();
        run_engine(
            &data,
            &[
                0xF0, 0x79, 0x02, 0x40, 0x66, 0x00, 0x6F, 0x00, 0x6F, 0x00, 0xF7,
            ],
        );
        let lock = data.read();
        let firmware = lock.firmware.as_ref().unwrap();
        assert_eq!(firmware.major, 2);
        assert_eq!(firmware.minor, 64);
        assert_eq!(firmware.name, "foo");
    }

    #[test]
    fn test_firmware_report_too_short_is_dropped() {
        let data = discovered_data();
        run_engine(&data, &[0xF0, 0x79, 0x02, 0xF7]);
        assert!(data.read().firmware.is_none());
    }

    #[test]
    fn test_encoder_data_sign_folding() {
        let data = discovered_data();
        // Raw 9000 (0x2328): lsb 0x28, msb 0x46 => 9000 - 16384 = -7384.
        run_engine(&data, &[0xF0, 0x61, 0x02, 0x28, 0x46, 0xF7]);
        assert_eq!(data.read().digital_entry(2).unwrap().value, -7384);

        // Raw 100 stays positive.
        run_engine(&data, &[0xF0, 0x61, 0x02, 0x64, 0x00, 0xF7]);
        assert_eq!(data.read().digital_entry(2).unwrap().value, 100);
    }

    #[test]
    fn test_sonar_data_updates_active_device() {
        let data = discovered_data();
        data.write().sonar.insert(7, SonarEntry::default());

        // Distance 142 (0x0E | 0x01 << 7) for trigger pin 7.
        run_engine(&data, &[0xF0, 0x63, 0x07, 0x0E, 0x01, 0xF7]);
        let lock = data.read();
        assert_eq!(lock.sonar[&7].distance, 142);
        assert_eq!(lock.digital_entry(7).unwrap().value, 142);
    }

    #[test]
    fn test_i2c_reply_stores_and_fires() {
        let data = discovered_data();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        data.write().i2c.insert(
            0x40,
            I2cEntry {
                callback: Some(callback(move |event| {
                    assert_eq!(
                        event,
                        Event::I2c {
                            address: 0x40,
                            register: 8,
                            data: vec![0x63, 0x6F]
                        }
                    );
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                })),
                reply: None,
            },
        );

        run_engine(
            &data,
            &[
                0xF0, 0x77, 0x40, 0x00, 0x08, 0x00, 0x63, 0x00, 0x6F, 0x00, 0xF7,
            ],
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let lock = data.read();
        let reply = lock.i2c[&0x40].reply.as_ref().unwrap();
        assert_eq!(reply.register, 8);
        assert_eq!(reply.data, vec![0x63, 0x6F]);
    }

    #[test]
    fn test_stepper_version_response() {
        let data = discovered_data();
        run_engine(&data, &[0xF0, 0x72, 0x07, 0x00, 0xF7]);
        assert_eq!(data.read().stepper_library_version, 7);
    }

    #[test]
    fn test_string_data_is_retained() {
        let data = discovered_data();
        run_engine(
            &data,
            &[0xF0, 0x71, 0x68, 0x00, 0x69, 0x00, 0xF7],
        );
        assert_eq!(data.read().last_string_message.as_deref(), Some("hi"));
    }

    #[test]
    fn test_discovery_payloads_are_retained() {
        let data = discovered_data();
        run_engine(&data, &[0xF0, 0x6A, 0x7F, 0x00, 0x01, 0xF7]);
        run_engine(&data, &[0xF0, 0x6C, 0x00, 0x01, 0x7F, 0xF7]);
        run_engine(&data, &[0xF0, 0x6E, 0x03, 0x00, 0x1E, 0xF7]);
        let lock = data.read();
        assert_eq!(lock.analog_mapping, Some(vec![0x7F, 0x00, 0x01]));
        assert_eq!(lock.capability_response, Some(vec![0x00, 0x01, 0x7F]));
        assert_eq!(lock.pin_state_response, Some(vec![0x03, 0x00, 0x1E]));
    }

    #[test]
    fn test_unknown_command_resynchronizes() {
        let data = discovered_data();
        // 0xA5 is not in the dispatch table; the following valid frame must still decode.
        run_engine(&data, &[0xA5, 0xE1, 0x2A, 0x01]);
        assert_eq!(data.read().analog_entry(1).unwrap().value, 170);
    }

    #[test]
    fn test_stray_data_bytes_are_ignored() {
        let data = discovered_data();
        run_engine(&data, &[0x11, 0x22, 0xE0, 0x01, 0x00]);
        assert_eq!(data.read().analog_entry(0).unwrap().value, 1);
    }

    #[test]
    fn test_unknown_sysex_sub_command_is_skipped() {
        let data = discovered_data();
        // 0x55 is unknown: its payload is consumed up to END_SYSEX, then decoding resumes.
        run_engine(&data, &[0xF0, 0x55, 0x01, 0x02, 0x03, 0xF7, 0xE0, 0x05, 0x00]);
        assert_eq!(data.read().analog_entry(0).unwrap().value, 5);
    }

    #[test]
    fn test_empty_sysex_envelope() {
        let data = discovered_data();
        run_engine(&data, &[0xF0, 0xF7, 0xE0, 0x07, 0x00]);
        assert_eq!(data.read().analog_entry(0).unwrap().value, 7);
    }

    #[test]
    fn test_truncated_frame_at_queue_close() {
        let data = discovered_data();
        // The queue closes mid-frame: the engine must simply stop.
        run_engine(&data, &[0xE0, 0x2A]);
        assert_eq!(data.read().analog_entry(0).unwrap().value, 0);
    }

    #[test]
    fn test_stop_flag_breaks_the_loop() {
        let queue = Arc::new(ByteQueue::new());
        queue.extend(&[0xE0, 0x2A, 0x01]);
        let data = discovered_data();
        let stop = Arc::new(AtomicBool::new(true));
        let engine = Engine::new(queue, data.clone(), stop);
        engine.run();
        // The stop flag was observed before any byte was processed.
        assert_eq!(data.read().analog_entry(0).unwrap().value, 0);
    }

    #[test]
    fn test_latch_fires_from_inbound_analog_stream() {
        let data = discovered_data();
        data.write()
            .arm_analog_latch(1, crate::io::data::AnalogThreshold::Gte, 1000, None)
            .unwrap();

        // 999 then 1023: only the second sample latches.
        run_engine(&data, &[0xE1, 0x67, 0x07, 0xE1, 0x7F, 0x07]);
        let snapshot = data.write().analog_latch_read(1).unwrap();
        assert_eq!(snapshot.state, LatchState::Latched);
        assert_eq!(snapshot.value, 1023);
    }
}
