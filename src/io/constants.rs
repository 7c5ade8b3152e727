//! Firmata protocol constants
//!
//! Official Firmata documentation: <https://github.com/firmata/protocol>

use std::time::Duration;

// ########################################
// Message command bytes (128-255/0x80-0xFF)

/// Send data for a digital port (collection of 8 pins)
pub const DIGITAL_MESSAGE: u8 = 0x90;
/// Digital message input range upper byte bound
pub const DIGITAL_MESSAGE_BOUND: u8 = 0x9F;
/// Send data for an analog pin (or PWM)
pub const ANALOG_MESSAGE: u8 = 0xE0;
/// Analog message input range upper byte bound
pub const ANALOG_MESSAGE_BOUND: u8 = 0xEF;
/// Enable analog input by channel #
pub const REPORT_ANALOG: u8 = 0xC0;
/// Enable digital input by port pair
pub const REPORT_DIGITAL: u8 = 0xD0;
//
/// Set a pin to INPUT/OUTPUT/PWM/etc
pub const SET_PIN_MODE: u8 = 0xF4;
/// Report protocol version
pub const REPORT_VERSION: u8 = 0xF9;
/// Reset from MIDI
pub const SYSTEM_RESET: u8 = 0xFF;
//
/// Start a MIDI Sysex message
pub const START_SYSEX: u8 = 0xF0;
/// End a MIDI Sysex message
pub const END_SYSEX: u8 = 0xF7;

// ########################################
// Extended command set using sysex (0-127/0x00-0x7F)

/// Play a tone at a specified frequency and duration
pub const TONE_PLAY: u8 = 0x5F;
/// Create and enable an encoder object
pub const ENCODER_CONFIG: u8 = 0x60;
/// Reply with encoders current positions
pub const ENCODER_DATA: u8 = 0x61;
/// Configure pins to control a Ping type sonar distance device
pub const SONAR_CONFIG: u8 = 0x62;
/// Distance data returned
pub const SONAR_DATA: u8 = 0x63;
/// Ask for mapping of analog to pin numbers
pub const ANALOG_MAPPING_QUERY: u8 = 0x69;
/// Reply with mapping info
pub const ANALOG_MAPPING_RESPONSE: u8 = 0x6A;
/// Ask for supported modes and resolution of all pins
pub const CAPABILITY_QUERY: u8 = 0x6B;
/// Reply with supported modes and resolution
pub const CAPABILITY_RESPONSE: u8 = 0x6C;
/// Ask for a pin's current mode and value
pub const PIN_STATE_QUERY: u8 = 0x6D;
/// Reply with pin's current mode and value
pub const PIN_STATE_RESPONSE: u8 = 0x6E;
/// Analog write (PWM, Servo, etc) to any pin
pub const EXTENDED_ANALOG: u8 = 0x6F;
/// Set max angle, minPulse, maxPulse, freq
pub const SERVO_CONFIG: u8 = 0x70;
/// String message with 14-bits per char
pub const STRING_DATA: u8 = 0x71;
/// Control a stepper motor
pub const STEPPER_DATA: u8 = 0x72;
/// Send an I2C read/write request
pub const I2C_REQUEST: u8 = 0x76;
/// Reply to an I2C read request
pub const I2C_REPLY: u8 = 0x77;
/// Config I2C settings such as delay times and power pins
pub const I2C_CONFIG: u8 = 0x78;
/// Report name and version of the firmware
pub const REPORT_FIRMWARE: u8 = 0x79;
/// Set the poll rate of the main loop
pub const SAMPLING_INTERVAL: u8 = 0x7A;
/// MIDI Reserved for realtime messages (also the 7-bit payload mask)
pub const SYSEX_REALTIME: u8 = 0x7F;

// ########################################
// Sub-command payloads

/// I2C write request operation bits
pub const I2C_WRITE: u8 = 0x00;
/// I2C stop a continuous read operation
pub const I2C_STOP_READING: u8 = 0x18;

/// Configure a stepper motor for operation
pub const STEPPER_CONFIGURE: u8 = 0;
/// Command a motor to move at the provided speed
pub const STEPPER_STEP: u8 = 1;
/// Used to get stepper library version number
pub const STEPPER_LIBRARY_VERSION: u8 = 2;

/// Play a tone
pub const TONE_TONE: u8 = 0;
/// Turn off tone
pub const TONE_NO_TONE: u8 = 1;

/// Enable reporting for REPORT_ANALOG or REPORT_DIGITAL
pub const REPORTING_ENABLE: u8 = 1;
/// Disable reporting for REPORT_ANALOG or REPORT_DIGITAL
pub const REPORTING_DISABLE: u8 = 0;

// ########################################
// Other values

/// Maximum number of simultaneously active sonar devices
pub const MAX_SONAR_DEVICES: usize = 6;
/// Distance value of a sonar entry before the first reading arrives
pub const SONAR_NO_DATA: u16 = 0x7F;
/// Maximum sonar distance in centimeters accepted by the firmware
pub const MAX_SONAR_DISTANCE: u16 = 200;
/// Maximum threshold value for an analog latch
pub const MAX_ANALOG_LATCH_TARGET: u16 = 1023;

/// Interval between two analog mapping queries during board discovery
pub const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Time allowed for the board to answer the discovery handshake
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
