//! QBMS - CAN frame type and wire codecs
//!
//! All multi-byte fields are big-endian. Every payload is built and parsed
//! explicitly over `[u8; 8]`; nothing relies on struct layout.
//!
//! | Frame            | Identifier            | Payload                                  |
//! |------------------|-----------------------|------------------------------------------|
//! | Charger status   | `0x18FF50E5` (ext)    | V, I (0.1 units), flags                  |
//! | Charger command  | `0x1806E5F4` (ext)    | V, I (0.1 units), enable (0 = charge)    |
//! | Current sensor   | configurable          | offset mA (u32), status byte             |
//! | Pack summary     | base                  | V (0.01V), I (0.1A), SOC, status         |
//! | Quadrant volts   | base + 1              | 4 x u16 (0.01V)                          |
//! | Cell averages    | base + 2              | 4 x u16 (mV)                             |
//! | Temperatures     | base + 3              | 4 x i16 (0.1C)                           |
//! | Control          | configurable          | byte 0 = `0xA5` resets SOC to full       |

use crate::charger::ChargerFlags;
use crate::types::*;
use embedded_can::{ExtendedId, Frame, Id, StandardId};

// ============================================================================
// Identifiers
// ============================================================================

/// Status frames sent by the charger
pub const CHARGER_STATUS_ID: u32 = 0x18FF_50E5;

/// Command frames sent to the charger
pub const CHARGER_COMMAND_ID: u32 = 0x1806_E5F4;

/// Control frame byte 0 that resets the capacity counter to full
pub const RESET_SOC_MAGIC: u8 = 0xA5;

/// Offset applied to the current sensor's milliamp reading
const CURRENT_SENSOR_OFFSET: u32 = 0x8000_0000;

/// Build an identifier from a configured address
///
/// Addresses above `0x7FF` use the 29-bit format.
pub fn make_id(address: u32) -> Result<Id> {
    if address > MAX_STANDARD_ID {
        ExtendedId::new(address)
            .map(Id::Extended)
            .ok_or(Error::InvalidArg)
    } else {
        StandardId::new(address as u16)
            .map(Id::Standard)
            .ok_or(Error::InvalidArg)
    }
}

/// Numeric value of an identifier
pub fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw(),
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Classic CAN frame (up to 8 data bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    remote: bool,
    dlc: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Data frame addressed by a configured numeric address
    pub fn with_address(address: u32, data: &[u8]) -> Result<Self> {
        let id = make_id(address)?;
        <Self as Frame>::new(id, data).ok_or(Error::InvalidArg)
    }

    /// Numeric identifier
    pub fn raw_id(&self) -> u32 {
        raw_id(self.id)
    }

    /// Whether this frame carries `address` in the width `make_id` would pick
    pub fn matches(&self, address: u32) -> bool {
        make_id(address).map_or(false, |id| id == self.id)
    }

    /// Payload padded with zeros to 8 bytes
    pub fn payload(&self) -> [u8; 8] {
        self.data
    }
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            remote: false,
            dlc: data.len() as u8,
            data: buf,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }
        Some(Self {
            id: id.into(),
            remote: true,
            dlc: dlc as u8,
            data: [0; 8],
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.dlc as usize]
        }
    }
}

/// Data bytes of `frame`, or `MalformedFrame` if fewer than `len`
fn require(frame: &CanFrame, len: usize) -> Result<&[u8]> {
    let data = frame.data();
    if frame.is_remote_frame() || data.len() < len {
        return Err(Error::MalformedFrame);
    }
    Ok(data)
}

#[inline]
fn be_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

// ============================================================================
// Charger Protocol
// ============================================================================

/// Decoded charger status message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargerStatus {
    /// Output voltage in 0.1V
    pub output_voltage: DeciVolts,
    /// Output current in 0.1A
    pub output_current: DeciAmps,
    /// Condition flags (5 bits)
    pub flags: ChargerFlags,
}

impl ChargerStatus {
    /// Parse a charger status frame
    pub fn decode(frame: &CanFrame) -> Result<Self> {
        if frame.id() != Id::Extended(charger_status_id()) {
            return Err(Error::UnexpectedId);
        }
        let data = require(frame, 5)?;
        Ok(Self {
            output_voltage: be_u16(data, 0),
            output_current: be_u16(data, 2),
            flags: ChargerFlags::from_bits_truncate(data[4] & 0x1F),
        })
    }

    /// Build the frame a charger would send
    pub fn encode(&self) -> CanFrame {
        let v = self.output_voltage.to_be_bytes();
        let i = self.output_current.to_be_bytes();
        frame_from(
            Id::Extended(charger_status_id()),
            [v[0], v[1], i[0], i[1], self.flags.bits(), 0, 0, 0],
        )
    }
}

/// Command sent to the charger in response to each status message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargerCommand {
    /// Requested voltage in 0.1V
    pub voltage: DeciVolts,
    /// Requested current in 0.1A
    pub current: DeciAmps,
    /// Charge (true) or stop (false)
    pub enable: bool,
}

impl ChargerCommand {
    /// Keep charging at the given set point
    pub const fn charge(voltage: DeciVolts, current: DeciAmps) -> Self {
        Self {
            voltage,
            current,
            enable: true,
        }
    }

    /// Stop charging; current is always zero
    pub const fn cease(voltage: DeciVolts) -> Self {
        Self {
            voltage,
            current: 0,
            enable: false,
        }
    }

    /// Build the command frame
    pub fn encode(&self) -> CanFrame {
        let v = self.voltage.to_be_bytes();
        let i = self.current.to_be_bytes();
        let stop = if self.enable { 0 } else { 1 };
        frame_from(
            Id::Extended(charger_command_id()),
            [v[0], v[1], i[0], i[1], stop, 0, 0, 0],
        )
    }

    /// Parse a command frame (used by simulated chargers)
    pub fn decode(frame: &CanFrame) -> Result<Self> {
        if frame.id() != Id::Extended(charger_command_id()) {
            return Err(Error::UnexpectedId);
        }
        let data = require(frame, 5)?;
        Ok(Self {
            voltage: be_u16(data, 0),
            current: be_u16(data, 2),
            enable: data[4] == 0,
        })
    }
}

fn charger_status_id() -> ExtendedId {
    // both charger ids are compile-time constants below 2^29
    ExtendedId::new(CHARGER_STATUS_ID).unwrap_or(ExtendedId::MAX)
}

fn charger_command_id() -> ExtendedId {
    ExtendedId::new(CHARGER_COMMAND_ID).unwrap_or(ExtendedId::MAX)
}

fn frame_from(id: Id, data: [u8; 8]) -> CanFrame {
    CanFrame {
        id,
        remote: false,
        dlc: 8,
        data,
    }
}

// ============================================================================
// Current Sensor
// ============================================================================

/// Raw current sensor telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorReading {
    /// Pack current in milliamps (positive discharges)
    pub milliamps: i32,
    /// Status byte (bit 0 = fault, upper bits = fault code)
    pub status: u8,
}

impl SensorReading {
    /// Parse a sensor frame's payload
    pub fn decode(frame: &CanFrame) -> Result<Self> {
        let data = require(frame, 5)?;
        let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Ok(Self {
            milliamps: raw.wrapping_sub(CURRENT_SENSOR_OFFSET) as i32,
            status: data[4],
        })
    }

    /// Build a sensor frame at `address`
    pub fn encode(&self, address: u32) -> Result<CanFrame> {
        let raw = (self.milliamps as u32).wrapping_add(CURRENT_SENSOR_OFFSET).to_be_bytes();
        CanFrame::with_address(address, &[raw[0], raw[1], raw[2], raw[3], self.status, 0, 0, 0])
    }

    /// Reading usable for integration
    pub fn is_valid(&self) -> bool {
        self.status == 0
    }

    /// Fault sub-code carried in the status byte
    pub fn fault_code(&self) -> u8 {
        self.status >> 1
    }
}

// ============================================================================
// Status Frames
// ============================================================================

/// Contents of the pack summary frame (base + 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PackSummary {
    /// Pack voltage in 0.01V
    pub voltage_cv: u16,
    /// Pack current in 0.1A
    pub current_da: i16,
    /// State of charge 0-255
    pub soc: u8,
    /// `PackStatus` bits
    pub status: u8,
}

impl PackSummary {
    /// Payload bytes
    pub fn to_payload(&self) -> [u8; 8] {
        let v = self.voltage_cv.to_be_bytes();
        let i = self.current_da.to_be_bytes();
        [v[0], v[1], i[0], i[1], self.soc, self.status, 0, 0]
    }

    /// Parse payload bytes
    pub fn from_payload(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(Error::MalformedFrame);
        }
        Ok(Self {
            voltage_cv: be_u16(data, 0),
            current_da: be_u16(data, 2) as i16,
            soc: data[4],
            status: data[5],
        })
    }
}

/// Four big-endian u16 words
pub fn encode_words(words: &[u16; QUADRANT_COUNT]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (chunk, word) in out.chunks_exact_mut(2).zip(words.iter()) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    out
}

/// Inverse of [`encode_words`]
pub fn decode_words(data: &[u8]) -> Result<[u16; QUADRANT_COUNT]> {
    if data.len() < 8 {
        return Err(Error::MalformedFrame);
    }
    let mut words = [0u16; QUADRANT_COUNT];
    for (word, chunk) in words.iter_mut().zip(data.chunks_exact(2)) {
        *word = u16::from_be_bytes([chunk[0], chunk[1]]);
    }
    Ok(words)
}

/// Four big-endian i16 words
pub fn encode_signed_words(words: &[i16; QUADRANT_COUNT]) -> [u8; 8] {
    encode_words(&words.map(|w| w as u16))
}

/// Inverse of [`encode_signed_words`]
pub fn decode_signed_words(data: &[u8]) -> Result<[i16; QUADRANT_COUNT]> {
    decode_words(data).map(|words| words.map(|w| w as i16))
}

/// Control frame asks for a capacity reset
pub fn is_reset_request(frame: &CanFrame) -> bool {
    frame.is_data_frame() && frame.data().first() == Some(&RESET_SOC_MAGIC)
}

/// Clamp into the unsigned 16-bit wire range
pub fn saturate_u16(value: i64) -> u16 {
    value.clamp(0, u16::MAX as i64) as u16
}

/// Clamp into the signed 16-bit wire range
pub fn saturate_i16(value: i64) -> i16 {
    value.clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_id_width() {
        assert!(matches!(make_id(0x650), Ok(Id::Standard(_))));
        assert!(matches!(make_id(0x7FF), Ok(Id::Standard(_))));
        assert!(matches!(make_id(0x800), Ok(Id::Extended(_))));
        assert_eq!(make_id(0x2000_0000), Err(Error::InvalidArg));
    }

    #[test]
    fn test_frame_basics() {
        let frame = CanFrame::with_address(0x3C0, &[1, 2, 3]).unwrap();
        assert!(frame.is_standard());
        assert!(frame.is_data_frame());
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert_eq!(frame.raw_id(), 0x3C0);
        assert!(frame.matches(0x3C0));
        assert!(!frame.matches(0x3C1));

        assert!(CanFrame::with_address(0x3C0, &[0; 9]).is_err());
    }

    #[test]
    fn test_decode_charger_status() {
        let id = make_id(CHARGER_STATUS_ID).unwrap();
        let frame = <CanFrame as Frame>::new(id, &[0x0F, 0x8C, 0x00, 0x64, 0xE3, 0, 0, 0]).unwrap();
        let status = ChargerStatus::decode(&frame).unwrap();
        assert_eq!(status.output_voltage, 3980);
        assert_eq!(status.output_current, 100);
        // upper three bits are masked off
        assert_eq!(status.flags.bits(), 0x03);
    }

    #[test]
    fn test_charger_status_rejects_short_and_foreign() {
        let id = make_id(CHARGER_STATUS_ID).unwrap();
        let short = <CanFrame as Frame>::new(id, &[0x0F, 0x8C]).unwrap();
        assert_eq!(ChargerStatus::decode(&short), Err(Error::MalformedFrame));

        let other = CanFrame::with_address(0x650, &[0; 8]).unwrap();
        assert_eq!(ChargerStatus::decode(&other), Err(Error::UnexpectedId));
    }

    #[test]
    fn test_encode_charger_command() {
        let frame = ChargerCommand::charge(3984, 55).encode();
        assert!(frame.is_extended());
        assert_eq!(frame.raw_id(), CHARGER_COMMAND_ID);
        assert_eq!(frame.data(), &[0x0F, 0x90, 0x00, 0x37, 0, 0, 0, 0]);

        let frame = ChargerCommand::cease(3984).encode();
        assert_eq!(frame.data(), &[0x0F, 0x90, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_sensor_offset_encoding() {
        let frame = CanFrame::with_address(0x3C0, &[0x80, 0x00, 0x13, 0x88, 0x00]).unwrap();
        let reading = SensorReading::decode(&frame).unwrap();
        assert_eq!(reading.milliamps, 5_000);
        assert!(reading.is_valid());

        let frame = CanFrame::with_address(0x3C0, &[0x7F, 0xFF, 0xEC, 0x78, 0x89]).unwrap();
        let reading = SensorReading::decode(&frame).unwrap();
        assert_eq!(reading.milliamps, -5_000);
        assert!(!reading.is_valid());
        assert_eq!(reading.fault_code(), 0x44);
    }

    #[test]
    fn test_pack_summary_layout() {
        let summary = PackSummary {
            voltage_cv: 38_400,
            current_da: -50,
            soc: 200,
            status: 0x60,
        };
        let payload = summary.to_payload();
        assert_eq!(payload, [0x96, 0x00, 0xFF, 0xCE, 200, 0x60, 0, 0]);
        assert_eq!(PackSummary::from_payload(&payload), Ok(summary));
    }

    #[test]
    fn test_word_layout() {
        assert_eq!(
            encode_words(&[0x0102, 0x0304, 0x0506, 0x0708]),
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(
            decode_signed_words(&encode_signed_words(&[-1, 250, -400, 0])),
            Ok([-1, 250, -400, 0])
        );
    }

    #[test]
    fn test_reset_request() {
        let frame = CanFrame::with_address(0x660, &[0xA5]).unwrap();
        assert!(is_reset_request(&frame));
        let frame = CanFrame::with_address(0x660, &[0xA4]).unwrap();
        assert!(!is_reset_request(&frame));
        let frame = CanFrame::with_address(0x660, &[]).unwrap();
        assert!(!is_reset_request(&frame));
    }

    #[test]
    fn test_saturation() {
        assert_eq!(saturate_u16(-5), 0);
        assert_eq!(saturate_u16(70_000), u16::MAX);
        assert_eq!(saturate_i16(-40_000), i16::MIN);
        assert_eq!(saturate_i16(123), 123);
    }
}
