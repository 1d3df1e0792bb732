//! QBMS - Base types and configuration constants
//!
//! Units used across the crate:
//! - quadrant and cell voltages in millivolts (`Millivolts`)
//! - temperatures in tenths of a degree Celsius (`DeciCelsius`)
//! - pack capacity in tenths of a microamp-hour (`Capacity`)
//! - charger voltage/current in tenths of a volt/amp, as on the charger wire

use core::fmt;
use fixed::types::I32F32;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Number of pack quadrants (fixed by the hardware)
pub const QUADRANT_COUNT: usize = 4;

/// Raw samples kept per channel for smoothing
pub const SAMPLE_DEPTH: usize = 8;

/// Sampler tick period in microseconds (80ms, one state per tick)
pub const SAMPLE_PERIOD_US: u64 = 80_000;

/// Pack summary frame period in microseconds (100ms)
pub const STATUS_FAST_PERIOD_US: u64 = 100_000;

/// Base tick for the slow status frames in microseconds (125ms)
pub const STATUS_SLOW_BASE_US: u64 = 125_000;

/// Slow status frames go out on every Nth base tick (4 x 125ms = 500ms)
pub const STATUS_SLOW_DIVIDER: u8 = 4;

/// Depth of the main-loop event queue
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Largest 11-bit CAN identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit CAN identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Upper bound for configured series cells per quadrant
pub const MAX_CELLS_PER_QUADRANT: u8 = 120;

// ============================================================================
// Basic Types
// ============================================================================

/// Timestamp in microseconds (scheduler clock)
pub type TimeUs = u64;

/// Timestamp in milliseconds (wraps, like a millis() counter)
pub type TimeMs = u32;

/// Voltage in millivolts
pub type Millivolts = i32;

/// Temperature in tenths of a degree Celsius
pub type DeciCelsius = i32;

/// Capacity in tenths of a microamp-hour
pub type Capacity = u32;

/// Charger voltage in tenths of a volt
pub type DeciVolts = u16;

/// Charger current in tenths of an amp
pub type DeciAmps = u16;

/// Fixed-point Q32.32 used for ratio arithmetic
pub type Fixed = I32F32;

// ============================================================================
// Error Types
// ============================================================================

/// Result type for QBMS operations
pub type Result<T> = core::result::Result<T, Error>;

/// Error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Invalid argument provided
    InvalidArg,
    /// Pin, two-wire or CAN driver reported a failure
    HalFailure,
    /// Frame payload too short or otherwise unusable
    MalformedFrame,
    /// Frame identifier does not belong to the decoder
    UnexpectedId,
    /// Event queue has no room
    QueueFull,
    /// Settings record failed its validity check
    InvalidSettings,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::InvalidArg => "invalid argument",
            Error::HalFailure => "hardware driver failure",
            Error::MalformedFrame => "malformed frame",
            Error::UnexpectedId => "unexpected frame identifier",
            Error::QueueFull => "event queue full",
            Error::InvalidSettings => "invalid settings record",
        };
        f.write_str(text)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

// ============================================================================
// Quadrant Reading
// ============================================================================

/// Calibrated snapshot of one quadrant, in fixed-point units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QuadrantReading {
    /// Quadrant voltage
    pub voltage_mv: Millivolts,
    /// Quadrant temperature
    pub temperature_dc: DeciCelsius,
    /// Configured series cells
    pub cell_count: u8,
}

impl QuadrantReading {
    /// Create a new reading
    pub const fn new(voltage_mv: Millivolts, temperature_dc: DeciCelsius, cell_count: u8) -> Self {
        Self {
            voltage_mv,
            temperature_dc,
            cell_count,
        }
    }

    /// Average cell voltage (cell count 0 is treated as 1)
    pub fn cell_average_mv(&self) -> Millivolts {
        self.voltage_mv / effective_cells(self.cell_count)
    }
}

/// Divisor for per-cell math; a missing cell count never divides by zero
#[inline]
pub fn effective_cells(count: u8) -> i32 {
    if count == 0 {
        1
    } else {
        count as i32
    }
}

/// Volts to millivolts, rounded to nearest
#[inline]
pub fn volts_to_mv(volts: f32) -> Millivolts {
    libm::roundf(volts * 1000.0) as Millivolts
}

/// Degrees to tenths of a degree, rounded to nearest
#[inline]
pub fn celsius_to_dc(celsius: f32) -> DeciCelsius {
    libm::roundf(celsius * 10.0) as DeciCelsius
}
