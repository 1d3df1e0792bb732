//! QBMS - Settings record
//!
//! The settings record is owned by the storage collaborator; the core only
//! reads snapshots of it. Out-of-range values are clamped to safe defaults
//! by [`BmsSettings::sanitize`] rather than rejected.

use crate::fault::FaultThresholds;
use crate::types::*;
use tracing::{info, warn};

// ============================================================================
// Constants
// ============================================================================

/// Layout version of the settings record
pub const SETTINGS_VERSION: u8 = 0x10;

/// Token marking a record as written by this firmware
pub const SETTINGS_VALID_TOKEN: u16 = 0xB315;

/// Bus speed used when the stored one is unusable
pub const DEFAULT_CAN_SPEED: u32 = 500_000;

/// Anything slower than this is treated as a corrupt value
pub const MIN_CAN_SPEED: u32 = 33_333;

/// Fastest classic CAN bitrate
pub const MAX_CAN_SPEED: u32 = 1_000_000;

/// Current sensor address when one is fitted
pub const DEFAULT_CURRENT_SENSOR_ADDRESS: u32 = 0x3C0;

/// First of the four status frame identifiers
pub const DEFAULT_BASE_ADDRESS: u32 = 0x650;

/// Identifier of the BMS control frame
pub const DEFAULT_CONTROL_ADDRESS: u32 = 0x660;

/// Re-arm charging when the charger output sags this far below target (35.0V)
pub const DEFAULT_REARM_MARGIN: DeciVolts = 350;

/// Largest voltage threshold representable in the fault evaluator
pub const MAX_THRESHOLD_MV: u32 = Millivolts::MAX as u32;

/// Highest accepted log level (0=debug, 1=info, 2=warn, 3=error, 4=off)
pub const MAX_LOG_LEVEL: u8 = 4;

const DEFAULT_VOLTAGE_MULTIPLIER: f32 = 0.0032;
const DEFAULT_CELLS: u8 = 24;
const DEFAULT_LOW_THRESHOLD_MV: u32 = 72_000;
const DEFAULT_HIGH_THRESHOLD_MV: u32 = 100_800;
const DEFAULT_LOW_TEMP_DC: i16 = 0;
const DEFAULT_HIGH_TEMP_DC: i16 = 550;

// ============================================================================
// Temperature Curve
// ============================================================================

/// Third-order thermistor curve `y = A*x^3 + B*x^2 + C*x + D`
///
/// `x` is the smoothed raw reading scaled to volts by `adc_to_volts`, which
/// keeps the polynomial coefficients in a sane floating point range.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TemperatureCurve {
    /// Cubic coefficient
    pub a: f32,
    /// Square coefficient
    pub b: f32,
    /// Linear coefficient
    pub c: f32,
    /// Offset
    pub d: f32,
    /// Raw reading to volts
    pub adc_to_volts: f32,
}

impl TemperatureCurve {
    /// Create a curve from its coefficients
    pub const fn new(a: f32, b: f32, c: f32, d: f32, adc_to_volts: f32) -> Self {
        Self {
            a,
            b,
            c,
            d,
            adc_to_volts,
        }
    }

    /// Degrees Celsius for a smoothed raw reading (Horner form)
    pub fn evaluate(&self, raw: f32) -> f32 {
        let x = raw * self.adc_to_volts;
        ((self.a * x + self.b) * x + self.c) * x + self.d
    }

    fn is_finite(&self) -> bool {
        self.a.is_finite()
            && self.b.is_finite()
            && self.c.is_finite()
            && self.d.is_finite()
            && self.adc_to_volts.is_finite()
    }
}

impl Default for TemperatureCurve {
    fn default() -> Self {
        // ADS1110 at gain 1: 2.048V over 15 bits
        Self::new(0.0, 0.0, -50.0, 100.0, 2.048 / 32_768.0)
    }
}

// ============================================================================
// Settings Record
// ============================================================================

/// Complete configuration snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BmsSettings {
    /// Record layout version
    pub version: u8,

    // CAN
    /// Bus speed in bits per second
    pub can_speed: u32,
    /// Whether the CAN interface is brought up at all
    pub can_enabled: bool,
    /// On-board bus termination
    pub can_termination: bool,
    /// Current sensor identifier (0 = not fitted)
    pub current_sensor_address: u32,
    /// First status frame identifier (frames use base..=base+3)
    pub base_address: u32,
    /// Control frame identifier
    pub control_address: u32,

    // Fault thresholds
    /// Allowed spread between highest and lowest cell average
    pub balance_threshold_mv: u16,
    /// Quadrant undervoltage limit
    pub low_threshold_mv: u32,
    /// Quadrant overvoltage limit
    pub high_threshold_mv: u32,
    /// Lowest acceptable temperature
    pub low_temp_dc: i16,
    /// Highest acceptable temperature
    pub high_temp_dc: i16,

    // Calibration
    /// Raw-to-volts scale per voltage channel
    pub voltage_multiplier: [f32; QUADRANT_COUNT],
    /// Raw-to-degrees curve per thermistor channel
    pub temperature_curve: [TemperatureCurve; QUADRANT_COUNT],
    /// Series cells per quadrant
    pub cell_count: [u8; QUADRANT_COUNT],

    // Capacity
    /// Full pack capacity
    pub max_pack_capacity: Capacity,
    /// Remaining capacity at last save
    pub current_pack_capacity: Capacity,

    // Charger
    /// Target charging voltage
    pub charging_voltage: DeciVolts,
    /// Full charging current
    pub charging_current: DeciAmps,
    /// Sag below target that re-arms a finished charge
    pub charger_rearm_margin: DeciVolts,

    /// Log level (0=debug, 1=info, 2=warn, 3=error, 4=off)
    pub log_level: u8,

    /// Validity token
    pub valid: u16,
}

impl Default for BmsSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            can_speed: DEFAULT_CAN_SPEED,
            can_enabled: true,
            can_termination: false,
            current_sensor_address: DEFAULT_CURRENT_SENSOR_ADDRESS,
            base_address: DEFAULT_BASE_ADDRESS,
            control_address: DEFAULT_CONTROL_ADDRESS,
            balance_threshold_mv: 100,
            low_threshold_mv: DEFAULT_LOW_THRESHOLD_MV,
            high_threshold_mv: DEFAULT_HIGH_THRESHOLD_MV,
            low_temp_dc: DEFAULT_LOW_TEMP_DC,
            high_temp_dc: DEFAULT_HIGH_TEMP_DC,
            voltage_multiplier: [DEFAULT_VOLTAGE_MULTIPLIER; QUADRANT_COUNT],
            temperature_curve: [TemperatureCurve::default(); QUADRANT_COUNT],
            cell_count: [DEFAULT_CELLS; QUADRANT_COUNT],
            // 100Ah
            max_pack_capacity: 1_000_000_000,
            current_pack_capacity: 1_000_000_000,
            // 4 x 24 cells at 4.15V
            charging_voltage: 3984,
            charging_current: 100,
            charger_rearm_margin: DEFAULT_REARM_MARGIN,
            log_level: 1,
            valid: SETTINGS_VALID_TOKEN,
        }
    }
}

impl BmsSettings {
    /// Check the version/validity token pair
    pub fn is_valid(&self) -> bool {
        self.version == SETTINGS_VERSION && self.valid == SETTINGS_VALID_TOKEN
    }

    /// Whether a current sensor is fitted
    pub fn current_sensor_enabled(&self) -> bool {
        self.current_sensor_address != 0
    }

    /// Threshold view used by the fault evaluator
    pub fn thresholds(&self) -> FaultThresholds {
        FaultThresholds {
            low_voltage_mv: self.low_threshold_mv.min(MAX_THRESHOLD_MV) as Millivolts,
            high_voltage_mv: self.high_threshold_mv.min(MAX_THRESHOLD_MV) as Millivolts,
            low_temp_dc: self.low_temp_dc as DeciCelsius,
            high_temp_dc: self.high_temp_dc as DeciCelsius,
            balance_mv: self.balance_threshold_mv as Millivolts,
        }
    }

    /// Clamp out-of-range values to safe defaults
    ///
    /// Returns the number of fields that were corrected.
    pub fn sanitize(&mut self) -> u32 {
        let defaults = Self::default();
        let mut fixed = 0u32;

        if self.can_speed < MIN_CAN_SPEED {
            warn!("CAN speed {} too low, using {}", self.can_speed, DEFAULT_CAN_SPEED);
            self.can_speed = DEFAULT_CAN_SPEED;
            fixed += 1;
        } else if self.can_speed > MAX_CAN_SPEED {
            warn!("CAN speed {} too high, using {}", self.can_speed, MAX_CAN_SPEED);
            self.can_speed = MAX_CAN_SPEED;
            fixed += 1;
        }

        if self.current_sensor_address > MAX_STANDARD_ID {
            warn!(
                "Current sensor address {:#x} outside standard range, sensor disabled",
                self.current_sensor_address
            );
            self.current_sensor_address = 0;
            fixed += 1;
        }

        // base+3 must still be a valid identifier
        if self.base_address == 0 || self.base_address > MAX_EXTENDED_ID - 3 {
            warn!("Base address {:#x} invalid, using default", self.base_address);
            self.base_address = defaults.base_address;
            fixed += 1;
        }

        if self.control_address == 0 || self.control_address > MAX_EXTENDED_ID {
            warn!("Control address {:#x} invalid, using default", self.control_address);
            self.control_address = defaults.control_address;
            fixed += 1;
        }

        for (quadrant, cells) in self.cell_count.iter_mut().enumerate() {
            if *cells > MAX_CELLS_PER_QUADRANT {
                warn!("Quadrant {} cell count {} clamped", quadrant, *cells);
                *cells = MAX_CELLS_PER_QUADRANT;
                fixed += 1;
            }
        }

        for (name, threshold) in [
            ("Low", &mut self.low_threshold_mv),
            ("High", &mut self.high_threshold_mv),
        ] {
            if *threshold > MAX_THRESHOLD_MV {
                warn!("{} voltage threshold {} clamped", name, *threshold);
                *threshold = MAX_THRESHOLD_MV;
                fixed += 1;
            }
        }

        if self.low_threshold_mv >= self.high_threshold_mv {
            warn!(
                "Voltage thresholds inverted ({} >= {}), using defaults",
                self.low_threshold_mv, self.high_threshold_mv
            );
            self.low_threshold_mv = defaults.low_threshold_mv;
            self.high_threshold_mv = defaults.high_threshold_mv;
            fixed += 1;
        }

        if self.low_temp_dc >= self.high_temp_dc {
            warn!(
                "Temperature thresholds inverted ({} >= {}), using defaults",
                self.low_temp_dc, self.high_temp_dc
            );
            self.low_temp_dc = defaults.low_temp_dc;
            self.high_temp_dc = defaults.high_temp_dc;
            fixed += 1;
        }

        for quadrant in 0..QUADRANT_COUNT {
            if !self.voltage_multiplier[quadrant].is_finite() {
                warn!("Quadrant {} voltage multiplier not finite, using default", quadrant);
                self.voltage_multiplier[quadrant] = defaults.voltage_multiplier[quadrant];
                fixed += 1;
            }
            if !self.temperature_curve[quadrant].is_finite() {
                warn!("Quadrant {} temperature curve not finite, using default", quadrant);
                self.temperature_curve[quadrant] = defaults.temperature_curve[quadrant];
                fixed += 1;
            }
        }

        if self.current_pack_capacity > self.max_pack_capacity {
            warn!("Remaining capacity above maximum, capping");
            self.current_pack_capacity = self.max_pack_capacity;
            fixed += 1;
        }

        if self.log_level > MAX_LOG_LEVEL {
            self.log_level = MAX_LOG_LEVEL;
            fixed += 1;
        }

        fixed
    }

    /// Rescale one voltage channel from a reference measurement
    ///
    /// Returns the new multiplier.
    pub fn calibrate_voltage(&mut self, quadrant: usize, reported_v: f32, measured_v: f32) -> Result<f32> {
        if quadrant >= QUADRANT_COUNT {
            return Err(Error::InvalidArg);
        }
        if !(reported_v > 0.0) || !measured_v.is_finite() || measured_v < 0.0 {
            return Err(Error::InvalidArg);
        }

        let scale = measured_v / reported_v;
        self.voltage_multiplier[quadrant] *= scale;
        info!(
            "Quadrant {} calibrated: {}V reported, {}V measured, multiplier now {}",
            quadrant, reported_v, measured_v, self.voltage_multiplier[quadrant]
        );
        Ok(self.voltage_multiplier[quadrant])
    }
}

// ============================================================================
// Storage Seam
// ============================================================================

/// Persistent storage for the settings record
///
/// Implemented outside the core (EEPROM, flash page, file...).
pub trait SettingsStore {
    /// Read the stored record
    fn load(&mut self) -> Result<BmsSettings>;

    /// Write the record
    fn save(&mut self, settings: &BmsSettings) -> Result<()>;
}

/// Load settings, falling back to factory defaults when the stored record
/// is missing or fails its validity check. The result is always sanitized.
pub fn load_or_default<S: SettingsStore>(store: &mut S) -> BmsSettings {
    let mut settings = match store.load() {
        Ok(settings) if settings.is_valid() => settings,
        Ok(_) => {
            warn!("Stored settings invalid, loading factory defaults");
            BmsSettings::default()
        }
        Err(e) => {
            warn!("Settings load failed ({}), loading factory defaults", e);
            BmsSettings::default()
        }
    };
    settings.sanitize();
    settings
}
