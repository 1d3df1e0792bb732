//! QBMS - Multiplexed analog sampling pipeline
//!
//! Two converters are shared by eight logical channels: four quadrant
//! voltage taps and four thermistors. Each tick advances a five-phase
//! state machine by exactly one phase:
//!
//! ```text
//! RequestVoltage -> ReadVoltageAndAdvance -> RequestTemperature
//!        ^                                          |
//!        |                                          v
//!  EvaluateFaults <----------------- ReadTemperatureAndAdvance
//! ```
//!
//! Splitting the conversion request from the read gives the multiplexer a
//! full tick to settle before the next conversion starts. A converter that
//! has not finished is skipped for this round; the channel keeps its last
//! smoothed value and the sampler moves on regardless.

use crate::hal::{AnalogMux, Converter};
use crate::settings::{BmsSettings, TemperatureCurve};
use crate::types::*;
use heapless::HistoryBuffer;
use tracing::{debug, trace, warn};

// ============================================================================
// Phase
// ============================================================================

/// Sampler state, one per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SamplerPhase {
    /// Start a conversion on the selected voltage tap
    #[default]
    RequestVoltage,
    /// Collect it and route the next voltage tap
    ReadVoltageAndAdvance,
    /// Start a conversion on the selected thermistor
    RequestTemperature,
    /// Collect it and route the next thermistor
    ReadTemperatureAndAdvance,
    /// Hand a full set of readings to fault evaluation
    EvaluateFaults,
}

impl SamplerPhase {
    /// Phase that follows this one
    pub fn next(self) -> Self {
        match self {
            Self::RequestVoltage => Self::ReadVoltageAndAdvance,
            Self::ReadVoltageAndAdvance => Self::RequestTemperature,
            Self::RequestTemperature => Self::ReadTemperatureAndAdvance,
            Self::ReadTemperatureAndAdvance => Self::EvaluateFaults,
            Self::EvaluateFaults => Self::RequestVoltage,
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

/// Moving-average history of one logical channel
pub struct Channel {
    history: HistoryBuffer<i16, SAMPLE_DEPTH>,
    smoothed: f32,
}

impl Channel {
    /// Empty channel (smoothed value 0)
    pub fn new() -> Self {
        Self {
            history: HistoryBuffer::new(),
            smoothed: 0.0,
        }
    }

    /// Record a sample, overwriting the oldest once full
    pub fn push(&mut self, raw: i16) {
        self.history.write(raw);
        let samples = self.history.as_slice();
        let sum: i32 = samples.iter().map(|&s| s as i32).sum();
        self.smoothed = sum as f32 / samples.len() as f32;
    }

    /// Mean of the samples currently held
    pub fn smoothed(&self) -> f32 {
        self.smoothed
    }

    /// Number of samples held (saturates at the history depth)
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// No sample recorded yet
    pub fn is_empty(&self) -> bool {
        self.history.len() == 0
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Calibration
// ============================================================================

/// Per-quadrant calibration copied out of the settings record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Raw-to-volts scale per voltage channel
    pub voltage_multiplier: [f32; QUADRANT_COUNT],
    /// Thermistor curve per channel
    pub temperature_curve: [TemperatureCurve; QUADRANT_COUNT],
    /// Series cells per quadrant
    pub cell_count: [u8; QUADRANT_COUNT],
}

impl Calibration {
    /// Extract calibration from a settings snapshot
    pub fn from_settings(settings: &BmsSettings) -> Self {
        Self {
            voltage_multiplier: settings.voltage_multiplier,
            temperature_curve: settings.temperature_curve,
            cell_count: settings.cell_count,
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::from_settings(&BmsSettings::default())
    }
}

/// Sampler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    /// Samples pushed into channel histories
    pub samples: u32,
    /// Reads skipped because the converter was still busy
    pub not_ready: u32,
    /// Converter or multiplexer errors
    pub hal_errors: u32,
    /// Completed four-channel cycles
    pub cycles: u32,
}

// ============================================================================
// Sampler
// ============================================================================

/// Time-multiplexed sampler over a voltage converter `V`, a temperature
/// converter `T` and a multiplexer `M`
pub struct AnalogSampler<V, T, M> {
    voltage_adc: V,
    temperature_adc: T,
    mux: M,

    phase: SamplerPhase,
    voltage_channel: usize,
    temperature_channel: usize,
    cycle_complete: bool,

    voltage: [Channel; QUADRANT_COUNT],
    temperature: [Channel; QUADRANT_COUNT],
    calibration: Calibration,

    stats: SamplerStats,
}

impl<V: Converter, T: Converter, M: AnalogMux> AnalogSampler<V, T, M> {
    /// Create a sampler positioned on channel 0
    pub fn new(voltage_adc: V, temperature_adc: T, mux: M, calibration: Calibration) -> Self {
        Self {
            voltage_adc,
            temperature_adc,
            mux,
            phase: SamplerPhase::RequestVoltage,
            voltage_channel: 0,
            temperature_channel: 0,
            cycle_complete: false,
            voltage: Default::default(),
            temperature: Default::default(),
            calibration,
            stats: SamplerStats::default(),
        }
    }

    /// Route channel 0 on both converters
    pub fn init(&mut self) -> Result<()> {
        self.mux.select_voltage(0)?;
        self.mux.select_temperature(0)?;
        self.voltage_channel = 0;
        self.temperature_channel = 0;
        self.phase = SamplerPhase::RequestVoltage;
        Ok(())
    }

    /// Advance one phase
    ///
    /// Returns the calibrated readings when a full four-channel cycle has
    /// completed and faults are due for evaluation.
    pub fn tick(&mut self) -> Option<[QuadrantReading; QUADRANT_COUNT]> {
        let phase = self.phase;
        self.phase = phase.next();

        match phase {
            SamplerPhase::RequestVoltage => {
                if let Err(e) = self.voltage_adc.start_conversion() {
                    self.hal_error("voltage conversion request", e);
                }
                None
            }
            SamplerPhase::ReadVoltageAndAdvance => {
                let result = self.voltage_adc.read();
                let channel = self.voltage_channel;
                self.absorb(result, channel, true);

                self.voltage_channel = (channel + 1) % QUADRANT_COUNT;
                if let Err(e) = self.mux.select_voltage(self.voltage_channel) {
                    self.hal_error("voltage tap select", e);
                }
                if self.voltage_channel == 0 {
                    self.cycle_complete = true;
                }
                None
            }
            SamplerPhase::RequestTemperature => {
                if let Err(e) = self.temperature_adc.start_conversion() {
                    self.hal_error("temperature conversion request", e);
                }
                None
            }
            SamplerPhase::ReadTemperatureAndAdvance => {
                let result = self.temperature_adc.read();
                let channel = self.temperature_channel;
                self.absorb(result, channel, false);

                self.temperature_channel = (channel + 1) % QUADRANT_COUNT;
                if let Err(e) = self.mux.select_temperature(self.temperature_channel) {
                    self.hal_error("thermistor select", e);
                }
                None
            }
            SamplerPhase::EvaluateFaults => {
                if !self.cycle_complete {
                    return None;
                }
                self.cycle_complete = false;
                self.stats.cycles = self.stats.cycles.wrapping_add(1);

                let readings = self.readings();
                debug!(
                    "Quadrants: {}mV {}mV {}mV {}mV",
                    readings[0].voltage_mv,
                    readings[1].voltage_mv,
                    readings[2].voltage_mv,
                    readings[3].voltage_mv
                );
                Some(readings)
            }
        }
    }

    fn absorb(&mut self, result: Result<Option<i16>>, channel: usize, is_voltage: bool) {
        match result {
            Ok(Some(raw)) => {
                let target = if is_voltage {
                    &mut self.voltage[channel]
                } else {
                    &mut self.temperature[channel]
                };
                target.push(raw);
                self.stats.samples = self.stats.samples.wrapping_add(1);
            }
            Ok(None) => {
                trace!("Converter busy, channel {} keeps last value", channel);
                self.stats.not_ready = self.stats.not_ready.wrapping_add(1);
            }
            Err(e) => self.hal_error("conversion read", e),
        }
    }

    fn hal_error(&mut self, what: &str, error: Error) {
        warn!("Sampler {} failed: {}", what, error);
        self.stats.hal_errors = self.stats.hal_errors.wrapping_add(1);
    }

    // ========================================================================
    // Calibrated Accessors
    // ========================================================================

    /// Replace calibration (takes effect on the next read)
    pub fn set_calibration(&mut self, calibration: Calibration) {
        self.calibration = calibration;
    }

    /// Current calibration
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Smoothed raw voltage reading (0 for an out-of-range quadrant)
    pub fn raw_voltage(&self, quadrant: usize) -> f32 {
        self.voltage.get(quadrant).map_or(0.0, Channel::smoothed)
    }

    /// Smoothed raw thermistor reading (0 for an out-of-range quadrant)
    pub fn raw_temperature(&self, quadrant: usize) -> f32 {
        self.temperature.get(quadrant).map_or(0.0, Channel::smoothed)
    }

    /// Quadrant voltage in volts
    pub fn voltage(&self, quadrant: usize) -> f32 {
        if quadrant >= QUADRANT_COUNT {
            return 0.0;
        }
        self.raw_voltage(quadrant) * self.calibration.voltage_multiplier[quadrant]
    }

    /// Quadrant temperature in degrees Celsius
    pub fn temperature(&self, quadrant: usize) -> f32 {
        if quadrant >= QUADRANT_COUNT {
            return 0.0;
        }
        self.calibration.temperature_curve[quadrant].evaluate(self.raw_temperature(quadrant))
    }

    /// Calibrated snapshot of one quadrant
    pub fn reading(&self, quadrant: usize) -> QuadrantReading {
        if quadrant >= QUADRANT_COUNT {
            return QuadrantReading::default();
        }
        QuadrantReading::new(
            volts_to_mv(self.voltage(quadrant)),
            celsius_to_dc(self.temperature(quadrant)),
            self.calibration.cell_count[quadrant],
        )
    }

    /// Calibrated snapshot of all quadrants
    pub fn readings(&self) -> [QuadrantReading; QUADRANT_COUNT] {
        core::array::from_fn(|q| self.reading(q))
    }

    /// Per-cell average for one quadrant
    pub fn cell_average_mv(&self, quadrant: usize) -> Millivolts {
        self.reading(quadrant).cell_average_mv()
    }

    /// Sum of the four quadrant voltages
    pub fn pack_voltage_mv(&self) -> Millivolts {
        self.readings().iter().map(|r| r.voltage_mv).sum()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Phase the next tick will run
    pub fn phase(&self) -> SamplerPhase {
        self.phase
    }

    /// Voltage tap currently routed
    pub fn voltage_channel(&self) -> usize {
        self.voltage_channel
    }

    /// Thermistor currently routed
    pub fn temperature_channel(&self) -> usize {
        self.temperature_channel
    }

    /// Counters
    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    /// Multiplexer (for inspection in tests and simulation)
    pub fn mux(&self) -> &M {
        &self.mux
    }

    /// Voltage converter
    pub fn voltage_adc_mut(&mut self) -> &mut V {
        &mut self.voltage_adc
    }

    /// Temperature converter
    pub fn temperature_adc_mut(&mut self) -> &mut T {
        &mut self.temperature_adc
    }
}
