//! QBMS - Fault aggregation and charge/discharge permission
//!
//! Once per full sampling cycle the four quadrant readings are compared
//! against the configured limits. Every pass starts from "everything
//! permitted"; a violating quadrant can only take permissions away.

use crate::types::*;
use bitflags::bitflags;
use tracing::{info, warn};

bitflags! {
    /// Pack status bitfield, byte 5 of the pack summary frame
    pub struct PackStatus: u8 {
        /// A quadrant is below the low voltage limit
        const LOW_VOLTAGE = 1 << 0;
        /// A quadrant is above the high voltage limit
        const HIGH_VOLTAGE = 1 << 1;
        /// A quadrant is below the low temperature limit
        const LOW_TEMPERATURE = 1 << 2;
        /// A quadrant is above the high temperature limit
        const HIGH_TEMPERATURE = 1 << 3;
        /// Cell averages spread wider than the balance threshold
        const IMBALANCE = 1 << 4;
        /// Discharging is allowed
        const DISCHARGE_OK = 1 << 5;
        /// Charging is allowed
        const CHARGE_OK = 1 << 6;
        /// Any of the fault bits above is set
        const GENERAL_FAULT = 1 << 7;

        /// All fault bits
        const FAULTS = Self::LOW_VOLTAGE.bits
            | Self::HIGH_VOLTAGE.bits
            | Self::LOW_TEMPERATURE.bits
            | Self::HIGH_TEMPERATURE.bits
            | Self::IMBALANCE.bits;
    }
}

impl PackStatus {
    /// Status before the first evaluation: nothing permitted
    pub const fn initial() -> Self {
        Self::empty()
    }

    /// Charging allowed
    pub fn charge_permitted(&self) -> bool {
        self.contains(Self::CHARGE_OK)
    }

    /// Discharging allowed
    pub fn discharge_permitted(&self) -> bool {
        self.contains(Self::DISCHARGE_OK)
    }

    /// Any fault present
    pub fn has_fault(&self) -> bool {
        self.intersects(Self::FAULTS)
    }
}

impl Default for PackStatus {
    fn default() -> Self {
        Self::initial()
    }
}

/// Limits in the fixed-point units the readings use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FaultThresholds {
    /// Quadrant undervoltage limit
    pub low_voltage_mv: Millivolts,
    /// Quadrant overvoltage limit
    pub high_voltage_mv: Millivolts,
    /// Lowest acceptable temperature
    pub low_temp_dc: DeciCelsius,
    /// Highest acceptable temperature
    pub high_temp_dc: DeciCelsius,
    /// Allowed cell average spread
    pub balance_mv: Millivolts,
}

/// Compute pack status from one set of quadrant readings
///
/// Pure: identical inputs always give identical output.
pub fn evaluate(readings: &[QuadrantReading; QUADRANT_COUNT], limits: &FaultThresholds) -> PackStatus {
    let mut status = PackStatus::CHARGE_OK | PackStatus::DISCHARGE_OK;
    let mut min_cell = Millivolts::MAX;
    let mut max_cell = Millivolts::MIN;

    for reading in readings.iter() {
        let cell_mv = reading.cell_average_mv();
        min_cell = min_cell.min(cell_mv);
        max_cell = max_cell.max(cell_mv);

        if reading.voltage_mv > limits.high_voltage_mv {
            status.insert(PackStatus::HIGH_VOLTAGE);
            status.remove(PackStatus::CHARGE_OK);
        }
        if reading.voltage_mv < limits.low_voltage_mv {
            status.insert(PackStatus::LOW_VOLTAGE);
            status.remove(PackStatus::DISCHARGE_OK);
        }
        if reading.temperature_dc > limits.high_temp_dc {
            status.insert(PackStatus::HIGH_TEMPERATURE);
            status.remove(PackStatus::CHARGE_OK | PackStatus::DISCHARGE_OK);
        }
        if reading.temperature_dc < limits.low_temp_dc {
            status.insert(PackStatus::LOW_TEMPERATURE);
            status.remove(PackStatus::CHARGE_OK | PackStatus::DISCHARGE_OK);
        }
    }

    if max_cell.saturating_sub(min_cell) > limits.balance_mv {
        status.insert(PackStatus::IMBALANCE);
        status.remove(PackStatus::CHARGE_OK | PackStatus::DISCHARGE_OK);
    } else {
        status.remove(PackStatus::IMBALANCE);
    }

    if status.has_fault() {
        status.insert(PackStatus::GENERAL_FAULT);
    }

    status
}

// ============================================================================
// Fault Evaluator
// ============================================================================

/// Owns the current pack status and logs fault transitions
#[derive(Debug, Default)]
pub struct FaultEvaluator {
    status: PackStatus,
    passes: u32,
}

impl FaultEvaluator {
    /// Create an evaluator with nothing permitted yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status
    pub fn status(&self) -> PackStatus {
        self.status
    }

    /// Completed evaluation passes
    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Recompute and store the pack status
    pub fn run(&mut self, readings: &[QuadrantReading; QUADRANT_COUNT], limits: &FaultThresholds) -> PackStatus {
        let next = evaluate(readings, limits);
        let raised = (next & PackStatus::FAULTS) - (self.status & PackStatus::FAULTS);
        let cleared = (self.status & PackStatus::FAULTS) - (next & PackStatus::FAULTS);

        if raised.contains(PackStatus::HIGH_VOLTAGE) {
            warn!("Quadrant over voltage, charging disabled");
        }
        if raised.contains(PackStatus::LOW_VOLTAGE) {
            warn!("Quadrant under voltage, discharging disabled");
        }
        if raised.contains(PackStatus::HIGH_TEMPERATURE) {
            warn!("Pack over temperature, charge and discharge disabled");
        }
        if raised.contains(PackStatus::LOW_TEMPERATURE) {
            warn!("Pack under temperature, charge and discharge disabled");
        }
        if raised.contains(PackStatus::IMBALANCE) {
            warn!("Pack voltage imbalance!");
        }
        if !cleared.is_empty() {
            info!("Pack faults cleared: {:#04x}", cleared.bits());
        }

        self.status = next;
        self.passes = self.passes.wrapping_add(1);
        next
    }
}
