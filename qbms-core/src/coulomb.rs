//! QBMS - Coulomb counting from the pack current sensor
//!
//! Capacity is kept in tenths of a microamp-hour. A sample in milliamps
//! held for `elapsed` milliseconds moves the counter by
//! `mA * elapsed / 360` units (10 000 units per mAh, 3 600 000 ms per hour).
//! Positive current discharges, negative current charges.

use crate::frames::SensorReading;
use crate::types::*;
use tracing::{debug, error, info};

// ============================================================================
// Sensor Faults
// ============================================================================

/// Fault condition reported by the current sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorFault {
    /// 0x41
    DataflashCrc,
    /// 0x42
    FluxgateHighFrequency,
    /// 0x43
    FluxgateNotOscillating,
    /// 0x44
    Failsafe,
    /// 0x46
    SignalNotAvailable,
    /// 0x47
    BridgeVoltageProtection,
    /// Any other sub-code
    Unknown(u8),
}

impl SensorFault {
    /// Map a fault sub-code
    pub fn from_code(code: u8) -> Self {
        match code {
            0x41 => Self::DataflashCrc,
            0x42 => Self::FluxgateHighFrequency,
            0x43 => Self::FluxgateNotOscillating,
            0x44 => Self::Failsafe,
            0x46 => Self::SignalNotAvailable,
            0x47 => Self::BridgeVoltageProtection,
            other => Self::Unknown(other),
        }
    }

    /// Human-readable condition
    pub fn describe(&self) -> &'static str {
        match self {
            Self::DataflashCrc => "error on dataflash CRC",
            Self::FluxgateHighFrequency => "fluxgate running high frequency",
            Self::FluxgateNotOscillating => "fluxgate not oscillating",
            Self::Failsafe => "sensor entered failsafe mode",
            Self::SignalNotAvailable => "signal not available",
            Self::BridgeVoltageProtection => "bridge voltage protection",
            Self::Unknown(_) => "unknown fault",
        }
    }
}

/// Counter hit one of its bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CapacityEvent {
    /// Clamped at zero
    PackEmpty,
    /// Clamped at full capacity
    PackFull,
}

// ============================================================================
// Counter
// ============================================================================

/// Remaining-capacity integrator
#[derive(Debug, Clone)]
pub struct PackCoulombCounter {
    remaining: Capacity,
    max: Capacity,
    last_sample_ms: Option<TimeMs>,
    milliamps: i32,
    clamped: Option<CapacityEvent>,
    last_fault: Option<SensorFault>,
    samples: u32,
    faults: u32,
}

impl PackCoulombCounter {
    /// Create a counter; `remaining` is capped at `max`
    pub fn new(max: Capacity, remaining: Capacity) -> Self {
        Self {
            remaining: remaining.min(max),
            max,
            last_sample_ms: None,
            milliamps: 0,
            clamped: None,
            last_fault: None,
            samples: 0,
            faults: 0,
        }
    }

    /// Handle one sensor message received at `now_ms`
    ///
    /// Faulted samples are logged and skipped without touching the time
    /// base. The first valid sample only establishes the time base.
    pub fn on_sample(&mut self, reading: &SensorReading, now_ms: TimeMs) -> Option<CapacityEvent> {
        if !reading.is_valid() {
            let fault = SensorFault::from_code(reading.fault_code());
            error!(
                "Current sensor fault {:#04x}: {}",
                reading.fault_code(),
                fault.describe()
            );
            self.last_fault = Some(fault);
            self.faults = self.faults.wrapping_add(1);
            return None;
        }

        self.milliamps = reading.milliamps;
        self.samples = self.samples.wrapping_add(1);
        debug!("Pack current {}mA", reading.milliamps);

        let event = match self.last_sample_ms {
            Some(last) => self.integrate(reading.milliamps, now_ms.wrapping_sub(last)),
            None => None,
        };
        self.last_sample_ms = Some(now_ms);
        event
    }

    /// Apply `milliamps` held for `elapsed_ms`
    ///
    /// Returns an event only on the transition into a clamp.
    pub fn integrate(&mut self, milliamps: i32, elapsed_ms: TimeMs) -> Option<CapacityEvent> {
        let delta = milliamps as i64 * elapsed_ms as i64 / 360;
        let next = self.remaining as i64 - delta;

        let (value, clamp) = if next < 0 {
            (0, Some(CapacityEvent::PackEmpty))
        } else if next > self.max as i64 {
            (self.max, Some(CapacityEvent::PackFull))
        } else {
            (next as Capacity, None)
        };
        self.remaining = value;

        let event = match clamp {
            Some(kind) if self.clamped != Some(kind) => Some(kind),
            _ => None,
        };
        // sitting exactly on a bound does not re-arm the report
        if clamp.is_some() || (value != 0 && value != self.max) {
            self.clamped = clamp;
        }

        match event {
            Some(CapacityEvent::PackEmpty) => error!("Pack totally empty! Stop discharging"),
            Some(CapacityEvent::PackFull) => info!("Pack is likely fully charged"),
            None => {}
        }
        event
    }

    /// Set remaining capacity to full
    pub fn reset_to_full(&mut self) {
        info!("Capacity reset to full ({})", self.max);
        self.remaining = self.max;
        self.clamped = None;
    }

    /// Change full capacity, capping the remaining value
    pub fn set_max(&mut self, max: Capacity) {
        self.max = max;
        self.remaining = self.remaining.min(max);
    }

    /// State of charge, 0-255
    pub fn soc(&self) -> u8 {
        state_of_charge(self.remaining, self.max)
    }

    /// Remaining capacity
    pub fn remaining(&self) -> Capacity {
        self.remaining
    }

    /// Full capacity
    pub fn max(&self) -> Capacity {
        self.max
    }

    /// Not yet full
    pub fn has_room(&self) -> bool {
        self.remaining < self.max
    }

    /// Latest valid current reading
    pub fn milliamps(&self) -> i32 {
        self.milliamps
    }

    /// Most recent sensor fault, if any was seen
    pub fn last_fault(&self) -> Option<SensorFault> {
        self.last_fault
    }

    /// (valid samples, faulted samples)
    pub fn counts(&self) -> (u32, u32) {
        (self.samples, self.faults)
    }
}

/// `255 * remaining / max` with a 64-bit intermediate; 0 when `max` is 0
pub fn state_of_charge(remaining: Capacity, max: Capacity) -> u8 {
    if max == 0 {
        return 0;
    }
    let remaining = remaining.min(max) as u64;
    (remaining * 255 / max as u64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Capacity = 1_000_000_000;

    fn valid(milliamps: i32) -> SensorReading {
        SensorReading { milliamps, status: 0 }
    }

    #[test]
    fn test_first_sample_sets_time_base() {
        let mut counter = PackCoulombCounter::new(MAX, MAX / 2);
        assert_eq!(counter.on_sample(&valid(36_000), 1_000), None);
        assert_eq!(counter.remaining(), MAX / 2);

        // 36A for 1s = 10mAh = 100 000 units
        counter.on_sample(&valid(36_000), 2_000);
        assert_eq!(counter.remaining(), MAX / 2 - 100_000);
    }

    #[test]
    fn test_negative_current_charges() {
        let mut counter = PackCoulombCounter::new(MAX, MAX / 2);
        counter.integrate(-3_600, 1_000);
        assert_eq!(counter.remaining(), MAX / 2 + 10_000);
    }

    #[test]
    fn test_full_reported_once() {
        let mut counter = PackCoulombCounter::new(MAX, MAX - 100);
        let mut reports = 0;
        for step in 0..=10 {
            if counter.on_sample(&valid(-5_000), step * 100) == Some(CapacityEvent::PackFull) {
                reports += 1;
            }
        }
        assert_eq!(counter.remaining(), MAX);
        assert_eq!(reports, 1);
        assert_eq!(counter.soc(), 255);
    }

    #[test]
    fn test_empty_clamps_at_zero() {
        let mut counter = PackCoulombCounter::new(MAX, 50);
        assert_eq!(counter.integrate(10_000, 1_000), Some(CapacityEvent::PackEmpty));
        assert_eq!(counter.remaining(), 0);
        assert_eq!(counter.integrate(10_000, 1_000), None);
        assert_eq!(counter.soc(), 0);

        // leaving the clamp re-arms the report
        counter.integrate(-36_000, 1_000);
        assert_eq!(counter.integrate(360_000, 1_000), Some(CapacityEvent::PackEmpty));
    }

    #[test]
    fn test_faulted_sample_skipped() {
        let mut counter = PackCoulombCounter::new(MAX, MAX / 2);
        counter.on_sample(&valid(36_000), 0);

        let faulted = SensorReading { milliamps: 1_000_000, status: (0x46 << 1) | 1 };
        assert_eq!(counter.on_sample(&faulted, 500), None);
        assert_eq!(counter.remaining(), MAX / 2);
        assert_eq!(counter.last_fault(), Some(SensorFault::SignalNotAvailable));
        assert_eq!(counter.milliamps(), 36_000);

        // elapsed measured from the last valid sample
        counter.on_sample(&valid(36_000), 1_000);
        assert_eq!(counter.remaining(), MAX / 2 - 100_000);
        assert_eq!(counter.counts(), (2, 1));
    }

    #[test]
    fn test_millisecond_wrap() {
        let mut counter = PackCoulombCounter::new(MAX, MAX / 2);
        counter.on_sample(&valid(36_000), u32::MAX - 499);
        counter.on_sample(&valid(36_000), 500);
        assert_eq!(counter.remaining(), MAX / 2 - 100_000);
    }

    #[test]
    fn test_reset_to_full() {
        let mut counter = PackCoulombCounter::new(MAX, 10);
        counter.reset_to_full();
        assert_eq!(counter.remaining(), MAX);
        assert!(!counter.has_room());
    }

    #[test]
    fn test_soc_bounds() {
        assert_eq!(state_of_charge(0, MAX), 0);
        assert_eq!(state_of_charge(MAX, MAX), 255);
        assert_eq!(state_of_charge(u32::MAX, u32::MAX), 255);
        assert_eq!(state_of_charge(u32::MAX / 2, u32::MAX), 127);
        assert_eq!(state_of_charge(5, 0), 0);
    }

    #[test]
    fn test_fault_catalogue() {
        assert_eq!(SensorFault::from_code(0x41), SensorFault::DataflashCrc);
        assert_eq!(SensorFault::from_code(0x47), SensorFault::BridgeVoltageProtection);
        assert_eq!(SensorFault::from_code(0x45), SensorFault::Unknown(0x45));
        assert_eq!(SensorFault::Unknown(0).describe(), "unknown fault");
    }
}
