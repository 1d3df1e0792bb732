//! # QBMS: Four-Quadrant Battery Management Core
//!
//! Battery management for a pack built from four series quadrants, each
//! with its own voltage tap, thermistor and cell count.
//!
//! ## Pipeline
//!
//! ### 1. Multiplexed Sampling
//!
//! Two converters serve eight channels through an analog multiplexer.
//! A five-phase state machine requests, reads and advances one channel
//! per tick and smooths each channel over its last eight samples.
//!
//! ### 2. Fault Aggregation
//!
//! Once per full cycle the quadrant readings are checked against voltage,
//! temperature and balance limits. The result is a single status byte
//! with per-fault flags and charge/discharge permission.
//!
//! ### 3. Coulomb Counting
//!
//! Current sensor telemetry is integrated into a remaining-capacity
//! counter that clamps at empty and full.
//!
//! ### 4. Charger Negotiation
//!
//! Every charger status message is answered with a command. Charging
//! continues only while the pack permits it, the counter has room and
//! the charger reports no faults; the current tapers near the target
//! voltage.
//!
//! ### 5. Telemetry
//!
//! A pack summary frame every 100ms, quadrant detail frames every 500ms.
//!
//! ## Quick Start
//!
//! ```ignore
//! use qbms::prelude::*;
//!
//! let settings = load_or_default(&mut store);
//! let mut pack = PackController::new(settings, voltage_adc, thermistor_adc, mux);
//! let mut scheduler = Scheduler::new();
//!
//! loop {
//!     scheduler.poll(clock.time_us());
//!     while let Some(event) = scheduler.next_event() {
//!         pack.on_event(event, &mut can)?;
//!     }
//!     pack.poll_bus(&mut can, clock.time_ms());
//! }
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

// Core modules
pub mod types;
pub mod settings;
pub mod hal;
pub mod frames;
pub mod ads1110;
pub mod mux;
pub mod sampler;
pub mod fault;
pub mod coulomb;
pub mod charger;
pub mod broadcaster;
pub mod scheduler;
pub mod pack;

// Re-exports for convenience
pub use types::*;
pub use settings::{load_or_default, BmsSettings, SettingsStore, TemperatureCurve};
pub use hal::{AnalogMux, CanBus, Clock, Converter};
pub use frames::{CanFrame, ChargerCommand, ChargerStatus, PackSummary, SensorReading};
pub use ads1110::Ads1110;
pub use mux::PinMux;
pub use sampler::{AnalogSampler, Calibration, Channel, SamplerPhase, SamplerStats};
pub use fault::{FaultEvaluator, FaultThresholds, PackStatus};
pub use coulomb::{CapacityEvent, PackCoulombCounter, SensorFault};
pub use charger::{ChargeGate, ChargeProfile, ChargerFlags, ChargerNegotiator};
pub use broadcaster::{PackSnapshot, StatusBroadcaster};
pub use scheduler::{Scheduler, TickEvent, TickFlag, TickFlags};
pub use pack::{FrameOutcome, PackController, PackStats};

/// Prelude - commonly used items
pub mod prelude {
    pub use crate::types::*;
    pub use crate::settings::{load_or_default, BmsSettings, SettingsStore};
    pub use crate::hal::{AnalogMux, CanBus, Clock, Converter};
    pub use crate::frames::CanFrame;
    pub use crate::fault::PackStatus;
    pub use crate::scheduler::{Scheduler, TickEvent, TickFlags};
    pub use crate::pack::PackController;
}

// ============================================================================
// Version
// ============================================================================

/// Major version
pub const VERSION_MAJOR: u32 = 0;
/// Minor version
pub const VERSION_MINOR: u32 = 1;
/// Patch version
pub const VERSION_PATCH: u32 = 0;
/// Version string
pub const VERSION_STRING: &str = "0.1.0";

/// Get version as packed integer (major << 16 | minor << 8 | patch)
pub const fn version() -> u32 {
    (VERSION_MAJOR << 16) | (VERSION_MINOR << 8) | VERSION_PATCH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(version(), 0x000100);
        assert_eq!(VERSION_STRING, env!("CARGO_PKG_VERSION"));
    }
}
