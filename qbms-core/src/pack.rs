//! QBMS - Pack controller
//!
//! Owns one instance of every component and routes work between them:
//!
//! ```text
//! TickEvent::Sample ──> AnalogSampler ──(full cycle)──> FaultEvaluator
//!                                                            │ CHARGE_OK
//! charger status ───────────────────────────────────> ChargerNegotiator ──> command
//!                                                            ▲ has room
//! current sensor ───────────────────────────────────> PackCoulombCounter
//!
//! TickEvent::{PackSummary, ...} ──> StatusBroadcaster (snapshot of all)
//! ```
//!
//! Settings replacements are staged and applied right after a fault
//! evaluation, so a cycle never mixes two configurations.

use crate::broadcaster::{PackSnapshot, StatusBroadcaster};
use crate::charger::{ChargeGate, ChargeProfile, ChargerNegotiator};
use crate::coulomb::{CapacityEvent, PackCoulombCounter};
use crate::fault::{FaultEvaluator, PackStatus};
use crate::frames::{self, CanFrame, ChargerCommand, ChargerStatus, SensorReading};
use crate::hal::{AnalogMux, CanBus, Converter};
use crate::sampler::{AnalogSampler, Calibration};
use crate::scheduler::TickEvent;
use crate::settings::BmsSettings;
use crate::types::*;
use tracing::{debug, info, trace, warn};

/// What an inbound frame turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Charger status answered with this command
    ChargerCommand(ChargerCommand),
    /// Current sample integrated (with a clamp event, if one fired)
    CurrentSample(Option<CapacityEvent>),
    /// Capacity reset to full
    CapacityReset,
    /// Not addressed to us
    Ignored,
}

/// Controller counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    /// Events handled
    pub events: u32,
    /// Fault evaluations run
    pub evaluations: u32,
    /// Frames received
    pub frames_in: u32,
    /// Frames that could not be decoded
    pub malformed: u32,
    /// Settings replacements applied
    pub settings_applied: u32,
}

// ============================================================================
// Pack Controller
// ============================================================================

/// The battery management core
pub struct PackController<V, T, M> {
    settings: BmsSettings,
    staged: Option<BmsSettings>,

    sampler: AnalogSampler<V, T, M>,
    evaluator: FaultEvaluator,
    counter: PackCoulombCounter,
    charger: ChargerNegotiator,
    broadcaster: StatusBroadcaster,

    stats: PackStats,
}

impl<V: Converter, T: Converter, M: AnalogMux> PackController<V, T, M> {
    /// Wire up all components from a settings snapshot
    ///
    /// The snapshot is sanitized first; a multiplexer that fails to
    /// initialise is logged and sampling carries on.
    pub fn new(settings: BmsSettings, voltage_adc: V, temperature_adc: T, mux: M) -> Self {
        let mut settings = settings;
        let fixed = settings.sanitize();
        if fixed > 0 {
            warn!("{} settings corrected at startup", fixed);
        }

        let mut sampler = AnalogSampler::new(
            voltage_adc,
            temperature_adc,
            mux,
            Calibration::from_settings(&settings),
        );
        if let Err(e) = sampler.init() {
            warn!("Multiplexer init failed: {}", e);
        }

        info!(
            "Pack controller up: base {:#x}, control {:#x}, sensor {:#x}",
            settings.base_address, settings.control_address, settings.current_sensor_address
        );

        Self {
            sampler,
            evaluator: FaultEvaluator::new(),
            counter: PackCoulombCounter::new(settings.max_pack_capacity, settings.current_pack_capacity),
            charger: ChargerNegotiator::new(ChargeProfile::from_settings(&settings)),
            broadcaster: StatusBroadcaster::new(settings.base_address),
            settings,
            staged: None,
            stats: PackStats::default(),
        }
    }

    // ========================================================================
    // Event Handling
    // ========================================================================

    /// Handle one scheduler event
    pub fn on_event<B: CanBus>(&mut self, event: TickEvent, bus: &mut B) -> Result<()> {
        self.stats.events = self.stats.events.wrapping_add(1);

        match event {
            TickEvent::Sample => {
                if let Some(readings) = self.sampler.tick() {
                    let status = self.evaluator.run(&readings, &self.settings.thresholds());
                    self.stats.evaluations = self.stats.evaluations.wrapping_add(1);
                    trace!("Pack status {:#04x}", status.bits());
                    self.apply_staged();
                }
                Ok(())
            }
            _ => {
                if !self.settings.can_enabled {
                    return Ok(());
                }
                let snapshot = self.snapshot();
                self.broadcaster.broadcast(event, &snapshot, bus).map(|_| ())
            }
        }
    }

    /// Handle one received frame at `now_ms`
    pub fn on_frame<B: CanBus>(&mut self, frame: &CanFrame, bus: &mut B, now_ms: TimeMs) -> Result<FrameOutcome> {
        self.stats.frames_in = self.stats.frames_in.wrapping_add(1);
        if !self.settings.can_enabled {
            return Ok(FrameOutcome::Ignored);
        }

        let result = self.route(frame, bus, now_ms);
        if let Err(Error::MalformedFrame) = result {
            debug!("Malformed frame on {:#x}", frame.raw_id());
            self.stats.malformed = self.stats.malformed.wrapping_add(1);
        }
        result
    }

    fn route<B: CanBus>(&mut self, frame: &CanFrame, bus: &mut B, now_ms: TimeMs) -> Result<FrameOutcome> {
        if frame.matches(frames::CHARGER_STATUS_ID) {
            let status = ChargerStatus::decode(frame)?;
            let gate = ChargeGate {
                charge_permitted: self.evaluator.status().charge_permitted(),
                has_room: self.counter.has_room(),
            };
            let command = self.charger.on_status(&status, gate);
            bus.transmit(&command.encode())?;
            return Ok(FrameOutcome::ChargerCommand(command));
        }

        if self.settings.current_sensor_enabled() && frame.matches(self.settings.current_sensor_address) {
            let reading = SensorReading::decode(frame)?;
            let event = self.counter.on_sample(&reading, now_ms);
            return Ok(FrameOutcome::CurrentSample(event));
        }

        if frame.matches(self.settings.control_address) && frames::is_reset_request(frame) {
            self.counter.reset_to_full();
            return Ok(FrameOutcome::CapacityReset);
        }

        Ok(FrameOutcome::Ignored)
    }

    /// Drain the receive queue
    ///
    /// Errors on individual frames are logged; returns the frames handled.
    pub fn poll_bus<B: CanBus>(&mut self, bus: &mut B, now_ms: TimeMs) -> usize {
        let mut handled = 0;
        while let Some(frame) = bus.receive() {
            if let Err(e) = self.on_frame(&frame, bus, now_ms) {
                warn!("Frame {:#x} dropped: {}", frame.raw_id(), e);
            }
            handled += 1;
        }
        handled
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Queue a settings replacement for the next evaluation boundary
    pub fn stage_settings(&mut self, settings: BmsSettings) {
        let mut settings = settings;
        settings.sanitize();
        self.staged = Some(settings);
    }

    fn apply_staged(&mut self) {
        let Some(next) = self.staged.take() else {
            return;
        };
        self.sampler.set_calibration(Calibration::from_settings(&next));
        self.charger.set_profile(ChargeProfile::from_settings(&next));
        self.broadcaster.set_base_address(next.base_address);
        self.counter.set_max(next.max_pack_capacity);
        self.settings = next;
        self.stats.settings_applied = self.stats.settings_applied.wrapping_add(1);
        info!("New settings applied");
    }

    /// Active settings
    pub fn settings(&self) -> &BmsSettings {
        &self.settings
    }

    /// Active settings with the live remaining capacity, ready to persist
    pub fn settings_to_persist(&self) -> BmsSettings {
        BmsSettings {
            current_pack_capacity: self.counter.remaining(),
            ..self.settings
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Current pack status
    pub fn status(&self) -> PackStatus {
        self.evaluator.status()
    }

    /// Snapshot for telemetry
    pub fn snapshot(&self) -> PackSnapshot {
        PackSnapshot {
            readings: self.sampler.readings(),
            milliamps: self.counter.milliamps(),
            soc: self.counter.soc(),
            status: self.evaluator.status(),
        }
    }

    /// Sampler
    pub fn sampler(&self) -> &AnalogSampler<V, T, M> {
        &self.sampler
    }

    /// Fault evaluator
    pub fn evaluator(&self) -> &FaultEvaluator {
        &self.evaluator
    }

    /// Coulomb counter
    pub fn counter(&self) -> &PackCoulombCounter {
        &self.counter
    }

    /// Charger session
    pub fn charger(&self) -> &ChargerNegotiator {
        &self.charger
    }

    /// Status broadcaster
    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.broadcaster
    }

    /// Counters
    pub fn stats(&self) -> PackStats {
        self.stats
    }
}
