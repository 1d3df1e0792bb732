//! QBMS - Charger negotiation
//!
//! The charger drives the exchange: it broadcasts a status message about
//! once a second and every one of them is answered with exactly one
//! command. Nothing is ever sent unprompted, so when the charger goes
//! quiet the BMS goes quiet too.
//!
//! Near the target voltage the requested current tapers linearly from the
//! configured current down to a tenth of it:
//!
//! ```text
//! current
//!   ^
//! I |__________________
//!   |                  \
//!   |                   \
//! I/10                   \___
//!   +----------------+----+--> shortfall (0.1V)
//!                   50    0
//! ```

use crate::frames::{ChargerCommand, ChargerStatus};
use crate::settings::BmsSettings;
use crate::types::*;
use bitflags::bitflags;
use tracing::{debug, error};

/// Shortfall below target (0.1V) where the current taper starts
pub const TAPER_BAND: DeciVolts = 50;

/// Floor current is the configured current divided by this
pub const TAPER_FLOOR_DIVISOR: DeciAmps = 10;

bitflags! {
    /// Charger condition flags (status byte 4, low five bits)
    pub struct ChargerFlags: u8 {
        /// Charger hardware failure
        const HARDWARE_FAILURE = 1 << 0;
        /// Charger over temperature
        const OVER_TEMPERATURE = 1 << 1;
        /// AC input voltage out of range
        const BAD_INPUT_VOLTAGE = 1 << 2;
        /// No battery detected or battery connected in reverse
        const NO_BATTERY = 1 << 3;
        /// No command received in time
        const COMMUNICATION_TIMEOUT = 1 << 4;
    }
}

impl ChargerFlags {
    /// Log every set flag as its named condition
    pub fn log_conditions(&self) {
        if self.contains(Self::HARDWARE_FAILURE) {
            error!("Charger: hardware failure!");
        }
        if self.contains(Self::OVER_TEMPERATURE) {
            error!("Charger: too hot!");
        }
        if self.contains(Self::BAD_INPUT_VOLTAGE) {
            error!("Charger: wrong input voltage at AC plug!");
        }
        if self.contains(Self::NO_BATTERY) {
            error!("Charger: no battery or reverse polarity, not charging!");
        }
        if self.contains(Self::COMMUNICATION_TIMEOUT) {
            error!("Charger: communication timeout!");
        }
    }
}

impl Default for ChargerFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Charger parameters copied out of the settings record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeProfile {
    /// Target output voltage
    pub voltage: DeciVolts,
    /// Full charging current
    pub current: DeciAmps,
    /// Sag below target that re-arms charging
    pub rearm_margin: DeciVolts,
}

impl ChargeProfile {
    /// Extract the charge profile from a settings snapshot
    pub fn from_settings(settings: &BmsSettings) -> Self {
        Self {
            voltage: settings.charging_voltage,
            current: settings.charging_current,
            rearm_margin: settings.charger_rearm_margin,
        }
    }
}

/// Pack state the negotiator needs for each decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeGate {
    /// Fault evaluation permits charging
    pub charge_permitted: bool,
    /// Coulomb counter is below full
    pub has_room: bool,
}

/// Tapered current for a given shortfall below target
///
/// Full current outside the taper band; inside it
/// `floor + floor * 9 * shortfall / band`, never above the full current.
pub fn taper_current(current: DeciAmps, shortfall: i32) -> DeciAmps {
    if shortfall > TAPER_BAND as i32 {
        return current;
    }

    let floor = current / TAPER_FLOOR_DIVISOR;
    let fraction = Fixed::from_num(shortfall.max(0)) / Fixed::from_num(TAPER_BAND);
    let boost = Fixed::from_num(floor) * fraction * Fixed::from_num(9);
    let target: i64 = (Fixed::from_num(floor) + boost).to_num();

    target.clamp(floor as i64, current as i64) as DeciAmps
}

// ============================================================================
// Negotiator
// ============================================================================

/// Charger session state
#[derive(Debug, Clone)]
pub struct ChargerNegotiator {
    profile: ChargeProfile,
    wants_charging: bool,
    output_voltage: DeciVolts,
    output_current: DeciAmps,
    flags: ChargerFlags,
    responses: u32,
}

impl ChargerNegotiator {
    /// New session; charging is wanted until something says otherwise
    pub fn new(profile: ChargeProfile) -> Self {
        Self {
            profile,
            wants_charging: true,
            output_voltage: 0,
            output_current: 0,
            flags: ChargerFlags::empty(),
            responses: 0,
        }
    }

    /// Record a charger status message and compute the reply
    pub fn on_status(&mut self, status: &ChargerStatus, gate: ChargeGate) -> ChargerCommand {
        debug!(
            "Charger status: {}dV {}dA flags {:#04x}",
            status.output_voltage,
            status.output_current,
            status.flags.bits()
        );
        self.output_voltage = status.output_voltage;
        self.output_current = status.output_current;
        self.flags = status.flags;
        self.flags.log_conditions();

        let rearm_below = self.profile.voltage.saturating_sub(self.profile.rearm_margin);
        if self.flags.is_empty() && self.output_voltage < rearm_below {
            self.wants_charging = true;
        }

        self.respond(gate)
    }

    fn respond(&mut self, gate: ChargeGate) -> ChargerCommand {
        self.responses = self.responses.wrapping_add(1);

        let shortfall = self.profile.voltage as i32 - self.output_voltage as i32;
        let target = taper_current(self.profile.current, shortfall);

        if shortfall <= 0 {
            self.wants_charging = false;
        }
        if !gate.charge_permitted {
            self.wants_charging = false;
        }

        if self.flags.is_empty() && gate.has_room && self.wants_charging {
            debug!("Charger: continue at {}dV {}dA", self.profile.voltage, target);
            ChargerCommand::charge(self.profile.voltage, target)
        } else {
            debug!("Charger: cease");
            ChargerCommand::cease(self.profile.voltage)
        }
    }

    /// Replace the charge profile (between evaluation cycles)
    pub fn set_profile(&mut self, profile: ChargeProfile) {
        self.profile = profile;
    }

    /// Charge profile in use
    pub fn profile(&self) -> &ChargeProfile {
        &self.profile
    }

    /// Charging latch
    pub fn wants_charging(&self) -> bool {
        self.wants_charging
    }

    /// Last reported output voltage
    pub fn output_voltage(&self) -> DeciVolts {
        self.output_voltage
    }

    /// Last reported output current
    pub fn output_current(&self) -> DeciAmps {
        self.output_current
    }

    /// Last reported condition flags
    pub fn flags(&self) -> ChargerFlags {
        self.flags
    }

    /// Commands issued so far
    pub fn responses(&self) -> u32 {
        self.responses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN: ChargeGate = ChargeGate {
        charge_permitted: true,
        has_room: true,
    };

    fn profile() -> ChargeProfile {
        ChargeProfile {
            voltage: 3984,
            current: 100,
            rearm_margin: 350,
        }
    }

    fn status(output_voltage: DeciVolts, flags: ChargerFlags) -> ChargerStatus {
        ChargerStatus {
            output_voltage,
            output_current: 0,
            flags,
        }
    }

    #[test]
    fn test_taper_shape() {
        assert_eq!(taper_current(100, 200), 100);
        assert_eq!(taper_current(100, 51), 100);
        assert_eq!(taper_current(100, 50), 100);
        assert_eq!(taper_current(100, 25), 55);
        assert_eq!(taper_current(100, 0), 10);
        assert_eq!(taper_current(100, -20), 10);
    }

    #[test]
    fn test_far_from_target_charges_full_current() {
        let mut charger = ChargerNegotiator::new(profile());
        let command = charger.on_status(&status(3_500, ChargerFlags::empty()), OPEN);
        assert_eq!(command, ChargerCommand::charge(3984, 100));
    }

    #[test]
    fn test_target_reached_stops() {
        let mut charger = ChargerNegotiator::new(profile());
        let command = charger.on_status(&status(3_984, ChargerFlags::empty()), OPEN);
        assert_eq!(command, ChargerCommand::cease(3984));
        assert!(!charger.wants_charging());

        // still above the re-arm point: stays off
        let command = charger.on_status(&status(3_900, ChargerFlags::empty()), OPEN);
        assert!(!command.enable);

        // sagged more than the margin: re-armed
        let command = charger.on_status(&status(3_600, ChargerFlags::empty()), OPEN);
        assert_eq!(command, ChargerCommand::charge(3984, 100));
    }

    #[test]
    fn test_charge_not_permitted_stops() {
        let mut charger = ChargerNegotiator::new(profile());
        let gate = ChargeGate {
            charge_permitted: false,
            has_room: true,
        };
        let command = charger.on_status(&status(3_500, ChargerFlags::empty()), gate);
        assert_eq!(command.current, 0);
        assert!(!command.enable);
        assert!(!charger.wants_charging());
    }

    #[test]
    fn test_full_pack_stops_without_clearing_latch() {
        let mut charger = ChargerNegotiator::new(profile());
        let gate = ChargeGate {
            charge_permitted: true,
            has_room: false,
        };
        let command = charger.on_status(&status(3_500, ChargerFlags::empty()), gate);
        assert!(!command.enable);
        assert!(charger.wants_charging());
    }

    #[test]
    fn test_flags_stop_charging() {
        let mut charger = ChargerNegotiator::new(profile());
        let command = charger.on_status(&status(3_500, ChargerFlags::OVER_TEMPERATURE), OPEN);
        assert_eq!(command, ChargerCommand::cease(3984));
        assert_eq!(charger.flags(), ChargerFlags::OVER_TEMPERATURE);
    }

    #[test]
    fn test_every_status_answered() {
        let mut charger = ChargerNegotiator::new(profile());
        for v in [3_000, 3_984, 4_100, 3_950] {
            charger.on_status(&status(v, ChargerFlags::empty()), OPEN);
        }
        assert_eq!(charger.responses(), 4);
    }
}
