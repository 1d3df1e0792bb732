//! Simulated pack hardware
//!
//! A crude electrical model of the pack sits behind every simulated
//! peripheral: the two converters read it through the multiplexer, the
//! charger feeds current into it and the current sensor reports on it.

use qbms::charger::ChargerFlags;
use qbms::frames::CHARGER_COMMAND_ID;
use qbms::prelude::*;
use qbms::{ChargerCommand, ChargerStatus, SensorReading};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{debug, trace, warn};

// ============================================================================
// Model Constants
// ============================================================================

/// Pack voltage gained per amp-second of charge
const VOLTS_PER_AMP_SECOND: f32 = 0.2;

/// Ambient temperature the thermistors settle to at rest
const AMBIENT_C: f32 = 25.0;

/// Temperature rise per amp at steady state
const HEATING_C_PER_AMP: f32 = 1.5;

/// Thermal time constant
const THERMAL_TAU_S: f32 = 30.0;

/// Charger status period (Elcon chargers report once a second)
pub const CHARGER_STATUS_PERIOD_MS: TimeMs = 1_000;

/// Current sensor report period
pub const SENSOR_PERIOD_MS: TimeMs = 100;

const INBOX_DEPTH: usize = 64;

// ============================================================================
// Pack Model
// ============================================================================

/// Electrical and thermal state of the simulated pack
#[derive(Debug, Clone, PartialEq)]
pub struct PackModel {
    /// Voltage across each quadrant
    pub quadrant_volts: [f32; QUADRANT_COUNT],
    /// Thermistor temperature per quadrant
    pub temperature_c: [f32; QUADRANT_COUNT],
    /// Current the charger is delivering (0.1A)
    pub charge_current: DeciAmps,
    /// Steady discharge load
    pub load_milliamps: i32,
}

/// Model shared between the simulated peripherals
pub type SharedModel = Rc<RefCell<PackModel>>;

impl PackModel {
    /// Balanced pack at `pack_voltage` (0.1V), no load
    pub fn new(pack_voltage: DeciVolts) -> Self {
        let quadrant = pack_voltage as f32 / 10.0 / QUADRANT_COUNT as f32;
        Self {
            quadrant_volts: [quadrant; QUADRANT_COUNT],
            temperature_c: [AMBIENT_C; QUADRANT_COUNT],
            charge_current: 0,
            load_milliamps: 0,
        }
    }

    pub fn shared(pack_voltage: DeciVolts) -> SharedModel {
        Rc::new(RefCell::new(Self::new(pack_voltage)))
    }

    pub fn pack_voltage(&self) -> DeciVolts {
        let volts: f32 = self.quadrant_volts.iter().sum();
        (volts * 10.0).round().clamp(0.0, u16::MAX as f32) as DeciVolts
    }

    /// Sensor convention: positive discharges
    pub fn pack_milliamps(&self) -> i32 {
        self.load_milliamps - self.charge_current as i32 * 100
    }

    /// Advance the model by `elapsed_ms`
    pub fn step(&mut self, elapsed_ms: TimeMs) {
        if elapsed_ms == 0 {
            return;
        }
        let seconds = elapsed_ms as f32 / 1_000.0;
        let amps = -(self.pack_milliamps() as f32) / 1_000.0;

        let rise = amps * seconds * VOLTS_PER_AMP_SECOND / QUADRANT_COUNT as f32;
        for volts in self.quadrant_volts.iter_mut() {
            *volts = (*volts + rise).max(0.0);
        }

        let target = AMBIENT_C + amps.abs() * HEATING_C_PER_AMP;
        let k = (seconds / THERMAL_TAU_S).min(1.0);
        for temperature in self.temperature_c.iter_mut() {
            *temperature += (target - *temperature) * k;
        }
    }
}

// ============================================================================
// Analog Front End
// ============================================================================

/// Taps currently routed by the multiplexer
#[derive(Debug, Default)]
pub struct Selection {
    voltage: Cell<usize>,
    temperature: Cell<usize>,
}

/// Multiplexer that only records the routing
#[derive(Debug)]
pub struct SimMux {
    selection: Rc<Selection>,
}

impl SimMux {
    pub fn new(selection: Rc<Selection>) -> Self {
        Self { selection }
    }
}

impl AnalogMux for SimMux {
    fn select_voltage(&mut self, quadrant: usize) -> Result<()> {
        if quadrant >= QUADRANT_COUNT {
            return Err(Error::InvalidArg);
        }
        self.selection.voltage.set(quadrant);
        Ok(())
    }

    fn select_temperature(&mut self, quadrant: usize) -> Result<()> {
        if quadrant >= QUADRANT_COUNT {
            return Err(Error::InvalidArg);
        }
        self.selection.temperature.set(quadrant);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Tap {
    Voltage,
    Temperature,
}

/// Converter reading the model through the multiplexer
///
/// The input is latched when the conversion starts; the result can be read
/// once.
pub struct SimConverter {
    tap: Tap,
    model: SharedModel,
    selection: Rc<Selection>,
    settings: BmsSettings,
    rng: StdRng,
    noise: i16,
    pending: Option<i16>,
}

impl SimConverter {
    /// Voltage converter, inverting the configured multipliers
    pub fn voltage(settings: &BmsSettings, model: SharedModel, selection: Rc<Selection>, seed: u64) -> Self {
        Self::build(Tap::Voltage, settings, model, selection, seed)
    }

    /// Thermistor converter, inverting the linear part of each curve
    pub fn temperature(settings: &BmsSettings, model: SharedModel, selection: Rc<Selection>, seed: u64) -> Self {
        Self::build(Tap::Temperature, settings, model, selection, seed)
    }

    fn build(tap: Tap, settings: &BmsSettings, model: SharedModel, selection: Rc<Selection>, seed: u64) -> Self {
        Self {
            tap,
            model,
            selection,
            settings: *settings,
            rng: StdRng::seed_from_u64(seed),
            noise: 0,
            pending: None,
        }
    }

    /// Add up to +/- `lsb` of uniform noise to every conversion
    pub fn with_noise(mut self, lsb: i16) -> Self {
        self.noise = lsb.max(0);
        self
    }

    fn ideal_raw(&self) -> f32 {
        let model = self.model.borrow();
        match self.tap {
            Tap::Voltage => {
                let quadrant = self.selection.voltage.get();
                let multiplier = self.settings.voltage_multiplier[quadrant];
                if multiplier == 0.0 {
                    return 0.0;
                }
                model.quadrant_volts[quadrant] / multiplier
            }
            Tap::Temperature => {
                let quadrant = self.selection.temperature.get();
                let curve = &self.settings.temperature_curve[quadrant];
                if curve.c == 0.0 || curve.adc_to_volts == 0.0 {
                    return 0.0;
                }
                (model.temperature_c[quadrant] - curve.d) / curve.c / curve.adc_to_volts
            }
        }
    }
}

impl Converter for SimConverter {
    fn start_conversion(&mut self) -> Result<()> {
        let mut raw = self.ideal_raw().round();
        if self.noise > 0 {
            raw += self.rng.gen_range(-self.noise..=self.noise) as f32;
        }
        self.pending = Some(raw.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<i16>> {
        Ok(self.pending.take())
    }
}

// ============================================================================
// CAN Bus
// ============================================================================

/// Bus shared with a simulated charger and current sensor
pub struct SimBus {
    model: SharedModel,
    inbox: VecDeque<CanFrame>,
    sensor_address: u32,
    charger_flags: ChargerFlags,
    next_status_ms: TimeMs,
    next_sensor_ms: TimeMs,
    last_command: Option<ChargerCommand>,
    transmitted: u32,
    commands: u32,
}

impl SimBus {
    /// Sensor frames go to `sensor_address`; 0 means no sensor fitted
    pub fn new(model: SharedModel, sensor_address: u32) -> Self {
        Self {
            model,
            inbox: VecDeque::with_capacity(INBOX_DEPTH),
            sensor_address,
            charger_flags: ChargerFlags::empty(),
            next_status_ms: CHARGER_STATUS_PERIOD_MS,
            next_sensor_ms: SENSOR_PERIOD_MS,
            last_command: None,
            transmitted: 0,
            commands: 0,
        }
    }

    /// Let the peripherals talk; call once per simulation step
    pub fn step(&mut self, now_ms: TimeMs) {
        if now_ms >= self.next_status_ms {
            self.next_status_ms = now_ms + CHARGER_STATUS_PERIOD_MS;
            let status = {
                let model = self.model.borrow();
                ChargerStatus {
                    output_voltage: model.pack_voltage(),
                    output_current: model.charge_current,
                    flags: self.charger_flags,
                }
            };
            trace!("Charger reports {:?}", status);
            self.deliver(status.encode());
        }

        if self.sensor_address != 0 && now_ms >= self.next_sensor_ms {
            self.next_sensor_ms = now_ms + SENSOR_PERIOD_MS;
            let reading = SensorReading {
                milliamps: self.model.borrow().pack_milliamps(),
                status: 0,
            };
            match reading.encode(self.sensor_address) {
                Ok(frame) => self.deliver(frame),
                Err(e) => warn!("Sensor frame not built: {}", e),
            }
        }
    }

    /// Conditions the charger reports from now on
    pub fn set_charger_flags(&mut self, flags: ChargerFlags) {
        self.charger_flags = flags;
    }

    pub fn last_command(&self) -> Option<ChargerCommand> {
        self.last_command
    }

    /// (frames transmitted by the BMS, charger commands among them)
    pub fn counts(&self) -> (u32, u32) {
        (self.transmitted, self.commands)
    }

    fn deliver(&mut self, frame: CanFrame) {
        if self.inbox.len() >= INBOX_DEPTH {
            self.inbox.pop_front();
            debug!("Simulated inbox overflow");
        }
        self.inbox.push_back(frame);
    }

    fn on_command(&mut self, command: ChargerCommand) {
        let mut model = self.model.borrow_mut();
        let current = if command.enable && model.pack_voltage() < command.voltage {
            command.current
        } else {
            0
        };
        if current != model.charge_current {
            debug!("Charger output {} -> {} (0.1A)", model.charge_current, current);
        }
        model.charge_current = current;
        self.last_command = Some(command);
    }
}

impl CanBus for SimBus {
    fn transmit(&mut self, frame: &CanFrame) -> Result<()> {
        self.transmitted = self.transmitted.wrapping_add(1);
        if frame.raw_id() == CHARGER_COMMAND_ID {
            let command = ChargerCommand::decode(frame)?;
            self.commands = self.commands.wrapping_add(1);
            self.on_command(command);
        }
        Ok(())
    }

    fn receive(&mut self) -> Option<CanFrame> {
        self.inbox.pop_front()
    }
}
