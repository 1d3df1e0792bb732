//! End-to-end scenarios through the pack controller
//!
//! Each test wires a full controller to scripted converters and a
//! recording bus, then drives it only through scheduler events and
//! received frames.

use embedded_can::Frame;
use qbms::charger::ChargerFlags;
use qbms::frames::{self, CHARGER_COMMAND_ID};
use qbms::hal::mock::{RecordingBus, RecordingMux};
use qbms::prelude::*;
use qbms::{CapacityEvent, ChargerCommand, ChargerStatus, FrameOutcome, PackSummary, SensorReading};

// ============================================================================
// Fixtures
// ============================================================================

/// Converter that reports a fixed value per channel, in channel order
struct ChannelConverter {
    values: [i16; QUADRANT_COUNT],
    next: usize,
}

impl ChannelConverter {
    fn new(values: [i16; QUADRANT_COUNT]) -> Self {
        Self { values, next: 0 }
    }
}

impl Converter for ChannelConverter {
    fn start_conversion(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self) -> Result<Option<i16>> {
        let value = self.values[self.next];
        self.next = (self.next + 1) % QUADRANT_COUNT;
        Ok(Some(value))
    }
}

type TestPack = PackController<ChannelConverter, ChannelConverter, RecordingMux>;

/// Millivolt-scaled voltage channels, 50C on every thermistor
fn pack_with(settings: BmsSettings, quadrant_mv: [i16; QUADRANT_COUNT]) -> TestPack {
    let settings = BmsSettings {
        voltage_multiplier: [0.001; QUADRANT_COUNT],
        ..settings
    };
    PackController::new(
        settings,
        ChannelConverter::new(quadrant_mv),
        ChannelConverter::new([16_000; QUADRANT_COUNT]),
        RecordingMux::default(),
    )
}

fn run_sampling_cycle(pack: &mut TestPack, bus: &mut RecordingBus) {
    // four passes of five phases
    for _ in 0..20 {
        pack.on_event(TickEvent::Sample, bus).unwrap();
    }
}

fn charger_status(volts: DeciVolts) -> CanFrame {
    ChargerStatus {
        output_voltage: volts,
        output_current: 0,
        flags: ChargerFlags::empty(),
    }
    .encode()
}

fn sensor_frame(milliamps: i32) -> CanFrame {
    SensorReading { milliamps, status: 0 }.encode(0x3C0).unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn overvoltage_quadrant_blocks_charging() {
    let settings = BmsSettings {
        low_threshold_mv: 3_000,
        high_threshold_mv: 4_200,
        cell_count: [24; QUADRANT_COUNT],
        current_pack_capacity: 1_000,
        ..BmsSettings::default()
    };
    let mut pack = pack_with(settings, [4_000, 4_000, 4_300, 4_000]);
    let mut bus = RecordingBus::new();

    run_sampling_cycle(&mut pack, &mut bus);

    let status = pack.status();
    assert!(status.contains(PackStatus::HIGH_VOLTAGE));
    assert!(status.contains(PackStatus::GENERAL_FAULT));
    assert!(!status.contains(PackStatus::IMBALANCE));
    assert!(!status.charge_permitted());
    assert!(status.discharge_permitted());

    for volts in [3_000, 3_500, 3_900] {
        let outcome = pack.on_frame(&charger_status(volts), &mut bus, 0).unwrap();
        assert_eq!(outcome, FrameOutcome::ChargerCommand(ChargerCommand::cease(3984)));
    }

    let commands: Vec<_> = bus
        .sent()
        .iter()
        .filter(|f| f.raw_id() == CHARGER_COMMAND_ID)
        .collect();
    assert_eq!(commands.len(), 3);
    for frame in commands {
        assert!(frame.is_extended());
        assert_eq!(&frame.data()[2..5], &[0, 0, 1]);
    }
}

#[test]
fn charging_current_pack_capped_and_reported_once() {
    let max = BmsSettings::default().max_pack_capacity;
    let settings = BmsSettings {
        current_pack_capacity: max - 100,
        ..BmsSettings::default()
    };
    let mut pack = pack_with(settings, [4_000; QUADRANT_COUNT]);
    let mut bus = RecordingBus::new();

    let mut full_reports = 0;
    for step in 0..=10u32 {
        let outcome = pack.on_frame(&sensor_frame(-5_000), &mut bus, step * 100).unwrap();
        if outcome == FrameOutcome::CurrentSample(Some(CapacityEvent::PackFull)) {
            full_reports += 1;
        }
    }

    assert_eq!(full_reports, 1);
    assert_eq!(pack.counter().remaining(), max);
    assert_eq!(pack.snapshot().soc, 255);
    assert_eq!(pack.counter().milliamps(), -5_000);
}

#[test]
fn healthy_pack_charges_with_taper() {
    let settings = BmsSettings {
        low_threshold_mv: 3_000,
        high_threshold_mv: 4_200,
        current_pack_capacity: 1_000,
        ..BmsSettings::default()
    };
    let mut pack = pack_with(settings, [4_000; QUADRANT_COUNT]);
    let mut bus = RecordingBus::new();
    run_sampling_cycle(&mut pack, &mut bus);
    assert!(pack.status().charge_permitted());

    let outcome = pack.on_frame(&charger_status(3_000), &mut bus, 0).unwrap();
    assert_eq!(outcome, FrameOutcome::ChargerCommand(ChargerCommand::charge(3984, 100)));

    // 25 decivolts short: halfway down the taper
    let outcome = pack.on_frame(&charger_status(3_959), &mut bus, 0).unwrap();
    assert_eq!(outcome, FrameOutcome::ChargerCommand(ChargerCommand::charge(3984, 55)));

    // target reached: cease and stay off until the output sags
    let outcome = pack.on_frame(&charger_status(3_984), &mut bus, 0).unwrap();
    assert_eq!(outcome, FrameOutcome::ChargerCommand(ChargerCommand::cease(3984)));
    let outcome = pack.on_frame(&charger_status(3_959), &mut bus, 0).unwrap();
    assert_eq!(outcome, FrameOutcome::ChargerCommand(ChargerCommand::cease(3984)));
}

#[test]
fn sensor_fault_does_not_move_capacity() {
    let settings = BmsSettings {
        current_pack_capacity: 500_000,
        ..BmsSettings::default()
    };
    let mut pack = pack_with(settings, [4_000; QUADRANT_COUNT]);
    let mut bus = RecordingBus::new();

    pack.on_frame(&sensor_frame(36_000), &mut bus, 0).unwrap();
    let faulted = SensorReading {
        milliamps: 36_000,
        status: (0x43 << 1) | 1,
    }
    .encode(0x3C0)
    .unwrap();
    pack.on_frame(&faulted, &mut bus, 1_000).unwrap();
    assert_eq!(pack.counter().remaining(), 500_000);

    pack.on_frame(&sensor_frame(36_000), &mut bus, 1_000).unwrap();
    assert_eq!(pack.counter().remaining(), 400_000);
}

#[test]
fn scheduled_run_emits_status_frames() {
    let settings = BmsSettings {
        low_threshold_mv: 3_000,
        high_threshold_mv: 4_200,
        ..BmsSettings::default()
    };
    let mut pack = pack_with(settings, [4_000; QUADRANT_COUNT]);
    let mut scheduler = Scheduler::new();
    let mut bus = RecordingBus::new();

    // two seconds in 10ms steps
    for step in 1..=200u64 {
        scheduler.poll(step * 10_000);
        while let Some(event) = scheduler.next_event() {
            pack.on_event(event, &mut bus).unwrap();
        }
    }

    let count = |id: u32| bus.sent().iter().filter(|f| f.raw_id() == id).count();
    assert_eq!(count(0x650), 20);
    assert_eq!(count(0x651), 4);
    assert_eq!(count(0x652), 4);
    assert_eq!(count(0x653), 4);

    // 25 sampler ticks: one full four-channel cycle plus a pass
    assert_eq!(pack.evaluator().passes(), 1);

    let last_summary = bus
        .sent()
        .iter()
        .rev()
        .find(|f| f.raw_id() == 0x650)
        .unwrap();
    let summary = PackSummary::from_payload(last_summary.data()).unwrap();
    assert_eq!(summary.voltage_cv, 1_600);
    assert_eq!(summary.status, (PackStatus::CHARGE_OK | PackStatus::DISCHARGE_OK).bits());

    let temperatures = bus.sent().iter().rev().find(|f| f.raw_id() == 0x653).unwrap();
    assert_eq!(frames::decode_signed_words(temperatures.data()), Ok([500; QUADRANT_COUNT]));
}

#[test]
fn control_frame_resets_soc_over_the_bus() {
    let settings = BmsSettings {
        current_pack_capacity: 0,
        ..BmsSettings::default()
    };
    let mut pack = pack_with(settings, [4_000; QUADRANT_COUNT]);
    let mut bus = RecordingBus::new();
    assert_eq!(pack.snapshot().soc, 0);

    bus.inject(CanFrame::with_address(0x660, &[0xA5, 0, 0, 0, 0, 0, 0, 0]).unwrap());
    bus.inject(sensor_frame(1_000));
    assert_eq!(pack.poll_bus(&mut bus, 0), 2);
    assert_eq!(pack.snapshot().soc, 255);
    assert_eq!(pack.settings_to_persist().current_pack_capacity, pack.counter().max());
}
