//! QBMS Node - host simulation
//!
//! Runs the complete pack pipeline (sampling, fault evaluation, coulomb
//! counting, charger negotiation and telemetry) against simulated
//! hardware, on a simulated clock.

mod config;
mod sim;

use clap::Parser;
use config::{JsonFileStore, NodeError};
use qbms::charger::ChargerFlags;
use qbms::hal::mock::ManualClock;
use qbms::prelude::{
    load_or_default, BmsSettings, Clock, DeciVolts, PackController, PackStatus, Scheduler, TimeMs,
};
use sim::{PackModel, Selection, SimBus, SimConverter, SimMux};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

/// Main loop granularity
const STEP_US: u64 = 10_000;

/// Progress report period
const REPORT_PERIOD_MS: TimeMs = 5_000;

/// Converter noise in LSB
const ADC_NOISE_LSB: i16 = 4;

/// QBMS battery management node (simulated hardware)
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings record (JSON); created on exit if missing
    #[arg(short, long, default_value = "qbms-settings.json")]
    settings: PathBuf,

    /// Log level (trace, debug, info, warn, error, off); defaults to the
    /// level stored in the settings record
    #[arg(short, long)]
    log_level: Option<String>,

    /// Simulated run time in milliseconds
    #[arg(short, long, default_value = "60000")]
    duration_ms: TimeMs,

    /// Initial pack voltage in 0.1V
    #[arg(short, long, default_value = "3600")]
    charge_start_decivolts: DeciVolts,

    /// Seed for converter noise
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Fault bits the simulated charger reports (0x01 hardware, 0x02 over
    /// temperature, 0x04 input voltage, 0x08 no battery, 0x10 timeout)
    #[arg(long, default_value = "0", value_parser = clap::value_parser!(u8).range(0..0x20))]
    charger_flags: u8,
}

/// Where a run ended up
#[derive(Debug)]
struct RunSummary {
    settings: BmsSettings,
    status: PackStatus,
    soc: u8,
    pack_voltage: DeciVolts,
    frames_sent: u32,
    commands: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut store = JsonFileStore::new(&args.settings);

    // Setup logging
    let level = match args.log_level.as_deref() {
        Some(name) => level_from_name(name),
        None => store
            .read_record()
            .map(|stored| level_from_settings(stored.log_level))
            .unwrap_or(LevelFilter::INFO),
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("QBMS node starting (v{})", qbms::VERSION_STRING);

    let settings = load_or_default(&mut store);
    let summary = run(&args, settings)?;

    info!(
        "Finished after {}ms: pack {}.{}V, SOC {}/255, status {:#04x}, {} frames sent ({} charger commands)",
        args.duration_ms,
        summary.pack_voltage / 10,
        summary.pack_voltage % 10,
        summary.soc,
        summary.status.bits(),
        summary.frames_sent,
        summary.commands
    );

    store.write_record(&summary.settings)?;
    info!("Settings saved to {}", store.path().display());
    Ok(())
}

fn run(args: &Args, settings: BmsSettings) -> Result<RunSummary, NodeError> {
    let model = PackModel::shared(args.charge_start_decivolts);
    let selection = Rc::new(Selection::default());

    let voltage_adc = SimConverter::voltage(&settings, model.clone(), selection.clone(), args.seed)
        .with_noise(ADC_NOISE_LSB);
    let temperature_adc =
        SimConverter::temperature(&settings, model.clone(), selection.clone(), args.seed.wrapping_add(1))
            .with_noise(ADC_NOISE_LSB);
    let mux = SimMux::new(selection);

    let mut pack = PackController::new(settings, voltage_adc, temperature_adc, mux);
    let mut bus = SimBus::new(model.clone(), pack.settings().current_sensor_address);
    let charger_flags = ChargerFlags::from_bits_truncate(args.charger_flags);
    if !charger_flags.is_empty() {
        info!("Simulated charger reports {:?}", charger_flags);
    }
    bus.set_charger_flags(charger_flags);
    let mut scheduler = Scheduler::new();
    let clock = ManualClock::new();

    let mut last_ms: TimeMs = 0;
    let mut next_report_ms = REPORT_PERIOD_MS;

    while clock.time_ms() < args.duration_ms {
        clock.advance_us(STEP_US);
        let now_ms = clock.time_ms();

        model.borrow_mut().step(now_ms.wrapping_sub(last_ms));
        last_ms = now_ms;
        bus.step(now_ms);

        scheduler.poll(clock.time_us());
        while let Some(event) = scheduler.next_event() {
            if let Err(e) = pack.on_event(event, &mut bus) {
                warn!("{:?} failed: {}", event, e);
            }
        }
        pack.poll_bus(&mut bus, now_ms);

        if now_ms >= next_report_ms {
            next_report_ms += REPORT_PERIOD_MS;
            let snapshot = pack.snapshot();
            info!(
                "t={}ms pack {}mV {}mA SOC {} status {:#04x} charger {}",
                now_ms,
                snapshot.pack_voltage_mv(),
                snapshot.milliamps,
                snapshot.soc,
                snapshot.status.bits(),
                if pack.charger().wants_charging() { "on" } else { "off" }
            );
        }
    }

    if scheduler.dropped() > 0 {
        warn!("{} scheduler events dropped", scheduler.dropped());
    }

    let (frames_sent, commands) = bus.counts();
    let pack_voltage = model.borrow().pack_voltage();
    Ok(RunSummary {
        settings: pack.settings_to_persist(),
        status: pack.status(),
        soc: pack.snapshot().soc,
        pack_voltage,
        frames_sent,
        commands,
    })
}

fn level_from_name(name: &str) -> LevelFilter {
    match name {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Map the stored 0..=4 level onto a filter
fn level_from_settings(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::DEBUG,
        1 => LevelFilter::INFO,
        2 => LevelFilter::WARN,
        3 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}
