//! QBMS - Periodic status telemetry
//!
//! Packages a [`PackSnapshot`] into the four status frames. The scheduler
//! decides when each frame is due; this module only decides what goes in
//! it.

use crate::fault::PackStatus;
use crate::frames::{self, CanFrame, PackSummary};
use crate::hal::CanBus;
use crate::scheduler::TickEvent;
use crate::types::*;
use tracing::{trace, warn};

/// Everything the status frames report, captured at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackSnapshot {
    /// Calibrated quadrant readings
    pub readings: [QuadrantReading; QUADRANT_COUNT],
    /// Latest pack current
    pub milliamps: i32,
    /// State of charge 0-255
    pub soc: u8,
    /// Fault and permission bits
    pub status: PackStatus,
}

impl PackSnapshot {
    /// Sum of quadrant voltages
    pub fn pack_voltage_mv(&self) -> Millivolts {
        self.readings.iter().map(|r| r.voltage_mv).sum()
    }

    /// Pack summary contents
    pub fn summary(&self) -> PackSummary {
        PackSummary {
            voltage_cv: frames::saturate_u16(self.pack_voltage_mv() as i64 / 10),
            current_da: frames::saturate_i16(self.milliamps as i64 / 100),
            soc: self.soc,
            status: self.status.bits(),
        }
    }

    /// Quadrant voltages in 0.01V
    pub fn quadrant_voltages_cv(&self) -> [u16; QUADRANT_COUNT] {
        self.readings.map(|r| frames::saturate_u16(r.voltage_mv as i64 / 10))
    }

    /// Cell averages in mV
    pub fn cell_averages_mv(&self) -> [u16; QUADRANT_COUNT] {
        self.readings.map(|r| frames::saturate_u16(r.cell_average_mv() as i64))
    }

    /// Temperatures in 0.1C
    pub fn temperatures_dc(&self) -> [i16; QUADRANT_COUNT] {
        self.readings.map(|r| frames::saturate_i16(r.temperature_dc as i64))
    }
}

/// Builds and sends the status frames
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    base_address: u32,
    sent: u32,
    failed: u32,
}

impl StatusBroadcaster {
    /// Frames go out on `base_address ..= base_address + 3`
    pub fn new(base_address: u32) -> Self {
        Self {
            base_address,
            sent: 0,
            failed: 0,
        }
    }

    /// Move the frames to a new base address
    pub fn set_base_address(&mut self, base_address: u32) {
        self.base_address = base_address;
    }

    /// Current base address
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Frame for a status event; `None` for events that are not frames
    pub fn frame_for(&self, event: TickEvent, snapshot: &PackSnapshot) -> Result<Option<CanFrame>> {
        let (offset, payload) = match event {
            TickEvent::Sample => return Ok(None),
            TickEvent::PackSummary => (0, snapshot.summary().to_payload()),
            TickEvent::QuadrantVoltages => (1, frames::encode_words(&snapshot.quadrant_voltages_cv())),
            TickEvent::CellAverages => (2, frames::encode_words(&snapshot.cell_averages_mv())),
            TickEvent::Temperatures => (3, frames::encode_signed_words(&snapshot.temperatures_dc())),
        };
        let address = self.base_address.checked_add(offset).ok_or(Error::InvalidArg)?;
        CanFrame::with_address(address, &payload).map(Some)
    }

    /// Build and transmit the frame for `event`
    ///
    /// Returns true if a frame was sent. Bus errors are counted and logged.
    pub fn broadcast<B: CanBus>(&mut self, event: TickEvent, snapshot: &PackSnapshot, bus: &mut B) -> Result<bool> {
        let frame = match self.frame_for(event, snapshot)? {
            Some(frame) => frame,
            None => return Ok(false),
        };

        match bus.transmit(&frame) {
            Ok(()) => {
                trace!("Sent {:?} on {:#x}", event, frame.raw_id());
                self.sent = self.sent.wrapping_add(1);
                Ok(true)
            }
            Err(e) => {
                warn!("Status frame {:?} not sent: {}", event, e);
                self.failed = self.failed.wrapping_add(1);
                Err(e)
            }
        }
    }

    /// (frames sent, transmit failures)
    pub fn counts(&self) -> (u32, u32) {
        (self.sent, self.failed)
    }
}
