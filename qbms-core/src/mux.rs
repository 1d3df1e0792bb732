//! QBMS - Analog switch multiplexer
//!
//! Each quadrant's voltage tap is routed by closing a high/low switch pair:
//!
//! | Quadrant | High side | Low side |
//! |----------|-----------|----------|
//! | 0        | VBAT1_H   | VBAT2_L  |
//! | 1        | VBAT2_H   | VBAT3_L  |
//! | 2        | VBAT3_H   | VBAT4_L  |
//! | 3        | VBAT4_H   | VBATRTN  |
//!
//! Thermistors use one switch each. Every switch in a group is opened before
//! the next one closes so two taps are never bridged.

use crate::hal::AnalogMux;
use crate::types::*;
use embedded_hal::digital::OutputPin;

/// Number of voltage switches (VBAT1_H, VBAT2_L, ..., VBAT4_H, VBATRTN)
pub const VOLTAGE_SWITCHES: usize = 2 * QUADRANT_COUNT;

/// Switch pair closed for each quadrant, as indices into the voltage pins
pub const VOLTAGE_PAIRS: [(usize, usize); QUADRANT_COUNT] = [(0, 1), (2, 3), (4, 5), (6, 7)];

/// Multiplexer built from plain output pins
///
/// Voltage pins are ordered VBAT1_H, VBAT2_L, VBAT2_H, VBAT3_L, VBAT3_H,
/// VBAT4_L, VBAT4_H, VBATRTN.
pub struct PinMux<P> {
    voltage: [P; VOLTAGE_SWITCHES],
    thermistor: [P; QUADRANT_COUNT],
}

impl<P: OutputPin> PinMux<P> {
    /// Take ownership of the switch pins and open all of them
    pub fn new(voltage: [P; VOLTAGE_SWITCHES], thermistor: [P; QUADRANT_COUNT]) -> Result<Self> {
        let mut mux = Self { voltage, thermistor };
        mux.open_voltage()?;
        mux.open_thermistors()?;
        Ok(mux)
    }

    /// Open every voltage switch
    pub fn open_voltage(&mut self) -> Result<()> {
        for pin in self.voltage.iter_mut() {
            pin.set_low().map_err(|_| Error::HalFailure)?;
        }
        Ok(())
    }

    /// Open every thermistor switch
    pub fn open_thermistors(&mut self) -> Result<()> {
        for pin in self.thermistor.iter_mut() {
            pin.set_low().map_err(|_| Error::HalFailure)?;
        }
        Ok(())
    }

    /// Give the pins back
    pub fn release(self) -> ([P; VOLTAGE_SWITCHES], [P; QUADRANT_COUNT]) {
        (self.voltage, self.thermistor)
    }
}

impl<P: OutputPin> AnalogMux for PinMux<P> {
    fn select_voltage(&mut self, quadrant: usize) -> Result<()> {
        let (high, low) = *VOLTAGE_PAIRS.get(quadrant).ok_or(Error::InvalidArg)?;
        self.open_voltage()?;
        self.voltage[high].set_high().map_err(|_| Error::HalFailure)?;
        self.voltage[low].set_high().map_err(|_| Error::HalFailure)
    }

    fn select_temperature(&mut self, quadrant: usize) -> Result<()> {
        if quadrant >= QUADRANT_COUNT {
            return Err(Error::InvalidArg);
        }
        self.open_thermistors()?;
        self.thermistor[quadrant].set_high().map_err(|_| Error::HalFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;

    /// Pin that logs its level changes into a shared journal
    struct JournalPin<'a> {
        id: u8,
        journal: &'a Cell<[Option<(u8, bool)>; 32]>,
        level: &'a Cell<u16>,
    }

    impl JournalPin<'_> {
        fn record(&self, high: bool) {
            let mut entries = self.journal.get();
            if let Some(slot) = entries.iter_mut().find(|e| e.is_none()) {
                *slot = Some((self.id, high));
            }
            self.journal.set(entries);

            let bit = 1u16 << self.id;
            let level = self.level.get();
            self.level.set(if high { level | bit } else { level & !bit });
        }
    }

    impl ErrorType for JournalPin<'_> {
        type Error = Infallible;
    }

    impl OutputPin for JournalPin<'_> {
        fn set_low(&mut self) -> core::result::Result<(), Infallible> {
            self.record(false);
            Ok(())
        }

        fn set_high(&mut self) -> core::result::Result<(), Infallible> {
            self.record(true);
            Ok(())
        }
    }

    #[test]
    fn test_select_closes_one_pair() {
        let journal = Cell::new([None; 32]);
        let level = Cell::new(0u16);
        let (journal_ref, level_ref) = (&journal, &level);
        let pin = move |id| JournalPin {
            id,
            journal: journal_ref,
            level: level_ref,
        };
        let mut mux = PinMux::new(
            [pin(0), pin(1), pin(2), pin(3), pin(4), pin(5), pin(6), pin(7)],
            [pin(8), pin(9), pin(10), pin(11)],
        )
        .unwrap();
        assert_eq!(level.get(), 0);

        mux.select_voltage(1).unwrap();
        assert_eq!(level.get(), 0b0000_1100);

        mux.select_voltage(3).unwrap();
        assert_eq!(level.get(), 0b1100_0000);

        mux.select_temperature(2).unwrap();
        assert_eq!(level.get(), 0b0100_1100_0000);

        assert_eq!(mux.select_voltage(4), Err(Error::InvalidArg));
        assert_eq!(mux.select_temperature(4), Err(Error::InvalidArg));
    }

    #[test]
    fn test_group_opened_before_close() {
        let journal = Cell::new([None; 32]);
        let level = Cell::new(0u16);
        let (journal_ref, level_ref) = (&journal, &level);
        let pin = move |id| JournalPin {
            id,
            journal: journal_ref,
            level: level_ref,
        };
        let mut mux = PinMux::new(
            [pin(0), pin(1), pin(2), pin(3), pin(4), pin(5), pin(6), pin(7)],
            [pin(8), pin(9), pin(10), pin(11)],
        )
        .unwrap();
        journal.set([None; 32]);

        mux.select_temperature(0).unwrap();
        let entries = journal.get();
        // four opens, then the single close
        for entry in entries.iter().take(4) {
            assert!(matches!(entry, Some((_, false))));
        }
        assert_eq!(entries[4], Some((8, true)));
        assert_eq!(entries[5], None);
    }
}
