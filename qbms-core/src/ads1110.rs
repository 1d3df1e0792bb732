//! QBMS - ADS1110 16-bit converter driver
//!
//! Single-shot mode at 15 samples per second: a conversion takes ~67ms, so
//! at one phase per 80ms tick the result is always due by the following
//! read phase. A read before that simply reports not-ready.

use crate::hal::Converter;
use crate::types::*;
use embedded_hal::i2c::I2c;
use tracing::trace;

/// Voltage converter bus address
pub const VOLTAGE_ADDR: u8 = 0x48;

/// Thermistor converter bus address
pub const THERMISTOR_ADDR: u8 = 0x4A;

/// Config register bits
pub mod config {
    /// 240 samples per second, 12-bit
    pub const DATARATE_240: u8 = 0;
    /// 60 samples per second, 14-bit
    pub const DATARATE_60: u8 = 1 << 2;
    /// 30 samples per second, 15-bit
    pub const DATARATE_30: u8 = 2 << 2;
    /// 15 samples per second, 16-bit
    pub const DATARATE_15: u8 = 3 << 2;
    /// PGA gain 1
    pub const GAIN_1: u8 = 0;
    /// PGA gain 2
    pub const GAIN_2: u8 = 1;
    /// PGA gain 4
    pub const GAIN_4: u8 = 2;
    /// PGA gain 8
    pub const GAIN_8: u8 = 3;
    /// Convert once per start instead of continuously
    pub const SINGLE_SHOT: u8 = 1 << 4;
    /// Write: start a conversion. Read: conversion still in progress
    pub const START: u8 = 1 << 7;
}

/// Config byte written to start each conversion
pub const START_CONFIG: u8 = config::DATARATE_15 | config::GAIN_1 | config::SINGLE_SHOT | config::START;

/// Chip handle
pub struct Ads1110<I> {
    i2c: I,
    addr: u8,
}

impl<I: I2c> Ads1110<I> {
    /// Bind a converter at `addr`
    pub fn new(i2c: I, addr: u8) -> Self {
        Self { i2c, addr }
    }

    /// Bus address
    pub fn address(&self) -> u8 {
        self.addr
    }

    /// Release the bus
    pub fn release(self) -> I {
        self.i2c
    }

    /// Write the config byte, starting a conversion
    pub fn start(&mut self) -> core::result::Result<(), I::Error> {
        self.i2c.write(self.addr, &[START_CONFIG])
    }

    /// Read `[hi, lo, config]`; `None` while the start bit is still set
    pub fn fetch(&mut self) -> core::result::Result<Option<i16>, I::Error> {
        let mut response = [0u8; 3];
        self.i2c.read(self.addr, &mut response)?;

        if response[2] & config::START != 0 {
            return Ok(None);
        }
        Ok(Some(i16::from_be_bytes([response[0], response[1]])))
    }
}

impl<I: I2c> Converter for Ads1110<I> {
    fn start_conversion(&mut self) -> Result<()> {
        self.start().map_err(|_| Error::HalFailure)
    }

    fn read(&mut self) -> Result<Option<i16>> {
        let value = self.fetch().map_err(|_| Error::HalFailure)?;
        if value.is_none() {
            trace!("ADS1110 {:#04x} not ready", self.addr);
        }
        Ok(value)
    }
}
