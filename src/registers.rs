//! Register map and pure codec for the PZEM-017.
//!
//! Everything here is side-effect free: raw 16-bit register words in, typed
//! values out, and the validation rules that must hold before a write is
//! attempted. The meter stores voltage, current, power and energy as
//! hundredths of their unit, so decoding is a fixed /100 scale.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Measurement block: 6 input registers (function 0x04) starting here.
pub const MEASUREMENT_BASE: u16 = 0x0000;
pub const MEASUREMENT_COUNT: u16 = 6;

/// Configuration block: 4 holding registers (function 0x03) starting here.
pub const CONFIG_BASE: u16 = 0x0000;
pub const CONFIG_COUNT: u16 = 4;

/// High voltage alarm threshold, centi-volts.
pub const REG_HIGH_VOLT_ALARM: u16 = 0x0000;
/// Low voltage alarm threshold, centi-volts.
pub const REG_LOW_VOLT_ALARM: u16 = 0x0001;
/// Modbus slave address. The meter exposes it as a holding register but this
/// driver never writes it.
pub const REG_SLAVE_ADDRESS: u16 = 0x0002;
/// Shunt selection, one of the [`ShuntType`] codes.
pub const REG_SHUNT: u16 = 0x0003;

/// Vendor-specific command that zeroes the energy counter. No payload.
pub const CMD_RESET_ENERGY: u8 = 0x42;

/// Alarm thresholds must lie in this range, volts.
pub const ALARM_VOLT_MIN: f64 = 1.0;
pub const ALARM_VOLT_MAX: f64 = 300.0;

/// The external shunt the meter measures current through. The meter only
/// understands the four LT-2 75mV shunts below; anything else read back from
/// the device is carried as `Unknown` rather than discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShuntType {
    A100,
    A50,
    A200,
    A300,
    Unknown(u16),
}

impl From<u16> for ShuntType {
    fn from(code: u16) -> Self {
        match code {
            0x0000 => ShuntType::A100,
            0x0001 => ShuntType::A50,
            0x0002 => ShuntType::A200,
            0x0003 => ShuntType::A300,
            code => ShuntType::Unknown(code),
        }
    }
}

impl ShuntType {
    /// The register code for this shunt. Fails on [`ShuntType::Unknown`] so an
    /// unrecognized value can never be written back to the device.
    pub fn code(self) -> Result<u16, Error> {
        match self {
            ShuntType::A100 => Ok(0x0000),
            ShuntType::A50 => Ok(0x0001),
            ShuntType::A200 => Ok(0x0002),
            ShuntType::A300 => Ok(0x0003),
            ShuntType::Unknown(code) => Err(Error::InvalidArgument(format!(
                "unrecognized shunt code 0x{:04x}, supported shunts are 100A, 50A, 200A, 300A",
                code
            ))),
        }
    }
}

impl fmt::Display for ShuntType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShuntType::A100 => write!(f, "100A"),
            ShuntType::A50 => write!(f, "50A"),
            ShuntType::A200 => write!(f, "200A"),
            ShuntType::A300 => write!(f, "300A"),
            ShuntType::Unknown(code) => write!(f, "unknown(0x{:04x})", code),
        }
    }
}

impl FromStr for ShuntType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "100A" => Ok(ShuntType::A100),
            "50A" => Ok(ShuntType::A50),
            "200A" => Ok(ShuntType::A200),
            "300A" => Ok(ShuntType::A300),
            s => Err(Error::InvalidArgument(format!(
                "unsupported shunt {:?}, supported shunts are 100A, 50A, 200A, 300A",
                s
            ))),
        }
    }
}

/// One decoded read of the measurement block. Replaced wholesale on every
/// successful read, never updated field by field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    /// Volts, register resolution 0.01 V.
    pub voltage: f64,
    /// Amps, register resolution 0.01 A.
    pub current: f64,
    /// Watts, register resolution 0.01 W.
    pub power: f64,
    /// Watt-hours, register resolution 0.01 Wh.
    pub energy: f64,
    pub high_volt_alarm_active: bool,
    pub low_volt_alarm_active: bool,
}

/// One decoded read of the configuration block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Volts.
    pub high_volt_threshold: f64,
    /// Volts.
    pub low_volt_threshold: f64,
    /// As reported by the device. Valid addresses are 1..=247.
    pub slave_address: u16,
    pub shunt_type: ShuntType,
}

pub fn decode_measurements(words: [u16; MEASUREMENT_COUNT as usize]) -> Measurements {
    Measurements {
        voltage: f64::from(words[0]) / 100.,
        current: f64::from(words[1]) / 100.,
        power: f64::from(words[2]) / 100.,
        energy: f64::from(words[3]) / 100.,
        high_volt_alarm_active: words[4] != 0,
        low_volt_alarm_active: words[5] != 0,
    }
}

pub fn decode_config(words: [u16; CONFIG_COUNT as usize]) -> Configuration {
    Configuration {
        high_volt_threshold: f64::from(words[0]) / 100.,
        low_volt_threshold: f64::from(words[1]) / 100.,
        slave_address: words[2],
        shunt_type: ShuntType::from(words[3]),
    }
}

/// Encode a voltage threshold as centi-volts. The encoded word must decode
/// back to within 0.01 V of the input, otherwise precision was silently lost
/// and the write is refused.
pub fn encode_threshold(volts: f64) -> Result<u16, Error> {
    if !volts.is_finite() {
        return Err(Error::InvalidArgument(format!(
            "threshold {} is not a finite voltage",
            volts
        )));
    }
    let scaled = (volts * 100.).round();
    if scaled < 0. || scaled > f64::from(u16::MAX) {
        return Err(Error::InvalidArgument(format!(
            "threshold {} V does not fit in a register",
            volts
        )));
    }
    let word = scaled as u16;
    if (f64::from(word) / 100. - volts).abs() > 0.01 {
        return Err(Error::InvalidArgument(format!(
            "threshold {} V loses precision when encoded as centi-volts",
            volts
        )));
    }
    Ok(word)
}

/// Both alarm thresholds are checked together before anything is written, so
/// an invalid pair never results in a partial update.
pub fn validate_alarm_pair(low: f64, high: f64) -> Result<(), Error> {
    if !(high > low) {
        return Err(Error::InvalidConfiguration(format!(
            "high alarm {} V must be strictly above low alarm {} V",
            high, low
        )));
    }
    for (name, value) in [("low", low), ("high", high)] {
        if !(ALARM_VOLT_MIN..=ALARM_VOLT_MAX).contains(&value) {
            return Err(Error::InvalidConfiguration(format!(
                "{} alarm {} V out of range {} <= alarm <= {}",
                name, value, ALARM_VOLT_MIN, ALARM_VOLT_MAX
            )));
        }
    }
    Ok(())
}
