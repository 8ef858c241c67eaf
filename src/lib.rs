//! A small library to control Peacefair PZEM-017 DC battery meters over
//! Modbus RTU.
//!
//! The meter exposes six measurement registers (voltage, current, power,
//! energy, two alarm flags) and four configuration registers (alarm
//! thresholds, slave address, shunt selection). [`pzem017::Pzem017`] wraps
//! one serial link to one meter, decodes the registers into typed snapshots,
//! and sequences configuration writes with the settle delays the instrument
//! requires.
//!
//! ```no_run
//! use peacefair::pzem017::{InitialSettings, Pzem017};
//! use peacefair::registers::ShuntType;
//! use peacefair::transport::ModbusRtu;
//!
//! # async fn demo() -> peacefair::error::Result<()> {
//! let transport = ModbusRtu::open("/dev/ttyUSB0", 1)?;
//! let mut meter = Pzem017::new(transport);
//! meter
//!     .initialize(&InitialSettings {
//!         shunt: ShuntType::A100,
//!         low_volt_alarm: 7.8,
//!         high_volt_alarm: 15.0,
//!     })
//!     .await?;
//! let m = meter.read_measurements().await?;
//! println!("{} V, {} A", m.voltage, m.current);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod pzem017;
pub mod registers;
pub mod transport;
