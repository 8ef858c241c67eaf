//! Session and command sequencing for the PZEM-017 DC battery meter.
//!
//! The meter is a slow, stateful instrument on a half-duplex RTU link: it
//! needs a full second of quiet after every configuration write before it
//! will accept the next command, and the energy reset needs longer still.
//! This module owns that sequencing. One session owns one transport; there is
//! no internal locking and no automatic retry, a retried write could be
//! applied twice.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::registers::{
    decode_config, decode_measurements, encode_threshold, validate_alarm_pair, Configuration,
    Measurements, ShuntType, CMD_RESET_ENERGY, CONFIG_BASE, CONFIG_COUNT, MEASUREMENT_BASE,
    MEASUREMENT_COUNT, REG_HIGH_VOLT_ALARM, REG_LOW_VOLT_ALARM, REG_SHUNT,
};
use crate::transport::{ReadFunction, RegisterTransport, TransportError};

/// The meter silently drops or mis-acks a command issued immediately after a
/// register write; every write is followed by this pause.
pub const SETTLE_AFTER_WRITE: Duration = Duration::from_secs(1);
/// Extra quiet time the energy counter reset needs on top of the per-write
/// settle.
pub const SETTLE_AFTER_RESET: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    /// Initialization failed. Terminal; open a new session to recover.
    Failed,
}

/// Configuration pushed to the meter when a session initializes, mirroring
/// what the device needs before its readings mean anything: which shunt is
/// installed and where the voltage alarms sit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialSettings {
    pub shunt: ShuntType,
    /// Volts.
    pub low_volt_alarm: f64,
    /// Volts.
    pub high_volt_alarm: f64,
}

/// A session with one PZEM-017. Generic over the transport so tests can run
/// against a recorded wire; production code uses
/// [`ModbusRtu`](crate::transport::ModbusRtu).
pub struct Pzem017<T> {
    transport: T,
    settle_after_write: Duration,
    reset_settle: Duration,
    state: SessionState,
    measurements: Option<Measurements>,
    configuration: Option<Configuration>,
}

impl<T: RegisterTransport> Pzem017<T> {
    /// A new, uninitialized session with the documented settle delays.
    pub fn new(transport: T) -> Self {
        Pzem017::with_settle_delays(transport, SETTLE_AFTER_WRITE, SETTLE_AFTER_RESET)
    }

    /// Override the settle delays. The delays are a device requirement, not a
    /// tuning knob; this exists so test suites can run without real-time
    /// waits.
    pub fn with_settle_delays(
        transport: T,
        settle_after_write: Duration,
        reset_settle: Duration,
    ) -> Self {
        Pzem017 {
            transport,
            settle_after_write,
            reset_settle,
            state: SessionState::Uninitialized,
            measurements: None,
            configuration: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The measurement snapshot from the most recent successful read, if any.
    pub fn last_measurements(&self) -> Option<&Measurements> {
        self.measurements.as_ref()
    }

    /// The configuration snapshot from the most recent successful read, if
    /// any.
    pub fn last_configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    /// Push `settings` to the meter and take the first readings: alarm
    /// thresholds are written, then the shunt selection, then the
    /// configuration and measurement blocks are read back. Runs once per
    /// session; any failure leaves the session `Failed` and every later call
    /// fails fast with [`Error::SessionNotReady`].
    pub async fn initialize(&mut self, settings: &InitialSettings) -> Result<()> {
        match self.state {
            SessionState::Uninitialized => (),
            state => return Err(Error::SessionNotReady(state)),
        }
        self.state = SessionState::Initializing;
        debug!(?settings, "initializing session");
        match self.run_initialization(settings).await {
            Ok(()) => {
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "initialization failed, session is unusable");
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn run_initialization(&mut self, settings: &InitialSettings) -> Result<()> {
        self.write_alarm_thresholds(settings.low_volt_alarm, settings.high_volt_alarm)
            .await?;
        self.write_shunt(settings.shunt).await?;
        self.refresh_configuration().await?;
        self.refresh_measurements().await?;
        Ok(())
    }

    /// Read the six measurement registers, replace the cached snapshot
    /// wholesale, and return it. Transport failures are surfaced as
    /// [`Error::DeviceCommunication`] without retry.
    pub async fn read_measurements(&mut self) -> Result<Measurements> {
        self.ensure_ready()?;
        self.refresh_measurements().await
    }

    /// Read the four configuration registers, replace the cached snapshot
    /// wholesale, and return it.
    pub async fn read_configuration(&mut self) -> Result<Configuration> {
        self.ensure_ready()?;
        self.refresh_configuration().await
    }

    /// Set both voltage alarm thresholds. The pair is validated jointly and
    /// both registers are encoded before the first write, so invalid input
    /// never reaches the device. The high threshold is written first, then
    /// the low one after the settle delay; if the second write fails the
    /// meter holds a mix of old and new thresholds and the error is
    /// [`Error::PartialWrite`].
    pub async fn set_alarm_thresholds(&mut self, low: f64, high: f64) -> Result<()> {
        self.ensure_ready()?;
        self.write_alarm_thresholds(low, high).await
    }

    /// Select the installed shunt. Does not refresh the configuration cache;
    /// re-read if you need the confirmed value.
    pub async fn set_shunt(&mut self, shunt: ShuntType) -> Result<()> {
        self.ensure_ready()?;
        self.write_shunt(shunt).await
    }

    /// Zero the energy counter. The reset needs longer than an ordinary write
    /// to take effect, so after the command the session waits the per-write
    /// settle plus [`SETTLE_AFTER_RESET`], then forces a configuration read
    /// to confirm the meter is responsive again. Succeeds only if that read
    /// does.
    pub async fn reset_energy(&mut self) -> Result<()> {
        self.ensure_ready()?;
        debug!("resetting energy counter");
        self.transport.send_command(CMD_RESET_ENERGY).await?;
        sleep(self.settle_after_write).await;
        sleep(self.reset_settle).await;
        self.refresh_configuration().await?;
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            state => Err(Error::SessionNotReady(state)),
        }
    }

    async fn refresh_measurements(&mut self) -> Result<Measurements> {
        let words = self
            .transport
            .read_registers(MEASUREMENT_BASE, MEASUREMENT_COUNT, ReadFunction::Input)
            .await?;
        let snapshot = decode_measurements(expect_block(&words)?);
        self.measurements = Some(snapshot);
        Ok(snapshot)
    }

    async fn refresh_configuration(&mut self) -> Result<Configuration> {
        let words = self
            .transport
            .read_registers(CONFIG_BASE, CONFIG_COUNT, ReadFunction::Holding)
            .await?;
        let snapshot = decode_config(expect_block(&words)?);
        self.configuration = Some(snapshot);
        Ok(snapshot)
    }

    async fn write_alarm_thresholds(&mut self, low: f64, high: f64) -> Result<()> {
        validate_alarm_pair(low, high)?;
        let high_word = encode_threshold(high)?;
        let low_word = encode_threshold(low)?;
        self.write_register(REG_HIGH_VOLT_ALARM, high_word).await?;
        self.write_register(REG_LOW_VOLT_ALARM, low_word)
            .await
            .map_err(|e| match e {
                Error::DeviceCommunication(source) => Error::PartialWrite {
                    context: "high threshold written, low threshold write failed",
                    source,
                },
                other => other,
            })
    }

    async fn write_shunt(&mut self, shunt: ShuntType) -> Result<()> {
        let code = shunt.code()?;
        self.write_register(REG_SHUNT, code).await
    }

    /// Every device write goes through here so the mandatory settle delay is
    /// never skipped.
    async fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.transport.write_register(address, value).await?;
        sleep(self.settle_after_write).await;
        Ok(())
    }
}

fn expect_block<const N: usize>(words: &[u16]) -> Result<[u16; N]> {
    <[u16; N]>::try_from(words).map_err(|_| {
        Error::DeviceCommunication(TransportError::ShortResponse {
            expected: N,
            actual: words.len(),
        })
    })
}
