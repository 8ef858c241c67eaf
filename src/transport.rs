//! The boundary between the register protocol and the wire.
//!
//! The session core only ever talks to [`RegisterTransport`], a minimal
//! read/write/command capability. [`ModbusRtu`] is the production
//! implementation, an adapter over a `tokio_modbus` RTU context attached to a
//! serial port opened with the PZEM-017 family's fixed framing.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::timeout;
use tokio_modbus::client::{rtu, Client, Context, Reader, Writer};
use tokio_modbus::{Request, Response, Slave};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};
use tracing::debug;

/// Serial framing is a constant of the device family.
pub const BAUD_RATE: u32 = 9600;
/// The meter answers slowly; anything shorter produces spurious timeouts.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Modbus register reads come in two flavors; the meter keeps measurements
/// behind 0x04 and configuration behind 0x03.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFunction {
    /// Function 0x03, the configuration block.
    Holding,
    /// Function 0x04, the measurement block.
    Input,
}

impl ReadFunction {
    pub fn code(self) -> u8 {
        match self {
            ReadFunction::Holding => 0x03,
            ReadFunction::Input => 0x04,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("modbus: {0}")]
    Modbus(#[from] tokio_modbus::Error),

    /// The device answered with a Modbus exception frame.
    #[error("modbus exception: {0}")]
    Exception(tokio_modbus::Exception),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("short response, expected {expected} registers, got {actual}")]
    ShortResponse { expected: usize, actual: usize },

    #[error("unexpected response to function 0x{function:02x}")]
    UnexpectedResponse { function: u8 },

    /// Outside the Modbus unicast range; the meter can never answer at such
    /// an address.
    #[error("invalid slave address {0}, valid addresses are 1..=247")]
    InvalidSlaveAddress(u8),
}

/// The single in-flight transaction the half-duplex link permits, abstracted
/// just far enough to swap the wire out in tests. Implementations own
/// addressing, framing, CRC and the response timeout; they do not retry.
#[async_trait]
pub trait RegisterTransport {
    /// Read `count` consecutive registers starting at `start`.
    async fn read_registers(
        &mut self,
        start: u16,
        count: u16,
        function: ReadFunction,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write a single register (function 0x06).
    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError>;

    /// Issue a vendor-specific command with no payload.
    async fn send_command(&mut self, function: u8) -> Result<(), TransportError>;
}

/// Production transport: Modbus RTU over a serial port at 9600 8N2.
pub struct ModbusRtu {
    ctx: Context,
    response_timeout: Duration,
}

impl ModbusRtu {
    /// Open `port` and attach to the meter at `slave`. Must be called from
    /// within a tokio runtime. Slave addresses outside the unicast range
    /// 1..=247 are rejected before the port is touched.
    pub fn open(port: &str, slave: u8) -> Result<Self, TransportError> {
        if !(1..=247).contains(&slave) {
            return Err(TransportError::InvalidSlaveAddress(slave));
        }
        let serial = tokio_serial::new(port, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::Two)
            .timeout(RESPONSE_TIMEOUT)
            .open_native_async()?;
        let ctx = rtu::attach_slave(serial, Slave(slave));
        Ok(ModbusRtu { ctx, response_timeout: RESPONSE_TIMEOUT })
    }
}

fn flatten<T>(
    res: Result<Result<T, tokio_modbus::Exception>, tokio_modbus::Error>,
) -> Result<T, TransportError> {
    match res {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(TransportError::Exception(exception)),
        Err(err) => Err(TransportError::Modbus(err)),
    }
}

#[async_trait]
impl RegisterTransport for ModbusRtu {
    async fn read_registers(
        &mut self,
        start: u16,
        count: u16,
        function: ReadFunction,
    ) -> Result<Vec<u16>, TransportError> {
        debug!(start, count, function = function.code(), "register read");
        let deadline = self.response_timeout;
        let request = async {
            match function {
                ReadFunction::Holding => self.ctx.read_holding_registers(start, count).await,
                ReadFunction::Input => self.ctx.read_input_registers(start, count).await,
            }
        };
        let words = flatten(
            timeout(deadline, request)
                .await
                .map_err(|_| TransportError::Timeout(deadline))?,
        )?;
        if words.len() != count as usize {
            return Err(TransportError::ShortResponse {
                expected: count as usize,
                actual: words.len(),
            });
        }
        Ok(words)
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        debug!(address, value, "register write");
        let deadline = self.response_timeout;
        flatten(
            timeout(deadline, self.ctx.write_single_register(address, value))
                .await
                .map_err(|_| TransportError::Timeout(deadline))?,
        )
    }

    async fn send_command(&mut self, function: u8) -> Result<(), TransportError> {
        debug!(function, "vendor command");
        let deadline = self.response_timeout;
        let request = Request::Custom(function, Cow::Borrowed(&[]));
        let response = flatten(
            timeout(deadline, self.ctx.call(request))
                .await
                .map_err(|_| TransportError::Timeout(deadline))?,
        )?;
        match response {
            Response::Custom(code, _) if code == function => Ok(()),
            _ => Err(TransportError::UnexpectedResponse { function }),
        }
    }
}
