use thiserror::Error;

use crate::pzem017::SessionState;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value outside the documented domain. Nothing was
    /// sent to the device.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A jointly invalid configuration, e.g. a high alarm at or below the low
    /// alarm. Nothing was sent to the device.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The transport or the Modbus layer failed. Not retried here; whether a
    /// retry is safe is the caller's call.
    #[error("device communication failed: {0}")]
    DeviceCommunication(#[from] TransportError),

    /// A multi-register change failed partway through. The device now holds a
    /// mix of old and new values; re-read the configuration before relying on
    /// it.
    #[error("partial write, {context}: {source}")]
    PartialWrite {
        context: &'static str,
        #[source]
        source: TransportError,
    },

    /// The session is not in the `Ready` state, either because initialization
    /// has not run yet or because it failed.
    #[error("session not ready (state is {0:?})")]
    SessionNotReady(SessionState),
}
