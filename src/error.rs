use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::transport::setup::TransportConnectError;

/// Coarse error classification. This is what the communicator records as its
/// sticky fatal-error field and what callers can query after the fact via
/// `get_async_error`, since device-side failures surface asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidUsage,
    InternalError,
    SystemError,
    UnhandledDeviceError,
}

impl ErrorKind {
    pub(crate) fn from_code(code: u32) -> Option<ErrorKind> {
        match code {
            0 => Some(ErrorKind::InvalidArgument),
            1 => Some(ErrorKind::InvalidUsage),
            2 => Some(ErrorKind::InternalError),
            3 => Some(ErrorKind::SystemError),
            4 => Some(ErrorKind::UnhandledDeviceError),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A distributed-setup precondition was violated by the caller, e.g. two
    /// ranks attached to the same device.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("system error: {0}")]
    SystemError(#[from] std::io::Error),
    #[error("unhandled device error: {0}")]
    UnhandledDeviceError(String),
    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("transport connect error: {0}")]
    Transport(#[from] TransportConnectError),
}

impl CommError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CommError::InvalidUsage(_) => ErrorKind::InvalidUsage,
            CommError::InternalError(_) => ErrorKind::InternalError,
            CommError::SystemError(_) => ErrorKind::SystemError,
            CommError::UnhandledDeviceError(_) => ErrorKind::UnhandledDeviceError,
            CommError::Bootstrap(_) => ErrorKind::SystemError,
            CommError::Transport(_) => ErrorKind::SystemError,
        }
    }
}

pub type Result<T> = std::result::Result<T, CommError>;
