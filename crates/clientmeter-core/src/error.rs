//! Shared error type across clientmeter crates.

use serde::Serialize;
use thiserror::Error;

/// Stable error kinds. `as_str` doubles as the `exception` metric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Client offers no listener hook.
    ListenerUnsupported,
    /// Invalid configuration.
    Config,
    /// Failure inside instrumentation code.
    Instrumentation,
    /// Connection or protocol failure.
    Transport,
    /// Request exceeded its deadline.
    Timeout,
    /// Client was stopped while the request was in flight.
    ClientStopped,
    /// Caller abandoned the request.
    Cancelled,
    /// Malformed input.
    BadRequest,
    /// Unsupported config version.
    UnsupportedVersion,
    /// Registry lookup miss.
    MeterNotFound,
    /// Internal error.
    Internal,
}

impl ErrorKind {
    /// String representation used in tags and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ListenerUnsupported => "ListenerUnsupported",
            ErrorKind::Config => "Config",
            ErrorKind::Instrumentation => "Instrumentation",
            ErrorKind::Transport => "Transport",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ClientStopped => "ClientStopped",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::UnsupportedVersion => "UnsupportedVersion",
            ErrorKind::MeterNotFound => "MeterNotFound",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Request-level failures are outcomes to record, not listener errors.
    pub fn is_request_failure(self) -> bool {
        matches!(
            self,
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::ClientStopped | ErrorKind::Cancelled
        )
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, ClientMeterError>;

/// Unified error type used by core and the http crate.
#[derive(Debug, Error)]
pub enum ClientMeterError {
    #[error("client does not support request listeners")]
    ListenerUnsupported,
    #[error("invalid config: {0}")]
    Config(String),
    #[error("instrumentation: {0}")]
    Instrumentation(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("client stopped")]
    ClientStopped,
    #[error("request cancelled")]
    Cancelled,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unsupported config version")]
    UnsupportedVersion,
    #[error("meter not found: {0}")]
    MeterNotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl ClientMeterError {
    /// Map the error to its stable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientMeterError::ListenerUnsupported => ErrorKind::ListenerUnsupported,
            ClientMeterError::Config(_) => ErrorKind::Config,
            ClientMeterError::Instrumentation(_) => ErrorKind::Instrumentation,
            ClientMeterError::Transport(_) => ErrorKind::Transport,
            ClientMeterError::Timeout => ErrorKind::Timeout,
            ClientMeterError::ClientStopped => ErrorKind::ClientStopped,
            ClientMeterError::Cancelled => ErrorKind::Cancelled,
            ClientMeterError::BadRequest(_) => ErrorKind::BadRequest,
            ClientMeterError::UnsupportedVersion => ErrorKind::UnsupportedVersion,
            ClientMeterError::MeterNotFound(_) => ErrorKind::MeterNotFound,
            ClientMeterError::Internal(_) => ErrorKind::Internal,
        }
    }
}
