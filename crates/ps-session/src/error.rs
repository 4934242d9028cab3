//! Error types for the session engine

use ps_detect::DetectError;
use ps_protocol::ProtocolError;
use thiserror::Error;

/// Result alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by drivers and the session engine
#[derive(Debug, Error)]
pub enum SessionError {
    /// Discovery found nothing matching the criteria
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Transport connect, validation or I/O failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed data at the decode boundary
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Out-of-range input rejected at an entry point
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Bounded wait exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// Command queue is at capacity
    #[error("command queue full")]
    CommandQueueFull,

    /// Recording export failed
    #[error("recording export failed: {0}")]
    Recording(#[from] std::io::Error),

    /// Session worker could not be started or vanished
    #[error("session runtime error: {0}")]
    Runtime(String),
}

impl From<DetectError> for SessionError {
    fn from(err: DetectError) -> Self {
        match err {
            DetectError::DeviceNotFound(msg) => SessionError::DeviceNotFound(msg),
            other => SessionError::Connection(other.to_string()),
        }
    }
}

impl From<serialport::Error> for SessionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => SessionError::DeviceNotFound(err.to_string()),
            _ => SessionError::Connection(err.to_string()),
        }
    }
}

impl From<btleplug::Error> for SessionError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => SessionError::DeviceNotFound(err.to_string()),
            btleplug::Error::TimedOut(d) => SessionError::Timeout(format!("BLE operation after {:?}", d)),
            other => SessionError::Connection(other.to_string()),
        }
    }
}

/// Outcome of one failed read from a frame sequence
#[derive(Debug, Error)]
pub enum ReadError {
    /// One frame was malformed; keep reading
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No data within the read timeout; keep reading
    #[error("read timed out")]
    Timeout,

    /// The transport is gone; the sequence is over
    #[error("transport error: {0}")]
    Io(String),
}

impl ReadError {
    /// Whether the sequence can continue after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ReadError::Io(_))
    }
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ReadError::Timeout,
            _ => ReadError::Io(err.to_string()),
        }
    }
}
