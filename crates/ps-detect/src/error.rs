//! Error types for sensor discovery

use thiserror::Error;

/// Errors that can occur during discovery
#[derive(Debug, Error)]
pub enum DetectError {
    /// Failed to enumerate serial ports
    #[error("failed to enumerate ports: {0}")]
    EnumerationFailed(#[from] serialport::Error),

    /// Identifier string is not `VID:PID`
    #[error("invalid VID:PID {0:?}")]
    InvalidVidPid(String),

    /// Nothing matched the selection criteria
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// No Bluetooth adapter is available
    #[error("no Bluetooth adapter available")]
    NoAdapter,

    /// Bluetooth stack error
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}
