//! Normalized device commands
//!
//! The sensor understands three operations on both transports: start
//! streaming, stop streaming, and set gain. [`DeviceCommand`] is the
//! transport-neutral form; [`crate::usb::UsbCommand`] and
//! [`crate::ble::BleCommand`] encode it for the wire.

use crate::error::ProtocolError;

/// Device amplification setting, always within `0..=15`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "i64", into = "u8"))]
pub struct Gain(u8);

impl Gain {
    /// Highest gain the sensor accepts
    pub const MAX: Gain = Gain(15);

    /// Validate a gain value
    pub fn new(value: u8) -> Result<Self, ProtocolError> {
        Self::try_from(value as i64)
    }

    /// Get the raw gain value
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Gain {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (0..=15).contains(&value) {
            Ok(Gain(value as u8))
        } else {
            Err(ProtocolError::InvalidGain(value))
        }
    }
}

impl From<Gain> for u8 {
    fn from(gain: Gain) -> Self {
        gain.0
    }
}

impl Default for Gain {
    fn default() -> Self {
        Gain::MAX
    }
}

impl std::fmt::Display for Gain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-neutral device command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Begin streaming frames
    Start,
    /// Stop streaming frames
    Stop,
    /// Change the amplification setting
    SetGain(Gain),
}

/// Trait for commands that can be encoded to bytes
pub trait EncodeCommand {
    /// Encode this command to its wire format
    fn encode(&self) -> Vec<u8>;
}
