//! Error types for PS02 protocol decoding

use thiserror::Error;

/// Errors from the 54-byte payload codec
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is not exactly 54 bytes
    #[error("expected {expected} payload bytes, got {actual}")]
    PayloadLength { expected: usize, actual: usize },
}

/// Higher-level protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Decode error
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Hex payload on a USB line could not be parsed
    #[error("bad hex payload: {0}")]
    BadHex(String),

    /// Sequence field on a USB line could not be parsed
    #[error("bad sequence field: {0}")]
    BadSequence(String),

    /// Gain outside the 0..=15 range
    #[error("gain must be 0..15, got {0}")]
    InvalidGain(i64),
}
