//! PS02 Protocol Library
//!
//! This crate provides decoding and encoding for the two wire formats spoken
//! by PS02 pressure sensors:
//!
//! - **USB**: ASCII hex lines `<seq>:<108 hex chars>\r\n` over a 115200 baud
//!   serial link, with `S0`/`B0`/`G<X>` command lines
//! - **BLE**: 56-byte binary notifications on the Nordic UART RX characteristic,
//!   with 5-byte `FE 00 <op> <arg> 00` control writes
//!
//! # Architecture
//!
//! Both transports carry the same 54-byte payload, which the [`frame`] codec
//! unpacks into 36 signed 12-bit samples. Each transport module provides:
//! - A parser returning a tagged [`Decoded`] outcome instead of raising on
//!   noise, so readers can branch on `Frame | Skip | Fatal`
//! - Command encoding to transport-specific bytes
//!
//! # Example
//!
//! ```rust
//! use ps_protocol::{usb, Decoded};
//!
//! let line = format!("A3:{}\r\n", "0".repeat(108));
//! match usb::parse_line(line.as_bytes()) {
//!     Decoded::Frame(frame) => {
//!         assert_eq!(frame.seq, 0xA3);
//!         assert!(frame.samples.iter().all(|&s| s == -2048));
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod ble;
pub mod command;
pub mod error;
pub mod frame;
pub mod usb;

pub use command::{DeviceCommand, EncodeCommand, Gain};
pub use error::{DecodeError, ProtocolError};
pub use frame::{decode_payload, encode_samples, Frame, PAYLOAD_LEN, SAMPLES_PER_FRAME};

/// Transport a sensor is reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Transport {
    /// USB CDC serial link
    Usb,
    /// Bluetooth Low Energy (Nordic UART service)
    Ble,
}

impl Transport {
    /// Returns a human-readable name for the transport
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Usb => "USB",
            Transport::Ble => "BLE",
        }
    }

    /// Mask applied to the wire sequence number
    ///
    /// USB lines carry an 8-bit counter, BLE packets only a nibble. The two
    /// sequence spaces are independent and never compared to each other.
    pub fn sequence_mask(&self) -> u8 {
        match self {
            Transport::Usb => 0xFF,
            Transport::Ble => 0x0F,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of feeding one transport unit (a line or a notification) to a parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A validated, decoded frame
    Frame(Frame),
    /// Not a data unit (noise, partial read, wrong header); keep reading
    Skip,
    /// Looked like a data unit but the payload was malformed; drop it
    Fatal(ProtocolError),
}

impl Decoded {
    /// Returns the frame if this outcome carries one
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Decoded::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}
