//! USB line protocol
//!
//! The sensor enumerates as a CDC serial port at 115200 baud. Streaming data
//! arrives as newline-terminated ASCII lines:
//!
//! ```text
//! <seq hex>:<108 hex chars>\r\n
//! ```
//!
//! where the 108 hex characters are the 54-byte payload. Anything else on the
//! line (boot banners, partial reads, blank lines) is skipped.
//!
//! # Commands
//! - `S0\r\n` - start streaming
//! - `B0\r\n` - stop streaming
//! - `G<X>\r\n` - set gain, `X` a single uppercase hex nibble

use crate::command::{DeviceCommand, EncodeCommand, Gain};
use crate::error::ProtocolError;
use crate::frame::{Frame, PAYLOAD_LEN};
use crate::Decoded;

/// Hex characters in a payload field
pub const PAYLOAD_HEX_LEN: usize = PAYLOAD_LEN * 2;

/// Maximum buffered bytes without a newline before the buffer is discarded
const MAX_LINE_LEN: usize = 512;

/// USB wire command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbCommand {
    /// `S0`
    Start,
    /// `B0`
    Stop,
    /// `G<X>`
    Gain(Gain),
}

impl From<DeviceCommand> for UsbCommand {
    fn from(cmd: DeviceCommand) -> Self {
        match cmd {
            DeviceCommand::Start => UsbCommand::Start,
            DeviceCommand::Stop => UsbCommand::Stop,
            DeviceCommand::SetGain(gain) => UsbCommand::Gain(gain),
        }
    }
}

impl EncodeCommand for UsbCommand {
    fn encode(&self) -> Vec<u8> {
        let line = match self {
            UsbCommand::Start => "S0".to_string(),
            UsbCommand::Stop => "B0".to_string(),
            UsbCommand::Gain(gain) => format!("G{:X}", gain.value()),
        };
        format!("{}\r\n", line).into_bytes()
    }
}

/// Parse one line (with or without its terminator)
///
/// Lines that do not have the `<hex>:<108 hex>` shape are skipped. A line
/// that has the shape but whose fields cannot be converted is fatal for that
/// frame only. Bytes that are not valid UTF-8 are dropped before parsing,
/// so line noise next to an otherwise intact frame does not lose it.
pub fn parse_line(line: &[u8]) -> Decoded {
    let mut text = String::from_utf8_lossy(line);
    if text.contains(char::REPLACEMENT_CHARACTER) {
        text = text
            .chars()
            .filter(|&c| c != char::REPLACEMENT_CHARACTER)
            .collect::<String>()
            .into();
    }
    let text = text.trim();

    let Some((seq_field, payload_field)) = text.split_once(':') else {
        return Decoded::Skip;
    };
    let seq_field = seq_field.trim_end();
    let payload_field = payload_field.trim_start();

    if seq_field.is_empty() || !seq_field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Decoded::Skip;
    }
    if payload_field.len() != PAYLOAD_HEX_LEN
        || !payload_field.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Decoded::Skip;
    }

    // Counters wider than u64 are still valid lines; only the low byte matters
    let tail = &seq_field[seq_field.len().saturating_sub(2)..];
    let seq = match u8::from_str_radix(tail, 16) {
        Ok(seq) => seq,
        Err(e) => return Decoded::Fatal(ProtocolError::BadSequence(e.to_string())),
    };

    let payload = match decode_hex(payload_field) {
        Ok(bytes) => bytes,
        Err(e) => return Decoded::Fatal(e),
    };
    if payload.len() != PAYLOAD_LEN {
        return Decoded::Fatal(ProtocolError::BadHex(format!(
            "expected {} bytes, got {}",
            PAYLOAD_LEN,
            payload.len()
        )));
    }

    match Frame::from_payload(seq, &payload) {
        Ok(frame) => Decoded::Frame(frame),
        Err(e) => Decoded::Fatal(e.into()),
    }
}

/// Decode an even-length hex string into bytes
fn decode_hex(hex: &str) -> Result<Vec<u8>, ProtocolError> {
    if hex.len() % 2 != 0 {
        return Err(ProtocolError::BadHex(format!("odd length {}", hex.len())));
    }
    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).map_err(|e| ProtocolError::BadHex(e.to_string()))?;
            u8::from_str_radix(s, 16).map_err(|e| ProtocolError::BadHex(format!("{s:?}: {e}")))
        })
        .collect()
}

/// Streaming USB line decoder
///
/// Accepts arbitrary byte chunks (as delivered by serial reads) and yields one
/// [`Decoded`] outcome per complete line.
pub struct UsbLineCodec {
    buffer: Vec<u8>,
}

impl UsbLineCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    /// Push raw bytes into the codec buffer
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > MAX_LINE_LEN && !self.buffer.contains(&b'\n') {
            tracing::warn!(
                "Discarding {} bytes without a line terminator",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    /// Extract the outcome of the next complete line, if any
    pub fn next_decoded(&mut self) -> Option<Decoded> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        Some(parse_line(&line))
    }

    /// Extract the next decoded frame, discarding skipped lines
    ///
    /// Malformed payloads are logged and dropped.
    pub fn next_frame(&mut self) -> Option<Frame> {
        while let Some(decoded) = self.next_decoded() {
            match decoded {
                Decoded::Frame(frame) => return Some(frame),
                Decoded::Skip => {}
                Decoded::Fatal(e) => tracing::warn!("Dropping malformed USB frame: {}", e),
            }
        }
        None
    }

    /// Clear the internal buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for UsbLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a frame as a wire line, the way the sensor sends it
pub fn encode_line(frame: &Frame) -> Vec<u8> {
    let payload = crate::frame::encode_samples(&frame.samples);
    let mut line = format!("{:02X}:", frame.seq);
    for b in payload {
        line.push_str(&format!("{:02X}", b));
    }
    line.push_str("\r\n");
    line.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn zero_line(seq: &str) -> String {
        format!("{}:{}\r\n", seq, "0".repeat(PAYLOAD_HEX_LEN))
    }

    #[test]
    fn test_parse_zero_line() {
        let frame = parse_line(zero_line("A3").as_bytes()).into_frame().unwrap();
        assert_eq!(frame.seq, 0xA3);
        assert_eq!(frame.samples.len(), 36);
        assert!(frame.samples.iter().all(|&s| s == -2048));
    }

    #[test]
    fn test_sequence_masked_to_eight_bits() {
        let frame = parse_line(zero_line("1A3").as_bytes()).into_frame().unwrap();
        assert_eq!(frame.seq, 0xA3);

        let frame = parse_line(zero_line("5").as_bytes()).into_frame().unwrap();
        assert_eq!(frame.seq, 5);
    }

    #[test]
    fn test_whitespace_tolerated() {
        let line = format!("  0f : {}  \r\n", "F".repeat(PAYLOAD_HEX_LEN));
        let frame = parse_line(line.as_bytes()).into_frame().unwrap();
        assert_eq!(frame.seq, 0x0F);
        assert!(frame.samples.iter().all(|&s| s == 2047));
    }

    #[test]
    fn test_missing_colon_skipped() {
        let line = format!("A3{}\r\n", "0".repeat(PAYLOAD_HEX_LEN));
        assert_eq!(parse_line(line.as_bytes()), Decoded::Skip);
    }

    #[test]
    fn test_short_payload_skipped() {
        let line = format!("A3:{}\r\n", "0".repeat(PAYLOAD_HEX_LEN - 2));
        assert_eq!(parse_line(line.as_bytes()), Decoded::Skip);
    }

    #[test]
    fn test_noise_skipped() {
        assert_eq!(parse_line(b""), Decoded::Skip);
        assert_eq!(parse_line(b"\r\n"), Decoded::Skip);
        assert_eq!(parse_line(b"PS02 ready\r\n"), Decoded::Skip);
        assert_eq!(parse_line(&[0xFF, 0xFE, b':']), Decoded::Skip);
    }

    #[test]
    fn test_invalid_utf8_noise_dropped() {
        let mut line = vec![0xFF];
        line.extend_from_slice(zero_line("A3").as_bytes());
        let frame = parse_line(&line).into_frame().unwrap();
        assert_eq!(frame.seq, 0xA3);

        let mut line = zero_line("A3").into_bytes();
        line.insert(3, 0xC3);
        assert_eq!(parse_line(&line).into_frame().unwrap().seq, 0xA3);
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(UsbCommand::Start.encode(), b"S0\r\n");
        assert_eq!(UsbCommand::Stop.encode(), b"B0\r\n");
        assert_eq!(UsbCommand::Gain(Gain::new(10).unwrap()).encode(), b"GA\r\n");
        assert_eq!(UsbCommand::Gain(Gain::new(3).unwrap()).encode(), b"G3\r\n");
        assert_eq!(
            UsbCommand::from(DeviceCommand::SetGain(Gain::MAX)).encode(),
            b"GF\r\n"
        );
    }

    #[test]
    fn test_streaming_parse() {
        let mut codec = UsbLineCodec::new();
        let line = zero_line("01");
        let (head, tail) = line.as_bytes().split_at(40);

        codec.push_bytes(b"boot\r\n");
        codec.push_bytes(head);
        assert!(codec.next_frame().is_none());

        codec.push_bytes(tail);
        let frame = codec.next_frame().unwrap();
        assert_eq!(frame.seq, 1);
        assert!(codec.next_decoded().is_none());
    }

    #[test]
    fn test_runaway_buffer_discarded() {
        let mut codec = UsbLineCodec::new();
        codec.push_bytes(&[b'0'; MAX_LINE_LEN + 1]);
        assert!(codec.next_decoded().is_none());

        codec.push_bytes(zero_line("02").as_bytes());
        assert_eq!(codec.next_frame().unwrap().seq, 2);
    }

    #[test]
    fn test_encode_line_parses_back() {
        let mut samples = [0i16; 36];
        for (i, s) in samples.iter_mut().enumerate() {
            *s = i as i16 * 100 - 1800;
        }
        let frame = Frame::new(0x42, samples);
        let parsed = parse_line(&encode_line(&frame)).into_frame().unwrap();
        assert_eq!(parsed.seq, 0x42);
        assert_eq!(parsed.samples, samples);
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..300)) {
            let _ = parse_line(&data);
        }

        #[test]
        fn any_hex_sequence_is_masked(seq in any::<u32>()) {
            let line = zero_line(&format!("{:X}", seq));
            let frame = parse_line(line.as_bytes()).into_frame().unwrap();
            prop_assert_eq!(frame.seq, (seq & 0xFF) as u8);
        }
    }
}
