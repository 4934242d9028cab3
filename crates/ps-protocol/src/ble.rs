//! BLE notification protocol
//!
//! The sensor exposes the Nordic UART service. Data arrives as notifications
//! on the RX characteristic:
//!
//! ```text
//! [0x00] [seq] [54 payload bytes] [trailer...]
//! ```
//!
//! Only the low nibble of `seq` is the sequence counter. Control is done with
//! 5-byte writes to the TX characteristic: `FE 00 <op> <arg> 00`.

use uuid::Uuid;

use crate::command::{DeviceCommand, EncodeCommand, Gain};
use crate::frame::{Frame, PAYLOAD_LEN};
use crate::Decoded;

/// Nordic UART service
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// RX characteristic (device to host notifications)
pub const UART_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// TX characteristic (host to device writes)
pub const UART_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Minimum notification length: header, sequence and payload
pub const MIN_PACKET_LEN: usize = 2 + PAYLOAD_LEN;

const HEADER: u8 = 0x00;
const COMMAND_PREFIX: [u8; 2] = [0xFE, 0x00];

/// BLE control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleCommand {
    /// `FE 00 53 00 00`
    Start,
    /// `FE 00 42 00 00`
    Stop,
    /// `FE 00 47 <gain> 00`
    Gain(Gain),
}

impl BleCommand {
    fn opcode(&self) -> u8 {
        match self {
            BleCommand::Start => b'S',
            BleCommand::Stop => b'B',
            BleCommand::Gain(_) => b'G',
        }
    }

    fn argument(&self) -> u8 {
        match self {
            BleCommand::Gain(gain) => gain.value(),
            _ => 0,
        }
    }
}

impl From<DeviceCommand> for BleCommand {
    fn from(cmd: DeviceCommand) -> Self {
        match cmd {
            DeviceCommand::Start => BleCommand::Start,
            DeviceCommand::Stop => BleCommand::Stop,
            DeviceCommand::SetGain(gain) => BleCommand::Gain(gain),
        }
    }
}

impl EncodeCommand for BleCommand {
    fn encode(&self) -> Vec<u8> {
        vec![
            COMMAND_PREFIX[0],
            COMMAND_PREFIX[1],
            self.opcode(),
            self.argument(),
            0x00,
        ]
    }
}

/// Parse one notification payload
///
/// Short packets and packets with a non-zero header are skipped. BLE never
/// produces [`Decoded::Fatal`]; a packet that passes framing always carries
/// exactly 54 payload bytes.
pub fn parse_notification(packet: &[u8]) -> Decoded {
    if packet.len() < MIN_PACKET_LEN {
        tracing::trace!("Skipping short BLE packet ({} bytes)", packet.len());
        return Decoded::Skip;
    }
    if packet[0] != HEADER {
        tracing::trace!("Skipping BLE packet with header {:#04x}", packet[0]);
        return Decoded::Skip;
    }

    let seq = packet[1] & 0x0F;
    match Frame::from_payload(seq, &packet[2..MIN_PACKET_LEN]) {
        Ok(frame) => Decoded::Frame(frame),
        Err(_) => Decoded::Skip,
    }
}

/// Build a notification the way the sensor sends it
pub fn encode_notification(frame: &Frame) -> Vec<u8> {
    let mut packet = Vec::with_capacity(MIN_PACKET_LEN);
    packet.push(HEADER);
    packet.push(frame.seq & 0x0F);
    packet.extend_from_slice(&crate::frame::encode_samples(&frame.samples));
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_packet() {
        let mut packet = vec![0x00, 0x01];
        packet.extend_from_slice(&[0u8; PAYLOAD_LEN]);

        let frame = parse_notification(&packet).into_frame().unwrap();
        assert_eq!(frame.seq, 1);
        assert!(frame.samples.iter().all(|&s| s == -2048));
    }

    #[test]
    fn test_sequence_low_nibble() {
        let mut packet = vec![0x00, 0xA7];
        packet.extend_from_slice(&[0u8; PAYLOAD_LEN]);
        assert_eq!(parse_notification(&packet).into_frame().unwrap().seq, 7);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut packet = vec![0x00, 0x02];
        packet.extend_from_slice(&[0xFFu8; PAYLOAD_LEN]);
        packet.extend_from_slice(&[0x12, 0x34]);

        let frame = parse_notification(&packet).into_frame().unwrap();
        assert!(frame.samples.iter().all(|&s| s == 2047));
        assert_eq!(frame.raw, Some([0xFFu8; PAYLOAD_LEN]));
    }

    #[test]
    fn test_short_packet_skipped() {
        let packet = vec![0u8; MIN_PACKET_LEN - 1];
        assert_eq!(parse_notification(&packet), Decoded::Skip);
        assert_eq!(parse_notification(&[]), Decoded::Skip);
    }

    #[test]
    fn test_bad_header_skipped() {
        let mut packet = vec![0x01, 0x00];
        packet.extend_from_slice(&[0u8; PAYLOAD_LEN]);
        assert_eq!(parse_notification(&packet), Decoded::Skip);
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(BleCommand::Start.encode(), vec![0xFE, 0x00, 0x53, 0x00, 0x00]);
        assert_eq!(BleCommand::Stop.encode(), vec![0xFE, 0x00, 0x42, 0x00, 0x00]);
        assert_eq!(
            BleCommand::from(DeviceCommand::SetGain(Gain::new(9).unwrap())).encode(),
            vec![0xFE, 0x00, 0x47, 0x09, 0x00]
        );
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            UART_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            UART_RX_CHAR_UUID.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            UART_TX_CHAR_UUID.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_encode_notification_parses_back() {
        let mut samples = [0i16; 36];
        samples[0] = -5;
        samples[35] = 1234;
        let frame = Frame::new(0x1C, samples);
        let parsed = parse_notification(&encode_notification(&frame))
            .into_frame()
            .unwrap();
        assert_eq!(parsed.seq, 0x0C);
        assert_eq!(parsed.samples, samples);
    }
}
