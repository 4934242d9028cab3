//! 54-byte payload codec
//!
//! The sensor packs 36 unsigned 12-bit samples into 18 groups of 3 bytes:
//!
//! ```text
//!   b0 = low byte of sample A
//!   b1 = low byte of sample B
//!   b2 = (high nibble of A) << 4 | (high nibble of B)
//! ```
//!
//! Decoded values are centered by subtracting 2048, so the full unsigned range
//! maps onto `-2048..=2047`.

use crate::error::DecodeError;

/// Payload size in bytes
pub const PAYLOAD_LEN: usize = 54;

/// Samples carried by one payload
pub const SAMPLES_PER_FRAME: usize = 36;

/// Offset subtracted from the raw 12-bit value
const CENTER: i16 = 2048;

/// One decoded unit of 36 samples plus its transport sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Transport-local sequence counter (8-bit for USB, 4-bit for BLE)
    pub seq: u8,
    /// Centered samples in `-2048..=2047`
    pub samples: [i16; SAMPLES_PER_FRAME],
    /// Raw payload the samples were decoded from
    pub raw: Option<[u8; PAYLOAD_LEN]>,
}

impl Frame {
    /// Create a frame without retaining the raw payload
    pub fn new(seq: u8, samples: [i16; SAMPLES_PER_FRAME]) -> Self {
        Self {
            seq,
            samples,
            raw: None,
        }
    }

    /// Decode a payload into a frame, keeping the raw bytes
    pub fn from_payload(seq: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let samples = decode_payload(payload)?;
        let mut raw = [0u8; PAYLOAD_LEN];
        raw.copy_from_slice(payload);
        Ok(Self {
            seq,
            samples,
            raw: Some(raw),
        })
    }
}

/// Decode 54 bytes into 36 signed samples
pub fn decode_payload(payload: &[u8]) -> Result<[i16; SAMPLES_PER_FRAME], DecodeError> {
    if payload.len() != PAYLOAD_LEN {
        return Err(DecodeError::PayloadLength {
            expected: PAYLOAD_LEN,
            actual: payload.len(),
        });
    }

    let mut out = [0i16; SAMPLES_PER_FRAME];
    for (i, group) in payload.chunks_exact(3).enumerate() {
        let (b0, b1, b2) = (group[0] as u16, group[1] as u16, group[2] as u16);
        out[2 * i] = (((b2 << 4) & 0x0F00) | b0) as i16 - CENTER;
        out[2 * i + 1] = (((b2 << 8) & 0x0F00) | b1) as i16 - CENTER;
    }
    Ok(out)
}

/// Pack 36 samples back into the 54-byte wire payload
///
/// Values outside `-2048..=2047` are truncated to their low 12 bits.
pub fn encode_samples(samples: &[i16; SAMPLES_PER_FRAME]) -> [u8; PAYLOAD_LEN] {
    let mut out = [0u8; PAYLOAD_LEN];
    for (i, pair) in samples.chunks_exact(2).enumerate() {
        let a = (pair[0].wrapping_add(CENTER) as u16) & 0x0FFF;
        let b = (pair[1].wrapping_add(CENTER) as u16) & 0x0FFF;
        out[3 * i] = (a & 0xFF) as u8;
        out[3 * i + 1] = (b & 0xFF) as u8;
        out[3 * i + 2] = (((a >> 8) as u8) << 4) | (b >> 8) as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_payload_decodes_to_negative_center() {
        let samples = decode_payload(&[0u8; PAYLOAD_LEN]).unwrap();
        assert!(samples.iter().all(|&s| s == -2048));
    }

    #[test]
    fn test_group_layout() {
        let mut payload = [0u8; PAYLOAD_LEN];
        // A = 0x801 -> 1, B = 0x7FF -> -1
        payload[0] = 0x01;
        payload[1] = 0xFF;
        payload[2] = 0x87;

        let samples = decode_payload(&payload).unwrap();
        assert_eq!(samples[0], 1);
        assert_eq!(samples[1], -1);
        assert_eq!(samples[2], -2048);
    }

    #[test]
    fn test_extremes() {
        let payload = [0xFFu8; PAYLOAD_LEN];
        let samples = decode_payload(&payload).unwrap();
        assert!(samples.iter().all(|&s| s == 2047));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert_eq!(
            decode_payload(&[0u8; 53]),
            Err(DecodeError::PayloadLength {
                expected: 54,
                actual: 53
            })
        );
        assert!(decode_payload(&[0u8; 55]).is_err());
        assert!(decode_payload(&[]).is_err());
    }

    #[test]
    fn test_from_payload_keeps_raw() {
        let payload = [0x11u8; PAYLOAD_LEN];
        let frame = Frame::from_payload(7, &payload).unwrap();
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.raw, Some(payload));
    }

    proptest! {
        #[test]
        fn decode_is_deterministic_and_in_range(payload in prop::collection::vec(any::<u8>(), PAYLOAD_LEN)) {
            let first = decode_payload(&payload).unwrap();
            let second = decode_payload(&payload).unwrap();
            prop_assert_eq!(first, second);
            prop_assert_eq!(first.len(), SAMPLES_PER_FRAME);
            for s in first {
                prop_assert!((-2048..=2047).contains(&s));
            }
        }

        #[test]
        fn encoder_inverts_decoder(payload in prop::collection::vec(any::<u8>(), PAYLOAD_LEN)) {
            let samples = decode_payload(&payload).unwrap();
            prop_assert_eq!(encode_samples(&samples).to_vec(), payload);
        }

        #[test]
        fn any_other_length_fails(len in 0usize..200) {
            prop_assume!(len != PAYLOAD_LEN);
            prop_assert!(decode_payload(&vec![0u8; len]).is_err());
        }
    }
}
