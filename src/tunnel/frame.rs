//! Multiplexing frame for the tunnel protocol
//!
//! Frame format (before obfuscation):
//! ```text
//! +--------+--------+--------+--------+
//! |            Stream ID (4B)         |
//! +--------+--------+--------+--------+
//! |            Sequence (4B)          |
//! +--------+--------+--------+--------+
//! |            Closing (4B)           |
//! +--------+--------+--------+--------+
//! |        Payload (<= 16396B)        |
//! +--------+--------+--------+--------+
//! ```
//!
//! Each frame travels as the body of one TLS application-data record, so
//! the record length doubles as the payload length.

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 12;

/// Maximum payload per frame, matching realistic browser TLS record sizes
pub const MAX_PAYLOAD_SIZE: usize = 16396;

/// Random filler carried by closing frames
pub const CLOSING_FILLER_LEN: usize = 16;

const CLOSING_FLAG: u32 = 1;

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream ID
    pub stream_id: u32,
    /// Per-stream, per-direction sequence number
    pub seq: u32,
    /// Last frame of the stream in this direction
    pub closing: bool,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new data frame
    pub fn data(stream_id: u32, seq: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            seq,
            closing: false,
            payload,
        }
    }

    /// Create a stream close frame.
    ///
    /// The payload is random filler and is discarded by the receiver.
    pub fn closing(stream_id: u32, seq: u32) -> Self {
        let mut filler = vec![0u8; CLOSING_FILLER_LEN];
        crate::crypto::random_bytes(&mut filler);
        Self {
            stream_id,
            seq,
            closing: true,
            payload: Bytes::from(filler),
        }
    }

    /// Encode the plaintext header
    pub fn header(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut buf = &mut header[..];
        buf.put_u32(self.stream_id);
        buf.put_u32(self.seq);
        buf.put_u32(if self.closing { CLOSING_FLAG } else { 0 });
        header
    }

    /// Decode a plaintext frame (header + payload)
    pub fn decode(mut buf: &[u8]) -> Result<Self, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TunnelError::InvalidFrame(format!(
                "frame too short: {} bytes",
                buf.len()
            )));
        }
        let payload_len = buf.len() - FRAME_HEADER_SIZE;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let stream_id = buf.get_u32();
        let seq = buf.get_u32();
        let closing = match buf.get_u32() {
            0 => false,
            CLOSING_FLAG => true,
            other => {
                return Err(TunnelError::InvalidFrame(format!(
                    "bad closing flag: {}",
                    other
                )))
            }
        };

        Ok(Self {
            stream_id,
            seq,
            closing,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data(42, 7, Bytes::from_static(b"Hello, World!"));
        let mut encoded = original.header().to_vec();
        encoded.extend_from_slice(&original.payload);

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_closing_frame_has_filler() {
        let frame = Frame::closing(3, 9);
        assert!(frame.closing);
        assert_eq!(frame.payload.len(), CLOSING_FILLER_LEN);
        assert_eq!(frame.encoded_size(), FRAME_HEADER_SIZE + CLOSING_FILLER_LEN);
    }

    #[test]
    fn test_rejects_short_and_oversized() {
        assert!(Frame::decode(&[0u8; 4]).is_err());
        let oversized = vec![0u8; FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            Frame::decode(&oversized),
            Err(TunnelError::FrameTooLarge(_, _))
        ));
    }

    #[test]
    fn test_rejects_bad_closing_flag() {
        let mut raw = Frame::data(1, 0, Bytes::new()).header();
        raw[11] = 5;
        assert!(Frame::decode(&raw).is_err());
    }
}
