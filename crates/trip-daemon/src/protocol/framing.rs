//! Length-prefixed frame codec for the verifier's byte interface.
//!
//! Each frame is a 4-byte big-endian length prefix followed by one
//! canonical CBOR message. The frame length is validated against the
//! cap before any allocation, so a hostile length prefix cannot exhaust
//! memory.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::ProtocolError;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Hard cap on a single frame: a full breadcrumb batch stays well under
/// this.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Length-prefixed binary frame codec for use with
/// [`tokio_util::codec::Framed`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Creates a codec with the protocol frame cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Creates a codec with a tighter cap (tests, constrained
    /// transports).
    ///
    /// # Panics
    ///
    /// Panics if `max` exceeds [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn with_max_size(max: usize) -> Self {
        assert!(
            max <= MAX_FRAME_SIZE,
            "frame cap {max} exceeds protocol limit {MAX_FRAME_SIZE}"
        );
        Self {
            max_frame_size: max,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        // Validate before reserving or splitting anything.
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from_static(b"\xa1\x00\x01");

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..HEADER_LEN], &[0, 0, 0, 3]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut codec = FrameCodec::new();

        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&[0u8, 0, 0, 8, 1, 2, 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn oversized_prefix_rejected_before_allocation() {
        let mut codec = FrameCodec::with_max_size(1024);
        let mut buf = BytesMut::new();
        buf.put_u32(1025);
        buf.extend_from_slice(&[0u8; 8]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge {
                size: 1025,
                max: 1024
            })
        ));
    }

    #[test]
    fn oversized_payload_not_encoded() {
        let mut codec = FrameCodec::with_max_size(16);
        let mut buf = BytesMut::new();
        assert!(codec
            .encode(Bytes::from(vec![0u8; 17]), &mut buf)
            .is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let first = Bytes::from_static(b"one");
        let second = Bytes::from_static(b"two!");

        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }
}
