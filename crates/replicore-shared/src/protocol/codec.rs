//! Length-prefixed framing of wire messages.
//!
//! Every record on a replication connection is a 32-bit big-endian length
//! followed by that many bytes of a serialized message. The codec yields and
//! accepts raw frames; message typing is decided by the surrounding exchange
//! (header frame first, then the body frame its type tag announces).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::ReplicaError;

/// Hard cap on a single frame, guarding against corrupted length prefixes
pub const MAX_FRAME_SIZE_BYTES: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Framing codec for replication connections
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ReplicaError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ReplicaError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let mut length_bytes = [0u8; LENGTH_PREFIX_BYTES];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > MAX_FRAME_SIZE_BYTES {
            return Err(ReplicaError::protocol(format!(
                "frame length {length} exceeds the {MAX_FRAME_SIZE_BYTES} byte limit"
            )));
        }
        if src.len() < LENGTH_PREFIX_BYTES + length {
            src.reserve(LENGTH_PREFIX_BYTES + length - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_BYTES);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ReplicaError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), ReplicaError> {
        if frame.len() > MAX_FRAME_SIZE_BYTES {
            return Err(ReplicaError::protocol(format!(
                "refusing to send a {} byte frame",
                frame.len()
            )));
        }
        dst.reserve(LENGTH_PREFIX_BYTES + frame.len());
        dst.put_u32(frame.len() as u32);
        dst.put_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_then_decode_round_trip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"hello"), &mut buf)
            .unwrap();
        codec.encode(Bytes::from_static(b""), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b""[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_waits_for_partial_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"abc");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(b"defghij");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"abcdefghij"[..]);
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"xy"), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 2]);
    }
}
