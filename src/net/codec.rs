//! Length-prefixed framing
//!
//! Every frame is a 4-byte little-endian length followed by that many bytes.

use crate::net::error::NetError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted from the wire (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the length header
const HEADER_LEN: usize = 4;

/// Codec for length-prefixed frames
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = NetError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(NetError::InvalidPacket(format!(
                "frame of {} bytes exceeds limit",
                item.len()
            )));
        }

        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Sizes are signed on the wire; anything negative or oversized is rejected
        let declared = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if declared < 0 || declared as usize > MAX_FRAME_SIZE {
            return Err(NetError::InvalidPacket(format!(
                "declared frame size {}",
                declared
            )));
        }
        let len = declared as usize;

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len)))
    }
}
