use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, FrameType, HEADER_LEN, MAGIC_BYTE, PROTOCOL_VERSION};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during encoding/decoding.
///
/// Any decode error means the byte stream is corrupt past recovery; the
/// owning stream must be closed.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Bad magic byte: {0:#04x}")]
    BadMagic(u8),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("Malformed {0} payload")]
    MalformedPayload(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binary frame codec for the tunnel protocol.
///
/// Wire format:
/// ```text
/// +-------+---------+------------+----------------+--------------+---------+
/// | magic | version | frame_type | exchange_id    | length       | payload |
/// | 1B    | 1B      | 1B         | 8B big-endian  | 4B big-endian| N bytes |
/// +-------+---------+------------+----------------+--------------+---------+
/// ```
///
/// The codec is stateless: decoding consumes nothing until a full frame is
/// buffered, so it can be driven incrementally from any byte stream.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validate the fixed header before waiting for the payload, so a
        // desynchronized stream fails fast instead of stalling on a bogus
        // length field.
        if src[0] != MAGIC_BYTE {
            return Err(CodecError::BadMagic(src[0]));
        }
        if src[1] != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(src[1]));
        }
        let frame_type = FrameType::try_from(src[2])?;

        let exchange_id = u64::from_be_bytes(src[3..11].try_into().unwrap());
        let length = u32::from_be_bytes(src[11..15].try_into().unwrap()) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            frame_type,
            exchange_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(frame.payload.len()));
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(MAGIC_BYTE);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(frame.frame_type as u8);
        dst.put_u64(frame.exchange_id);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);

        Ok(())
    }
}
