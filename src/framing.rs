//! Framing of envelopes written to client sessions.
//!
//! Each frame is a 3-byte big-endian length prefix followed by the encoded
//! envelope.

use bytes::{Buf, Bytes, BytesMut};
use log::trace;
use thiserror::Error;

pub const FRAME_LENGTH_SIZE: usize = 3;
pub const FRAME_MAX_SIZE: usize = 1 << 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("Frame is too large (max: {max}, got: {len})")]
    TooLarge { max: usize, len: usize },
}

pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FramingError> {
    let payload_len = payload.len();
    if payload_len >= FRAME_MAX_SIZE {
        return Err(FramingError::TooLarge {
            max: FRAME_MAX_SIZE,
            len: payload_len,
        });
    }

    let mut data = BytesMut::with_capacity(FRAME_LENGTH_SIZE + payload_len);
    let len_bytes = u32::to_be_bytes(payload_len as u32);
    data.extend_from_slice(&len_bytes[1..]);
    data.extend_from_slice(payload);

    trace!("--> Encoded frame: {payload_len} bytes");
    Ok(data.freeze())
}

/// Buffers session output and splits it back into frames.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete frame, if one is buffered.
    pub fn decode_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < FRAME_LENGTH_SIZE {
            return None;
        }

        let frame_len = ((self.buffer[0] as usize) << 16)
            | ((self.buffer[1] as usize) << 8)
            | (self.buffer[2] as usize);

        if self.buffer.len() < FRAME_LENGTH_SIZE + frame_len {
            return None;
        }
        self.buffer.advance(FRAME_LENGTH_SIZE);
        Some(self.buffer.split_to(frame_len).freeze())
    }
}
