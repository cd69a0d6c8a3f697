//! Length-prefixed frame encoding and incremental decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

/// Frame header size in bytes (the little-endian body length prefix)
pub const HEADER_SIZE: usize = 4;

/// Default maximum body size accepted by a decoder (64 KiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Encode one frame: little-endian length prefix followed by the body.
///
/// Fails if the body exceeds `max_frame_size`; the bound is caller policy,
/// the format itself carries any u32 length.
pub fn encode_frame(body: &[u8], max_frame_size: usize) -> Result<Bytes, WireError> {
    if body.len() > max_frame_size {
        return Err(WireError::TooLarge(body.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Incremental frame decoder for a raw byte stream.
///
/// Feed arriving bytes into a `BytesMut` accumulator and call [`decode`]
/// until it returns `Ok(None)`. A frame whose declared body exceeds the size
/// policy yields `Err(WireError::Size)` exactly once; the decoder then
/// consumes and discards that body across subsequent calls, so the caller
/// can drop the frame and keep the session alive.
///
/// [`decode`]: FrameDecoder::decode
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
    /// Remaining bytes of an oversized body still to be discarded.
    skip: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default frame size policy
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with an explicit frame size policy
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            skip: 0,
        }
    }

    /// Decode one complete body from `buf`, if available.
    ///
    /// Returns `Ok(None)` when more bytes are needed; partial frames are
    /// never yielded.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        loop {
            if self.skip > 0 {
                let n = self.skip.min(buf.len());
                buf.advance(n);
                self.skip -= n;
                if self.skip > 0 {
                    return Ok(None);
                }
                continue;
            }

            if buf.len() < HEADER_SIZE {
                return Ok(None);
            }

            let body_len =
                u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            if body_len > self.max_frame_size {
                buf.advance(HEADER_SIZE);
                self.skip = body_len;
                return Err(WireError::Size(body_len));
            }

            if buf.len() < HEADER_SIZE + body_len {
                return Ok(None);
            }

            buf.advance(HEADER_SIZE);
            return Ok(Some(buf.split_to(body_len).freeze()));
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
