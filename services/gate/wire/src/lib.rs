//! Stream framing for gate sessions.
//!
//! This crate provides the minimal wire format used to delimit messages on a
//! raw byte stream: a fixed little-endian length prefix followed by the
//! message body. The decoder is incremental: it consumes bytes as they
//! arrive, in whatever chunking the transport produces, and yields complete
//! bodies only.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 body_len (LE)    | length of the body         |
//! +----------------------+----------------------------+
//! | body                 | body_len bytes             |
//! +----------------------+----------------------------+
//! ```
//!
//! The maximum body length is decoder policy, not part of the format: an
//! oversized frame is skipped in place (its declared body is consumed and
//! discarded) so the stream stays delimited and later frames still decode.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;

pub use error::WireError;
pub use frame::{encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
