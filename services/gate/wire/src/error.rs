//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Body length exceeds the decoder's frame size policy
    #[error("frame size limit exceeded: {0}")]
    Size(usize),

    /// Body too large to encode under the caller's limit
    #[error("message too large to encode: {0}")]
    TooLarge(usize),
}
