//! A growable byte buffer with a logical length.

use bytes::BytesMut;

/// Initial capacity of a freshly allocated buffer
pub const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024;

/// A byte buffer with a logical length at most its physical capacity.
///
/// Owned exclusively by whoever currently holds it: checked out of a
/// [`BufferPool`](crate::BufferPool), used, and returned exactly once.
#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    /// Allocate a buffer with the default capacity
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
        }
    }

    /// Current logical length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the logical length is zero
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Physical capacity of the backing storage
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Set the logical length to `len`, growing the backing storage only if
    /// its capacity is insufficient; otherwise the buffer is resized in
    /// place. New bytes are zeroed.
    pub fn ensure_capacity(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// Replace the buffer contents with `src` (ensure + copy).
    pub fn copy_from(&mut self, src: &[u8]) {
        self.ensure_capacity(src.len());
        self.data[..].copy_from_slice(src);
    }

    /// Reset the logical length to zero, keeping the backing storage
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// View the buffer contents
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the buffer contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
