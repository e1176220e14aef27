//! Write cursor over a caller-supplied code region.
//!
//! The buffer never allocates: it appends into the slice it was given and
//! reports absolute addresses so backends can encode relative branches and
//! align loop targets to instruction-fetch boundaries.

use thiserror::Error;

/// Error types for code buffer writes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeBufferError {
    #[error("Code buffer overflow: {needed} bytes needed, {remaining} remaining")]
    Overflow { needed: usize, remaining: usize },
}

/// Append-only cursor over a writable code region.
pub struct CodeBuffer<'a> {
    region: &'a mut [u8],
    len: usize,
}

impl<'a> CodeBuffer<'a> {
    pub fn new(region: &'a mut [u8]) -> Self {
        Self { region, len: 0 }
    }

    /// Offset of the cursor from the start of the region.
    pub fn position(&self) -> usize {
        self.len
    }

    /// Total size of the region.
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn remaining(&self) -> usize {
        self.region.len() - self.len
    }

    /// Absolute address of the region start.
    pub fn base_address(&self) -> usize {
        self.region.as_ptr() as usize
    }

    /// Absolute address of the cursor.
    pub fn address(&self) -> usize {
        self.base_address() + self.len
    }

    /// Absolute address of a region offset.
    pub fn address_of(&self, offset: usize) -> usize {
        self.base_address() + offset
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.region[..self.len]
    }

    /// Mutable view of an already written fragment.
    pub fn fragment_mut(&mut self, start: usize, len: usize) -> &mut [u8] {
        debug_assert!(start + len <= self.len);
        &mut self.region[start..start + len]
    }

    /// Append `bytes` and return the offset they start at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, CodeBufferError> {
        if bytes.len() > self.remaining() {
            return Err(CodeBufferError::Overflow {
                needed: bytes.len(),
                remaining: self.remaining(),
            });
        }

        let start = self.len;
        self.region[start..start + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(start)
    }

    /// Padding needed so that the address `bias` bytes past the cursor lands
    /// on a multiple of `boundary`.
    pub fn padding_for(&self, boundary: usize, bias: usize) -> usize {
        assert!(boundary.is_power_of_two(), "boundary must be a power of two");
        let misalignment = (self.address() + bias) & (boundary - 1);
        (boundary - misalignment) & (boundary - 1)
    }

    /// Pad with `fill` until `address() + bias` is `boundary` aligned.
    /// Returns the number of padding bytes written.
    pub fn align_to(&mut self, boundary: usize, bias: usize, fill: u8) -> Result<usize, CodeBufferError> {
        let padding = self.padding_for(boundary, bias);
        if padding > self.remaining() {
            return Err(CodeBufferError::Overflow {
                needed: padding,
                remaining: self.remaining(),
            });
        }

        self.region[self.len..self.len + padding].fill(fill);
        self.len += padding;
        Ok(padding)
    }
}
