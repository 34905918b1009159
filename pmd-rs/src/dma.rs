//! Buffers handed to the submission primitives must come from this
//! allocator. Buffers are zeroed and aligned so that a command never sees a
//! payload that straddles an unaligned boundary, matching what a DMA engine
//! would require.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
};

use snafu::Snafu;

#[derive(Debug, Snafu, Clone)]
pub enum DmaError {
    #[snafu(display("Failed to allocate DMA buffer of {} bytes", size))]
    Alloc { size: u64 },
}

/// Aligned, zero-initialized buffer released when dropped.
#[derive(Debug)]
pub struct DmaBuf {
    buf: NonNull<u8>,
    length: u64,
    layout: Layout,
}

impl DmaBuf {
    /// Allocate a buffer suitable for IO. The alignment is normally the
    /// sector size of the target namespace.
    pub fn new(size: u64, alignment: u64) -> Result<Self, DmaError> {
        let align = alignment.max(1).next_power_of_two() as usize;
        let layout = Layout::from_size_align(size as usize, align)
            .map_err(|_| DmaError::Alloc { size })?;
        let buf = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(DmaError::Alloc { size })?;
        Ok(Self {
            buf,
            length: size,
            layout,
        })
    }

    /// convert the buffer to a slice
    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.buf.as_ptr(), self.length as usize) }
    }

    /// convert the buffer to a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.buf.as_ptr(), self.length as usize) }
    }

    /// fill the buffer with the given value
    pub fn fill(&mut self, val: u8) {
        self.as_mut_slice().iter_mut().for_each(|b| *b = val);
    }

    /// Raw pointer for the submission path. The buffer must stay alive until
    /// the completion callback of the command it was submitted with fires.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_ptr()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    /// Return length of the allocated buffer.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.buf.as_ptr(), self.layout) }
    }
}
