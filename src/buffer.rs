//! Staging memory shared between a ring algorithm, its proxies and the
//! network backend.
//!
//! A [`SharedBuffer`] is a fixed-size, pack-aligned byte region that several
//! threads (and, for the MPI backend, the MPI library itself) read and write
//! concurrently. Access to any given byte range is serialized by the step
//! protocol in [`crate::transport::ConnectorMem`], not by a lock: a range is
//! written by exactly one side, then handed over by publishing a
//! [`StepFlag`](crate::spin::StepFlag).

use std::cell::UnsafeCell;
use std::ops::Range;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Pack-aligned byte region with interior mutability.
///
/// # Safety Contract
///
/// The methods are safe to call, but two threads must never access
/// overlapping bytes at the same time when at least one of them writes. The
/// step flags guarantee this for connector buffers.
pub struct SharedBuffer {
    words: Box<[UnsafeCell<u64>]>,
    len: usize,
}

// SAFETY: all access goes through raw-pointer copies whose exclusivity is
// guaranteed by the step protocol documented above.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Zero-filled buffer of `len` bytes, 8-byte aligned.
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(8)).map(|_| UnsafeCell::new(0)).collect();
        SharedBuffer { words, len }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address, for backends that need a raw pointer.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.words.as_ptr()).cast::<u8>()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::InvalidBuffer),
        }
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: bounds checked above; exclusivity per the safety contract.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy bytes starting at `offset` into `out`.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check(offset, out.len())?;
        // SAFETY: bounds checked above; exclusivity per the safety contract.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_mut_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Typed write of `data` at byte `offset`.
    pub fn write_elems<T: bytemuck::Pod>(&self, offset: usize, data: &[T]) -> Result<()> {
        self.write(offset, bytemuck::cast_slice(data))
    }

    /// Typed read into `out` from byte `offset`.
    pub fn read_elems<T: bytemuck::Pod>(&self, offset: usize, out: &mut [T]) -> Result<()> {
        self.read(offset, bytemuck::cast_slice_mut(out))
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer").field("len", &self.len).finish()
    }
}

/// A byte range of a [`SharedBuffer`], the unit handed to network backends.
///
/// Holding the `Arc` keeps the memory alive while an asynchronous operation
/// is in flight.
#[derive(Debug, Clone)]
pub struct Region {
    buffer: Arc<SharedBuffer>,
    offset: usize,
    len: usize,
}

impl Region {
    /// View `range` of `buffer`.
    pub fn new(buffer: Arc<SharedBuffer>, range: Range<usize>) -> Result<Self> {
        if range.start > range.end {
            return Err(Error::InvalidBuffer);
        }
        buffer.check(range.start, range.len())?;
        Ok(Region {
            buffer,
            offset: range.start,
            len: range.len(),
        })
    }

    /// The whole of `buffer`.
    pub fn whole(buffer: Arc<SharedBuffer>) -> Self {
        let len = buffer.len();
        Region {
            buffer,
            offset: 0,
            len,
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the region inside its buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Region truncated to its first `len` bytes.
    pub fn prefix(&self, len: usize) -> Result<Self> {
        if len > self.len {
            return Err(Error::InvalidBuffer);
        }
        Ok(Region {
            buffer: Arc::clone(&self.buffer),
            offset: self.offset,
            len,
        })
    }

    /// Copy the region's bytes into a new vector.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.len];
        self.buffer.read(self.offset, &mut out)?;
        Ok(out)
    }

    /// Copy `data` to the start of the region.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.len {
            return Err(Error::InvalidBuffer);
        }
        self.buffer.write(self.offset, data)
    }

    /// Raw pointer to the first byte, for FFI backends.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        // SAFETY: offset was bounds checked at construction.
        unsafe { self.buffer.as_mut_ptr().add(self.offset) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_pack_aligned() {
        let buf = SharedBuffer::new(13);
        assert_eq!(buf.as_mut_ptr() as usize % 8, 0);
        assert_eq!(buf.len(), 13);
    }

    #[test]
    fn read_write_round_trip() {
        let buf = SharedBuffer::new(16);
        buf.write(3, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 5];
        buf.read(2, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2, 3, 0]);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let buf = SharedBuffer::new(8);
        assert!(matches!(buf.write(6, &[0; 3]), Err(Error::InvalidBuffer)));
        assert!(matches!(buf.read(usize::MAX, &mut [0; 1]), Err(Error::InvalidBuffer)));
    }

    #[test]
    fn typed_access() {
        let buf = SharedBuffer::new(32);
        buf.write_elems(8, &[1.5f32, -2.0]).unwrap();
        let mut out = [0f32; 2];
        buf.read_elems(8, &mut out).unwrap();
        assert_eq!(out, [1.5, -2.0]);
    }

    #[test]
    fn regions() {
        let buf = Arc::new(SharedBuffer::new(64));
        let region = Region::new(Arc::clone(&buf), 16..32).unwrap();
        assert_eq!(region.len(), 16);
        region.write(b"hello").unwrap();
        assert_eq!(&region.prefix(5).unwrap().to_vec().unwrap(), b"hello");
        assert!(region.prefix(17).is_err());
        assert!(Region::new(buf, 60..68).is_err());
    }
}
