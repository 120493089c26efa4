//! Owned host memory blocks.

use crate::error::{Error, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Alignment for host blocks. Wide enough for SIMD loads and for DMA
/// staging on every backend we care about.
const HOST_ALIGN: usize = 64;

/// An owned, aligned, zero-initialized host allocation.
///
/// This is the host-side backing store for [`SyncedBuffer`](super::SyncedBuffer)
/// when the buffer owns its memory. The block is freed on drop.
pub struct HostBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostBlock {
    /// Allocate a zeroed block of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is 0 or the allocation fails.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }
        let layout = Layout::from_size_align(size, HOST_ALIGN)
            .map_err(|e| Error::AllocationFailed(e.to_string()))?;
        // SAFETY: layout has non-zero size, checked above.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::AllocationFailed(format!("{size} bytes")))?;
        Ok(Self { ptr, layout })
    }

    /// Pointer to the start of the block.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable pointer to the start of the block.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the block in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Check if the block is empty. Always false: zero-size blocks cannot
    /// be constructed.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// View the block as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() bytes for the life of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// View the block as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid and we hold &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the block has exclusive ownership of its allocation; access from
// multiple threads is coordinated by the owner (SyncedBuffer's lock).
unsafe impl Send for HostBlock {}
unsafe impl Sync for HostBlock {}

impl std::fmt::Debug for HostBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBlock")
            .field("len", &self.len())
            .field("align", &self.layout.align())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zeroed_and_aligned() {
        let block = HostBlock::new(4096).unwrap();
        assert_eq!(block.len(), 4096);
        assert_eq!(block.as_ptr() as usize % HOST_ALIGN, 0);
        assert!(block.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_size_rejected() {
        assert!(HostBlock::new(0).is_err());
    }

    #[test]
    fn writes_stick() {
        let mut block = HostBlock::new(16).unwrap();
        block.as_mut_slice()[..5].copy_from_slice(b"hello");
        assert_eq!(&block.as_slice()[..5], b"hello");
    }
}
