//! # Memory Page
//!
//! A single contiguous region obtained from the system allocator. Pages are
//! the unit every section grows by.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::align::is_power_of_two;
use crate::error::{MemoryError, MemoryResult};
use crate::diag::raise_failure;
use crate::mem_assert;

/// A fixed-size, aligned region of system memory. Freed on drop.
///
/// Pages are move-only: there is exactly one owner of the region.
pub struct MemPage {
    memory: NonNull<u8>,
    layout: Layout,
}

// SAFETY: a page is plain owned memory with no thread affinity.
unsafe impl Send for MemPage {}
// SAFETY: `&MemPage` only exposes the address and size.
unsafe impl Sync for MemPage {}

impl MemPage {
    /// Allocates a page of `size` bytes aligned to `alignment`.
    ///
    /// Fails fatally if the system is out of memory or the arguments are
    /// invalid; use [`MemPage::try_allocate`] to check first.
    #[must_use]
    pub fn allocate(size: usize, alignment: usize) -> Self {
        match Self::try_allocate(size, alignment) {
            Ok(page) => page,
            Err(err) => raise_failure(file!(), line!(), format_args!("{err}")),
        }
    }

    /// Allocates a page, reporting failure instead of terminating.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::InvalidAlignment`] if `alignment` is not a power of two
    /// - [`MemoryError::PageAllocation`] if the system allocator refuses
    pub fn try_allocate(size: usize, alignment: usize) -> MemoryResult<Self> {
        if !is_power_of_two(alignment) {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        let failed = MemoryError::PageAllocation { size, alignment };
        // Zero-sized layouts are not allowed by the global allocator.
        let layout = Layout::from_size_align(size.max(1), alignment).map_err(|_| failed.clone())?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let memory = NonNull::new(raw).ok_or(failed)?;

        tracing::trace!(size, alignment, address = raw as usize, "page allocated");
        Ok(Self { memory, layout })
    }

    /// First byte of the page.
    #[inline]
    #[must_use]
    pub fn address(&self) -> NonNull<u8> {
        self.memory
    }

    /// Usable size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Alignment the page was requested with.
    #[inline]
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Pointer `offset` bytes into the page. `offset == size` is the end
    /// pointer.
    #[inline]
    #[must_use]
    pub fn at(&self, offset: usize) -> NonNull<u8> {
        mem_assert!(
            offset <= self.layout.size(),
            "offset {offset} outside page of {} bytes",
            self.layout.size()
        );
        // SAFETY: in bounds of (or one past) the allocation, so non-null.
        unsafe { NonNull::new_unchecked(self.memory.as_ptr().add(offset)) }
    }

    /// Returns `true` if `ptr` lies inside `[address, address + size)`.
    #[inline]
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.memory.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr - start < self.layout.size()
    }
}

impl Drop for MemPage {
    fn drop(&mut self) {
        // SAFETY: allocated in `try_allocate` with this exact layout.
        unsafe { alloc::dealloc(self.memory.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for MemPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPage")
            .field("address", &self.memory)
            .field("size", &self.layout.size())
            .field("alignment", &self.layout.align())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::is_aligned;

    #[test]
    fn test_page_allocation() {
        let page = MemPage::allocate(4096, 64);
        assert_eq!(page.size(), 4096);
        assert!(is_aligned(page.address(), 64));
    }

    #[test]
    fn test_contains_bounds() {
        let page = MemPage::allocate(128, 16);
        let start = page.address().as_ptr();
        assert!(page.contains(start));
        assert!(page.contains(start.wrapping_add(127)));
        assert!(!page.contains(start.wrapping_add(128)));
        assert!(!page.contains(start.wrapping_sub(1)));
    }

    #[test]
    fn test_page_is_writable() {
        let page = MemPage::allocate(64, 8);
        // SAFETY: the page owns 64 writable bytes.
        unsafe {
            std::ptr::write_bytes(page.address().as_ptr(), 0xAB, 64);
            assert_eq!(*page.address().as_ptr().add(63), 0xAB);
        }
    }

    #[test]
    fn test_try_allocate_rejects_alignment() {
        let err = MemPage::try_allocate(64, 3).unwrap_err();
        assert_eq!(err, MemoryError::InvalidAlignment(3));
    }

    #[test]
    fn test_try_allocate_reports_exhaustion() {
        let err = MemPage::try_allocate(usize::MAX - 64, 16).unwrap_err();
        assert!(matches!(err, MemoryError::PageAllocation { .. }));
    }
}
