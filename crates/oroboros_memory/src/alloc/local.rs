//! Per-thread allocator state: a free-list head and a section lease.
//! Also the size-prefixed block framing shared by the linear allocators.

#![allow(unsafe_code)]

use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::heap::{HeapAllocator, MemSection, MemSectionPtr};
use crate::threading::ThreadLocalValue;

/// One thread's view of an allocator.
///
/// Lives behind an uncontended mutex: other threads only lock it while
/// resetting frames or releasing a singleton.
#[derive(Debug, Default)]
pub(crate) struct ThreadHeap {
    /// First free block, for allocators with a free list.
    pub(crate) free: Option<NonNull<u8>>,
    section: MemSectionPtr,
}

// SAFETY: `free` points into the section this state leases; both move
// together and are only touched under the owning mutex.
unsafe impl Send for ThreadHeap {}

impl ThreadHeap {
    /// The leased section, leasing one of `kind` on first use.
    pub(crate) fn section(&mut self, kind: &str) -> &mut MemSection {
        if !self.section.valid() {
            self.section = HeapAllocator::instance().get_section(kind);
        }
        &mut self.section
    }

    /// Allocations served from the leased section since its last rewind.
    pub(crate) fn allocations(&self) -> usize {
        if self.section.valid() {
            self.section.allocation_count()
        } else {
            0
        }
    }

    /// Rewinds the section, keeping the lease.
    pub(crate) fn rewind(&mut self) {
        if self.section.valid() {
            self.section.reset();
        }
    }

    /// Forgets the free list and returns the section to the heap.
    pub(crate) fn clear(&mut self) {
        self.free = None;
        self.section.release();
    }
}

/// Per-thread states of one allocator instance.
pub(crate) type ThreadHeaps = ThreadLocalValue<Mutex<ThreadHeap>>;

/// Clears every thread's state.
pub(crate) fn clear_all(heaps: &ThreadHeaps) {
    heaps.visit_all(|heap| heap.lock().clear());
}

/// Bytes in front of every stack or frame block.
pub(crate) const SIZE_HEADER: usize = size_of::<usize>();

/// Alignment of stack and frame block starts.
pub(crate) const SIZED_BLOCK_ALIGNMENT: usize = align_of::<usize>();

/// Writes the size header at `block` and returns the payload behind it.
///
/// # Safety
///
/// `block` must be aligned to [`SIZED_BLOCK_ALIGNMENT`] with
/// `SIZE_HEADER + size` writable bytes.
pub(crate) unsafe fn stamp_size(block: NonNull<u8>, size: usize) -> NonNull<u8> {
    block.as_ptr().cast::<usize>().write(size);
    NonNull::new_unchecked(block.as_ptr().add(SIZE_HEADER))
}

/// Reads the size header in front of `payload`.
///
/// # Safety
///
/// `payload` must come from [`stamp_size`].
pub(crate) unsafe fn stamped_size(payload: NonNull<u8>) -> usize {
    payload.as_ptr().sub(SIZE_HEADER).cast::<usize>().read()
}
