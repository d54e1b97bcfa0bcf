//! # Fixed Blocks Allocator
//!
//! `N`-byte blocks served from a per-thread intrusive free list. A freed
//! block stores the address of the next free block in its first word.
//!
//! ```text
//!   thread free list:  head ──► [next|....] ──► [next|....] ──► null
//!   miss:              bump N bytes from the thread's section
//! ```
//!
//! Blocks freed on another thread join *that* thread's list.
//!
//! ## Safety Note
//!
//! Free-list links are written into freed blocks with unaligned accesses
//! (block alignment follows `N`, which may be below pointer alignment).

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};

use super::local::{clear_all, ThreadHeap, ThreadHeaps};
use super::singleton::{instance_of, DelayedRelease};
use super::{AlignedAllocator, AlignedState, MemAllocator};
use crate::mem_assert;

/// Largest alignment a fixed block is placed at.
const MAX_BLOCK_ALIGNMENT: usize = 16;

/// Singleton allocator of `N`-byte blocks.
///
/// ```rust,ignore
/// let blocks = FixedBlocksAllocator::<64>::instance();
/// let ptr = blocks.allocate(40);
/// unsafe { blocks.deallocate(ptr) };
/// ```
pub struct FixedBlocksAllocator<const N: usize> {
    kind: String,
    heaps: ThreadHeaps,
    release: DelayedRelease,
    aligned: AlignedState,
}

impl<const N: usize> FixedBlocksAllocator<N> {
    const BLOCK_HOLDS_LINK: () = assert!(
        N >= std::mem::size_of::<usize>(),
        "FixedBlocksAllocator block size must hold a pointer"
    );

    /// Alignment of every block: the largest power of two dividing `N`,
    /// capped at 16.
    pub const BLOCK_ALIGNMENT: usize = {
        let low_bit = N & N.wrapping_neg();
        if low_bit > MAX_BLOCK_ALIGNMENT {
            MAX_BLOCK_ALIGNMENT
        } else {
            low_bit
        }
    };

    /// Returns the process instance for block size `N`.
    pub fn instance() -> &'static Self {
        let () = Self::BLOCK_HOLDS_LINK;
        instance_of(Self::create, Self::release_hook)
    }

    fn create() -> Self {
        let kind = format!("FixedBlocksAllocator<{N}>");
        Self {
            aligned: AlignedState::new(kind.clone()),
            kind,
            heaps: ThreadHeaps::new(),
            release: DelayedRelease::default(),
        }
    }

    fn release_hook(this: &'static Self) {
        if this.release.request_release(&this.kind) {
            this.release_resources();
        }
    }

    fn release_resources(&self) {
        clear_all(&self.heaps);
        tracing::debug!(allocator = %self.kind, "allocator released");
    }

    /// Outstanding blocks over all threads.
    #[must_use]
    pub fn outstanding(&self) -> isize {
        self.release.counter().total()
    }

    /// Calling thread's allocations minus its frees.
    #[must_use]
    pub fn thread_outstanding(&self) -> isize {
        self.release.counter().thread_count()
    }

    /// Returns `true` once the allocator has released its sections.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.release.is_released()
    }

    fn pop_or_bump(&self, heap: &mut ThreadHeap) -> NonNull<u8> {
        if let Some(block) = heap.free {
            // SAFETY: free blocks start with the link written in `deallocate`.
            let next = unsafe { ptr::read_unaligned(block.as_ptr().cast::<*mut u8>()) };
            heap.free = NonNull::new(next);
            return block;
        }
        heap.section(&self.kind).allocate(N, Self::BLOCK_ALIGNMENT)
    }
}

impl<const N: usize> MemAllocator for FixedBlocksAllocator<N> {
    fn allocate(&self, size: usize) -> NonNull<u8> {
        mem_assert!(size <= N, "invalid size {size} for {N}-byte blocks");
        self.release.on_allocate(&self.kind);
        let mut heap = self.heaps.value().lock();
        self.pop_or_bump(&mut heap)
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> NonNull<u8> {
        mem_assert!(size <= N, "invalid size {size} for {N}-byte blocks");
        ptr
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        {
            let mut heap = self.heaps.value().lock();
            let next = heap.free.map_or(ptr::null_mut(), NonNull::as_ptr);
            ptr::write_unaligned(ptr.as_ptr().cast::<*mut u8>(), next);
            heap.free = Some(ptr);
        }
        if self.release.on_deallocate() {
            self.release_resources();
        }
    }

    unsafe fn allocation_size(&self, _ptr: NonNull<u8>) -> usize {
        N
    }
}

impl<const N: usize> AlignedAllocator for FixedBlocksAllocator<N> {
    fn aligned_state(&self) -> &AlignedState {
        &self.aligned
    }
}

impl<const N: usize> std::fmt::Debug for FixedBlocksAllocator<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedBlocksAllocator")
            .field("block_size", &N)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::is_aligned;
    use std::collections::HashSet;

    #[test]
    fn test_block_alignment() {
        assert_eq!(FixedBlocksAllocator::<8>::BLOCK_ALIGNMENT, 8);
        assert_eq!(FixedBlocksAllocator::<12>::BLOCK_ALIGNMENT, 4);
        assert_eq!(FixedBlocksAllocator::<24>::BLOCK_ALIGNMENT, 8);
        assert_eq!(FixedBlocksAllocator::<1024>::BLOCK_ALIGNMENT, 16);
    }

    #[test]
    fn test_blocks_are_distinct_and_reused() {
        let blocks = FixedBlocksAllocator::<40>::instance();
        let before = blocks.thread_outstanding();

        let ptrs: Vec<_> = (0..100).map(|_| blocks.allocate(40)).collect();
        let unique: HashSet<_> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
        assert_eq!(unique.len(), 100);
        assert!(ptrs.iter().all(|p| is_aligned(*p, 8)));
        assert_eq!(blocks.thread_outstanding(), before + 100);

        let last = *ptrs.last().unwrap();
        for ptr in ptrs {
            unsafe { blocks.deallocate(ptr) };
        }
        assert_eq!(blocks.thread_outstanding(), before);

        // LIFO free list hands back the most recently freed block.
        let again = blocks.allocate(1);
        assert_eq!(again, last);
        unsafe { blocks.deallocate(again) };
    }

    #[test]
    fn test_reallocate_keeps_pointer() {
        let blocks = FixedBlocksAllocator::<56>::instance();
        let ptr = blocks.allocate(8);
        unsafe {
            assert_eq!(blocks.reallocate(ptr, 56), ptr);
            assert_eq!(blocks.allocation_size(ptr), 56);
            blocks.deallocate(ptr);
        }
    }

    #[test]
    #[should_panic(expected = "invalid size 65")]
    fn test_oversized_request_is_fatal() {
        let _ = FixedBlocksAllocator::<64>::instance().allocate(65);
    }

    #[test]
    fn test_aligned_blocks_fit() {
        for _ in 0..1024 {
            let small = FixedBlocksAllocator::<16>::instance();
            let ptr = small.allocate_aligned(4, 4);
            assert!(small.is_aligned(ptr));
            unsafe {
                ptr::write_bytes(ptr.as_ptr(), 0, 4);
                assert!(small.is_valid(ptr));
                small.deallocate_aligned(ptr);
            }

            let wide = FixedBlocksAllocator::<32>::instance();
            let ptr = wide.allocate_aligned(8, 4);
            assert!(wide.is_aligned(ptr));
            unsafe {
                ptr::write_bytes(ptr.as_ptr(), 0, 8);
                assert!(wide.is_valid(ptr));
                wide.deallocate_aligned(ptr);
            }
        }
    }

    #[test]
    fn test_cross_thread_free_joins_freeing_thread() {
        let blocks = FixedBlocksAllocator::<72>::instance();
        let ptr = blocks.allocate(72).as_ptr() as usize;

        std::thread::spawn(move || {
            let blocks = FixedBlocksAllocator::<72>::instance();
            let ptr = NonNull::new(ptr as *mut u8).unwrap();
            unsafe { blocks.deallocate(ptr) };
            assert_eq!(blocks.allocate(72), ptr);
            unsafe { blocks.deallocate(ptr) };
        })
        .join()
        .unwrap();

        assert_eq!(blocks.outstanding(), 0);
    }
}
