//! # Array Allocator
//!
//! Variable-size blocks for arrays that grow. Every block is framed by a
//! header and a trailing signature:
//!
//! ```text
//!   ┌─────────────────────────┬──────────────┬───────────┬───────────┐
//!   │ Head {reserve,size,next}│ payload      │ Signature │ unused    │
//!   └─────────────────────────┴──────────────┴───────────┴───────────┘
//!                             ◄── size ────►
//!                             ◄────────── reserve ─────────────────►
//! ```
//!
//! `Signature.value` equals the address of the `Head`; a mismatch means the
//! payload was overrun. Freed blocks keep their reserve and go onto the
//! calling thread's free list, searched first-fit.
//!
//! ## Safety Note
//!
//! Heads and signatures are plain-old-data read and written unaligned
//! through `bytemuck`. Free-list links are stored as addresses exposed by
//! `as` casts and turned back into pointers the same way.

#![allow(unsafe_code)]

use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::slice;

use bytemuck::{Pod, Zeroable};

use super::local::{clear_all, ThreadHeap, ThreadHeaps};
use super::singleton::{instance_of, DelayedRelease};
use super::{AlignedAllocator, AlignedState, MemAllocator};
use crate::mem_assert;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
struct Head {
    /// Payload bytes available in this block.
    reserve: usize,
    /// Payload bytes requested.
    size: usize,
    /// Address of the next free head, 0 for none.
    next: usize,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
struct Signature {
    value: usize,
}

const HEAD_SIZE: usize = size_of::<Head>();
const SIGNATURE_SIZE: usize = size_of::<Signature>();
const OVERHEAD: usize = HEAD_SIZE + SIGNATURE_SIZE;
const HEAD_ALIGNMENT: usize = std::mem::align_of::<Head>();

unsafe fn read_pod<T: Pod>(at: *const u8) -> T {
    bytemuck::pod_read_unaligned(slice::from_raw_parts(at, size_of::<T>()))
}

unsafe fn write_pod<T: Pod>(at: *mut u8, value: &T) {
    slice::from_raw_parts_mut(at, size_of::<T>()).copy_from_slice(bytemuck::bytes_of(value));
}

/// Typed view of one framed block.
#[derive(Clone, Copy, Debug)]
struct ArrayBlock {
    head: NonNull<u8>,
}

impl ArrayBlock {
    /// # Safety
    ///
    /// `payload` must come from [`ArrayAllocator::allocate`].
    unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self {
            head: NonNull::new_unchecked(payload.as_ptr().sub(HEAD_SIZE)),
        }
    }

    fn from_address(address: usize) -> Option<Self> {
        NonNull::new(address as *mut u8).map(|head| Self { head })
    }

    fn address(self) -> usize {
        self.head.as_ptr() as usize
    }

    fn payload(self) -> NonNull<u8> {
        // SAFETY: the payload follows the head inside the same block.
        unsafe { NonNull::new_unchecked(self.head.as_ptr().add(HEAD_SIZE)) }
    }

    unsafe fn head(self) -> Head {
        read_pod(self.head.as_ptr())
    }

    unsafe fn write_head(self, head: &Head) {
        write_pod(self.head.as_ptr(), head);
    }

    unsafe fn set_next(self, next: usize) {
        let mut head = self.head();
        head.next = next;
        self.write_head(&head);
    }

    /// Records a new payload size and moves the signature behind it.
    unsafe fn set_size(self, size: usize) {
        let mut head = self.head();
        head.size = size;
        self.write_head(&head);
        let signature = Signature {
            value: self.address(),
        };
        write_pod(self.payload().as_ptr().add(size), &signature);
    }

    unsafe fn is_intact(self) -> bool {
        let head = self.head();
        let signature: Signature = read_pod(self.payload().as_ptr().add(head.size));
        signature.value == self.address()
    }
}

/// Singleton allocator of variable-size blocks, reserving at least `N`
/// payload bytes per fresh block.
pub struct ArrayAllocator<const N: usize> {
    kind: String,
    heaps: ThreadHeaps,
    release: DelayedRelease,
    aligned: AlignedState,
}

impl<const N: usize> ArrayAllocator<N> {
    /// Header plus signature bytes around every payload.
    pub const OVERHEAD: usize = OVERHEAD;

    /// Returns the process instance for minimum array size `N`.
    pub fn instance() -> &'static Self {
        instance_of(Self::create, Self::release_hook)
    }

    fn create() -> Self {
        let kind = format!("ArrayAllocator<{N}>");
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

    /// Payload bytes the block at `ptr` can hold without moving.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block from this allocator.
    #[must_use]
    pub unsafe fn reserve(&self, ptr: NonNull<u8>) -> usize {
        ArrayBlock::from_payload(ptr).head().reserve
    }

    /// Unlinks the first free block with enough reserve.
    fn take_first_fit(heap: &mut ThreadHeap, size: usize) -> Option<ArrayBlock> {
        let mut previous: Option<ArrayBlock> = None;
        let mut cursor = heap.free.map(|head| ArrayBlock { head });

        while let Some(block) = cursor {
            // SAFETY: free-list entries are heads written by this allocator.
            let head = unsafe { block.head() };
            if head.reserve >= size {
                match previous {
                    // SAFETY: as above.
                    Some(prev) => unsafe { prev.set_next(head.next) },
                    None => heap.free = ArrayBlock::from_address(head.next).map(|b| b.head),
                }
                return Some(block);
            }
            previous = Some(block);
            cursor = ArrayBlock::from_address(head.next);
        }
        None
    }

    fn carve(&self, heap: &mut ThreadHeap, size: usize) -> ArrayBlock {
        let section = heap.section(&self.kind);
        let minimum = N + OVERHEAD;
        if section.page_size() < minimum {
            section.set_page_size(minimum);
        }

        let chunk = (size + OVERHEAD).max(section.page_size());
        let head = section.allocate(chunk, HEAD_ALIGNMENT);
        let block = ArrayBlock { head };
        // SAFETY: `chunk` fresh bytes start at `head`.
        unsafe {
            block.write_head(&Head {
                reserve: chunk - OVERHEAD,
                size: 0,
                next: 0,
            });
        }
        block
    }

    unsafe fn checked_block(&self, ptr: NonNull<u8>) -> ArrayBlock {
        let block = ArrayBlock::from_payload(ptr);
        if self.aligned.debug_signatures() {
            mem_assert!(
                block.is_intact(),
                "signature of block {ptr:p} in {} is corrupted",
                self.kind
            );
        }
        block
    }
}

impl<const N: usize> MemAllocator for ArrayAllocator<N> {
    fn allocate(&self, size: usize) -> NonNull<u8> {
        self.release.on_allocate(&self.kind);
        let mut heap = self.heaps.value().lock();
        let block = match Self::take_first_fit(&mut heap, size) {
            Some(block) => block,
            None => self.carve(&mut heap, size),
        };
        // SAFETY: reserve >= size, so the signature fits.
        unsafe { block.set_size(size) };
        block.payload()
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> NonNull<u8> {
        let block = self.checked_block(ptr);
        let head = block.head();
        if head.reserve >= size {
            block.set_size(size);
            return ptr;
        }

        let moved = self.allocate(size);
        ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), head.size.min(size));
        self.deallocate(ptr);
        moved
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let block = self.checked_block(ptr);
        {
            let mut heap = self.heaps.value().lock();
            let next = heap.free.map_or(0, |head| head.as_ptr() as usize);
            block.set_next(next);
            heap.free = Some(block.head);
        }
        if self.release.on_deallocate() {
            self.release_resources();
        }
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        ArrayBlock::from_payload(ptr).head().size
    }
}

impl<const N: usize> AlignedAllocator for ArrayAllocator<N> {
    fn aligned_state(&self) -> &AlignedState {
        &self.aligned
    }

    unsafe fn validate_block(&self, ptr: NonNull<u8>) -> bool {
        ArrayBlock::from_payload(ptr).is_intact()
    }
}

impl<const N: usize> std::fmt::Debug for ArrayAllocator<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayAllocator")
            .field("minimum_array_size", &N)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_layout() {
        assert_eq!(HEAD_SIZE, 3 * size_of::<usize>());
        assert_eq!(OVERHEAD, 4 * size_of::<usize>());
    }

    #[test]
    fn test_fresh_block_reserves_minimum() {
        let arrays = ArrayAllocator::<300>::instance();
        let ptr = arrays.allocate(10);
        unsafe {
            assert_eq!(arrays.allocation_size(ptr), 10);
            assert!(arrays.reserve(ptr) >= 300);
            assert!(arrays.is_valid(ptr));
            arrays.deallocate(ptr);
        }
    }

    #[test]
    fn test_reallocate_in_place_then_moves() {
        const BLOCK: usize = 512;
        let arrays = ArrayAllocator::<BLOCK>::instance();
        let ptr = arrays.allocate(BLOCK);
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 7, BLOCK);
            let reserve = arrays.reserve(ptr);

            let same = arrays.reallocate(ptr, reserve);
            assert_eq!(same, ptr);
            assert_eq!(arrays.allocation_size(same), reserve);

            let moved = arrays.reallocate(same, reserve * 2);
            assert_ne!(moved, same);
            assert_eq!(arrays.allocation_size(moved), reserve * 2);
            assert_eq!(*moved.as_ptr().add(BLOCK - 1), 7);
            ptr::write_bytes(moved.as_ptr(), 0, reserve * 2);
            assert!(arrays.is_valid(moved));
            arrays.deallocate(moved);
        }
    }

    #[test]
    fn test_first_fit_reuses_freed_block() {
        let arrays = ArrayAllocator::<128>::instance();
        let a = arrays.allocate(100);
        unsafe { arrays.deallocate(a) };
        let b = arrays.allocate(60);
        assert_eq!(a, b);
        unsafe {
            assert_eq!(arrays.allocation_size(b), 60);
            arrays.deallocate(b);
        }
    }

    #[test]
    fn test_first_fit_skips_small_blocks() {
        let arrays = ArrayAllocator::<64>::instance();
        let small = arrays.allocate(8);
        let small_reserve = unsafe { arrays.reserve(small) };
        unsafe { arrays.deallocate(small) };

        let big = arrays.allocate(small_reserve + 1);
        assert_ne!(big, small);
        let reused = arrays.allocate(8);
        assert_eq!(reused, small);
        unsafe {
            arrays.deallocate(big);
            arrays.deallocate(reused);
        }
    }

    #[test]
    fn test_overrun_breaks_signature() {
        let arrays = ArrayAllocator::<96>::instance();
        let ptr = arrays.allocate(32);
        unsafe {
            let past = ptr.as_ptr().add(32);
            let saved = *past;
            *past = !saved;
            assert!(!arrays.is_valid(ptr));
            *past = saved;
            assert!(arrays.is_valid(ptr));
            arrays.deallocate(ptr);
        }
    }

    #[test]
    #[should_panic(expected = "corrupted")]
    fn test_free_of_overrun_block_is_fatal() {
        let arrays = ArrayAllocator::<160>::instance();
        let ptr = arrays.allocate(10);
        unsafe {
            *ptr.as_ptr().add(10) ^= 0xFF;
            arrays.deallocate(ptr);
        }
    }

    #[test]
    #[should_panic(expected = "corrupted")]
    fn test_reallocate_of_overrun_block_is_fatal() {
        let arrays = ArrayAllocator::<176>::instance();
        let ptr = arrays.allocate(24);
        unsafe {
            *ptr.as_ptr().add(24) ^= 0xFF;
            let _ = arrays.reallocate(ptr, 48);
        }
    }
}
