//! # Allocators
//!
//! Every allocator implements [`MemAllocator`] (plain blocks) and
//! [`AlignedAllocator`] (aligned blocks on top of plain ones), so callers can
//! hold any of them as `&dyn AlignedAllocator`.
//!
//! | Allocator | Shape | Lifetime |
//! |---|---|---|
//! | [`FixedBlocksAllocator<N>`] | `N`-byte blocks, per-thread free list | singleton |
//! | [`ArrayAllocator<N>`] | variable blocks, first-fit free list | singleton |
//! | [`StackAllocator<N>`] | bump, freed all at once | scoped |
//! | [`FrameAllocator`] | bump, rewound every frame | scoped |
//! | [`GeneralAllocator`] / [`StringAllocator`] | size-bucket dispatch | handle |
//! | [`SystemAllocator`] | `std::alloc::System` | handle |
//!
//! ## Safety Note
//!
//! The traits traffic in raw pointers. Every method taking a pointer is
//! `unsafe` and requires that the pointer was returned by the same allocator
//! and is still live.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use crate::align::{aligned_size, is_power_of_two};
use crate::{mem_assert, mem_debug_assert};

pub mod aligned;
mod array;
mod boxed;
mod fixed_blocks;
mod frame;
mod general;
mod local;
pub mod singleton;
mod stack;
mod system;

pub use aligned::{AlignedState, AllocationInfo, SIGNATURE_SIZE};
pub use array::ArrayAllocator;
pub use boxed::{frame_new, stack_new, AllocBox};
pub use fixed_blocks::FixedBlocksAllocator;
pub use frame::{frame_allocator, set_frame_allocator, FrameAllocator, FrameMemAllocator};
pub use general::{Bucket, GeneralAllocator, StringAllocator};
pub use singleton::AllocationCounter;
pub use stack::{
    current_stack_allocator, release_stack_allocator, set_stack_allocator,
    InheritedStackAllocator, LocalStackAllocator, StackAllocator, StackAllocatorGuard,
    StackMemAllocator,
};
pub use system::{default_allocator, SystemAllocator};

/// Plain block allocation.
pub trait MemAllocator: Send + Sync {
    /// Allocates `size` bytes. Failure is fatal.
    fn allocate(&self, size: usize) -> NonNull<u8>;

    /// Resizes a block, possibly moving it. The first `min(old, size)` bytes
    /// are preserved.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block from this allocator.
    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> NonNull<u8>;

    /// Frees a block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block from this allocator. It is dangling after
    /// the call.
    unsafe fn deallocate(&self, ptr: NonNull<u8>);

    /// Size of a block as recorded by the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block from this allocator.
    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize;
}

/// Aligned allocation, debug checks and naming, provided on top of
/// [`MemAllocator`].
pub trait AlignedAllocator: MemAllocator {
    /// The allocator's name and aligned-block side table.
    fn aligned_state(&self) -> &AlignedState;

    /// Allocator-specific integrity check of a plain block. Defaults to
    /// `true`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block from this allocator.
    unsafe fn validate_block(&self, _ptr: NonNull<u8>) -> bool {
        true
    }

    /// Allocates `size` bytes aligned to `alignment` (a power of two).
    fn allocate_aligned(&self, size: usize, alignment: usize) -> NonNull<u8> {
        mem_assert!(
            is_power_of_two(alignment),
            "alignment expected to be a power of two. Actual value: ({alignment})"
        );

        let raw = self.allocate(AllocationInfo::raw_size(size, alignment));
        let raw_addr = raw.as_ptr() as usize;
        let offset = aligned_size(raw_addr, alignment) - raw_addr;
        // SAFETY: offset < alignment, inside the over-sized block.
        let aligned = unsafe { NonNull::new_unchecked(raw.as_ptr().add(offset)) };

        let state = self.aligned_state();
        if state.debug_signatures() {
            // SAFETY: the block has SIGNATURE_SIZE bytes after the payload.
            unsafe { aligned::write_signature(aligned, size) };
        }
        state.register(
            aligned,
            AllocationInfo {
                offset,
                size,
                alignment,
            },
        );
        aligned
    }

    /// Resizes an aligned block, moving it and preserving `min(old, size)`
    /// bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live aligned block from this allocator.
    unsafe fn reallocate_aligned(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        alignment: usize,
    ) -> NonNull<u8> {
        let Some(info) = self.aligned_state().lookup(ptr) else {
            crate::diag::raise_failure(
                file!(),
                line!(),
                format_args!("reallocate_aligned on unknown block {ptr:p}"),
            );
        };

        let moved = self.allocate_aligned(size, alignment);
        std::ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), info.size.min(size));
        self.deallocate_aligned(ptr);
        moved
    }

    /// Frees an aligned block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live aligned block from this allocator.
    unsafe fn deallocate_aligned(&self, ptr: NonNull<u8>) {
        let state = self.aligned_state();
        let Some(info) = state.unregister(ptr) else {
            crate::diag::raise_failure(
                file!(),
                line!(),
                format_args!("deallocate_aligned on unknown block {ptr:p}"),
            );
        };
        if state.debug_signatures() {
            mem_assert!(
                aligned::signature_intact(ptr, info.size),
                "signature of aligned block {ptr:p} in {} is corrupted",
                state.name()
            );
        }
        self.deallocate(NonNull::new_unchecked(ptr.as_ptr().sub(info.offset)));
    }

    /// Requested size of an aligned block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live aligned block from this allocator.
    unsafe fn aligned_size(&self, ptr: NonNull<u8>, alignment: usize) -> usize {
        match self.aligned_state().lookup(ptr) {
            Some(info) => {
                mem_debug_assert!(
                    info.alignment == alignment,
                    "block {ptr:p} was allocated with alignment {}, queried with {alignment}",
                    info.alignment
                );
                info.size
            }
            None => 0,
        }
    }

    /// Returns `true` if `ptr` was produced by
    /// [`allocate_aligned`](AlignedAllocator::allocate_aligned).
    fn is_aligned(&self, ptr: NonNull<u8>) -> bool {
        self.aligned_state().lookup(ptr).is_some()
    }

    /// Returns `false` if the block's signature has been overwritten.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block (plain or aligned) from this allocator.
    unsafe fn is_valid(&self, ptr: NonNull<u8>) -> bool {
        let state = self.aligned_state();
        match state.lookup(ptr) {
            Some(info) => {
                let raw = NonNull::new_unchecked(ptr.as_ptr().sub(info.offset));
                let signed = !state.debug_signatures() || aligned::signature_intact(ptr, info.size);
                signed && self.validate_block(raw)
            }
            None => self.validate_block(ptr),
        }
    }

    /// Allocator name.
    fn name(&self) -> String {
        self.aligned_state().name()
    }

    /// Renames the allocator.
    fn set_name(&self, name: &str) {
        self.aligned_state().set_name(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::is_aligned;

    #[test]
    fn test_aligned_sweep_over_system_allocator() {
        let allocator = SystemAllocator::new();
        let mut alignment = 2;
        while alignment <= 1024 {
            let mut size = 1;
            while size < 1024 {
                let ptr = allocator.allocate_aligned(size, alignment);
                assert!(is_aligned(ptr, alignment));
                assert!(allocator.is_aligned(ptr));
                unsafe {
                    assert_eq!(allocator.aligned_size(ptr, alignment), size);
                    assert!(allocator.is_valid(ptr));

                    std::ptr::write_bytes(ptr.as_ptr(), 0x5A, size);
                    let grown = allocator.reallocate_aligned(ptr, size * 2, alignment);
                    assert!(is_aligned(grown, alignment));
                    assert_eq!(allocator.aligned_size(grown, alignment), size * 2);
                    assert_eq!(*grown.as_ptr().add(size - 1), 0x5A);
                    assert!(allocator.is_valid(grown));
                    allocator.deallocate_aligned(grown);
                }
                size = size * 2 + 1;
            }
            alignment *= 2;
        }
        assert_eq!(allocator.aligned_state().live_blocks(), 0);
    }

    #[test]
    fn test_plain_blocks_are_not_aligned_blocks() {
        let allocator = SystemAllocator::new();
        let ptr = allocator.allocate(24);
        assert!(!allocator.is_aligned(ptr));
        unsafe {
            assert!(allocator.is_valid(ptr));
            allocator.deallocate(ptr);
        }
    }

    #[test]
    fn test_overrun_detected_by_signature() {
        let allocator = SystemAllocator::new();
        if !allocator.aligned_state().debug_signatures() {
            return;
        }
        let ptr = allocator.allocate_aligned(16, 16);
        unsafe {
            let past = ptr.as_ptr().add(16);
            let saved = *past;
            *past = !saved;
            assert!(!allocator.is_valid(ptr));
            *past = saved;
            assert!(allocator.is_valid(ptr));
            allocator.deallocate_aligned(ptr);
        }
    }

    #[test]
    fn test_name_roundtrip() {
        let allocator = SystemAllocator::new();
        assert_eq!(allocator.name(), "SystemAllocator");
        allocator.set_name("scratch");
        assert_eq!(allocator.name(), "scratch");
    }

    #[test]
    fn test_allocators_are_object_safe() {
        let allocator = SystemAllocator::new();
        let dynamic: &dyn AlignedAllocator = &allocator;
        let ptr = dynamic.allocate_aligned(40, 8);
        unsafe { dynamic.deallocate_aligned(ptr) };
    }
}
