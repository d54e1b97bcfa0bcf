//! # Frame Allocator
//!
//! Bump allocation for data that lives at most one frame. At the start of
//! every frame [`FrameMemAllocator::prepare_frame`] rewinds all threads'
//! sections, provided nothing allocated in the previous frame is still live.
//!
//! ```rust,ignore
//! let frames = Arc::new(FrameAllocator::new());
//! set_frame_allocator(Some(frames.clone()));
//!
//! loop {
//!     if !frames.prepare_frame() {
//!         // something from last frame leaked; memory keeps growing
//!     }
//!     let scratch = frame_new([0u8; 256]);
//! }
//! ```

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::RwLock;

use super::local::{stamp_size, stamped_size, ThreadHeaps, SIZED_BLOCK_ALIGNMENT, SIZE_HEADER};
use super::{AlignedAllocator, AlignedState, AllocationCounter, MemAllocator};

const FRAME_KIND: &str = "FrameAllocator";

/// An allocator that is rewound once per frame.
pub trait FrameMemAllocator: AlignedAllocator {
    /// Rewinds every thread's memory for the next frame.
    ///
    /// Returns `false`, without rewinding, if any allocation is still live.
    fn prepare_frame(&self) -> bool;

    /// This allocator as a plain aligned allocator.
    fn as_aligned(&self) -> &dyn AlignedAllocator;
}

/// Per-thread bump allocator with a frame-wide reset.
pub struct FrameAllocator {
    heaps: ThreadHeaps,
    counter: AllocationCounter,
    aligned: AlignedState,
}

impl FrameAllocator {
    /// Creates an empty frame allocator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heaps: ThreadHeaps::new(),
            counter: AllocationCounter::new(),
            aligned: AlignedState::new(FRAME_KIND),
        }
    }

    /// Live blocks over all threads.
    #[must_use]
    pub fn outstanding(&self) -> isize {
        self.counter.total()
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemAllocator for FrameAllocator {
    fn allocate(&self, size: usize) -> NonNull<u8> {
        self.counter.increment();
        let block = self
            .heaps
            .value()
            .lock()
            .section(FRAME_KIND)
            .allocate(SIZE_HEADER + size, SIZED_BLOCK_ALIGNMENT);
        // SAFETY: the section just reserved header plus payload.
        unsafe { stamp_size(block, size) }
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> NonNull<u8> {
        let old = stamped_size(ptr);
        if size <= old {
            return ptr;
        }
        let moved = self.allocate(size);
        ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old);
        self.deallocate(ptr);
        moved
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>) {
        self.counter.decrement();
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        stamped_size(ptr)
    }
}

impl AlignedAllocator for FrameAllocator {
    fn aligned_state(&self) -> &AlignedState {
        &self.aligned
    }
}

impl FrameMemAllocator for FrameAllocator {
    fn prepare_frame(&self) -> bool {
        let outstanding = self.counter.total();
        if outstanding != 0 {
            tracing::warn!(
                allocator = %self.aligned.name(),
                outstanding,
                "frame not reset: allocations still live"
            );
            return false;
        }
        self.heaps.visit_all(|heap| heap.lock().rewind());
        true
    }

    fn as_aligned(&self) -> &dyn AlignedAllocator {
        self
    }
}

impl fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

static FRAME_ALLOCATOR: RwLock<Option<Arc<dyn FrameMemAllocator>>> = parking_lot::const_rwlock(None);

/// Installs (or clears) the process frame allocator. Returns the previous
/// one.
pub fn set_frame_allocator(
    allocator: Option<Arc<dyn FrameMemAllocator>>,
) -> Option<Arc<dyn FrameMemAllocator>> {
    std::mem::replace(&mut *FRAME_ALLOCATOR.write(), allocator)
}

/// The process frame allocator, if one is installed.
#[must_use]
pub fn frame_allocator() -> Option<Arc<dyn FrameMemAllocator>> {
    FRAME_ALLOCATOR.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_prepare_frame_rewinds() {
        let frames = FrameAllocator::new();
        let first = frames.allocate(32);
        unsafe {
            assert_eq!(frames.allocation_size(first), 32);
            frames.deallocate(first);
        }

        assert!(frames.prepare_frame());
        let again = frames.allocate(32);
        assert_eq!(again, first);
        unsafe { frames.deallocate(again) };
    }

    #[test]
    fn test_prepare_frame_refuses_with_live_block() {
        let frames = FrameAllocator::new();
        let live = frames.allocate(8);
        assert!(!frames.prepare_frame());

        let next = frames.allocate(8);
        assert_ne!(next, live);
        unsafe {
            frames.deallocate(live);
            frames.deallocate(next);
        }
        assert!(frames.prepare_frame());
    }

    #[test]
    fn test_prepare_frame_rewinds_every_thread() {
        let frames = FrameAllocator::new();
        thread::scope(|s| {
            s.spawn(|| {
                let ptr = frames.allocate(64);
                unsafe { frames.deallocate(ptr) };
            });
        });

        let busy = |frames: &FrameAllocator| {
            let mut busy = 0;
            frames.heaps.visit_all(|heap| busy += heap.lock().allocations());
            busy
        };
        assert_eq!(busy(&frames), 1);
        assert!(frames.prepare_frame());
        assert_eq!(busy(&frames), 0);
    }

    #[test]
    fn test_reallocate_moves_when_growing() {
        let frames = FrameAllocator::new();
        let ptr = frames.allocate(4);
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 9, 4);
            let grown = frames.reallocate(ptr, 64);
            assert_ne!(grown, ptr);
            assert_eq!(*grown.as_ptr().add(3), 9);
            frames.deallocate(grown);
        }
        assert!(frames.prepare_frame());
    }
}
