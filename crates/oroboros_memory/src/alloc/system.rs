//! System-backed allocator and the process default allocator.
//!
//! ## Safety Note
//!
//! [`SystemAllocator`] goes through [`GlobalAlloc`] with a 16-byte size
//! header in front of each payload, so frees can rebuild the layout.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;
use std::ptr::NonNull;
use std::sync::OnceLock;

use super::{AlignedAllocator, AlignedState, GeneralAllocator, MemAllocator};

const HEADER: usize = 16;
const ALIGNMENT: usize = 16;

fn layout_for(size: usize) -> Layout {
    match Layout::from_size_align(HEADER + size, ALIGNMENT) {
        Ok(layout) => layout,
        Err(_) => crate::diag::raise_failure(
            file!(),
            line!(),
            format_args!("allocation of {size} bytes exceeds the address space"),
        ),
    }
}

/// Thin wrapper over the operating system allocator.
pub struct SystemAllocator {
    aligned: AlignedState,
}

impl SystemAllocator {
    /// Creates a handle named `SystemAllocator`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            aligned: AlignedState::new("SystemAllocator"),
        }
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemAllocator for SystemAllocator {
    fn allocate(&self, size: usize) -> NonNull<u8> {
        let layout = layout_for(size);
        // SAFETY: the layout is never zero-sized.
        let raw = unsafe { System.alloc(layout) };
        let Some(raw) = NonNull::new(raw) else {
            crate::diag::raise_failure(
                file!(),
                line!(),
                format_args!("system allocator out of memory ({size} bytes)"),
            );
        };
        // SAFETY: HEADER bytes lead the block and are aligned for usize.
        unsafe {
            raw.as_ptr().cast::<usize>().write(size);
            NonNull::new_unchecked(raw.as_ptr().add(HEADER))
        }
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> NonNull<u8> {
        let raw = ptr.as_ptr().sub(HEADER);
        let old = raw.cast::<usize>().read();
        let grown = System.realloc(raw, layout_for(old), layout_for(size).size());
        let Some(grown) = NonNull::new(grown) else {
            crate::diag::raise_failure(
                file!(),
                line!(),
                format_args!("system allocator out of memory ({size} bytes)"),
            );
        };
        grown.as_ptr().cast::<usize>().write(size);
        NonNull::new_unchecked(grown.as_ptr().add(HEADER))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let raw = ptr.as_ptr().sub(HEADER);
        let size = raw.cast::<usize>().read();
        System.dealloc(raw, layout_for(size));
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        ptr.as_ptr().sub(HEADER).cast::<usize>().read()
    }
}

impl AlignedAllocator for SystemAllocator {
    fn aligned_state(&self) -> &AlignedState {
        &self.aligned
    }
}

impl fmt::Debug for SystemAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemAllocator")
            .field("aligned", &self.aligned)
            .finish()
    }
}

/// Process default allocator: a [`GeneralAllocator`] created on first use.
#[must_use]
pub fn default_allocator() -> &'static GeneralAllocator {
    static DEFAULT: OnceLock<GeneralAllocator> = OnceLock::new();
    DEFAULT.get_or_init(|| {
        tracing::debug!("default allocator created");
        GeneralAllocator::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_header_survives_realloc() {
        let system = SystemAllocator::new();
        let ptr = system.allocate(10);
        unsafe {
            assert_eq!(system.allocation_size(ptr), 10);
            std::ptr::write_bytes(ptr.as_ptr(), 3, 10);
            let grown = system.reallocate(ptr, 4000);
            assert_eq!(system.allocation_size(grown), 4000);
            assert_eq!(*grown.as_ptr().add(9), 3);
            system.deallocate(grown);
        }
    }

    #[test]
    fn test_zero_size_is_a_real_block() {
        let system = SystemAllocator::new();
        let a = system.allocate(0);
        let b = system.allocate(0);
        assert_ne!(a, b);
        unsafe {
            system.deallocate(a);
            system.deallocate(b);
        }
    }

    #[test]
    fn test_default_allocator_is_shared() {
        let a = default_allocator() as *const GeneralAllocator;
        let b = default_allocator() as *const GeneralAllocator;
        assert_eq!(a, b);
        assert_eq!(default_allocator().name(), "GeneralAllocator");
    }
}
