//! Owning boxes over the allocator traits.
//!
//! [`AllocBox`] places one value in any [`AlignedAllocator`] and drops it
//! back there. [`stack_new`] and [`frame_new`] use the thread's current stack
//! allocator and the process frame allocator.
//!
//! ## Safety Note
//!
//! The box owns a raw block; its value is initialized in `new_in` and
//! dropped exactly once in `Drop`.

#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use super::{
    current_stack_allocator, frame_allocator, AlignedAllocator, FrameMemAllocator,
    StackMemAllocator,
};
use crate::align::is_aligned;

enum Owner<'a> {
    Borrowed(&'a dyn AlignedAllocator),
    Stack(Arc<dyn StackMemAllocator>),
    Frame(Arc<dyn FrameMemAllocator>),
}

impl Owner<'_> {
    fn allocator(&self) -> &dyn AlignedAllocator {
        match self {
            Self::Borrowed(allocator) => *allocator,
            Self::Stack(allocator) => allocator.as_aligned(),
            Self::Frame(allocator) => allocator.as_aligned(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Block {
    /// Zero-sized value, nothing allocated.
    None,
    Plain,
    Aligned,
}

/// A value living in an allocator block.
pub struct AllocBox<'a, T> {
    ptr: NonNull<T>,
    block: Block,
    owner: Owner<'a>,
    _marker: PhantomData<T>,
}

// SAFETY: the box owns its value; the allocators are Send + Sync.
unsafe impl<T: Send> Send for AllocBox<'_, T> {}
// SAFETY: shared access only hands out `&T`.
unsafe impl<T: Sync> Sync for AllocBox<'_, T> {}

impl<'a, T> AllocBox<'a, T> {
    /// Moves `value` into a block from `allocator`.
    pub fn new_in(value: T, allocator: &'a dyn AlignedAllocator) -> Self {
        Self::with_owner(value, Owner::Borrowed(allocator))
    }

    fn with_owner(value: T, owner: Owner<'a>) -> Self {
        let (raw, block) = if size_of::<T>() == 0 {
            (NonNull::<T>::dangling().cast::<u8>(), Block::None)
        } else {
            let allocator = owner.allocator();
            let plain = allocator.allocate(size_of::<T>());
            if is_aligned(plain, align_of::<T>()) {
                (plain, Block::Plain)
            } else {
                // SAFETY: `plain` was just allocated and holds nothing.
                unsafe { allocator.deallocate(plain) };
                (
                    allocator.allocate_aligned(size_of::<T>(), align_of::<T>()),
                    Block::Aligned,
                )
            }
        };

        let ptr = raw.cast::<T>();
        // SAFETY: the block is sized and aligned for T.
        unsafe { ptr.as_ptr().write(value) };
        Self {
            ptr,
            block,
            owner,
            _marker: PhantomData,
        }
    }

    /// The allocator holding the value.
    #[must_use]
    pub fn allocator(this: &Self) -> &dyn AlignedAllocator {
        this.owner.allocator()
    }

    /// Whether the value sits in an aligned block rather than a plain one.
    #[must_use]
    pub fn is_aligned_block(this: &Self) -> bool {
        this.block == Block::Aligned
    }
}

impl<T> Deref for AllocBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: initialized in `with_owner`, live until drop.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for AllocBox<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: unique access through `&mut self`.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for AllocBox<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the value is dropped once, then its block is returned to
        // the allocator that produced it.
        unsafe {
            self.ptr.as_ptr().drop_in_place();
            let allocator = self.owner.allocator();
            match self.block {
                Block::None => {}
                Block::Plain => allocator.deallocate(self.ptr.cast()),
                Block::Aligned => allocator.deallocate_aligned(self.ptr.cast()),
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for AllocBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Boxes `value` in the thread's current stack allocator.
///
/// Fatal if no stack allocator is active on this thread.
pub fn stack_new<T>(value: T) -> AllocBox<'static, T> {
    let Some(allocator) = current_stack_allocator() else {
        crate::diag::raise_failure(
            file!(),
            line!(),
            format_args!("stack_new called without an active stack allocator"),
        );
    };
    AllocBox::with_owner(value, Owner::Stack(allocator))
}

/// Boxes `value` in the process frame allocator.
///
/// Fatal if no frame allocator is installed.
pub fn frame_new<T>(value: T) -> AllocBox<'static, T> {
    let Some(allocator) = frame_allocator() else {
        crate::diag::raise_failure(
            file!(),
            line!(),
            format_args!("frame_new called without a frame allocator"),
        );
    };
    AllocBox::with_owner(value, Owner::Frame(allocator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{LocalStackAllocator, SystemAllocator};
    use std::rc::Rc;

    #[test]
    fn test_value_dropped_once() {
        let system = SystemAllocator::new();
        let tracker = Rc::new(());
        {
            let boxed = AllocBox::new_in(Rc::clone(&tracker), &system);
            assert_eq!(Rc::strong_count(&boxed), 2);
        }
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_over_aligned_value() {
        #[repr(align(64))]
        struct Wide([u8; 64]);

        let system = SystemAllocator::new();
        let mut boxed = AllocBox::new_in(Wide([1; 64]), &system);
        boxed.0[63] = 2;
        assert_eq!(boxed.ptr.as_ptr() as usize % 64, 0);
        assert_eq!(boxed.0[0] + boxed.0[63], 3);
        if AllocBox::is_aligned_block(&boxed) {
            assert_eq!(system.aligned_state().live_blocks(), 1);
        }
    }

    #[test]
    fn test_zero_sized_value() {
        let system = SystemAllocator::new();
        let unit = AllocBox::new_in((), &system);
        let () = *unit;
        assert!(!AllocBox::is_aligned_block(&unit));
    }

    #[test]
    fn test_stack_new_uses_current_allocator() {
        let scope: LocalStackAllocator<1024> = LocalStackAllocator::new();
        {
            let numbers = stack_new([7u32; 8]);
            assert_eq!(numbers.iter().sum::<u32>(), 56);
            assert_eq!(scope.outstanding(), 1);
            assert_eq!(AllocBox::allocator(&numbers).name(), scope.name());
        }
        assert_eq!(scope.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "without an active stack allocator")]
    fn test_stack_new_without_scope() {
        let _value = stack_new(1u64);
    }
}
