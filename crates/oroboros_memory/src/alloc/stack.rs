//! # Stack Allocator
//!
//! A scoped bump allocator. Memory is only reclaimed when the allocator is
//! dropped; `deallocate` merely counts. The thread that built the allocator
//! (the *mother thread*) first fills an inline buffer of `N` bytes, every
//! other thread bumps from its own leased section.
//!
//! ## Current Allocator
//!
//! Each thread keeps a stack of active stack allocators. Scopes push and pop
//! it:
//!
//! ```rust,ignore
//! let scope: LocalStackAllocator = LocalStackAllocator::new();
//! let numbers = stack_new(vec![1, 2, 3]);
//!
//! // Hand the parent's allocator to a worker explicitly.
//! let parent = InheritedStackAllocator::capture();
//! std::thread::spawn(move || {
//!     let _scope = parent.enter();
//!     let label = stack_new(String::from("worker"));
//! });
//! ```

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::local::{stamp_size, stamped_size, ThreadHeaps, SIZED_BLOCK_ALIGNMENT, SIZE_HEADER};
use super::{AlignedAllocator, AlignedState, AllocationCounter, MemAllocator};
use crate::align::aligned_size;
use crate::heap::MemPage;
use crate::threading::live_thread_index;
use crate::{mem_assert, mem_debug_assert};

/// Inline buffer size of [`LocalStackAllocator`] by default: 64KB.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// A bump allocator that is only cleared as a whole.
pub trait StackMemAllocator: AlignedAllocator {
    /// Returns `true` when every block has been deallocated, on all threads.
    fn is_clear(&self) -> bool;

    /// This allocator as a plain aligned allocator.
    fn as_aligned(&self) -> &dyn AlignedAllocator;
}

/// Stack allocator with an `N`-byte inline buffer for the mother thread.
pub struct StackAllocator<const N: usize> {
    inline: MemPage,
    /// Bump offset into `inline`. Only the mother thread moves it.
    offset: AtomicUsize,
    mother: usize,
    kind: String,
    heaps: ThreadHeaps,
    counter: AllocationCounter,
    aligned: AlignedState,
}

impl<const N: usize> StackAllocator<N> {
    /// Creates an allocator owned by the calling thread.
    #[must_use]
    pub fn new() -> Self {
        let kind = format!("StackAllocator<{N}>");
        Self {
            inline: MemPage::allocate(N, crate::config::current().page_alignment),
            offset: AtomicUsize::new(0),
            mother: live_thread_index(),
            aligned: AlignedState::new(kind.clone()),
            kind,
            heaps: ThreadHeaps::new(),
            counter: AllocationCounter::new(),
        }
    }

    /// Live blocks over all threads.
    #[must_use]
    pub fn outstanding(&self) -> isize {
        self.counter.total()
    }

    /// Bytes of the inline buffer in use.
    #[must_use]
    pub fn inline_used(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }

    fn bump_inline(&self, total: usize) -> Option<NonNull<u8>> {
        if live_thread_index() != self.mother {
            return None;
        }
        let start = aligned_size(self.offset.load(Ordering::Relaxed), SIZED_BLOCK_ALIGNMENT);
        if start + total > N {
            return None;
        }
        self.offset.store(start + total, Ordering::Relaxed);
        Some(self.inline.at(start))
    }
}

impl<const N: usize> Default for StackAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MemAllocator for StackAllocator<N> {
    fn allocate(&self, size: usize) -> NonNull<u8> {
        let total = SIZE_HEADER + size;
        self.counter.increment();

        let block = match self.bump_inline(total) {
            Some(block) => block,
            None => self
                .heaps
                .value()
                .lock()
                .section(&self.kind)
                .allocate(total, SIZED_BLOCK_ALIGNMENT),
        };
        // SAFETY: `total` aligned bytes were just reserved.
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

impl<const N: usize> AlignedAllocator for StackAllocator<N> {
    fn aligned_state(&self) -> &AlignedState {
        &self.aligned
    }
}

impl<const N: usize> StackMemAllocator for StackAllocator<N> {
    fn is_clear(&self) -> bool {
        self.counter.total() == 0
    }

    fn as_aligned(&self) -> &dyn AlignedAllocator {
        self
    }
}

impl<const N: usize> Drop for StackAllocator<N> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let outstanding = self.counter.total();
        mem_assert!(
            outstanding == 0,
            "{} dropped with {outstanding} live allocations",
            self.aligned.name()
        );
    }
}

impl<const N: usize> fmt::Debug for StackAllocator<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackAllocator")
            .field("inline_size", &N)
            .field("inline_used", &self.inline_used())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Current allocator context
// =============================================================================

thread_local! {
    static STACK_CONTEXT: RefCell<Vec<Arc<dyn StackMemAllocator>>> = const { RefCell::new(Vec::new()) };
}

/// Makes `allocator` the calling thread's current stack allocator.
pub fn set_stack_allocator(allocator: Arc<dyn StackMemAllocator>) {
    STACK_CONTEXT.with(|context| context.borrow_mut().push(allocator));
}

/// The calling thread's current stack allocator, if any.
#[must_use]
pub fn current_stack_allocator() -> Option<Arc<dyn StackMemAllocator>> {
    STACK_CONTEXT.with(|context| context.borrow().last().cloned())
}

/// Pops the calling thread's current stack allocator, restoring the
/// previous one.
pub fn release_stack_allocator() -> Option<Arc<dyn StackMemAllocator>> {
    STACK_CONTEXT
        .try_with(|context| context.borrow_mut().pop())
        .ok()
        .flatten()
}

fn same_allocator<A: ?Sized, B: ?Sized>(a: &Arc<A>, b: &Arc<B>) -> bool {
    ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

fn pop_expected<A: ?Sized>(expected: &Arc<A>) {
    let popped = release_stack_allocator();
    mem_debug_assert!(
        popped.as_ref().is_some_and(|top| same_allocator(top, expected)),
        "stack allocator scopes released out of order"
    );
}

/// Owns a [`StackAllocator`] and makes it current for its scope.
pub struct LocalStackAllocator<const N: usize = DEFAULT_STACK_SIZE> {
    allocator: Arc<StackAllocator<N>>,
}

impl<const N: usize> LocalStackAllocator<N> {
    /// Creates the allocator and pushes it as current.
    #[must_use]
    pub fn new() -> Self {
        let allocator = Arc::new(StackAllocator::new());
        set_stack_allocator(Arc::clone(&allocator) as Arc<dyn StackMemAllocator>);
        Self { allocator }
    }

    /// Shared handle to the owned allocator.
    #[must_use]
    pub fn handle(&self) -> Arc<StackAllocator<N>> {
        Arc::clone(&self.allocator)
    }
}

impl<const N: usize> Default for LocalStackAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Deref for LocalStackAllocator<N> {
    type Target = StackAllocator<N>;

    fn deref(&self) -> &StackAllocator<N> {
        &self.allocator
    }
}

impl<const N: usize> Drop for LocalStackAllocator<N> {
    fn drop(&mut self) {
        pop_expected(&self.allocator);
    }
}

impl<const N: usize> fmt::Debug for LocalStackAllocator<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LocalStackAllocator")
            .field(&*self.allocator)
            .finish()
    }
}

/// Makes a shared stack allocator current for its scope.
pub struct StackAllocatorGuard {
    allocator: Arc<dyn StackMemAllocator>,
}

impl StackAllocatorGuard {
    /// Pushes `allocator` as current.
    #[must_use]
    pub fn new(allocator: Arc<dyn StackMemAllocator>) -> Self {
        set_stack_allocator(Arc::clone(&allocator));
        Self { allocator }
    }
}

impl Deref for StackAllocatorGuard {
    type Target = dyn StackMemAllocator;

    fn deref(&self) -> &Self::Target {
        &*self.allocator
    }
}

impl Drop for StackAllocatorGuard {
    fn drop(&mut self) {
        pop_expected(&self.allocator);
    }
}

impl fmt::Debug for StackAllocatorGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StackAllocatorGuard")
            .field(&self.allocator.name())
            .finish()
    }
}

/// A parent thread's current stack allocator, captured for a child thread.
#[derive(Clone, Default)]
pub struct InheritedStackAllocator {
    parent: Option<Arc<dyn StackMemAllocator>>,
}

impl InheritedStackAllocator {
    /// Captures the calling thread's current stack allocator.
    #[must_use]
    pub fn capture() -> Self {
        Self {
            parent: current_stack_allocator(),
        }
    }

    /// Returns `true` if nothing was current at capture time.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parent.is_none()
    }

    /// Makes the captured allocator current on the calling thread.
    #[must_use]
    pub fn enter(&self) -> Option<StackAllocatorGuard> {
        self.parent.clone().map(StackAllocatorGuard::new)
    }
}

impl fmt::Debug for InheritedStackAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InheritedStackAllocator")
            .field("parent", &self.parent.as_ref().map(|a| a.name()))
            .finish()
    }
}
