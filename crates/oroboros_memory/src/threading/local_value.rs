//! # Per-Thread Values
//!
//! [`ThreadLocalValue<T>`] stores one `T` per live thread *per instance*,
//! which `thread_local!` cannot do for values owned by a heap object.
//!
//! ## Safety Note
//!
//! This module hands out `&T` to the owning thread from a shared table, so it
//! needs unsafe code. The rules that keep it sound:
//!
//! - A slot is only written by the thread whose live index maps to it.
//! - Cross-thread reads ([`ThreadLocalValue::visit_all`]) require `T: Sync`.
//! - Destruction requires `&mut self`, so no `&T` can be outstanding.
//!
//! ## Layout
//!
//! ```text
//!   lines (fixed table of line pointers, appended under a mutex)
//!   ┌──────┬──────┬──────┬─────┐
//!   │ ln 0 │ ln 1 │ null │ ... │
//!   └──┬───┴──┬───┴──────┴─────┘
//!      ▼      ▼
//!   [slot; line_size]   slot = { valid, MaybeUninit<T> }
//!
//!   live index i  →  line = i / line_size, offset = i % line_size
//! ```
//!
//! Lines are never moved once published, so a thread reading its slot never
//! races with a thread appending a new line.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::num::NonZeroUsize;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::live_thread_index;
use crate::mem_assert;

/// Maximum number of lines per instance.
const MAX_LINES: usize = 1024;

/// Smallest line, used when the hardware reports very few cores.
const MIN_LINE_SIZE: usize = 4;

type Initializer<T> = Box<dyn Fn(&mut T) + Send + Sync>;

struct Slot<T> {
    valid: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            valid: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// # Safety
    ///
    /// The slot must be valid.
    unsafe fn get(&self) -> &T {
        (*self.value.get()).assume_init_ref()
    }

    /// Drops the value if present.
    fn clear(&mut self) {
        if *self.valid.get_mut() {
            *self.valid.get_mut() = false;
            // SAFETY: the slot was valid and we hold it exclusively.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

/// One lazily-constructed `T` per live thread.
///
/// ```rust,ignore
/// let counters: ThreadLocalValue<AtomicIsize> = ThreadLocalValue::new();
/// counters.value().fetch_add(1, Ordering::Relaxed);
///
/// let mut total = 0;
/// counters.visit_all(|c| total += c.load(Ordering::Relaxed));
/// ```
///
/// A thread's slot outlives the thread: when its live index is recycled the
/// next thread receiving that index inherits the value.
pub struct ThreadLocalValue<T: Send> {
    lines: Box<[AtomicPtr<Slot<T>>]>,
    line_size: usize,
    num_lines: AtomicUsize,
    grow: Mutex<()>,
    construct: Option<Initializer<T>>,
}

// SAFETY: values are only reached through the owning thread's slot (`value`),
// through `&mut self`, or through `visit_all` which requires `T: Sync`.
unsafe impl<T: Send> Send for ThreadLocalValue<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for ThreadLocalValue<T> {}

impl<T: Send> ThreadLocalValue<T> {
    /// Creates an instance whose values start as `T::default()`.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an instance that runs `construct` on every freshly defaulted
    /// value, once per thread.
    #[must_use]
    pub fn with_initializer(construct: impl Fn(&mut T) + Send + Sync + 'static) -> Self {
        Self::build(Some(Box::new(construct)))
    }

    fn build(construct: Option<Initializer<T>>) -> Self {
        let line_size = std::thread::available_parallelism()
            .map_or(MIN_LINE_SIZE, NonZeroUsize::get)
            .max(MIN_LINE_SIZE);
        let lines = (0..MAX_LINES)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            lines,
            line_size,
            num_lines: AtomicUsize::new(0),
            grow: Mutex::new(()),
            construct,
        }
    }

    /// Slots per line.
    #[inline]
    #[must_use]
    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Number of lines allocated so far.
    #[inline]
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.num_lines.load(Ordering::Acquire)
    }

    /// Returns the calling thread's value, constructing it on first access.
    pub fn value(&self) -> &T
    where
        T: Default,
    {
        let slot = self.slot(live_thread_index());
        if !slot.valid.load(Ordering::Acquire) {
            let mut fresh = T::default();
            if let Some(construct) = &self.construct {
                construct(&mut fresh);
            }
            // SAFETY: an invalid slot is only ever written by the thread that
            // owns its index, which is us.
            unsafe { (*slot.value.get()).write(fresh) };
            slot.valid.store(true, Ordering::Release);
        }
        // SAFETY: the slot is valid.
        unsafe { slot.get() }
    }

    /// Returns the calling thread's value if it has been constructed.
    #[must_use]
    pub fn try_value(&self) -> Option<&T> {
        let index = live_thread_index();
        let line = index / self.line_size;
        if line >= self.line_count() {
            return None;
        }
        let slot = self.slot(index);
        // SAFETY: checked valid.
        slot.valid
            .load(Ordering::Acquire)
            .then(|| unsafe { slot.get() })
    }

    /// Drops the calling thread's value. No-op if it was never constructed.
    pub fn destroy(&mut self) {
        let index = live_thread_index();
        let line = index / self.line_size;
        if line >= self.line_count() {
            return;
        }
        let offset = index % self.line_size;
        let line_ptr = *self.lines[line].get_mut();
        // SAFETY: published lines hold `line_size` slots and we are exclusive.
        unsafe { (*line_ptr.add(offset)).clear() };
    }

    /// Drops every thread's value.
    pub fn destroy_all(&mut self) {
        self.for_each_slot_mut(Slot::clear);
    }

    /// Applies `visitor` to every constructed value.
    ///
    /// Runs under the growth mutex; values of threads that are concurrently
    /// being constructed may or may not be visited.
    pub fn visit_all(&self, mut visitor: impl FnMut(&T))
    where
        T: Sync,
    {
        let _guard = self.grow.lock();
        let lines = self.line_count();
        for line in 0..lines {
            let line_ptr = self.lines[line].load(Ordering::Acquire);
            for offset in 0..self.line_size {
                // SAFETY: published lines hold `line_size` slots.
                let slot = unsafe { &*line_ptr.add(offset) };
                if slot.valid.load(Ordering::Acquire) {
                    // SAFETY: valid, and `T: Sync` permits the shared read.
                    visitor(unsafe { slot.get() });
                }
            }
        }
    }

    /// Applies `visitor` to every constructed value with exclusive access.
    pub fn visit_all_mut(&mut self, mut visitor: impl FnMut(&mut T)) {
        self.for_each_slot_mut(|slot| {
            if *slot.valid.get_mut() {
                // SAFETY: valid and exclusive.
                visitor(unsafe { slot.value.get_mut().assume_init_mut() });
            }
        });
    }

    fn for_each_slot_mut(&mut self, mut f: impl FnMut(&mut Slot<T>)) {
        let lines = *self.num_lines.get_mut();
        for line in 0..lines {
            let line_ptr = *self.lines[line].get_mut();
            for offset in 0..self.line_size {
                // SAFETY: published lines hold `line_size` slots and we are exclusive.
                f(unsafe { &mut *line_ptr.add(offset) });
            }
        }
    }

    fn slot(&self, index: usize) -> &Slot<T> {
        let line = index / self.line_size;
        let offset = index % self.line_size;
        mem_assert!(
            line < MAX_LINES,
            "thread index {index} exceeds ThreadLocalValue capacity ({} threads)",
            MAX_LINES * self.line_size
        );

        let mut line_ptr = self.lines[line].load(Ordering::Acquire);
        if line_ptr.is_null() {
            line_ptr = self.grow_to(line);
        }
        // SAFETY: published lines hold `line_size` slots and are never freed
        // while `self` is alive.
        unsafe { &*line_ptr.add(offset) }
    }

    #[cold]
    fn grow_to(&self, line: usize) -> *mut Slot<T> {
        let _guard = self.grow.lock();
        let count = self.num_lines.load(Ordering::Acquire);
        for new_line in count..=line {
            let slots: Box<[Slot<T>]> = (0..self.line_size).map(|_| Slot::empty()).collect();
            let raw = Box::into_raw(slots).cast::<Slot<T>>();
            self.lines[new_line].store(raw, Ordering::Release);
        }
        if line >= count {
            self.num_lines.store(line + 1, Ordering::Release);
        }
        self.lines[line].load(Ordering::Acquire)
    }
}

impl<T: Send> Default for ThreadLocalValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Drop for ThreadLocalValue<T> {
    fn drop(&mut self) {
        self.destroy_all();
        let lines = *self.num_lines.get_mut();
        for line in 0..lines {
            let line_ptr = *self.lines[line].get_mut();
            // SAFETY: created by `Box::into_raw` on a `line_size` slice in `grow_to`.
            drop(unsafe {
                Box::from_raw(ptr::slice_from_raw_parts_mut(line_ptr, self.line_size))
            });
        }
    }
}

impl<T: Send> fmt::Debug for ThreadLocalValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalValue")
            .field("line_size", &self.line_size)
            .field("lines", &self.line_count())
            .finish_non_exhaustive()
    }
}
