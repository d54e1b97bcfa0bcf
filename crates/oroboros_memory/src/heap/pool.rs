//! # Heap Section Pool
//!
//! [`HeapAllocator`] is the process-wide owner of every [`MemSection`].
//! Allocators lease sections by *kind* (allocator class plus size, e.g.
//! `"FixedBlocksAllocator<64>"`) and give them back when they are done.
//!
//! ## Safety Note
//!
//! Sections live in shared `SectionEntry` cells so that the global registry
//! and the per-thread recycle pools can both hold them. Access to the section
//! itself is only ever made through a [`MemSectionPtr`], and the `in_work`
//! flag guarantees at most one lease exists per entry.
//!
//! ## Recycling
//!
//! ```text
//!   get_section("X") ──► thread pool["X"].pop() ──► (miss) create + register
//!          │
//!          ▼
//!    MemSectionPtr ──drop──► reset ──► thread pool["X"].push()
//!                                 └──► (shutdown) unregister, pages freed
//! ```

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::section::MemSection;
use crate::config;
use crate::diag::raise_failure;
use crate::mem_assert;
use crate::threading::ThreadLocalValue;

struct SectionEntry {
    in_work: AtomicBool,
    section: UnsafeCell<MemSection>,
}

// SAFETY: the section is only reached through the single lease that set
// `in_work`; registry and pools only move the `Arc` around.
unsafe impl Sync for SectionEntry {}

type SectionMap = HashMap<String, Vec<Arc<SectionEntry>>>;

/// Process-wide pool of memory sections.
pub struct HeapAllocator {
    /// Every live section, by kind. Structural changes only.
    sections: Mutex<SectionMap>,
    /// Idle sections per thread. Only contended during shutdown.
    pools: ThreadLocalValue<Mutex<SectionMap>>,
    shutting_down: AtomicBool,
}

static HEAP: OnceLock<HeapAllocator> = OnceLock::new();

impl HeapAllocator {
    /// Returns the process heap, creating it on first use.
    pub fn instance() -> &'static Self {
        HEAP.get_or_init(|| Self {
            sections: Mutex::new(HashMap::new()),
            pools: ThreadLocalValue::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Leases a section of `kind`, reusing an idle one from the calling
    /// thread's pool when possible.
    pub fn get_section(&self, kind: &str) -> MemSectionPtr {
        let recycled = self.pools.value().lock().get_mut(kind).and_then(Vec::pop);
        let entry = match recycled {
            Some(entry) => entry,
            None => self.create_section(kind),
        };

        let was_in_work = entry.in_work.swap(true, Ordering::AcqRel);
        mem_assert!(!was_in_work, "section of kind {kind:?} leased twice");
        tracing::trace!(kind, "section leased");

        MemSectionPtr { entry: Some(entry) }
    }

    fn create_section(&self, kind: &str) -> Arc<SectionEntry> {
        let config = config::current();
        let page_size = config.page_size_for(kind);
        let entry = Arc::new(SectionEntry {
            in_work: AtomicBool::new(false),
            section: UnsafeCell::new(MemSection::new(kind, page_size, config.page_alignment)),
        });

        let mut sections = self.sections.lock();
        let list = sections.entry(kind.to_owned()).or_default();
        list.push(Arc::clone(&entry));
        tracing::debug!(kind, page_size, count = list.len(), "section created");
        entry
    }

    fn release_section(&self, entry: Arc<SectionEntry>) {
        // SAFETY: the lease being released was the only accessor.
        let section = unsafe { &mut *entry.section.get() };
        section.reset();
        let kind = section.kind().to_owned();
        entry.in_work.store(false, Ordering::Release);

        if self.shutting_down.load(Ordering::Acquire) {
            self.unregister(&kind, &entry);
            tracing::trace!(kind = %kind, "section released after shutdown");
            return;
        }

        self.pools.value().lock().entry(kind).or_default().push(entry);
    }

    fn unregister(&self, kind: &str, entry: &Arc<SectionEntry>) {
        let mut sections = self.sections.lock();
        if let Some(list) = sections.get_mut(kind) {
            list.retain(|e| !Arc::ptr_eq(e, entry));
            if list.is_empty() {
                sections.remove(kind);
            }
        }
    }

    /// Enters shutdown mode: drains every thread's recycle pool and frees the
    /// idle sections. Sections still leased are freed when their lease drops.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let mut drained = Vec::new();
        self.pools.visit_all(|pool| {
            drained.extend(pool.lock().drain());
        });

        let mut released = 0usize;
        for (kind, entries) in drained {
            for entry in entries {
                self.unregister(&kind, &entry);
                released += 1;
            }
        }

        tracing::info!(
            released,
            remaining = self.registered_sections(),
            "heap allocator shut down"
        );
    }

    /// Returns `true` once shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Returns `true` when no section remains registered.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.sections.lock().is_empty()
    }

    /// Number of registered sections of `kind`, leased or idle.
    #[must_use]
    pub fn section_count(&self, kind: &str) -> usize {
        self.sections.lock().get(kind).map_or(0, Vec::len)
    }

    /// Number of registered sections over all kinds.
    #[must_use]
    pub fn registered_sections(&self) -> usize {
        self.sections.lock().values().map(Vec::len).sum()
    }
}

impl fmt::Debug for HeapAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("sections", &self.registered_sections())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

/// Exclusive lease of a [`MemSection`]. Returns the section to the heap on
/// drop.
///
/// A default-constructed lease is empty; dereferencing it is a fatal error.
#[derive(Default)]
pub struct MemSectionPtr {
    entry: Option<Arc<SectionEntry>>,
}

impl MemSectionPtr {
    /// Returns `true` if this lease holds a section.
    #[inline]
    #[must_use]
    pub fn valid(&self) -> bool {
        self.entry.is_some()
    }

    /// Stable identity of the leased section, for comparing leases.
    #[must_use]
    pub fn id(&self) -> Option<usize> {
        self.entry.as_ref().map(|e| Arc::as_ptr(e) as usize)
    }

    /// Returns the section to the heap now. No-op on an empty lease.
    pub fn release(&mut self) {
        if let Some(entry) = self.entry.take() {
            HeapAllocator::instance().release_section(entry);
        }
    }

    fn entry(&self) -> &SectionEntry {
        match &self.entry {
            Some(entry) => entry.as_ref(),
            None => raise_failure(file!(), line!(), format_args!("empty section lease dereferenced")),
        }
    }
}

impl Deref for MemSectionPtr {
    type Target = MemSection;

    fn deref(&self) -> &MemSection {
        // SAFETY: this lease is the sole accessor while `in_work` is set.
        unsafe { &*self.entry().section.get() }
    }
}

impl DerefMut for MemSectionPtr {
    fn deref_mut(&mut self) -> &mut MemSection {
        // SAFETY: as above, and `&mut self` excludes other borrows of the lease.
        unsafe { &mut *self.entry().section.get() }
    }
}

impl Drop for MemSectionPtr {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MemSectionPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry {
            Some(_) => f.debug_tuple("MemSectionPtr").field(&**self).finish(),
            None => f.write_str("MemSectionPtr(empty)"),
        }
    }
}
