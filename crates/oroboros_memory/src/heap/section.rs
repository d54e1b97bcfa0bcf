//! # Memory Section
//!
//! A growable chain of [`MemPage`]s with a bump cursor. Sections never free
//! individual allocations; [`MemSection::reset`] rewinds the cursor to the
//! root page and keeps every page for reuse.
//!
//! ```text
//!   pages:  [ root ][ page 1 ][ page 2 ]
//!                      ▲
//!                      current, free = offset of first unused byte
//! ```

use std::ptr::NonNull;

use super::page::MemPage;
use crate::align::{aligned_size, is_power_of_two};
use crate::mem_assert;

/// Alignment used by [`MemSection::allocate_default`].
pub const DEFAULT_SECTION_ALIGNMENT: usize = 4;

/// A bump allocator over a chain of pages.
#[derive(Debug)]
pub struct MemSection {
    kind: String,
    pages: Vec<MemPage>,
    /// Index of the page the cursor is in.
    current: usize,
    /// Offset of the first unused byte in `pages[current]`.
    free: usize,
    page_size: usize,
    page_alignment: usize,
    allocation_count: usize,
}

impl MemSection {
    /// Creates an empty section. The root page is allocated on first use.
    #[must_use]
    pub fn new(kind: impl Into<String>, page_size: usize, page_alignment: usize) -> Self {
        mem_assert!(
            is_power_of_two(page_alignment),
            "alignment expected to be a power of two. Actual value: ({page_alignment})"
        );
        Self {
            kind: kind.into(),
            pages: Vec::new(),
            current: 0,
            free: 0,
            page_size,
            page_alignment,
            allocation_count: 0,
        }
    }

    /// Returns `size` unused bytes aligned to `alignment`.
    ///
    /// Walks forward from the cursor and appends a page of
    /// `max(size, page_size)` bytes only when no following page has room.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> NonNull<u8> {
        mem_assert!(
            is_power_of_two(alignment),
            "alignment expected to be a power of two. Actual value: ({alignment})"
        );

        let mut index = self.current;
        let mut cursor = self.free;
        while index < self.pages.len() {
            let page = &self.pages[index];
            let base = page.address().as_ptr() as usize;
            let start = aligned_size(base + cursor, alignment) - base;
            if start + size <= page.size() {
                return self.commit(index, start, size);
            }
            index += 1;
            cursor = 0;
        }

        let page = MemPage::allocate(size.max(self.page_size), alignment.max(self.page_alignment));
        tracing::debug!(
            kind = %self.kind,
            size = page.size(),
            pages = self.pages.len() + 1,
            "section grew"
        );
        self.pages.push(page);
        self.commit(self.pages.len() - 1, 0, size)
    }

    /// [`MemSection::allocate`] with [`DEFAULT_SECTION_ALIGNMENT`].
    pub fn allocate_default(&mut self, size: usize) -> NonNull<u8> {
        self.allocate(size, DEFAULT_SECTION_ALIGNMENT)
    }

    fn commit(&mut self, index: usize, start: usize, size: usize) -> NonNull<u8> {
        self.current = index;
        self.free = start + size;
        self.allocation_count += 1;
        self.pages[index].at(start)
    }

    /// Rewinds the cursor to the root page. Pages are kept.
    ///
    /// Every pointer handed out since the last reset becomes reusable; the
    /// caller guarantees none of them is still live.
    pub fn reset(&mut self) {
        self.current = 0;
        self.free = 0;
        self.allocation_count = 0;
    }

    /// Returns `true` if `ptr` lies inside any page of this section.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.pages.iter().any(|page| page.contains(ptr))
    }

    /// Kind string this section was created for.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Minimum size of newly appended pages.
    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Changes the minimum size of pages appended from now on.
    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size;
    }

    /// Number of pages in the chain.
    #[inline]
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Total bytes held by the chain.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pages.iter().map(MemPage::size).sum()
    }

    /// Allocations served since the last reset.
    #[inline]
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }
}
