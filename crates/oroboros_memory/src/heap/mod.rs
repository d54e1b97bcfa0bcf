//! # Heap
//!
//! Backing memory for every allocator in the crate.
//!
//! - [`MemPage`]: one aligned region from the system allocator
//! - [`MemSection`]: a bump cursor over a chain of pages
//! - [`HeapAllocator`] / [`MemSectionPtr`]: the process pool of sections,
//!   leased by kind and recycled per thread

mod page;
mod pool;
mod section;

pub use page::MemPage;
pub use pool::{HeapAllocator, MemSectionPtr};
pub use section::{MemSection, DEFAULT_SECTION_ALIGNMENT};
