//! # OROBOROS Memory
//!
//! Thread-aware allocators for hot engine paths.
//!
//! ## Architecture Rules
//!
//! 1. **No locks on the fast path** - every thread allocates from its own
//!    free list and its own leased section
//! 2. **Pages are pooled, not returned** - sections go back to the heap and
//!    are recycled by kind until shutdown
//! 3. **Contract violations are fatal** - see [`diag`]
//!
//! ## Layers
//!
//! ```text
//!   GeneralAllocator / StringAllocator        size-bucket dispatch
//!   FixedBlocks<N> | Array<N> | Stack<N> | Frame
//!   ThreadLocalValue<ThreadHeap>              per-thread state
//!   HeapAllocator ─► MemSection ─► MemPage    pooled backing memory
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use oroboros_memory::{init, FixedBlocksAllocator, MemAllocator, MemoryConfig};
//!
//! let _runtime = init(MemoryConfig::default())?;
//! let blocks = FixedBlocksAllocator::<64>::instance();
//! let ptr = blocks.allocate(48);
//! unsafe { blocks.deallocate(ptr) };
//! // dropping the runtime releases singletons and drains the heap
//! ```

pub mod align;
pub mod alloc;
pub mod config;
pub mod diag;
pub mod error;
pub mod heap;
pub mod threading;

pub use alloc::{
    current_stack_allocator, default_allocator, frame_allocator, frame_new,
    release_stack_allocator, set_frame_allocator, set_stack_allocator, stack_new,
    AlignedAllocator, AllocBox, AllocationCounter, ArrayAllocator, Bucket,
    FixedBlocksAllocator, FrameAllocator, FrameMemAllocator, GeneralAllocator,
    InheritedStackAllocator, LocalStackAllocator, MemAllocator, StackAllocator,
    StackAllocatorGuard, StackMemAllocator, StringAllocator, SystemAllocator,
};
pub use config::MemoryConfig;
pub use error::{MemoryError, MemoryResult};
pub use heap::{HeapAllocator, MemPage, MemSection, MemSectionPtr};
pub use threading::{live_thread_index, RaiiFunction, ThreadLocalValue};

/// Keeps the memory system up. Dropping it runs [`shutdown`].
#[must_use = "the memory system shuts down when the runtime is dropped"]
pub struct MemoryRuntime {
    _guard: RaiiFunction,
}

impl std::fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRuntime").finish_non_exhaustive()
    }
}

/// Installs `config` and returns the guard that shuts the system down.
///
/// # Errors
///
/// Returns the validation error if `config` is rejected; nothing is
/// installed in that case.
pub fn init(config: MemoryConfig) -> MemoryResult<MemoryRuntime> {
    let page_size = config.default_page_size;
    config::install(config)?;
    tracing::info!(page_size, "memory system initialized");
    Ok(MemoryRuntime {
        _guard: RaiiFunction::on_drop(shutdown),
    })
}

/// Releases every singleton allocator and drains the heap.
///
/// Singletons with live blocks are released when their last block is freed.
/// Allocating from a released singleton is fatal.
pub fn shutdown() {
    let singletons = alloc::singleton::run_release_hooks();
    HeapAllocator::instance().shutdown();
    tracing::info!(singletons, "memory system shut down");
}
