//! # Threading Primitives
//!
//! Building blocks the allocators use to keep per-thread state:
//!
//! - [`live_thread_index`]: dense, recycled index of the calling thread.
//! - [`ThreadLocalValue`]: one lazily-built value per thread, per instance.
//! - [`RaiiFunction`]: construct/destruct closure guard.

mod index;
mod local_value;
mod raii;

pub use index::live_thread_index;
pub use local_value::ThreadLocalValue;
pub use raii::RaiiFunction;
