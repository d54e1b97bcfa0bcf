//! # Live Thread Index
//!
//! Every thread that touches the memory system gets a small, dense index.
//! Indices are recycled: when a thread exits, its index returns to a global
//! pool and the next new thread receives the lowest free one. Dense indices
//! keep [`ThreadLocalValue`](super::ThreadLocalValue) tables compact.

use std::cell::Cell;
use std::collections::BTreeSet;

use parking_lot::Mutex;

use super::RaiiFunction;

struct IndexPool {
    /// Released indices, lowest first.
    free: BTreeSet<usize>,
    /// Next never-used index.
    next: usize,
}

impl IndexPool {
    const fn new() -> Self {
        Self {
            free: BTreeSet::new(),
            next: 0,
        }
    }

    fn acquire(&mut self) -> usize {
        if let Some(index) = self.free.pop_first() {
            return index;
        }
        let index = self.next;
        self.next += 1;
        index
    }

    fn release(&mut self, index: usize) {
        self.free.insert(index);
    }
}

static POOL: Mutex<IndexPool> = parking_lot::const_mutex(IndexPool::new());

struct ThreadIndex {
    index: usize,
    _release: RaiiFunction,
}

impl ThreadIndex {
    fn acquire() -> Self {
        let index = POOL.lock().acquire();
        CACHED_INDEX.with(|cached| cached.set(Some(index)));
        tracing::trace!(index, "live thread index assigned");
        Self {
            index,
            _release: RaiiFunction::on_drop(move || {
                // Late destructors must not keep using an index another
                // thread may now receive.
                let _ = CACHED_INDEX.try_with(|cached| cached.set(None));
                POOL.lock().release(index);
                tracing::trace!(index, "live thread index released");
            }),
        }
    }
}

thread_local! {
    static LIVE_INDEX: ThreadIndex = ThreadIndex::acquire();
    /// Copy of the current index. Has no destructor, so it stays readable
    /// for the whole of thread-local teardown.
    static CACHED_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Returns the calling thread's live index.
///
/// The index is stable while the thread runs. Once the index guard has
/// been destroyed during thread-local teardown, the thread takes one fresh
/// index from the pool, keeps it for every later call, and never returns
/// it.
#[must_use]
pub fn live_thread_index() -> usize {
    if let Some(index) = CACHED_INDEX.with(Cell::get) {
        return index;
    }
    LIVE_INDEX.try_with(|slot| slot.index).unwrap_or_else(|_| {
        let index = POOL.lock().acquire();
        CACHED_INDEX.with(|cached| cached.set(Some(index)));
        tracing::trace!(index, "live thread index taken during teardown");
        index
    })
}
