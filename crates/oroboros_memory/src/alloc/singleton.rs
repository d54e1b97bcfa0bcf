//! # Delayed-Release Singletons
//!
//! [`FixedBlocksAllocator`](super::FixedBlocksAllocator) and
//! [`ArrayAllocator`](super::ArrayAllocator) are process singletons, one per
//! block size. Rust has no generic statics, so instances live in a registry
//! keyed by [`TypeId`] and are leaked for the `'static` lifetime.
//!
//! At [`shutdown`](crate::shutdown) every registered release hook runs. A
//! singleton with outstanding blocks is only marked *ready*; it releases its
//! sections on the `deallocate` that brings its outstanding count to zero.
//!
//! ```text
//!   instance() ──► registry[TypeId] ──(miss)──► create, leak, push hook
//!   shutdown() ──► hook: ready = true ──► total == 0 ? release now
//!                                                   : release on last free
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::OnceLock;

use parking_lot::{Mutex, RwLock};

use crate::diag::raise_failure;
use crate::mem_assert;
use crate::threading::ThreadLocalValue;

type Registry = RwLock<HashMap<TypeId, &'static (dyn Any + Send + Sync)>>;
type ReleaseHook = Box<dyn FnOnce() + Send>;

static RELEASE_HOOKS: Mutex<Vec<ReleaseHook>> = parking_lot::const_mutex(Vec::new());

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Returns the process instance of `T`, creating it with `create` on first
/// use and registering `release` to run at shutdown.
///
/// `create` runs under the registry lock and must not request another
/// singleton.
pub(crate) fn instance_of<T>(create: fn() -> T, release: fn(&'static T)) -> &'static T
where
    T: Any + Send + Sync,
{
    let id = TypeId::of::<T>();
    if let Some(&found) = registry().read().get(&id) {
        return downcast(found);
    }

    let mut map = registry().write();
    if let Some(&found) = map.get(&id) {
        return downcast(found);
    }

    let created: &'static T = Box::leak(Box::new(create()));
    map.insert(id, created);
    RELEASE_HOOKS.lock().push(Box::new(move || release(created)));
    tracing::debug!(singleton = std::any::type_name::<T>(), "singleton created");
    created
}

fn downcast<T: Any>(found: &'static (dyn Any + Send + Sync)) -> &'static T {
    match found.downcast_ref::<T>() {
        Some(instance) => instance,
        None => raise_failure(
            file!(),
            line!(),
            format_args!("singleton registry type mismatch for {}", std::any::type_name::<T>()),
        ),
    }
}

/// Runs every registered release hook, newest first. Returns how many ran.
pub(crate) fn run_release_hooks() -> usize {
    let hooks = std::mem::take(&mut *RELEASE_HOOKS.lock());
    let count = hooks.len();
    for hook in hooks.into_iter().rev() {
        hook();
    }
    count
}

/// Outstanding-allocation counter with one atomic per thread.
///
/// Cross-thread frees make individual counters negative; only the sum is
/// meaningful.
#[derive(Debug, Default)]
pub struct AllocationCounter {
    counts: ThreadLocalValue<AtomicIsize>,
}

impl AllocationCounter {
    /// Creates a zeroed counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one allocation on the calling thread.
    #[inline]
    pub fn increment(&self) {
        self.counts.value().fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one free on the calling thread.
    #[inline]
    pub fn decrement(&self) {
        self.counts.value().fetch_sub(1, Ordering::Relaxed);
    }

    /// The calling thread's contribution.
    #[must_use]
    pub fn thread_count(&self) -> isize {
        self.counts.value().load(Ordering::Relaxed)
    }

    /// Sum over all threads.
    #[must_use]
    pub fn total(&self) -> isize {
        let mut total = 0;
        self.counts
            .visit_all(|count| total += count.load(Ordering::Acquire));
        total
    }
}

/// Allocation counting plus the ready/released flags of a singleton.
#[derive(Debug, Default)]
pub(crate) struct DelayedRelease {
    counter: AllocationCounter,
    ready: AtomicBool,
    released: AtomicBool,
}

impl DelayedRelease {
    /// Records an allocation. Fatal once release has begun.
    pub(crate) fn on_allocate(&self, name: &str) {
        mem_assert!(
            !self.ready.load(Ordering::Acquire),
            "allocation from {name} after its release began"
        );
        self.counter.increment();
    }

    /// Records a free. Returns `true` if the caller must release now.
    pub(crate) fn on_deallocate(&self) -> bool {
        self.counter.decrement();
        self.ready.load(Ordering::Acquire) && self.try_claim()
    }

    /// Marks the singleton ready. Returns `true` if it can release now.
    pub(crate) fn request_release(&self, name: &str) -> bool {
        self.ready.store(true, Ordering::Release);
        let claimed = self.try_claim();
        if !claimed {
            tracing::warn!(
                allocator = name,
                outstanding = self.counter.total(),
                "release deferred until outstanding blocks are freed"
            );
        }
        claimed
    }

    fn try_claim(&self) -> bool {
        self.counter.total() == 0 && !self.released.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn counter(&self) -> &AllocationCounter {
        &self.counter
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Probe(u32);

    #[test]
    fn test_instance_is_created_once() {
        let a = instance_of(|| Probe(7), |_| {});
        let b = instance_of(|| Probe(9), |_| {});
        assert!(std::ptr::eq(a, b));
        assert_eq!(b.0, 7);
    }

    #[test]
    fn test_counter_sums_across_threads() {
        let counter = AllocationCounter::new();
        counter.increment();
        counter.increment();

        thread::scope(|s| {
            s.spawn(|| counter.decrement());
        });

        assert_eq!(counter.thread_count(), 2);
        assert_eq!(counter.total(), 1);
    }

    #[test]
    fn test_release_waits_for_last_free() {
        let state = DelayedRelease::default();
        state.on_allocate("TestKind");
        assert!(!state.request_release("TestKind"));
        assert!(state.on_deallocate());
        assert!(state.is_released());
    }

    #[test]
    fn test_release_claimed_once() {
        let state = DelayedRelease::default();
        assert!(state.request_release("TestKind"));
        assert!(!state.request_release("TestKind"));
    }

    #[test]
    #[should_panic(expected = "after its release began")]
    fn test_allocate_after_release_is_fatal() {
        let state = DelayedRelease::default();
        let _ = state.request_release("TestKind");
        state.on_allocate("TestKind");
    }
}
