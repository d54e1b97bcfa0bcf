//! Thread indices recycled through real thread exits. Runs alone in its own
//! binary so no other test thread can take the released index.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use oroboros_memory::{live_thread_index, ThreadLocalValue};

#[test]
fn test_exited_thread_hands_index_and_slot_to_next_thread() {
    let values: Arc<ThreadLocalValue<AtomicU64>> = Arc::new(ThreadLocalValue::new());

    let first = {
        let values = Arc::clone(&values);
        thread::spawn(move || {
            values.value().store(42, Ordering::Relaxed);
            live_thread_index()
        })
    };
    // Joining waits for the thread's locals to be torn down.
    let first_index = first.join().unwrap();

    let second = {
        let values = Arc::clone(&values);
        thread::spawn(move || (live_thread_index(), values.value().load(Ordering::Relaxed)))
    };
    let (second_index, inherited) = second.join().unwrap();

    assert_eq!(second_index, first_index);
    assert_eq!(inherited, 42, "the slot outlives the thread that built it");
}
