//! # Allocator Soak Test
//!
//! Hammers every allocator from several threads for a fixed number of
//! rounds, frees everything across threads, then shuts the memory system
//! down and checks the heap drained.
//!
//! Usage: `alloc_soak [config.toml]`

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use oroboros_memory::{
    FrameAllocator, FrameMemAllocator, GeneralAllocator, HeapAllocator, LocalStackAllocator,
    MemAllocator, MemoryConfig, StackMemAllocator, StringAllocator,
};

/// Worker threads.
const THREADS: usize = 8;
/// Rounds per worker.
const ROUNDS: usize = 200;
/// Blocks allocated per round.
const BLOCKS_PER_ROUND: usize = 64;

/// Block handed between threads.
struct Block {
    address: usize,
    size: usize,
    fill: u8,
}

fn size_for(thread: usize, round: usize, i: usize) -> usize {
    // Cycles through every bucket and well into the array fallback.
    1 + (thread * 7_919 + round * 104_729 + i * 1_299_709) % 6_000
}

fn worker(index: usize, general: &GeneralAllocator, frames: &FrameAllocator) -> Vec<Block> {
    let strings = StringAllocator::new();
    let scope: LocalStackAllocator<16384> = LocalStackAllocator::new();
    let mut kept = Vec::new();

    for round in 0..ROUNDS {
        for i in 0..BLOCKS_PER_ROUND {
            let size = size_for(index, round, i);
            let fill = (i % 250) as u8 + 1;
            let ptr = general.allocate(size);
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), fill, size) };

            if i % 4 == 0 {
                kept.push(Block {
                    address: ptr.as_ptr() as usize,
                    size,
                    fill,
                });
            } else {
                unsafe { general.deallocate(ptr) };
            }

            let text = strings.allocate(size % 300);
            unsafe { strings.deallocate(text) };

            let scratch = scope.allocate(size % 512);
            unsafe { scope.deallocate(scratch) };

            let transient = frames.allocate(size % 128);
            unsafe { frames.deallocate(transient) };
        }
    }
    assert!(scope.is_clear(), "stack scope leaked on worker {index}");
    kept
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => match MemoryConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("alloc_soak: {e}");
                std::process::exit(2);
            }
        },
        None => MemoryConfig::default(),
    };

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║           ALLOCATOR SOAK TEST                                    ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!("Configuration:");
    println!("  Threads:           {THREADS}");
    println!("  Rounds:            {ROUNDS}");
    println!("  Blocks per round:  {BLOCKS_PER_ROUND}");
    println!("  Page size:         {}", config.default_page_size);
    println!("  Debug signatures:  {}", config.debug_signatures);
    println!();

    let runtime = match oroboros_memory::init(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("alloc_soak: {e}");
            std::process::exit(2);
        }
    };

    let general = Arc::new(GeneralAllocator::new());
    let frames = Arc::new(FrameAllocator::new());
    let start = Instant::now();

    let handles: Vec<_> = (0..THREADS)
        .map(|index| {
            let general = Arc::clone(&general);
            let frames = Arc::clone(&frames);
            thread::spawn(move || worker(index, &general, &frames))
        })
        .collect();

    let mut kept = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(blocks) => kept.extend(blocks),
            Err(_) => {
                eprintln!("alloc_soak: worker panicked");
                std::process::exit(1);
            }
        }
    }
    let allocate_time = start.elapsed();

    // Free everything from the main thread.
    let mut corrupted = 0usize;
    for block in &kept {
        let Some(ptr) = NonNull::new(block.address as *mut u8) else {
            continue;
        };
        unsafe {
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), block.size);
            if bytes.iter().any(|&b| b != block.fill) {
                corrupted += 1;
            }
            general.deallocate(ptr);
        }
    }
    let frame_reset = frames.prepare_frame();

    println!("Results:");
    println!("  Allocation phase:  {:.2?}", allocate_time);
    println!("  Blocks kept:       {}", kept.len());
    println!("  Corrupted blocks:  {corrupted}");
    println!("  Frame reset:       {frame_reset}");
    println!(
        "  Live sections:     {}",
        HeapAllocator::instance().registered_sections()
    );

    drop(frames);
    drop(general);
    drop(runtime);

    let drained = HeapAllocator::instance().is_drained();
    println!("  Heap drained:      {drained}");
    println!();

    if corrupted > 0 || !frame_reset {
        println!("  ✗ FAILED");
        std::process::exit(1);
    }
    println!("  ✓ PASSED");
}
