//! # Allocator Benchmark
//!
//! REQUIREMENTS:
//! - Fixed-block allocate/free pair well under the system allocator
//! - Frame allocation is a bump plus a size stamp
//!
//! Run with: `cargo bench --package oroboros_memory`

// Benchmarks don't need docs
#![allow(missing_docs)]
#![allow(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use oroboros_memory::{
    FixedBlocksAllocator, FrameAllocator, FrameMemAllocator, GeneralAllocator, LocalStackAllocator,
    MemAllocator, SystemAllocator,
};

/// Blocks per iteration.
const BATCH: usize = 1_000;

/// Benchmark: allocate then free one fixed block, against the system allocator.
fn bench_fixed_pair(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free_pair_64");
    let blocks = FixedBlocksAllocator::<64>::instance();
    group.bench_function("fixed_blocks", |b| {
        b.iter(|| {
            let ptr = blocks.allocate(black_box(64));
            unsafe { blocks.deallocate(ptr) };
        });
    });

    let system = SystemAllocator::new();
    group.bench_function("system", |b| {
        b.iter(|| {
            let ptr = system.allocate(black_box(64));
            unsafe { system.deallocate(ptr) };
        });
    });
    group.finish();
}

/// Benchmark: batches of mixed sizes through the general allocator.
fn bench_general_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("general_batch");
    let general = GeneralAllocator::new();
    let mut live = Vec::with_capacity(BATCH);

    for size in [24, 200, 900, 5_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                for _ in 0..BATCH {
                    live.push(general.allocate(size));
                }
                for ptr in live.drain(..) {
                    unsafe { general.deallocate(ptr) };
                }
            });
        });
    }
    group.finish();
}

/// Benchmark: one frame of small allocations, then the frame reset.
fn bench_frame(c: &mut Criterion) {
    let frames = FrameAllocator::new();
    let mut live = Vec::with_capacity(BATCH);
    c.bench_function("frame_1000_allocations", |b| {
        b.iter(|| {
            for i in 0..BATCH {
                live.push(frames.allocate(16 + i % 48));
            }
            for ptr in live.drain(..) {
                unsafe { frames.deallocate(ptr) };
            }
            black_box(frames.prepare_frame())
        });
    });
}

/// Benchmark: stack allocator scope with the inline buffer.
fn bench_stack_scope(c: &mut Criterion) {
    c.bench_function("stack_scope_100_allocations", |b| {
        b.iter(|| {
            let scope: LocalStackAllocator<8192> = LocalStackAllocator::new();
            for _ in 0..100 {
                let ptr = scope.allocate(black_box(32));
                unsafe { scope.deallocate(ptr) };
            }
        });
    });
}

criterion_group!(
    benches,
    bench_fixed_pair,
    bench_general_batch,
    bench_frame,
    bench_stack_scope
);
criterion_main!(benches);
