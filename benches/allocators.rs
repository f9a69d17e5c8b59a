use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use bumpalo::Bump;
use fencealloc::{
    ArenaId, AtomicRingAllocator, BuddyAllocator, CompletionCounter, FrameLifecycleManager,
    PoolAllocator, RingAllocator, SegregatedFitAllocator,
};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// TRANSIENT ALLOCATION (ring vs bump arena)
// =============================================================================

fn bench_transient_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("transient_frame_1000");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("ring", |b| {
        let mut ring = RingAllocator::new(ArenaId(0), 64 * 1024 * 1024, 256);
        let mut frame = 0u64;
        b.iter(|| {
            for _ in 0..1000 {
                black_box(ring.allocate(256).unwrap());
            }
            frame += 1;
            ring.mark_frame_end(frame);
            ring.reset_tail(frame);
        });
    });

    group.bench_function("atomic_ring", |b| {
        let ring = AtomicRingAllocator::new(ArenaId(0), 64 * 1024 * 1024, 256);
        let mut frame = 0u64;
        b.iter(|| {
            for _ in 0..1000 {
                black_box(ring.allocate(256).unwrap());
            }
            frame += 1;
            ring.mark_frame_end(frame);
            ring.reset_tail(frame);
        });
    });

    group.bench_function("bumpalo", |b| {
        let mut bump = Bump::with_capacity(64 * 1024 * 1024);
        b.iter(|| {
            for _ in 0..1000 {
                black_box(bump.alloc([0u8; 256]));
            }
            bump.reset();
        });
    });

    group.finish();
}

// =============================================================================
// LONG-LIVED ALLOCATION (alloc/free churn)
// =============================================================================

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free_churn");

    for size in [256u64, 4096, 65536] {
        group.throughput(Throughput::Elements(256));

        group.bench_with_input(BenchmarkId::new("buddy", size), &size, |b, &size| {
            let mut buddy = BuddyAllocator::new(ArenaId(0), 256, 64 * 1024 * 1024, 256);
            let mut live = Vec::with_capacity(256);
            b.iter(|| {
                for _ in 0..256 {
                    live.push(buddy.allocate(size).unwrap());
                }
                for a in live.drain(..) {
                    buddy.free(a.offset, a.size).unwrap();
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("tlsf", size), &size, |b, &size| {
            let mut tlsf = SegregatedFitAllocator::new(ArenaId(0), 64 * 1024 * 1024, 256);
            let mut live = Vec::with_capacity(256);
            b.iter(|| {
                for i in 0..256u64 {
                    // Mixed sizes exercise several size classes.
                    live.push(tlsf.allocate(size + (i % 7) * 256).unwrap());
                }
                for a in live.drain(..) {
                    tlsf.free(a.offset).unwrap();
                }
            });
        });
    }

    group.bench_function("pool", |b| {
        let mut pool = PoolAllocator::new(ArenaId(0), 65536, 256, 256);
        let mut live = Vec::with_capacity(256);
        b.iter(|| {
            for _ in 0..256 {
                live.push(pool.allocate().unwrap());
            }
            for block in live.drain(..) {
                pool.free(block.index).unwrap();
            }
        });
    });

    group.finish();
}

// =============================================================================
// FRAME OVERHEAD
// =============================================================================

fn bench_frame_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_overhead");

    group.bench_function("begin_end_with_deferral", |b| {
        let engine = Arc::new(CompletionCounter::new());
        let mut frames: FrameLifecycleManager<Box<[u8; 64]>, _> =
            FrameLifecycleManager::new(3, Arc::clone(&engine), Duration::from_secs(5));
        let mut value = 0u64;
        b.iter(|| {
            frames.begin_frame().unwrap();
            for _ in 0..16 {
                frames.defer_delete(Box::new([0u8; 64]));
            }
            value += 1;
            frames.end_frame(value).unwrap();
            engine.signal(value);
        });
    });

    group.finish();
}

criterion_group!(transient, bench_transient_frame);
criterion_group!(long_lived, bench_churn);
criterion_group!(overhead, bench_frame_overhead);
criterion_main!(transient, long_lived, overhead);
