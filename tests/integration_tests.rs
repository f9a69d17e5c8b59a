//! Integration tests for fencealloc.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fencealloc::{
    Allocation, ArenaId, AtomicRingAllocator, BudgetMonitor, BudgetSnapshot, BuddyAllocator,
    Compactable, CompletionCounter, CompletionSource, DefragState, Defragmenter, EvictionPolicy,
    FrameError, FrameLifecycleManager, OffsetAllocator, PoolAllocator, Priority,
    RelocationHandler, ResourceDescriptor, ResourceHandle, RingAllocator, SegregatedFitAllocator,
    SharedAllocator, SuiteConfig,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deferred resource that records when it is released.
struct Released {
    name: u64,
    log: Arc<Mutex<Vec<u64>>>,
}

impl Drop for Released {
    fn drop(&mut self) {
        self.log.lock().unwrap().push(self.name);
    }
}

#[test]
fn test_deferred_resources_wait_for_their_frame() {
    init_logging();
    let engine = Arc::new(CompletionCounter::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut frames: FrameLifecycleManager<Released, _> =
        FrameLifecycleManager::new(3, Arc::clone(&engine), Duration::from_secs(1));

    // Record six frames; the engine lags two frames behind.
    for frame in 1..=6u64 {
        if frame > 2 {
            engine.signal(frame - 2);
        }
        frames.begin_frame().unwrap();
        frames.defer_delete(Released { name: frame, log: Arc::clone(&log) });
        frames.end_frame(frame).unwrap();

        // Every released resource belongs to a completed frame.
        let completed = engine.completed_value();
        assert!(log.lock().unwrap().iter().all(|&name| name <= completed));
    }

    assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);

    engine.signal(6);
    assert_eq!(frames.wait_idle().unwrap(), 3);
    assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_engine_hang_is_fatal() {
    init_logging();
    let config = SuiteConfig::default().with_frames_in_flight(2).with_engine_wait_timeout_ms(20);
    let engine = Arc::new(CompletionCounter::new());
    let mut frames: FrameLifecycleManager<u32, _> =
        FrameLifecycleManager::from_config(&config, Arc::clone(&engine)).unwrap();

    for frame in 1..=2 {
        frames.begin_frame().unwrap();
        frames.end_frame(frame).unwrap();
    }
    assert!(matches!(frames.begin_frame(), Err(FrameError::EngineHang { awaited: 1, .. })));
    assert!(matches!(frames.end_frame(3), Err(FrameError::EngineHang { .. })));
    assert!(matches!(frames.wait_idle(), Err(FrameError::EngineHang { .. })));
}

#[test]
fn test_ring_frames_through_manager() {
    init_logging();
    let config = SuiteConfig::minimal().with_ring_capacity(4096).with_alignment(4096, 256);
    let engine = Arc::new(CompletionCounter::new());
    let ring = RingAllocator::from_config(ArenaId(1), &config).unwrap();
    let mut frames: FrameLifecycleManager<(), _> =
        FrameLifecycleManager::new(2, Arc::clone(&engine), Duration::from_secs(1)).with_ring(ring);

    // Each frame uses 1.5 KiB; two in flight fit, a third waits for completion.
    let mut live: Vec<(u64, Allocation)> = Vec::new();
    for frame in 1..=20u64 {
        if frame > 2 {
            engine.signal(frame - 2);
        }
        frames.begin_frame().unwrap();
        let completed = frames.last_completed_value();
        live.retain(|(owner, _)| *owner > completed);

        for _ in 0..3 {
            let a = frames.ring_mut().unwrap().allocate(500).unwrap();
            assert!(live.iter().all(|(_, other)| !a.overlaps(other)), "frame {frame}: {a:?}");
            live.push((frame, a));
        }
        frames.end_frame(frame).unwrap();
    }
}

#[test]
fn test_concurrent_ring_recording() {
    init_logging();
    let ring = Arc::new(AtomicRingAllocator::new(ArenaId(2), 1 << 16, 256));

    for frame in 1..=8u64 {
        let allocations: Vec<Allocation> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let ring = &ring;
                    scope.spawn(move || (0..8).map(|_| ring.allocate(300).unwrap()).collect::<Vec<_>>())
                })
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });

        for (i, a) in allocations.iter().enumerate() {
            assert!(allocations[i + 1..].iter().all(|b| !a.overlaps(b)));
        }
        ring.mark_frame_end(frame);
        ring.reset_tail(frame);
    }
    assert_eq!(ring.used_bytes(), 0);
}

#[test]
fn test_pressure_drives_eviction() {
    init_logging();
    let mut resources: HashMap<ResourceHandle, ResourceDescriptor> = HashMap::new();
    let mut add = |id, priority, size, tick| {
        resources.insert(
            ResourceHandle(id),
            ResourceDescriptor { priority, size, last_used_tick: tick, resident: true },
        );
    };
    add(1, Priority::Critical, 400, 10);
    add(2, Priority::High, 200, 9);
    add(3, Priority::Low, 150, 3);
    add(4, Priority::Background, 100, 8);
    add(5, Priority::Background, 100, 2);

    let pressure: Arc<Mutex<Option<BudgetSnapshot>>> = Arc::default();
    let sink = Arc::clone(&pressure);
    let mut monitor = BudgetMonitor::new(60, 1.0)
        .with_pressure_callback(move |snapshot| *sink.lock().unwrap() = Some(*snapshot));

    let usage: u64 = resources.values().map(|r| r.size).sum();
    monitor.update(usage, 800);

    let snapshot = pressure.lock().unwrap().take().expect("pressure was reported");
    assert_eq!(snapshot.overage_bytes(), 150);

    let policy = EvictionPolicy::new();
    let evict = policy.eviction_candidates(resources.iter().map(|(h, d)| (*h, d)), snapshot.overage_bytes());
    assert_eq!(evict, vec![ResourceHandle(5), ResourceHandle(4)]);

    for handle in &evict {
        resources.get_mut(handle).unwrap().resident = false;
    }
    let usage: u64 = resources.values().filter(|r| r.resident).map(|r| r.size).sum();
    assert!(monitor.update(usage, 800).ratio <= 1.0);

    // Draining everything leaves Critical and High resident.
    let all = policy.eviction_candidates(resources.iter().map(|(h, d)| (*h, d)), u64::MAX);
    assert_eq!(all, vec![ResourceHandle(3)]);

    // 150 bytes to spend: the more recently used Background resource fits, the other does not.
    let load = policy.load_candidates(resources.iter().map(|(h, d)| (*h, d)), 150);
    assert_eq!(load, vec![ResourceHandle(4)]);
}

/// Byte-accurate model of the arena, so moves can be checked.
struct ArenaMirror {
    bytes: Vec<u8>,
    owners: HashMap<u64, u8>,
    pending: Option<(Allocation, Allocation)>,
}

impl RelocationHandler for ArenaMirror {
    fn copy(&mut self, from: &Allocation, to: &Allocation) {
        let src = from.offset as usize..from.end() as usize;
        self.bytes.copy_within(src, to.offset as usize);
        self.pending = Some((*from, *to));
    }

    fn barrier(&mut self) -> bool {
        self.pending.is_some()
    }

    fn update_references(&mut self, from: &Allocation, to: &Allocation) {
        let owner = self.owners.remove(&from.offset).unwrap();
        self.owners.insert(to.offset, owner);
        self.pending = None;
    }
}

fn fragment<A: Compactable>(allocator: &mut A, sizes: &[u64]) -> ArenaMirror {
    let mut mirror = ArenaMirror {
        bytes: vec![0; allocator.capacity() as usize],
        owners: HashMap::new(),
        pending: None,
    };

    let allocations: Vec<Allocation> = sizes.iter().map(|&s| allocator.allocate(s).unwrap()).collect();
    for (i, a) in allocations.iter().enumerate() {
        if i % 2 == 0 {
            allocator.free(a).unwrap();
        } else {
            let tag = i as u8;
            mirror.bytes[a.offset as usize..a.end() as usize].fill(tag);
            mirror.owners.insert(a.offset, tag);
        }
    }
    mirror
}

fn assert_contents_survived<A: Compactable>(allocator: &A, mirror: &ArenaMirror) {
    let live = allocator.live_allocations();
    assert_eq!(live.len(), mirror.owners.len());
    for a in live {
        let tag = mirror.owners[&a.offset];
        assert!(mirror.bytes[a.offset as usize..a.end() as usize].iter().all(|&b| b == tag));
    }
}

#[test]
fn test_defragment_tlsf_end_to_end() {
    init_logging();
    let mut tlsf = SegregatedFitAllocator::new(ArenaId(4), 1 << 16, 256);
    let mut mirror = fragment(&mut tlsf, &[4096, 512, 4096, 512, 4096, 512, 4096, 512]);
    let before = tlsf.fragmentation();
    assert!(before > 0.05);

    let mut defrag = Defragmenter::new(Duration::from_millis(50), 0.05);
    while defrag.update(&mut tlsf, &mut mirror) != DefragState::Idle {}

    assert!(tlsf.fragmentation() < before);
    assert_eq!(defrag.stats().moves_completed, 4);
    let offsets: Vec<u64> = tlsf.live_allocations().iter().map(|a| a.offset).collect();
    assert_eq!(offsets, vec![0, 512, 1024, 1536]);
    assert_contents_survived(&tlsf, &mirror);
}

#[test]
fn test_defragment_buddy_end_to_end() {
    init_logging();
    let mut buddy = BuddyAllocator::new(ArenaId(5), 256, 1 << 14, 256);
    let mut mirror = fragment(&mut buddy, &[256; 16]);
    // Eight 256-byte holes plus the untouched upper halves.
    assert_eq!(buddy.stats().free_block_count, 10);

    let mut defrag = Defragmenter::new(Duration::from_millis(50), 1.0);
    defrag.request_pass();
    while defrag.update(&mut buddy, &mut mirror) != DefragState::Idle {}

    let offsets: Vec<u64> = buddy.live_allocations().iter().map(|a| a.offset).collect();
    assert_eq!(offsets, (0..8).map(|i| i * 256).collect::<Vec<_>>());
    assert_contents_survived(&buddy, &mirror);
    assert_eq!(buddy.stats().largest_free_block, 8192);
}

#[test]
fn test_suite_from_config() {
    init_logging();
    let config = SuiteConfig::minimal().with_strict_frees(false);
    config.validate().unwrap();

    let ring = RingAllocator::from_config(ArenaId(0), &config).unwrap();
    let pool = PoolAllocator::from_config(ArenaId(1), &config).unwrap();
    let buddy = BuddyAllocator::from_config(ArenaId(2), &config).unwrap();
    let tlsf = SegregatedFitAllocator::from_config(ArenaId(3), &config).unwrap();

    let mut backends: Vec<Box<dyn OffsetAllocator>> =
        vec![Box::new(ring), Box::new(pool), Box::new(buddy), Box::new(tlsf)];

    for backend in &mut backends {
        let a = backend.allocate(100).unwrap();
        assert_eq!(a.offset % config.sub_allocation_alignment, 0);
        assert!(a.size >= 100);
        assert_eq!(backend.capacity() % config.sub_allocation_alignment, 0);

        let foreign = Allocation { arena: ArenaId(99), ..a };
        assert!(backend.free(&foreign).is_err());
        backend.free(&a).unwrap();
    }
}

#[test]
fn test_shared_tlsf_across_threads() {
    init_logging();
    let shared = Arc::new(SharedAllocator::new(SegregatedFitAllocator::new(ArenaId(6), 1 << 20, 256)));

    std::thread::scope(|scope| {
        for t in 0..4u64 {
            let shared = &shared;
            scope.spawn(move || {
                for i in 0..50u64 {
                    let a = shared.allocate(256 * (1 + (i + t) % 5)).unwrap();
                    shared.free(&a).unwrap();
                }
            });
        }
    });

    let stats = shared.stats();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.free_block_count, 1);
}
