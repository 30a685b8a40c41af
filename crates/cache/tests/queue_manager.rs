use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chunkstream_cache::{
    BudgetKind, CapacityConfig, CapacityError, CapacityLimits, ChunkError, ChunkKey, ChunkPayload,
    ChunkPriority, ChunkQueueManager, ChunkState, DataType, FetchAction, FetchError, GpuHandle,
    GpuUploader, GridPosition, InterestId, LayerId, RequestId, SourceId, UploadError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SOURCE: SourceId = SourceId(1);
const LAYER: InterestId = InterestId::Layer(LayerId(1));

fn key(x: i64) -> ChunkKey {
    ChunkKey::new(SOURCE, GridPosition::new(x, 0, 0))
}

fn payload(size: usize) -> ChunkPayload {
    ChunkPayload::new([size as u32, 1, 1], DataType::Uint8, vec![0; size]).unwrap()
}

fn manager(gpu: CapacityLimits, system: CapacityLimits) -> ChunkQueueManager {
    let config = CapacityConfig::unbounded()
        .with_gpu_memory(gpu)
        .with_system_memory(system);
    let mut manager = ChunkQueueManager::new(&config).unwrap();
    manager.register_source(SOURCE);
    manager
}

fn deliver(manager: &mut ChunkQueueManager, key: ChunkKey, size: usize) -> bool {
    manager.on_download_started(key, 0);
    manager.on_chunk_ready(key, 0, Ok(payload(size)), Duration::from_millis(5))
}

fn gpu_items(manager: &ChunkQueueManager) -> usize {
    manager.budget(BudgetKind::GpuMemory).unwrap().item_count()
}

#[test]
fn first_interest_requests_fetch_once() {
    let mut manager = manager(CapacityLimits::unbounded(), CapacityLimits::unbounded());
    manager.add_interest(key(0), LAYER, ChunkPriority::visible(1.0)).unwrap();

    assert_eq!(
        manager.drain_actions(),
        vec![FetchAction::Request {
            key: key(0),
            priority: ChunkPriority::visible(1.0),
            generation: 0,
        }]
    );
    assert_eq!(manager.chunk_state(key(0)), Some(ChunkState::Queued));

    // A second, less urgent interest shares the pending fetch
    let request = InterestId::Request(RequestId(1));
    manager.add_interest(key(0), request, ChunkPriority::prefetch(0.0)).unwrap();
    assert!(manager.drain_actions().is_empty());

    // A more urgent interest requeues the fetch
    manager.add_interest(key(0), request, ChunkPriority::visible(0.5)).unwrap();
    assert_eq!(
        manager.drain_actions(),
        vec![FetchAction::Request {
            key: key(0),
            priority: ChunkPriority::visible(0.5),
            generation: 0,
        }]
    );
}

#[test]
fn fetch_cancelled_only_when_last_interest_leaves() {
    let mut manager = manager(CapacityLimits::unbounded(), CapacityLimits::unbounded());
    let request = InterestId::Request(RequestId(9));
    manager.add_interest(key(0), LAYER, ChunkPriority::visible(1.0)).unwrap();
    manager.add_interest(key(0), request, ChunkPriority::visible(1.0)).unwrap();
    manager.drain_actions();

    manager.remove_interest(key(0), request);
    assert!(manager.drain_actions().is_empty());
    assert_eq!(manager.chunk_state(key(0)), Some(ChunkState::Queued));

    manager.remove_interest(key(0), LAYER);
    assert_eq!(manager.drain_actions(), vec![FetchAction::Cancel { key: key(0) }]);
    assert_eq!(manager.chunk_state(key(0)), None);
}

#[test]
fn visible_chunk_is_promoted_to_gpu_on_arrival() {
    let mut manager = manager(CapacityLimits::unbounded(), CapacityLimits::unbounded());
    manager.add_interest(key(0), LAYER, ChunkPriority::visible(0.0)).unwrap();
    assert!(deliver(&mut manager, key(0), 64));

    assert_eq!(manager.chunk_state(key(0)), Some(ChunkState::GpuMemory));
    let gpu = manager.budget(BudgetKind::GpuMemory).unwrap();
    let system = manager.budget(BudgetKind::SystemMemory).unwrap();
    assert_eq!((gpu.item_count(), gpu.size_bytes()), (1, 64));
    assert_eq!((system.item_count(), system.size_bytes()), (0, 0));

    let states: Vec<ChunkState> = manager.drain_events().iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![
            ChunkState::Queued,
            ChunkState::Downloading,
            ChunkState::SystemMemory,
            ChunkState::GpuMemory,
        ]
    );
}

#[test]
fn prefetch_chunk_stays_in_system_memory() {
    let mut manager = manager(CapacityLimits::unbounded(), CapacityLimits::unbounded());
    manager.add_interest(key(0), LAYER, ChunkPriority::prefetch(0.0)).unwrap();
    deliver(&mut manager, key(0), 64);
    manager.process();

    assert_eq!(manager.chunk_state(key(0)), Some(ChunkState::SystemMemory));
    assert_eq!(gpu_items(&manager), 0);
}

#[test]
fn end_to_end_gpu_item_limit_of_two() {
    let mut manager = manager(CapacityLimits::items(2), CapacityLimits::unbounded());
    let (a, b, c) = (key(0), key(1), key(2));
    for (rank, k) in [a, b, c].into_iter().enumerate() {
        manager.add_interest(k, LAYER, ChunkPriority::visible(rank as f32)).unwrap();
    }
    for k in [a, b, c] {
        deliver(&mut manager, k, 100);
    }
    manager.process();

    assert_eq!(manager.chunk_state(a), Some(ChunkState::GpuMemory));
    assert_eq!(manager.chunk_state(b), Some(ChunkState::GpuMemory));
    assert_eq!(manager.chunk_state(c), Some(ChunkState::SystemMemory));
    assert_eq!(gpu_items(&manager), 2);

    manager.remove_interest(a, LAYER);
    manager.process();

    assert_eq!(manager.chunk_state(a), Some(ChunkState::Evicted));
    assert_eq!(manager.chunk_state(b), Some(ChunkState::GpuMemory));
    assert_eq!(manager.chunk_state(c), Some(ChunkState::GpuMemory));
    assert_eq!(gpu_items(&manager), 2);
    assert!(manager.payload(a).is_none());
}

#[test]
fn eviction_picks_least_recently_needed_chunk() {
    let mut manager = manager(CapacityLimits::items(2), CapacityLimits::unbounded());
    let (a, b, c) = (key(0), key(1), key(2));
    manager.add_interest(a, LAYER, ChunkPriority::visible(0.0)).unwrap();
    manager.add_interest(b, LAYER, ChunkPriority::visible(1.0)).unwrap();
    deliver(&mut manager, a, 10);
    deliver(&mut manager, b, 10);

    // a leaves the working set before b
    manager.remove_interest(a, LAYER);
    manager.remove_interest(b, LAYER);

    manager.add_interest(c, LAYER, ChunkPriority::visible(0.0)).unwrap();
    deliver(&mut manager, c, 10);

    assert_eq!(manager.chunk_state(a), Some(ChunkState::Evicted));
    assert_eq!(manager.chunk_state(b), Some(ChunkState::GpuMemory));
    assert_eq!(manager.chunk_state(c), Some(ChunkState::GpuMemory));
    assert_eq!(manager.statistics().total.evictions, 1);
}

#[test]
fn eviction_continues_until_incoming_chunk_fits() {
    let mut manager = manager(CapacityLimits::bytes(300), CapacityLimits::unbounded());
    let (small, large, incoming) = (key(0), key(1), key(2));
    manager.add_interest(small, LAYER, ChunkPriority::visible(0.0)).unwrap();
    manager.add_interest(large, LAYER, ChunkPriority::visible(1.0)).unwrap();
    deliver(&mut manager, small, 100);
    deliver(&mut manager, large, 200);

    manager.remove_interest(small, LAYER);
    manager.remove_interest(large, LAYER);
    manager.add_interest(incoming, LAYER, ChunkPriority::visible(0.0)).unwrap();
    deliver(&mut manager, incoming, 150);

    assert_eq!(manager.chunk_state(small), Some(ChunkState::Evicted));
    assert_eq!(manager.chunk_state(large), Some(ChunkState::Evicted));
    assert_eq!(manager.chunk_state(incoming), Some(ChunkState::GpuMemory));
    assert_eq!(manager.budget(BudgetKind::GpuMemory).unwrap().size_bytes(), 150);
}

#[test]
fn full_system_memory_defers_then_refetches() {
    let mut manager = manager(CapacityLimits::unbounded(), CapacityLimits::items(1));
    let (a, b) = (key(0), key(1));
    manager.add_interest(a, LAYER, ChunkPriority::prefetch(0.0)).unwrap();
    manager.add_interest(b, LAYER, ChunkPriority::prefetch(1.0)).unwrap();
    deliver(&mut manager, a, 10);
    assert!(deliver(&mut manager, b, 10));

    assert_eq!(manager.chunk_state(a), Some(ChunkState::SystemMemory));
    assert_eq!(manager.chunk_state(b), Some(ChunkState::Queued));
    manager.drain_actions();

    // Nothing can be evicted yet, so nothing is re-requested
    manager.process();
    assert!(manager.drain_actions().is_empty());

    manager.remove_interest(a, LAYER);
    manager.process();
    assert_eq!(
        manager.drain_actions(),
        vec![FetchAction::Request {
            key: b,
            priority: ChunkPriority::prefetch(1.0),
            generation: 0,
        }]
    );

    deliver(&mut manager, b, 10);
    assert_eq!(manager.chunk_state(a), Some(ChunkState::Evicted));
    assert_eq!(manager.chunk_state(b), Some(ChunkState::SystemMemory));
}

#[test]
fn oversized_chunk_reports_capacity_error_once() {
    let mut manager = manager(CapacityLimits::unbounded(), CapacityLimits::bytes(100));
    manager.add_interest(key(0), LAYER, ChunkPriority::visible(0.0)).unwrap();
    manager.add_interest(key(1), LAYER, ChunkPriority::visible(1.0)).unwrap();
    deliver(&mut manager, key(0), 200);
    deliver(&mut manager, key(1), 300);

    assert_eq!(manager.chunk_state(key(0)), Some(ChunkState::Failed));
    assert!(matches!(
        manager.chunk_error(key(1)),
        Some(ChunkError::Capacity(CapacityError::ItemExceedsSizeLimit { .. }))
    ));
    assert_eq!(manager.take_capacity_errors().len(), 1);

    // Never retried, not even on fresh interest
    manager.drain_actions();
    manager.remove_interest(key(0), LAYER);
    manager.add_interest(key(0), LAYER, ChunkPriority::visible(0.0)).unwrap();
    assert!(manager.drain_actions().is_empty());
    assert!(manager.take_capacity_errors().is_empty());
}

#[test]
fn fetch_failure_is_retried_only_on_fresh_interest() {
    let mut manager = manager(CapacityLimits::unbounded(), CapacityLimits::unbounded());
    manager.add_interest(key(0), LAYER, ChunkPriority::visible(0.0)).unwrap();
    manager.drain_actions();
    let failure = Err(ChunkError::Fetch(FetchError::Failed("503".into())));
    assert!(manager.on_chunk_ready(key(0), 0, failure, Duration::ZERO));

    assert_eq!(manager.chunk_state(key(0)), Some(ChunkState::Failed));
    manager.process();
    assert!(manager.drain_actions().is_empty());

    let request = InterestId::Request(RequestId(2));
    manager.add_interest(key(0), request, ChunkPriority::visible(0.0)).unwrap();
    assert_eq!(manager.chunk_state(key(0)), Some(ChunkState::Queued));
    assert_eq!(manager.drain_actions().len(), 1);
}

#[test]
fn invalidation_drops_stale_results_and_refetches() {
    let mut manager = manager(CapacityLimits::unbounded(), CapacityLimits::unbounded());
    manager.add_interest(key(0), LAYER, ChunkPriority::visible(0.0)).unwrap();
    manager.add_interest(key(1), LAYER, ChunkPriority::visible(1.0)).unwrap();
    deliver(&mut manager, key(1), 50);
    manager.drain_actions();

    assert_eq!(manager.invalidate_source(SOURCE), Some(1));
    assert_eq!(gpu_items(&manager), 0);

    let actions = manager.drain_actions();
    assert!(actions.contains(&FetchAction::Cancel { key: key(0) }));
    assert!(actions.contains(&FetchAction::Request {
        key: key(1),
        priority: ChunkPriority::visible(1.0),
        generation: 1,
    }));

    // A late result from the old generation is ignored
    assert!(!manager.on_chunk_ready(key(0), 0, Ok(payload(50)), Duration::ZERO));
    assert_eq!(manager.chunk_state(key(0)), Some(ChunkState::Queued));

    assert!(manager.on_chunk_ready(key(0), 1, Ok(payload(50)), Duration::ZERO));
    assert_eq!(manager.chunk_state(key(0)), Some(ChunkState::GpuMemory));
}

#[test]
fn lowering_limits_demotes_until_within_budget() {
    let mut manager = manager(CapacityLimits::items(3), CapacityLimits::unbounded());
    for x in 0..3 {
        manager.add_interest(key(x), LAYER, ChunkPriority::visible(x as f32)).unwrap();
        deliver(&mut manager, key(x), 10);
    }
    assert_eq!(gpu_items(&manager), 3);

    manager.set_limits(BudgetKind::GpuMemory, CapacityLimits::items(1)).unwrap();
    manager.process();

    assert_eq!(gpu_items(&manager), 1);
    // The most urgent chunk keeps its GPU slot; the others fall back to system memory
    assert_eq!(manager.chunk_state(key(0)), Some(ChunkState::GpuMemory));
    assert_eq!(manager.chunk_state(key(1)), Some(ChunkState::SystemMemory));
    assert_eq!(manager.chunk_state(key(2)), Some(ChunkState::SystemMemory));

    assert!(manager
        .set_limits(BudgetKind::GpuMemory, CapacityLimits::items(0))
        .is_err());
}

#[test]
fn disposing_source_releases_budgets() {
    let mut manager = manager(CapacityLimits::unbounded(), CapacityLimits::unbounded());
    manager.add_interest(key(0), LAYER, ChunkPriority::visible(0.0)).unwrap();
    manager.add_interest(key(1), LAYER, ChunkPriority::prefetch(0.0)).unwrap();
    manager.add_interest(key(2), LAYER, ChunkPriority::visible(1.0)).unwrap();
    deliver(&mut manager, key(0), 10);
    deliver(&mut manager, key(1), 10);
    manager.drain_actions();

    manager.dispose_source(SOURCE);

    assert_eq!(manager.drain_actions(), vec![FetchAction::Cancel { key: key(2) }]);
    assert_eq!(gpu_items(&manager), 0);
    assert_eq!(manager.budget(BudgetKind::SystemMemory).unwrap().item_count(), 0);
    assert!(matches!(
        manager.add_interest(key(0), LAYER, ChunkPriority::visible(0.0)),
        Err(ChunkError::SourceDisposed)
    ));
}

#[test]
fn statistics_count_visible_chunks_by_state() {
    let mut manager = manager(CapacityLimits::unbounded(), CapacityLimits::unbounded());
    manager.add_interest(key(0), LAYER, ChunkPriority::visible(0.0)).unwrap();
    manager.add_interest(key(1), LAYER, ChunkPriority::prefetch(0.0)).unwrap();
    manager.add_interest(key(2), LAYER, ChunkPriority::visible(1.0)).unwrap();
    manager.add_interest(key(3), LAYER, ChunkPriority::visible(2.0)).unwrap();
    deliver(&mut manager, key(0), 40);
    deliver(&mut manager, key(1), 20);
    manager.on_download_started(key(2), 0);

    let stats = manager.statistics();
    assert_eq!(stats.sources.len(), 1);
    assert_eq!(stats.total.visible_chunks, 4);
    assert_eq!(stats.total.visible_queued, 1);
    assert_eq!(stats.total.visible_downloading, 1);
    assert_eq!(stats.total.visible_system_memory, 1);
    assert_eq!(stats.total.visible_gpu_memory, 1);
    assert_eq!(stats.total.visible_gpu_bytes, 40);
    assert_eq!(stats.total.resident_bytes, 60);
    assert_eq!(stats.total.downloads_completed, 2);
    assert_eq!(stats.gpu_memory.size_bytes, 40);
}

struct CountingUploader {
    uploads: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl GpuUploader for CountingUploader {
    fn upload(&mut self, _key: &ChunkKey, payload: &ChunkPayload) -> Result<GpuHandle, UploadError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(GpuHandle::new(payload.size_bytes() as u64, payload.size_bytes()))
    }

    fn release(&mut self, _key: &ChunkKey, _handle: GpuHandle) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn uploader_sees_promotions_and_evictions() {
    let uploads = Arc::new(AtomicUsize::new(0));
    let releases = Arc::new(AtomicUsize::new(0));
    let config = CapacityConfig::unbounded().with_gpu_memory(CapacityLimits::items(1));
    let mut manager = ChunkQueueManager::new(&config)
        .unwrap()
        .with_uploader(Box::new(CountingUploader {
            uploads: uploads.clone(),
            releases: releases.clone(),
        }));
    manager.register_source(SOURCE);

    manager.add_interest(key(0), LAYER, ChunkPriority::visible(0.0)).unwrap();
    deliver(&mut manager, key(0), 10);
    manager.remove_interest(key(0), LAYER);
    manager.add_interest(key(1), LAYER, ChunkPriority::visible(0.0)).unwrap();
    deliver(&mut manager, key(1), 10);

    assert_eq!(uploads.load(Ordering::SeqCst), 2);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

/// Budget usage must always equal the sum over chunks in the matching state
fn assert_budgets_match_states(manager: &ChunkQueueManager) {
    for (kind, state) in [
        (BudgetKind::GpuMemory, ChunkState::GpuMemory),
        (BudgetKind::SystemMemory, ChunkState::SystemMemory),
    ] {
        let budget = manager.budget(kind).unwrap();
        let source = manager.source(SOURCE).unwrap();
        let members: Vec<_> = source.chunks().filter(|c| c.state() == state).collect();
        assert_eq!(budget.item_count(), members.len(), "{kind} item count");
        assert_eq!(
            budget.size_bytes(),
            members.iter().map(|c| c.size_bytes()).sum::<usize>(),
            "{kind} bytes"
        );
        assert!(!budget.is_over_capacity(), "{kind} over capacity");
        for chunk in &members {
            assert!(chunk.payload().is_some(), "{} resident without payload", chunk.key());
        }
    }
}

#[test]
fn randomized_workload_keeps_budgets_consistent() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut manager = manager(
        CapacityLimits::new(Some(4), Some(1000)),
        CapacityLimits::new(Some(8), Some(2500)),
    );
    let layers = [InterestId::Layer(LayerId(1)), InterestId::Layer(LayerId(2))];
    let mut pending: HashMap<ChunkKey, u64> = HashMap::new();

    for _ in 0..2000 {
        match rng.gen_range(0..10) {
            0..=3 => {
                let k = key(rng.gen_range(0..16));
                let layer = layers[rng.gen_range(0..2)];
                let priority = if rng.gen_bool(0.6) {
                    ChunkPriority::visible(rng.gen_range(0.0..10.0))
                } else {
                    ChunkPriority::prefetch(rng.gen_range(0.0..10.0))
                };
                manager.add_interest(k, layer, priority).unwrap();
            }
            4..=5 => {
                let k = key(rng.gen_range(0..16));
                manager.remove_interest(k, layers[rng.gen_range(0..2)]);
            }
            6..=8 => {
                if let Some(&k) = pending.keys().nth(rng.gen_range(0..pending.len().max(1))) {
                    let generation = pending.remove(&k).unwrap_or(0);
                    manager.on_download_started(k, generation);
                    let size = rng.gen_range(50..400);
                    manager.on_chunk_ready(k, generation, Ok(payload(size)), Duration::ZERO);
                }
            }
            _ => manager.process(),
        }

        for action in manager.drain_actions() {
            match action {
                FetchAction::Request { key, generation, .. } => {
                    pending.insert(key, generation);
                }
                FetchAction::Cancel { key } => {
                    pending.remove(&key);
                }
            }
        }
        assert_budgets_match_states(&manager);
    }
}
