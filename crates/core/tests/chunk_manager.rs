//! ChunkManager against a hand-driven worker endpoint

use std::sync::Arc;
use std::time::Duration;

use chunkstream_cache::{
    CapacityConfig, CapacityLimits, ChunkError, ChunkKey, ChunkPayload, ChunkPriority, ChunkState,
    DataType, FetchError, Generation, GridPosition, LayerId,
};
use chunkstream_core::rpc;
use chunkstream_core::{
    BackendEndpoint, BackendMessage, ChunkManager, FrontendMessage, SourceSpec, SyntheticSource,
};
use chunkstream_scheduler::CancellationToken;
use viewer_core::{ChunkLayout, WorkingSetDelta};

const WAIT: Duration = Duration::from_secs(2);

fn manager(capacity: CapacityConfig) -> (ChunkManager, BackendEndpoint) {
    let (frontend, backend) = rpc::channel();
    (ChunkManager::with_endpoint(&capacity, frontend).unwrap(), backend)
}

fn spec(key: &str) -> SourceSpec {
    SourceSpec::new(
        key,
        ChunkLayout::new([4, 4, 4], [16, 16, 16]),
        Arc::new(SyntheticSource::new([4, 4, 4])),
    )
}

fn payload(fill: u8) -> ChunkPayload {
    ChunkPayload::new([4, 4, 4], DataType::Uint8, vec![fill; 64]).unwrap()
}

fn requested(backend: &BackendEndpoint) -> Vec<(ChunkKey, Generation)> {
    backend
        .drain()
        .into_iter()
        .filter_map(|message| match message {
            FrontendMessage::RequestChunk { key, generation, .. } => Some((key, generation)),
            _ => None,
        })
        .collect()
}

fn ready(backend: &BackendEndpoint, key: ChunkKey, generation: Generation, result: Result<ChunkPayload, ChunkError>) {
    backend
        .send(BackendMessage::ChunkReady {
            key,
            generation,
            result,
            latency: Duration::from_millis(3),
        })
        .unwrap();
}

#[test]
fn identical_keys_share_one_source() {
    let (manager, backend) = manager(CapacityConfig::unbounded());
    let first = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let second = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let other = manager.get_chunk_source(spec("volume/s1")).unwrap();

    assert_eq!(first.id(), second.id());
    assert_ne!(first.id(), other.id());
    assert_eq!(first.ref_count(), 2);
    let registered = backend
        .drain()
        .iter()
        .filter(|m| matches!(m, FrontendMessage::RegisterSource { .. }))
        .count();
    assert_eq!(registered, 2);

    let id = first.id();
    drop(first);
    assert_eq!(manager.source_count(), 2);
    drop(second);
    assert_eq!(manager.source_count(), 1);
    assert!(backend
        .drain()
        .iter()
        .any(|m| matches!(m, FrontendMessage::DisposeSource { source } if *source == id)));
}

#[test]
fn concurrent_requests_share_one_fetch() {
    let (manager, backend) = manager(CapacityConfig::unbounded());
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let position = GridPosition::new(1, 2, 3);

    let first = manager
        .request_chunk(&source, position, ChunkPriority::visible(0.0), &CancellationToken::new())
        .unwrap();
    let second = manager
        .request_chunk(&source, position, ChunkPriority::visible(0.0), &CancellationToken::new())
        .unwrap();

    let requests = requested(&backend);
    assert_eq!(requests.len(), 1);
    let (key, generation) = requests[0];
    assert_eq!(key.position, position);

    ready(&backend, key, generation, Ok(payload(7)));
    let a = manager.resolve(first, WAIT).unwrap();
    let b = manager.resolve(second, WAIT).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_bytes()[0], 7);
}

#[test]
fn cancelling_one_requester_keeps_the_shared_fetch() {
    let (manager, backend) = manager(CapacityConfig::unbounded());
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let position = GridPosition::new(0, 0, 0);
    let token = CancellationToken::new();

    let first = manager
        .request_chunk(&source, position, ChunkPriority::visible(0.0), &token)
        .unwrap();
    let second = manager
        .request_chunk(&source, position, ChunkPriority::visible(0.0), &CancellationToken::new())
        .unwrap();
    let key = first.key();
    backend.drain();

    token.cancel();
    assert_eq!(manager.resolve(first, WAIT), Err(ChunkError::Cancelled));
    assert!(!backend
        .drain()
        .iter()
        .any(|m| matches!(m, FrontendMessage::CancelChunk { .. })));

    // the last interest leaving cancels the fetch
    drop(second);
    assert!(backend
        .drain()
        .iter()
        .any(|m| matches!(m, FrontendMessage::CancelChunk { key: k } if *k == key)));
    assert_eq!(manager.chunk_state(key), None);
}

#[test]
fn already_cancelled_token_is_rejected() {
    let (manager, backend) = manager(CapacityConfig::unbounded());
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    backend.drain();

    let token = CancellationToken::new();
    token.cancel();
    let result = manager.request_chunk(&source, GridPosition::new(0, 0, 0), ChunkPriority::visible(0.0), &token);
    assert!(matches!(result, Err(ChunkError::Cancelled)));
    assert!(requested(&backend).is_empty());
}

#[test]
fn positions_outside_the_grid_are_not_found() {
    let (manager, _backend) = manager(CapacityConfig::unbounded());
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let result = manager.request_chunk(
        &source,
        GridPosition::new(4, 0, 0),
        ChunkPriority::visible(0.0),
        &CancellationToken::new(),
    );
    assert!(matches!(result, Err(ChunkError::Fetch(FetchError::NotFound(_)))));
}

#[test]
fn fetch_failure_fails_only_that_chunk() {
    let (manager, backend) = manager(CapacityConfig::unbounded());
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let token = CancellationToken::new();
    let broken = manager
        .request_chunk(&source, GridPosition::new(0, 0, 0), ChunkPriority::visible(0.0), &token)
        .unwrap();
    let healthy = manager
        .request_chunk(&source, GridPosition::new(1, 0, 0), ChunkPriority::visible(1.0), &token)
        .unwrap();

    let requests = requested(&backend);
    assert_eq!(requests.len(), 2);
    for (key, generation) in requests {
        let result = if key == broken.key() {
            Err(ChunkError::Fetch(FetchError::Failed("boom".to_string())))
        } else {
            Ok(payload(1))
        };
        ready(&backend, key, generation, result);
    }

    assert_eq!(
        manager.resolve(broken, WAIT),
        Err(ChunkError::Fetch(FetchError::Failed("boom".to_string())))
    );
    assert!(manager.resolve(healthy, WAIT).is_ok());
}

#[test]
fn stale_generation_never_reaches_the_caller() {
    let (manager, backend) = manager(CapacityConfig::unbounded());
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let pending = manager
        .request_chunk(&source, GridPosition::new(2, 2, 2), ChunkPriority::visible(0.0), &CancellationToken::new())
        .unwrap();
    let (key, old_generation) = requested(&backend)[0];

    let new_generation = source.invalidate().unwrap();
    assert!(new_generation > old_generation);
    let refetched = requested(&backend);
    assert_eq!(refetched, vec![(key, new_generation)]);

    ready(&backend, key, old_generation, Ok(payload(1)));
    manager.process().unwrap();
    assert!(!pending.is_complete());

    ready(&backend, key, new_generation, Ok(payload(2)));
    let delivered = manager.resolve(pending, WAIT).unwrap();
    assert_eq!(delivered.as_bytes()[0], 2);
}

#[test]
fn fetch_abandoned_by_the_worker_is_requested_again() {
    let (manager, backend) = manager(CapacityConfig::unbounded());
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let pending = manager
        .request_chunk(&source, GridPosition::new(1, 1, 1), ChunkPriority::visible(0.0), &CancellationToken::new())
        .unwrap();
    let (key, generation) = requested(&backend)[0];

    ready(&backend, key, generation, Err(ChunkError::Cancelled));
    manager.process().unwrap();
    assert!(!pending.is_complete());
    assert_eq!(manager.chunk_state(key), Some(ChunkState::Queued));
    assert_eq!(requested(&backend), vec![(key, generation)]);

    ready(&backend, key, generation, Ok(payload(4)));
    assert_eq!(manager.resolve(pending, WAIT).unwrap().as_bytes()[0], 4);
}

#[test]
fn unanswered_request_times_out_and_withdraws() {
    let (manager, backend) = manager(CapacityConfig::unbounded());
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let pending = manager
        .request_chunk(&source, GridPosition::new(0, 1, 0), ChunkPriority::visible(0.0), &CancellationToken::new())
        .unwrap();
    let key = pending.key();

    assert_eq!(
        manager.resolve(pending, Duration::from_millis(20)),
        Err(ChunkError::TimedOut)
    );
    assert_eq!(manager.chunk_state(key), None);
    assert!(backend
        .drain()
        .iter()
        .any(|m| matches!(m, FrontendMessage::CancelChunk { .. })));
}

#[test]
fn layer_deltas_drive_gpu_residency() {
    let capacity = CapacityConfig::unbounded().with_gpu_memory(CapacityLimits::items(2));
    let (manager, backend) = manager(capacity);
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let layer = LayerId(1);
    let key = |x| ChunkKey::new(source.id(), GridPosition::new(x, 0, 0));
    let (a, b, c) = (key(0), key(1), key(2));

    manager.apply_delta(
        layer,
        &WorkingSetDelta {
            added: vec![
                (a, ChunkPriority::visible(0.0)),
                (b, ChunkPriority::visible(1.0)),
                (c, ChunkPriority::visible(2.0)),
            ],
            ..WorkingSetDelta::default()
        },
    );
    for (key, generation) in requested(&backend) {
        ready(&backend, key, generation, Ok(payload(0)));
    }
    manager.process().unwrap();

    assert_eq!(manager.chunk_state(a), Some(ChunkState::GpuMemory));
    assert_eq!(manager.chunk_state(b), Some(ChunkState::GpuMemory));
    assert_eq!(manager.chunk_state(c), Some(ChunkState::SystemMemory));

    manager.apply_delta(
        layer,
        &WorkingSetDelta {
            removed: vec![a],
            ..WorkingSetDelta::default()
        },
    );
    manager.process().unwrap();

    assert_eq!(manager.chunk_state(a), Some(ChunkState::Evicted));
    assert_eq!(manager.chunk_state(c), Some(ChunkState::GpuMemory));
    assert_eq!(manager.statistics().gpu_memory.item_count, 2);
}

#[test]
fn residency_changes_reach_subscribers() {
    let (manager, backend) = manager(CapacityConfig::unbounded());
    let events = manager.subscribe();
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let pending = manager
        .request_chunk(&source, GridPosition::new(0, 0, 0), ChunkPriority::prefetch(0.0), &CancellationToken::new())
        .unwrap();
    let (key, generation) = requested(&backend)[0];
    ready(&backend, key, generation, Ok(payload(0)));
    manager.resolve(pending, WAIT).unwrap();

    let states: Vec<ChunkState> = events.try_iter().filter(|e| e.key == key).map(|e| e.state).collect();
    assert_eq!(states.first(), Some(&ChunkState::Queued));
    assert!(states.contains(&ChunkState::SystemMemory));
}

#[test]
fn dropped_backend_disconnects_waiters() {
    let (manager, backend) = manager(CapacityConfig::unbounded());
    let source = manager.get_chunk_source(spec("volume/s0")).unwrap();
    let pending = manager
        .request_chunk(&source, GridPosition::new(0, 0, 0), ChunkPriority::visible(0.0), &CancellationToken::new())
        .unwrap();
    drop(backend);

    assert_eq!(manager.resolve(pending, WAIT), Err(ChunkError::Disconnected));
    assert!(!manager.is_connected());
}
