//! Privileged-side facade over the chunk queue and the worker bridge
//!
//! Layers and individual callers register interest in chunks through the
//! `ChunkManager`. Interest is counted per consumer, so concurrent requests
//! for the same chunk share a single fetch and a chunk is only cancelled once
//! nobody wants it. Results from the worker are matched by key and
//! generation; a result from before an invalidation never reaches a caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chunkstream_cache::{
    AggregatedStatistics, BudgetKind, CapacityConfig, CapacityError, CapacityLimits, ChunkError,
    ChunkKey, ChunkPayload, ChunkPriority, ChunkQueueManager, ChunkState, FetchAction, FetchError,
    Generation, GpuUploader, GridPosition, InterestId, LayerId, RequestId, ResidencyEvent, SourceId,
};
use chunkstream_scheduler::{CancellationToken, WorkerPoolConfig, WorkerQueueStats};
use crossbeam_channel::{Receiver, Sender};
use viewer_core::{LayerTransform, WorkingSetDelta};

use crate::backend::WorkerBackend;
use crate::error::EngineResult;
use crate::rpc::{self, BackendMessage, FrontendEndpoint, FrontendMessage};
use crate::signal::ResidencySignal;
use crate::source::{ChunkSourceHandle, SourceKey, SourceOwner, SourceSpec, WeakSourceHandle};

/// Longest single wait for worker messages inside `resolve`
const RESOLVE_POLL: Duration = Duration::from_millis(5);

type Reply = Result<ChunkPayload, ChunkError>;

struct Waiter {
    request: RequestId,
    token: CancellationToken,
    reply: Sender<Reply>,
}

struct ManagerState {
    queue: ChunkQueueManager,
    endpoint: FrontendEndpoint,
    connected: bool,
    sources: HashMap<SourceKey, (SourceId, WeakSourceHandle)>,
    next_source: u64,
    next_request: u64,
    waiters: HashMap<ChunkKey, Vec<Waiter>>,
    requests: HashMap<RequestId, ChunkKey>,
    layers: HashMap<LayerId, Vec<ChunkSourceHandle>>,
    signal: ResidencySignal,
    capacity_errors: Vec<CapacityError>,
}

impl ManagerState {
    fn send(&mut self, message: FrontendMessage) -> Result<(), ChunkError> {
        if !self.connected {
            return Err(ChunkError::Disconnected);
        }
        let kind = message.kind();
        if self.endpoint.send(message).is_err() {
            log::error!("worker backend disconnected while sending {}", kind);
            self.disconnect();
            return Err(ChunkError::Disconnected);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        let keys: Vec<ChunkKey> = self.waiters.keys().copied().collect();
        for key in keys {
            self.settle_with(key, Err(ChunkError::Disconnected));
        }
    }

    fn apply(&mut self, message: BackendMessage) {
        match message {
            BackendMessage::DownloadStarted { key, generation } => {
                self.queue.on_download_started(key, generation);
            }
            BackendMessage::ChunkReady {
                key,
                generation,
                result,
                latency,
            } => {
                self.queue.on_chunk_ready(key, generation, result, latency);
            }
            BackendMessage::LayerAdded { layer } => log::trace!("worker added {}", layer),
            BackendMessage::LayerRemoved { layer } => log::trace!("worker removed {}", layer),
        }
    }

    /// Apply waiting worker messages, then run eviction and promotion
    fn pump(&mut self) -> Result<usize, ChunkError> {
        let mut applied = 0;
        while self.connected {
            match self.endpoint.try_recv() {
                Ok(Some(message)) => {
                    self.apply(message);
                    applied += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    log::error!("worker backend disconnected");
                    self.disconnect();
                }
            }
        }
        self.sweep_cancelled();
        self.queue.process();
        self.flush();
        if self.connected {
            Ok(applied)
        } else {
            Err(ChunkError::Disconnected)
        }
    }

    /// Forward queue actions to the worker and resolve finished waiters
    fn flush(&mut self) {
        loop {
            let actions = self.queue.drain_actions();
            let events = self.queue.drain_events();
            if actions.is_empty() && events.is_empty() {
                break;
            }
            for action in actions {
                let message = match action {
                    FetchAction::Request {
                        key,
                        priority,
                        generation,
                    } => FrontendMessage::RequestChunk {
                        key,
                        priority,
                        generation,
                    },
                    FetchAction::Cancel { key } => FrontendMessage::CancelChunk { key },
                };
                if self.send(message).is_err() {
                    break;
                }
            }
            for event in &events {
                if matches!(
                    event.state,
                    ChunkState::SystemMemory | ChunkState::GpuMemory | ChunkState::Failed
                ) {
                    self.settle(event.key);
                }
            }
            self.signal.emit(&events);
        }
        self.capacity_errors.extend(self.queue.take_capacity_errors());
    }

    /// Resolve the waiters of `key` if the chunk reached a final state
    fn settle(&mut self, key: ChunkKey) {
        if !self.waiters.contains_key(&key) {
            return;
        }
        let outcome = match self.queue.chunk_state(key) {
            Some(ChunkState::SystemMemory | ChunkState::GpuMemory) => self.queue.payload(key).map(Ok),
            Some(ChunkState::Failed) => self.queue.chunk_error(key).map(Err),
            _ => None,
        };
        if let Some(outcome) = outcome {
            self.settle_with(key, outcome);
        }
    }

    fn settle_with(&mut self, key: ChunkKey, outcome: Reply) {
        for waiter in self.waiters.remove(&key).unwrap_or_default() {
            self.requests.remove(&waiter.request);
            self.queue.remove_interest(key, InterestId::Request(waiter.request));
            let _ = waiter.reply.send(outcome.clone());
        }
    }

    fn cancel_request(&mut self, request: RequestId) -> bool {
        let Some(key) = self.requests.remove(&request) else {
            return false;
        };
        if let Some(waiters) = self.waiters.get_mut(&key) {
            if let Some(index) = waiters.iter().position(|w| w.request == request) {
                let waiter = waiters.swap_remove(index);
                let _ = waiter.reply.send(Err(ChunkError::Cancelled));
            }
            if waiters.is_empty() {
                self.waiters.remove(&key);
            }
        }
        self.queue.remove_interest(key, InterestId::Request(request));
        log::trace!("request {:?} for {} cancelled", request, key);
        self.flush();
        true
    }

    fn sweep_cancelled(&mut self) {
        let cancelled: Vec<RequestId> = self
            .waiters
            .values()
            .flatten()
            .filter(|waiter| waiter.token.is_cancelled())
            .map(|waiter| waiter.request)
            .collect();
        for request in cancelled {
            self.cancel_request(request);
        }
    }
}

struct ManagerShared {
    state: Mutex<ManagerState>,
}

impl ManagerShared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SourceOwner for ManagerShared {
    fn release_source(&self, id: SourceId) {
        let mut state = self.lock();
        state.sources.retain(|_, (source, _)| *source != id);
        let orphaned: Vec<ChunkKey> = state.waiters.keys().filter(|key| key.source == id).copied().collect();
        for key in orphaned {
            state.settle_with(key, Err(ChunkError::SourceDisposed));
        }
        state.queue.dispose_source(id);
        state.flush();
        let _ = state.send(FrontendMessage::DisposeSource { source: id });
    }

    fn invalidate_source(&self, id: SourceId) -> Option<Generation> {
        let mut state = self.lock();
        let generation = state.queue.invalidate_source(id)?;
        let _ = state.send(FrontendMessage::InvalidateSource {
            source: id,
            generation,
        });
        state.flush();
        Some(generation)
    }
}

/// Outstanding request for one chunk
///
/// Dropping an unresolved request withdraws its interest.
pub struct PendingChunk {
    request: RequestId,
    key: ChunkKey,
    token: CancellationToken,
    reply: Receiver<Reply>,
    owner: Weak<ManagerShared>,
    done: bool,
}

impl PendingChunk {
    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_complete(&self) -> bool {
        self.done || !self.reply.is_empty()
    }

    /// Take the result without blocking
    pub fn try_take(&mut self) -> Option<Reply> {
        if self.done {
            return None;
        }
        let reply = self.reply.try_recv().ok()?;
        self.done = true;
        Some(reply)
    }
}

impl Drop for PendingChunk {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.lock().cancel_request(self.request);
        }
    }
}

/// Entry point for layers and renderers to obtain chunk data
pub struct ChunkManager {
    shared: Arc<ManagerShared>,
    inbox: Receiver<BackendMessage>,
    backend: Option<WorkerBackend>,
}

impl ChunkManager {
    /// Start a manager with its own worker backend
    pub fn new(capacity: &CapacityConfig, workers: WorkerPoolConfig) -> EngineResult<Self> {
        let queue = ChunkQueueManager::new(capacity)?;
        Self::spawn(queue, capacity, workers)
    }

    /// Like `new`, calling `uploader` when chunks enter or leave GPU memory
    pub fn with_uploader(
        capacity: &CapacityConfig,
        workers: WorkerPoolConfig,
        uploader: Box<dyn GpuUploader>,
    ) -> EngineResult<Self> {
        let queue = ChunkQueueManager::new(capacity)?.with_uploader(uploader);
        Self::spawn(queue, capacity, workers)
    }

    /// Manager talking to an externally driven worker endpoint
    pub fn with_endpoint(capacity: &CapacityConfig, endpoint: FrontendEndpoint) -> EngineResult<Self> {
        let queue = ChunkQueueManager::new(capacity)?;
        Ok(Self::assemble(queue, endpoint, None))
    }

    fn spawn(queue: ChunkQueueManager, capacity: &CapacityConfig, workers: WorkerPoolConfig) -> EngineResult<Self> {
        let (frontend, backend_endpoint) = rpc::channel();
        let backend = WorkerBackend::spawn(backend_endpoint, capacity, workers)?;
        Ok(Self::assemble(queue, frontend, Some(backend)))
    }

    fn assemble(queue: ChunkQueueManager, endpoint: FrontendEndpoint, backend: Option<WorkerBackend>) -> Self {
        let inbox = endpoint.receiver();
        let state = ManagerState {
            queue,
            endpoint,
            connected: true,
            sources: HashMap::new(),
            next_source: 1,
            next_request: 1,
            waiters: HashMap::new(),
            requests: HashMap::new(),
            layers: HashMap::new(),
            signal: ResidencySignal::new(),
            capacity_errors: Vec::new(),
        };
        Self {
            shared: Arc::new(ManagerShared {
                state: Mutex::new(state),
            }),
            inbox,
            backend,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.shared.lock()
    }

    /// Shared source for `spec.key`, registering it on first use
    ///
    /// Later specs with a key already in use get the existing source; their
    /// fetcher and layout are ignored.
    pub fn get_chunk_source(&self, spec: SourceSpec) -> Result<ChunkSourceHandle, ChunkError> {
        let mut state = self.lock();
        if let Some(handle) = state.sources.get(&spec.key).and_then(|(_, weak)| weak.upgrade()) {
            return Ok(handle);
        }

        let id = SourceId(state.next_source);
        state.next_source += 1;
        state.send(FrontendMessage::RegisterSource {
            source: id,
            fetcher: spec.fetcher,
        })?;
        state.queue.register_source(id);

        let shared: Weak<ManagerShared> = Arc::downgrade(&self.shared);
        let owner: Weak<dyn SourceOwner> = shared;
        let handle = ChunkSourceHandle::new(id, spec.key.clone(), spec.layout, owner);
        log::info!("registered source {} as {}", spec.key, id);
        state.sources.insert(spec.key, (id, handle.downgrade()));
        Ok(handle)
    }

    /// Request one chunk on behalf of a single caller
    ///
    /// Fails immediately with `ChunkError::Cancelled` if `token` is already
    /// cancelled. Cancelling the token later withdraws only this caller's
    /// interest.
    pub fn request_chunk(
        &self,
        source: &ChunkSourceHandle,
        position: GridPosition,
        priority: ChunkPriority,
        token: &CancellationToken,
    ) -> Result<PendingChunk, ChunkError> {
        if token.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }
        if !source.layout().contains(&position) {
            return Err(FetchError::NotFound(format!("{} is outside {}", position, source.key())).into());
        }

        let mut state = self.lock();
        if !state.connected {
            return Err(ChunkError::Disconnected);
        }
        let request = RequestId(state.next_request);
        state.next_request += 1;
        let key = ChunkKey::new(source.id(), position);
        state.queue.add_interest(key, InterestId::Request(request), priority)?;

        let (reply, rx) = crossbeam_channel::bounded(1);
        state.waiters.entry(key).or_default().push(Waiter {
            request,
            token: token.clone(),
            reply,
        });
        state.requests.insert(request, key);
        state.settle(key);
        state.flush();

        Ok(PendingChunk {
            request,
            key,
            token: token.clone(),
            reply: rx,
            owner: Arc::downgrade(&self.shared),
            done: false,
        })
    }

    /// Withdraw a request; false if it already resolved
    pub fn cancel_request(&self, request: RequestId) -> bool {
        self.lock().cancel_request(request)
    }

    /// Block until `pending` resolves, pumping worker messages meanwhile
    pub fn resolve(&self, mut pending: PendingChunk, timeout: Duration) -> Result<ChunkPayload, ChunkError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reply) = pending.try_take() {
                return reply;
            }
            if pending.token.is_cancelled() {
                pending.done = true;
                self.cancel_request(pending.request);
                return Err(ChunkError::Cancelled);
            }
            let pumped = self.process();
            if let Some(reply) = pending.try_take() {
                return reply;
            }
            pumped?;

            let now = Instant::now();
            if now >= deadline {
                pending.done = true;
                self.cancel_request(pending.request);
                return Err(ChunkError::TimedOut);
            }
            if let Ok(message) = self.inbox.recv_timeout((deadline - now).min(RESOLVE_POLL)) {
                self.lock().apply(message);
            }
        }
    }

    /// Apply worker results, run eviction and forward new fetch actions
    ///
    /// Returns the number of worker messages applied.
    pub fn process(&self) -> Result<usize, ChunkError> {
        self.lock().pump()
    }

    /// Apply one layer's working-set change as layer interest
    ///
    /// Withdrawals go first so their chunks can be evicted in favour of the
    /// additions.
    pub fn apply_delta(&self, layer: LayerId, delta: &WorkingSetDelta) {
        let mut state = self.lock();
        let interest = InterestId::Layer(layer);
        for key in &delta.removed {
            state.queue.remove_interest(*key, interest);
        }
        for (key, priority) in &delta.added {
            if let Err(err) = state.queue.add_interest(*key, interest, *priority) {
                log::debug!("{} cannot request {}: {}", layer, key, err);
            }
        }
        for (key, priority) in &delta.reprioritized {
            if let Err(err) = state.queue.update_interest(*key, interest, *priority) {
                log::debug!("{} cannot reprioritize {}: {}", layer, key, err);
            }
        }
        state.flush();
    }

    /// Mirror a visible layer to the worker and keep its sources alive
    ///
    /// Adding a layer id again replaces its sources.
    pub fn add_visible_layer(
        &self,
        layer: LayerId,
        sources: &[ChunkSourceHandle],
        transform: &LayerTransform,
    ) -> Result<(), ChunkError> {
        let (previous, sent) = {
            let mut state = self.lock();
            let sent = state.send(FrontendMessage::AddVisibleLayer {
                layer,
                sources: sources.iter().map(ChunkSourceHandle::id).collect(),
                transform: *transform,
            });
            (state.layers.insert(layer, sources.to_vec()), sent)
        };
        // released outside the lock: the last handle disposes its source
        drop(previous);
        sent
    }

    /// Forget a visible layer, releasing its sources
    ///
    /// Chunk interest is withdrawn separately through `apply_delta`.
    pub fn remove_visible_layer(&self, layer: LayerId) -> Result<bool, ChunkError> {
        let (removed, sent) = {
            let mut state = self.lock();
            let removed = state.layers.remove(&layer);
            let sent = if removed.is_some() {
                state.send(FrontendMessage::RemoveVisibleLayer { layer })
            } else {
                Ok(())
            };
            (removed, sent)
        };
        let existed = removed.is_some();
        drop(removed);
        sent.map(|_| existed)
    }

    pub fn invalidate_source(&self, source: &ChunkSourceHandle) -> Option<Generation> {
        self.shared.invalidate_source(source.id())
    }

    /// Replace a budget's limits; memory tiers evict immediately
    pub fn set_limits(&self, kind: BudgetKind, limits: CapacityLimits) -> Result<(), ChunkError> {
        limits.validate(kind)?;
        let mut state = self.lock();
        match kind {
            BudgetKind::GpuMemory | BudgetKind::SystemMemory => state.queue.set_limits(kind, limits)?,
            BudgetKind::Downloads | BudgetKind::Compute => {
                state.send(FrontendMessage::SetLimits { kind, limits })?
            }
        }
        state.flush();
        Ok(())
    }

    pub fn chunk_state(&self, key: ChunkKey) -> Option<ChunkState> {
        self.lock().queue.chunk_state(key)
    }

    pub fn payload(&self, key: ChunkKey) -> Option<ChunkPayload> {
        self.lock().queue.payload(key)
    }

    pub fn chunk_error(&self, key: ChunkKey) -> Option<ChunkError> {
        self.lock().queue.chunk_error(key)
    }

    pub fn statistics(&self) -> AggregatedStatistics {
        self.lock().queue.statistics()
    }

    /// Download and compute queue counters, when the backend runs in-process
    pub fn worker_stats(&self) -> Option<WorkerQueueStats> {
        self.backend.as_ref().map(WorkerBackend::stats)
    }

    pub fn subscribe(&self) -> Receiver<ResidencyEvent> {
        self.lock().signal.subscribe()
    }

    /// Capacity configuration errors reported since the last call
    pub fn take_capacity_errors(&self) -> Vec<CapacityError> {
        std::mem::take(&mut self.lock().capacity_errors)
    }

    pub fn source_count(&self) -> usize {
        self.lock().sources.len()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Stop the worker backend and wait for it
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.lock().send(FrontendMessage::Shutdown);
        if let Some(backend) = self.backend.take() {
            backend.join();
        }
    }
}

impl Drop for ChunkManager {
    fn drop(&mut self) {
        self.stop();
    }
}
