//! Privileged-side chunk queue manager
//!
//! Owns the GPU and system memory budgets and the privileged half of the
//! chunk table. Consumers register interest in chunks; the manager turns
//! interest changes into fetch requests and cancellations for the worker
//! context (collected as [`FetchAction`]s), admits arriving payloads into
//! system memory, promotes visible chunks to the GPU and evicts chunks that
//! are no longer needed when a tier is full.
//!
//! Eviction policy: only chunks outside every working set are evicted to make
//! room. Among those, the chunk that left the working sets earliest goes
//! first, and on a tie the larger chunk goes first. GPU admission may also
//! demote prefetch-tier chunks back to system memory. Needed chunks are only
//! ever evicted when limits are lowered below current usage.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::capacity::{BudgetKind, CapacityBudget, CapacityLimits};
use crate::chunk::{ChunkKey, ChunkPriority, ChunkState, Generation, SourceId};
use crate::config::CapacityConfig;
use crate::error::{CapacityError, ChunkError};
use crate::gpu::{GpuUploader, NoopUploader};
use crate::payload::ChunkPayload;
use crate::source::{Chunk, ChunkSource, InterestId};
use crate::stats::{AggregatedStatistics, ChunkStatistics, SourceCounters, SourceStatistics};

/// Evicted or failed records kept for inspection before being forgotten
const MAX_TOMBSTONES: usize = 4096;

/// Instruction for the worker context produced by interest changes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FetchAction {
    /// Fetch (or re-prioritize an already queued fetch of) a chunk
    Request {
        key: ChunkKey,
        priority: ChunkPriority,
        generation: Generation,
    },
    /// Nobody needs the chunk any more
    Cancel { key: ChunkKey },
}

/// Residency change of one chunk, broadcast to renderers and the visibility engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidencyEvent {
    pub key: ChunkKey,
    pub state: ChunkState,
    pub generation: Generation,
}

/// Manager of the GPU and system memory tiers
pub struct ChunkQueueManager {
    gpu: CapacityBudget,
    system: CapacityBudget,
    sources: BTreeMap<SourceId, ChunkSource>,
    counters: HashMap<SourceId, SourceCounters>,
    uploader: Box<dyn GpuUploader>,
    tick: u64,
    actions: Vec<FetchAction>,
    events: Vec<ResidencyEvent>,
    capacity_errors: Vec<CapacityError>,
    reported_budgets: HashSet<BudgetKind>,
    tombstones: VecDeque<ChunkKey>,
}

impl ChunkQueueManager {
    /// Create a manager using the GPU and system memory limits of `config`
    pub fn new(config: &CapacityConfig) -> Result<Self, CapacityError> {
        config.gpu_memory.validate(BudgetKind::GpuMemory)?;
        config.system_memory.validate(BudgetKind::SystemMemory)?;
        Ok(Self {
            gpu: CapacityBudget::new(BudgetKind::GpuMemory, config.gpu_memory),
            system: CapacityBudget::new(BudgetKind::SystemMemory, config.system_memory),
            sources: BTreeMap::new(),
            counters: HashMap::new(),
            uploader: Box::new(NoopUploader),
            tick: 0,
            actions: Vec::new(),
            events: Vec::new(),
            capacity_errors: Vec::new(),
            reported_budgets: HashSet::new(),
            tombstones: VecDeque::new(),
        })
    }

    /// Attach the renderer's GPU upload hook
    pub fn with_uploader(mut self, uploader: Box<dyn GpuUploader>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn budget(&self, kind: BudgetKind) -> Option<&CapacityBudget> {
        match kind {
            BudgetKind::GpuMemory => Some(&self.gpu),
            BudgetKind::SystemMemory => Some(&self.system),
            BudgetKind::Downloads | BudgetKind::Compute => None,
        }
    }

    /// Register a source; returns its current generation
    pub fn register_source(&mut self, id: SourceId) -> Generation {
        self.counters.entry(id).or_default();
        self.sources
            .entry(id)
            .or_insert_with(|| ChunkSource::new(id))
            .generation()
    }

    pub fn source(&self, id: SourceId) -> Option<&ChunkSource> {
        self.sources.get(&id)
    }

    /// Drop a source and every chunk it owns, cancelling outstanding fetches
    pub fn dispose_source(&mut self, id: SourceId) {
        let Some(mut source) = self.sources.remove(&id) else {
            return;
        };
        self.counters.remove(&id);
        for (_, mut chunk) in source.chunks.drain() {
            if is_in_flight(&chunk) {
                self.actions.push(FetchAction::Cancel { key: chunk.key });
            }
            if chunk.state.is_resident() {
                release_residency(&mut self.gpu, &mut self.system, self.uploader.as_mut(), &mut chunk);
                self.events.push(ResidencyEvent {
                    key: chunk.key,
                    state: ChunkState::Evicted,
                    generation: chunk.generation,
                });
            }
        }
        self.tombstones.retain(|key| key.source != id);
        log::info!("disposed {}", id);
    }

    /// Add (or update) one consumer's interest in a chunk
    ///
    /// Creates the chunk on first interest and emits a fetch request. Failed
    /// and evicted chunks are re-requested, except chunks that failed on a
    /// capacity error, which are never retried.
    pub fn add_interest(
        &mut self,
        key: ChunkKey,
        interest: InterestId,
        priority: ChunkPriority,
    ) -> Result<(), ChunkError> {
        self.tick += 1;
        let tick = self.tick;
        let source = self
            .sources
            .get_mut(&key.source)
            .ok_or(ChunkError::SourceDisposed)?;
        let generation = source.generation();

        let mut created = false;
        let chunk = source.chunks.entry(key.position).or_insert_with(|| {
            created = true;
            Chunk::new(key, generation, tick)
        });
        let old_priority = chunk.priority();
        chunk.interests.insert(interest, priority);
        chunk.last_needed = tick;
        let new_priority = chunk.priority();

        match chunk.state {
            ChunkState::Queued | ChunkState::Downloading if chunk.deferred => {}
            ChunkState::Queued | ChunkState::Downloading => {
                if created || new_priority != old_priority {
                    self.actions.push(FetchAction::Request {
                        key,
                        priority: new_priority,
                        generation,
                    });
                }
            }
            ChunkState::Failed if matches!(chunk.error, Some(ChunkError::Capacity(_))) => {}
            ChunkState::Failed | ChunkState::Evicted => {
                chunk.state = ChunkState::Queued;
                chunk.error = None;
                chunk.generation = generation;
                self.actions.push(FetchAction::Request {
                    key,
                    priority: new_priority,
                    generation,
                });
                self.events.push(ResidencyEvent {
                    key,
                    state: ChunkState::Queued,
                    generation,
                });
            }
            ChunkState::SystemMemory | ChunkState::GpuMemory => {}
        }

        if created {
            self.events.push(ResidencyEvent {
                key,
                state: ChunkState::Queued,
                generation,
            });
        }
        Ok(())
    }

    /// Change the priority of an existing interest; returns false if there is none
    pub fn update_interest(
        &mut self,
        key: ChunkKey,
        interest: InterestId,
        priority: ChunkPriority,
    ) -> Result<bool, ChunkError> {
        let exists = self
            .chunk(key)
            .map_or(false, |chunk| chunk.interests.contains_key(&interest));
        if exists {
            self.add_interest(key, interest, priority)?;
        }
        Ok(exists)
    }

    /// Withdraw one consumer's interest
    ///
    /// The fetch is cancelled once no interest remains. Resident chunks stay
    /// resident but become eviction candidates.
    pub fn remove_interest(&mut self, key: ChunkKey, interest: InterestId) {
        self.tick += 1;
        let tick = self.tick;
        let Some(source) = self.sources.get_mut(&key.source) else {
            return;
        };
        let Some(chunk) = source.chunks.get_mut(&key.position) else {
            return;
        };
        let old_priority = chunk.priority();
        if chunk.interests.remove(&interest).is_none() {
            return;
        }
        chunk.last_needed = tick;

        if chunk.is_needed() {
            let new_priority = chunk.priority();
            if is_in_flight(chunk) && new_priority != old_priority {
                self.actions.push(FetchAction::Request {
                    key,
                    priority: new_priority,
                    generation: chunk.generation,
                });
            }
            return;
        }

        match chunk.state {
            ChunkState::Queued | ChunkState::Downloading => {
                if !chunk.deferred {
                    self.actions.push(FetchAction::Cancel { key });
                }
                source.chunks.remove(&key.position);
                log::trace!("dropped unneeded request for {}", key);
            }
            ChunkState::Failed | ChunkState::Evicted => self.tombstones.push_back(key),
            ChunkState::SystemMemory | ChunkState::GpuMemory => {}
        }
    }

    /// Worker started fetching a chunk
    pub fn on_download_started(&mut self, key: ChunkKey, generation: Generation) {
        let Some(chunk) = self.chunk_mut(key) else {
            return;
        };
        if chunk.generation != generation || chunk.state != ChunkState::Queued || chunk.deferred {
            return;
        }
        chunk.state = ChunkState::Downloading;
        self.events.push(ResidencyEvent {
            key,
            state: ChunkState::Downloading,
            generation,
        });
    }

    /// Apply a fetch result from the worker
    ///
    /// Returns false if the result was stale (unknown chunk, older generation,
    /// or a chunk that is no longer waiting for data) and was dropped.
    pub fn on_chunk_ready(
        &mut self,
        key: ChunkKey,
        generation: Generation,
        result: Result<ChunkPayload, ChunkError>,
        latency: Duration,
    ) -> bool {
        let awaiting = self.chunk(key).map_or(false, |chunk| {
            chunk.generation == generation && is_in_flight(chunk)
        });
        if !awaiting {
            log::debug!("dropping stale result for {} (generation {})", key, generation);
            return false;
        }

        let payload = match result {
            Ok(payload) => payload,
            Err(err) if err.is_cancellation() => {
                self.requeue_or_forget(key);
                return false;
            }
            Err(err) => {
                log::warn!("chunk {} failed: {}", key, err);
                self.fail_chunk(key, err);
                return true;
            }
        };

        self.counters.entry(key.source).or_default().record_download(latency);
        let size = payload.size_bytes();
        if let Err(err) = self.system.check_item(size) {
            self.report_capacity_error(err.clone());
            self.fail_chunk(key, ChunkError::Capacity(err));
            return true;
        }

        if !self.make_room(BudgetKind::SystemMemory, size, Some(key)) {
            log::debug!("no system memory for {} ({} bytes), deferring", key, size);
            if let Some(chunk) = self.chunk_mut(key) {
                chunk.size_bytes = size;
                chunk.state = ChunkState::Queued;
                chunk.deferred = true;
            }
            self.push_event(key, ChunkState::Queued);
            return true;
        }

        let admitted = self.system.try_admit(size);
        debug_assert!(admitted, "system memory refused {} after making room", key);
        let wants_gpu = match self.chunk_mut(key) {
            Some(chunk) => {
                chunk.size_bytes = size;
                chunk.payload = Some(payload);
                chunk.state = ChunkState::SystemMemory;
                chunk.priority().wants_gpu()
            }
            None => false,
        };
        self.push_event(key, ChunkState::SystemMemory);
        if wants_gpu {
            self.try_promote(key);
        }
        true
    }

    /// Periodic maintenance
    ///
    /// Enforces limits, promotes visible chunks waiting in system memory to
    /// the GPU, re-requests deferred chunks once there is room for them and
    /// forgets old evicted records.
    pub fn process(&mut self) {
        self.enforce_limits(BudgetKind::GpuMemory);
        self.enforce_limits(BudgetKind::SystemMemory);

        let mut waiting: Vec<(ChunkPriority, ChunkKey)> = self
            .all_chunks()
            .filter(|c| c.state == ChunkState::SystemMemory && c.priority().wants_gpu())
            .map(|c| (c.priority(), c.key))
            .collect();
        waiting.sort();
        for (_, key) in waiting {
            self.try_promote(key);
        }

        let mut deferred: Vec<(ChunkPriority, ChunkKey, usize)> = self
            .all_chunks()
            .filter(|c| c.deferred && c.is_needed())
            .map(|c| (c.priority(), c.key, c.size_bytes))
            .collect();
        deferred.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let (mut reserved_items, mut reserved_bytes) = (0usize, 0usize);
        for (priority, key, size) in deferred {
            if !self.could_admit(BudgetKind::SystemMemory, reserved_items + 1, reserved_bytes + size) {
                break;
            }
            reserved_items += 1;
            reserved_bytes += size;
            if let Some(chunk) = self.chunk_mut(key) {
                chunk.deferred = false;
                let generation = chunk.generation;
                self.actions.push(FetchAction::Request {
                    key,
                    priority,
                    generation,
                });
            }
        }

        self.prune_tombstones();
    }

    /// Replace the limits of the GPU or system memory budget, evicting as needed
    pub fn set_limits(&mut self, kind: BudgetKind, limits: CapacityLimits) -> Result<(), CapacityError> {
        limits.validate(kind)?;
        let budget = match kind {
            BudgetKind::GpuMemory => &mut self.gpu,
            BudgetKind::SystemMemory => &mut self.system,
            BudgetKind::Downloads | BudgetKind::Compute => return Ok(()),
        };
        budget.set_limits(limits);
        self.reported_budgets.remove(&kind);
        self.enforce_limits(kind);
        Ok(())
    }

    /// Bump a source's generation, evicting all of its chunks
    ///
    /// Chunks that are still needed are re-requested at the new generation.
    /// Returns the new generation, or `None` for an unknown source.
    pub fn invalidate_source(&mut self, id: SourceId) -> Option<Generation> {
        let source = self.sources.get_mut(&id)?;
        let generation = source.bump_generation();
        let mut evictions = 0;

        source.chunks.retain(|_, chunk| {
            if is_in_flight(chunk) {
                self.actions.push(FetchAction::Cancel { key: chunk.key });
            }
            if chunk.state.is_resident() {
                release_residency(&mut self.gpu, &mut self.system, self.uploader.as_mut(), chunk);
                evictions += 1;
            }
            if chunk.state != ChunkState::Queued || chunk.deferred {
                self.events.push(ResidencyEvent {
                    key: chunk.key,
                    state: ChunkState::Evicted,
                    generation: chunk.generation,
                });
            }
            if !chunk.is_needed() {
                return false;
            }
            chunk.state = ChunkState::Queued;
            chunk.generation = generation;
            chunk.deferred = false;
            chunk.error = None;
            chunk.payload = None;
            self.actions.push(FetchAction::Request {
                key: chunk.key,
                priority: chunk.priority(),
                generation,
            });
            self.events.push(ResidencyEvent {
                key: chunk.key,
                state: ChunkState::Queued,
                generation,
            });
            true
        });

        self.counters.entry(id).or_default().evictions += evictions;
        self.tombstones.retain(|key| key.source != id);
        log::info!("invalidated {}, now at generation {}", id, generation);
        Some(generation)
    }

    pub fn chunk(&self, key: ChunkKey) -> Option<&Chunk> {
        self.sources.get(&key.source)?.chunks.get(&key.position)
    }

    pub fn chunk_state(&self, key: ChunkKey) -> Option<ChunkState> {
        self.chunk(key).map(|c| c.state)
    }

    /// Shared handle to a resident chunk's payload
    pub fn payload(&self, key: ChunkKey) -> Option<ChunkPayload> {
        self.chunk(key)?.payload.clone()
    }

    pub fn chunk_error(&self, key: ChunkKey) -> Option<ChunkError> {
        self.chunk(key)?.error.clone()
    }

    /// Fetch instructions produced since the last call
    pub fn drain_actions(&mut self) -> Vec<FetchAction> {
        std::mem::take(&mut self.actions)
    }

    /// Residency changes produced since the last call
    pub fn drain_events(&mut self) -> Vec<ResidencyEvent> {
        std::mem::take(&mut self.events)
    }

    /// Capacity configuration errors, each budget reported at most once
    pub fn take_capacity_errors(&mut self) -> Vec<CapacityError> {
        std::mem::take(&mut self.capacity_errors)
    }

    pub fn source_statistics(&self, id: SourceId) -> Option<SourceStatistics> {
        let source = self.sources.get(&id)?;
        let counters = self.counters.get(&id).copied().unwrap_or_default();
        Some(SourceStatistics {
            source: id,
            generation: source.generation(),
            stats: ChunkStatistics::collect(source.chunks(), counters),
        })
    }

    pub fn statistics(&self) -> AggregatedStatistics {
        let sources: Vec<SourceStatistics> = self
            .sources
            .keys()
            .filter_map(|&id| self.source_statistics(id))
            .collect();
        let mut total = ChunkStatistics::default();
        for source in &sources {
            total.merge(&source.stats);
        }
        AggregatedStatistics {
            sources,
            total,
            gpu_memory: self.gpu.snapshot(),
            system_memory: self.system.snapshot(),
        }
    }

    fn chunk_mut(&mut self, key: ChunkKey) -> Option<&mut Chunk> {
        self.sources.get_mut(&key.source)?.chunks.get_mut(&key.position)
    }

    fn all_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.sources.values().flat_map(|s| s.chunks())
    }

    fn push_event(&mut self, key: ChunkKey, state: ChunkState) {
        let generation = self.chunk(key).map_or(0, |c| c.generation);
        self.events.push(ResidencyEvent {
            key,
            state,
            generation,
        });
    }

    fn fail_chunk(&mut self, key: ChunkKey, err: ChunkError) {
        let Some(chunk) = self.chunk_mut(key) else {
            return;
        };
        chunk.state = ChunkState::Failed;
        chunk.error = Some(err);
        chunk.deferred = false;
        let needed = chunk.is_needed();
        self.push_event(key, ChunkState::Failed);
        if !needed {
            self.tombstones.push_back(key);
        }
    }

    fn requeue_or_forget(&mut self, key: ChunkKey) {
        let Some(chunk) = self.chunk_mut(key) else {
            return;
        };
        if chunk.is_needed() {
            chunk.state = ChunkState::Queued;
            let action = FetchAction::Request {
                key,
                priority: chunk.priority(),
                generation: chunk.generation,
            };
            self.actions.push(action);
        } else if let Some(source) = self.sources.get_mut(&key.source) {
            source.chunks.remove(&key.position);
        }
    }

    fn report_capacity_error(&mut self, err: CapacityError) {
        let kind = match &err {
            CapacityError::ItemExceedsSizeLimit { budget, .. } => *budget,
            CapacityError::ZeroLimit { budget } => *budget,
        };
        if self.reported_budgets.insert(kind) {
            log::error!("capacity configuration error: {}", err);
            self.capacity_errors.push(err);
        }
    }

    fn budget_mut(&mut self, kind: BudgetKind) -> &mut CapacityBudget {
        match kind {
            BudgetKind::GpuMemory => &mut self.gpu,
            _ => &mut self.system,
        }
    }

    /// Pick the next eviction victim of a tier
    ///
    /// With `include_needed`, needed chunks are considered after unneeded
    /// ones, least urgent first.
    fn select_victim(
        &self,
        kind: BudgetKind,
        protect: Option<ChunkKey>,
        include_needed: bool,
    ) -> Option<ChunkKey> {
        self.all_chunks()
            .filter(|c| c.state.budget() == Some(kind) && Some(c.key) != protect)
            .filter(|c| include_needed || is_evictable(c, kind))
            .min_by(|a, b| {
                is_evictable(b, kind)
                    .cmp(&is_evictable(a, kind))
                    .then_with(|| b.priority().cmp(&a.priority()))
                    .then_with(|| a.last_needed.cmp(&b.last_needed))
                    .then_with(|| b.size_bytes.cmp(&a.size_bytes))
                    .then_with(|| a.key.cmp(&b.key))
            })
            .map(|c| c.key)
    }

    /// Evict eviction candidates until `size` more bytes fit; false if impossible
    fn make_room(&mut self, kind: BudgetKind, size: usize, protect: Option<ChunkKey>) -> bool {
        loop {
            if self.budget_mut(kind).fits(size) {
                return true;
            }
            match self.select_victim(kind, protect, false) {
                Some(victim) => self.evict(victim, kind),
                None => return false,
            }
        }
    }

    /// True if the tier could take `items`/`bytes` more after evicting every candidate
    fn could_admit(&self, kind: BudgetKind, items: usize, bytes: usize) -> bool {
        let budget = match kind {
            BudgetKind::GpuMemory => &self.gpu,
            _ => &self.system,
        };
        let (mut evictable_items, mut evictable_bytes) = (0usize, 0usize);
        for chunk in self.all_chunks() {
            if chunk.state.budget() == Some(kind) && is_evictable(chunk, kind) {
                evictable_items += 1;
                evictable_bytes += chunk.size_bytes;
            }
        }
        let limits = budget.limits();
        let items_after = budget.item_count().saturating_sub(evictable_items) + items;
        let bytes_after = budget.size_bytes().saturating_sub(evictable_bytes) + bytes;
        limits.item_limit.map_or(true, |l| items_after <= l)
            && limits.size_limit.map_or(true, |l| bytes_after <= l)
    }

    fn enforce_limits(&mut self, kind: BudgetKind) {
        while self.budget_mut(kind).is_over_capacity() {
            match self.select_victim(kind, None, true) {
                Some(victim) => self.evict(victim, kind),
                None => break,
            }
        }
    }

    /// Remove a chunk from a tier
    ///
    /// GPU chunks that are still needed are demoted to system memory when it
    /// has room. Needed chunks that lose their data are queued for a re-fetch.
    fn evict(&mut self, key: ChunkKey, kind: BudgetKind) {
        let Some(chunk) = self
            .sources
            .get_mut(&key.source)
            .and_then(|s| s.chunks.get_mut(&key.position))
        else {
            return;
        };
        let size = chunk.size_bytes;
        let needed = chunk.is_needed();

        if kind == BudgetKind::GpuMemory {
            self.gpu.release(size);
            if let Some(handle) = chunk.gpu_handle.take() {
                self.uploader.release(&key, handle);
            }
            chunk.state = ChunkState::SystemMemory;
            if needed {
                if self.make_room(BudgetKind::SystemMemory, size, Some(key)) {
                    let admitted = self.system.try_admit(size);
                    debug_assert!(admitted, "system memory refused demoted {}", key);
                    log::debug!("demoted {} to system memory", key);
                    self.push_event(key, ChunkState::SystemMemory);
                    return;
                }
            }
        } else {
            self.system.release(size);
        }

        let Some(chunk) = self.chunk_mut(key) else {
            return;
        };
        chunk.payload = None;
        chunk.state = ChunkState::Evicted;
        let generation = chunk.generation;
        self.counters.entry(key.source).or_default().evictions += 1;
        log::debug!("evicted {} from {} ({} bytes)", key, kind, size);
        self.events.push(ResidencyEvent {
            key,
            state: ChunkState::Evicted,
            generation,
        });

        if needed {
            if let Some(chunk) = self.chunk_mut(key) {
                chunk.state = ChunkState::Queued;
                chunk.deferred = true;
            }
            self.push_event(key, ChunkState::Queued);
        } else {
            self.tombstones.push_back(key);
        }
    }

    /// Move a visible chunk from system memory to the GPU if there is room
    fn try_promote(&mut self, key: ChunkKey) -> bool {
        let (size, wants_gpu) = match self.chunk(key) {
            Some(c) if c.state == ChunkState::SystemMemory => (c.size_bytes, c.priority().wants_gpu()),
            _ => return false,
        };
        if !wants_gpu {
            return false;
        }
        if let Err(err) = self.gpu.check_item(size) {
            self.report_capacity_error(err);
            return false;
        }
        if !self.make_room(BudgetKind::GpuMemory, size, Some(key)) {
            log::trace!("gpu memory full, {} waits in system memory", key);
            return false;
        }

        let Some(chunk) = self
            .sources
            .get_mut(&key.source)
            .and_then(|s| s.chunks.get_mut(&key.position))
        else {
            return false;
        };
        let Some(payload) = chunk.payload.as_ref() else {
            return false;
        };
        match self.uploader.upload(&key, payload) {
            Ok(handle) => chunk.gpu_handle = Some(handle),
            Err(err) => {
                log::warn!("{} stays in system memory: {}", key, err);
                return false;
            }
        }
        self.system.release(size);
        let admitted = self.gpu.try_admit(size);
        debug_assert!(admitted, "gpu memory refused {} after making room", key);
        chunk.state = ChunkState::GpuMemory;
        self.push_event(key, ChunkState::GpuMemory);
        true
    }

    fn prune_tombstones(&mut self) {
        while self.tombstones.len() > MAX_TOMBSTONES {
            let Some(key) = self.tombstones.pop_front() else {
                break;
            };
            let forget = self
                .chunk(key)
                .map_or(false, |c| c.state.is_terminal() && !c.is_needed());
            if forget {
                if let Some(source) = self.sources.get_mut(&key.source) {
                    source.chunks.remove(&key.position);
                }
            }
        }
    }
}

/// A fetch for this chunk is outstanding with the worker
fn is_in_flight(chunk: &Chunk) -> bool {
    matches!(chunk.state, ChunkState::Queued | ChunkState::Downloading) && !chunk.deferred
}

/// Candidates for making room: unneeded chunks, plus prefetch chunks on the GPU
fn is_evictable(chunk: &Chunk, kind: BudgetKind) -> bool {
    match kind {
        BudgetKind::GpuMemory => !chunk.priority().wants_gpu(),
        _ => !chunk.is_needed(),
    }
}

/// Release whatever budget a resident chunk is counted in and drop its data
fn release_residency(
    gpu: &mut CapacityBudget,
    system: &mut CapacityBudget,
    uploader: &mut dyn GpuUploader,
    chunk: &mut Chunk,
) {
    match chunk.state {
        ChunkState::GpuMemory => {
            gpu.release(chunk.size_bytes);
            if let Some(handle) = chunk.gpu_handle.take() {
                uploader.release(&chunk.key, handle);
            }
        }
        ChunkState::SystemMemory => system.release(chunk.size_bytes),
        _ => {}
    }
    chunk.payload = None;
    chunk.state = ChunkState::Evicted;
}
