//! Worker-side chunk queue manager
//!
//! Holds the download and compute budgets. Fetch requests wait in a priority
//! queue until a download slot is free; fetched bytes then wait in a second
//! queue for a compute slot to be decoded. Every in-flight chunk has a
//! cancellation token, and results from cancelled or superseded work are
//! never reported.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chunkstream_cache::{
    BudgetKind, BudgetSnapshot, CapacityBudget, CapacityConfig, CapacityError, CapacityLimits,
    ChunkKey, ChunkPriority, FetchError, Generation, SourceId,
};

use crate::cancel::{CancellationRegistry, CancellationToken};
use crate::priority::PriorityQueue;

/// Result of submitting a fetch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Newly queued
    Queued,
    /// Already queued; moved to the new priority
    Requeued,
    /// Already being fetched or decoded at this generation
    InFlight,
    /// Older than the source's current generation; ignored
    Stale,
}

/// Unit of work handed to a worker thread
#[derive(Debug)]
pub enum WorkerJob {
    Fetch {
        key: ChunkKey,
        generation: Generation,
        token: CancellationToken,
    },
    Decode {
        key: ChunkKey,
        generation: Generation,
        bytes: Vec<u8>,
        token: CancellationToken,
    },
}

impl WorkerJob {
    pub fn key(&self) -> ChunkKey {
        match self {
            WorkerJob::Fetch { key, .. } | WorkerJob::Decode { key, .. } => *key,
        }
    }
}

/// What happened to a finished fetch
#[derive(Debug, PartialEq)]
pub enum FetchCompletion {
    /// Bytes are waiting for a compute slot
    QueuedForDecode,
    /// The work was cancelled or superseded; nothing to report
    Cancelled,
    /// The fetcher gave up without being cancelled; report it so the owner
    /// can requeue or forget the chunk
    Abandoned {
        generation: Generation,
        latency: Duration,
    },
    /// The fetch failed; report the error
    Failed {
        generation: Generation,
        error: FetchError,
        latency: Duration,
    },
}

/// A finished decode whose result should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeCompletion {
    pub generation: Generation,
    /// Time from the start of the fetch to the end of the decode
    pub latency: Duration,
}

/// Queue and slot statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerQueueStats {
    pub queued_fetches: usize,
    pub queued_decodes: usize,
    pub in_flight: usize,
    pub downloads: BudgetSnapshot,
    pub compute: BudgetSnapshot,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Fetching,
    AwaitingDecode,
    Decoding,
}

#[derive(Debug)]
struct InFlight {
    generation: Generation,
    priority: ChunkPriority,
    started: Instant,
    stage: Stage,
}

struct QueueState {
    downloads: CapacityBudget,
    compute: CapacityBudget,
    fetch_queue: PriorityQueue<ChunkKey, ChunkPriority>,
    queued_generation: HashMap<ChunkKey, Generation>,
    decode_queue: PriorityQueue<ChunkKey, ChunkPriority>,
    decode_pending: HashMap<ChunkKey, Vec<u8>>,
    in_flight: HashMap<ChunkKey, InFlight>,
    source_generations: HashMap<SourceId, Generation>,
    completed: u64,
    cancelled: u64,
    failed: u64,
}

impl QueueState {
    fn current_generation(&self, source: SourceId) -> Generation {
        self.source_generations.get(&source).copied().unwrap_or(0)
    }

    /// Forget queued and in-flight work for `key`; true if anything was dropped
    fn drop_key(&mut self, key: &ChunkKey, tokens: &CancellationRegistry<ChunkKey>) -> bool {
        let queued = self.fetch_queue.remove(key).is_some();
        self.queued_generation.remove(key);
        let in_flight = self.in_flight.remove(key).is_some();
        if in_flight {
            tokens.cancel(key);
            self.decode_queue.remove(key);
            self.decode_pending.remove(key);
        }
        queued || in_flight
    }
}

/// Download and compute admission for the worker context
pub struct WorkerQueueManager {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    tokens: CancellationRegistry<ChunkKey>,
}

impl WorkerQueueManager {
    /// Create a manager using the download and compute limits of `config`
    pub fn new(config: &CapacityConfig) -> Result<Self, CapacityError> {
        config.concurrent_downloads.validate(BudgetKind::Downloads)?;
        config.concurrent_compute.validate(BudgetKind::Compute)?;
        Ok(Self {
            state: Mutex::new(QueueState {
                downloads: CapacityBudget::new(BudgetKind::Downloads, config.concurrent_downloads),
                compute: CapacityBudget::new(BudgetKind::Compute, config.concurrent_compute),
                fetch_queue: PriorityQueue::new(),
                queued_generation: HashMap::new(),
                decode_queue: PriorityQueue::new(),
                decode_pending: HashMap::new(),
                in_flight: HashMap::new(),
                source_generations: HashMap::new(),
                completed: 0,
                cancelled: 0,
                failed: 0,
            }),
            work_ready: Condvar::new(),
            tokens: CancellationRegistry::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a fetch, or move an already queued fetch to a new priority
    pub fn enqueue(&self, key: ChunkKey, priority: ChunkPriority, generation: Generation) -> EnqueueOutcome {
        let mut state = self.lock();
        if generation < state.current_generation(key.source) {
            return EnqueueOutcome::Stale;
        }

        if let Some(in_flight) = state.in_flight.get_mut(&key) {
            if in_flight.generation == generation {
                in_flight.priority = priority;
                if in_flight.stage == Stage::AwaitingDecode {
                    state.decode_queue.push(key, priority);
                }
                return EnqueueOutcome::InFlight;
            }
            log::debug!("{} superseded by generation {}", key, generation);
            state.drop_key(&key, &self.tokens);
        }

        let is_new = state.fetch_queue.push(key, priority);
        state.queued_generation.insert(key, generation);
        drop(state);
        self.work_ready.notify_one();
        if is_new {
            EnqueueOutcome::Queued
        } else {
            EnqueueOutcome::Requeued
        }
    }

    /// Withdraw a chunk; cancels its fetch or decode if one is running
    pub fn cancel(&self, key: &ChunkKey) -> bool {
        let mut state = self.lock();
        let dropped = state.drop_key(key, &self.tokens);
        if dropped {
            state.cancelled += 1;
            log::trace!("cancelled {}", key);
        }
        dropped
    }

    /// Withdraw every chunk of a source
    pub fn cancel_source(&self, source: SourceId) -> usize {
        let mut state = self.lock();
        let keys: Vec<ChunkKey> = state
            .queued_generation
            .keys()
            .chain(state.in_flight.keys())
            .filter(|key| key.source == source)
            .copied()
            .collect();
        let mut dropped = 0;
        for key in keys {
            if state.drop_key(&key, &self.tokens) {
                dropped += 1;
            }
        }
        state.source_generations.remove(&source);
        state.cancelled += dropped as u64;
        dropped
    }

    /// Withdraw everything, queued and in flight
    pub fn cancel_all(&self) -> usize {
        let mut state = self.lock();
        let keys: Vec<ChunkKey> = state
            .queued_generation
            .keys()
            .chain(state.in_flight.keys())
            .copied()
            .collect();
        let dropped = keys
            .iter()
            .filter(|key| state.drop_key(key, &self.tokens))
            .count();
        state.cancelled += dropped as u64;
        dropped
    }

    /// Record a source's new generation and drop all work from older ones
    pub fn invalidate_source(&self, source: SourceId, generation: Generation) -> usize {
        let mut state = self.lock();
        let current = state.current_generation(source);
        state.source_generations.insert(source, current.max(generation));

        let stale: Vec<ChunkKey> = state
            .queued_generation
            .iter()
            .filter(|(key, queued)| key.source == source && **queued < generation)
            .map(|(key, _)| *key)
            .chain(
                state
                    .in_flight
                    .iter()
                    .filter(|(key, job)| key.source == source && job.generation < generation)
                    .map(|(key, _)| *key),
            )
            .collect();
        let mut dropped = 0;
        for key in stale {
            if state.drop_key(&key, &self.tokens) {
                dropped += 1;
            }
        }
        state.cancelled += dropped as u64;
        dropped
    }

    /// Take the next job a free slot allows
    ///
    /// Decodes go first: their bytes are already held in memory.
    pub fn next_job(&self) -> Option<WorkerJob> {
        let mut state = self.lock();

        if state.compute.fits(0) {
            if let Some((key, _)) = state.decode_queue.pop() {
                if let Some(bytes) = state.decode_pending.remove(&key) {
                    let generation = match state.in_flight.get_mut(&key) {
                        Some(job) => {
                            job.stage = Stage::Decoding;
                            job.generation
                        }
                        None => return None,
                    };
                    let token = self.tokens.get(&key).unwrap_or_default();
                    state.compute.try_admit(0);
                    return Some(WorkerJob::Decode {
                        key,
                        generation,
                        bytes,
                        token,
                    });
                }
            }
        }

        if state.downloads.fits(0) {
            if let Some((key, priority)) = state.fetch_queue.pop() {
                let generation = state.queued_generation.remove(&key).unwrap_or(0);
                state.downloads.try_admit(0);
                state.in_flight.insert(
                    key,
                    InFlight {
                        generation,
                        priority,
                        started: Instant::now(),
                        stage: Stage::Fetching,
                    },
                );
                let token = self.tokens.register(key);
                return Some(WorkerJob::Fetch {
                    key,
                    generation,
                    token,
                });
            }
        }

        None
    }

    /// Release the download slot of a finished fetch
    pub fn finish_fetch(
        &self,
        key: ChunkKey,
        token: &CancellationToken,
        result: Result<Vec<u8>, FetchError>,
    ) -> FetchCompletion {
        let mut state = self.lock();
        state.downloads.release(0);

        if token.is_cancelled() {
            drop(state);
            self.work_ready.notify_one();
            return FetchCompletion::Cancelled;
        }
        if matches!(result, Err(FetchError::Cancelled)) {
            let completion = match state.in_flight.remove(&key) {
                Some(job) => {
                    self.tokens.unregister(&key, token);
                    state.cancelled += 1;
                    FetchCompletion::Abandoned {
                        generation: job.generation,
                        latency: job.started.elapsed(),
                    }
                }
                None => FetchCompletion::Cancelled,
            };
            drop(state);
            self.work_ready.notify_one();
            return completion;
        }

        let completion = match result {
            Ok(bytes) => match state.in_flight.get_mut(&key) {
                Some(job) => {
                    job.stage = Stage::AwaitingDecode;
                    let priority = job.priority;
                    state.decode_pending.insert(key, bytes);
                    state.decode_queue.push(key, priority);
                    FetchCompletion::QueuedForDecode
                }
                None => FetchCompletion::Cancelled,
            },
            Err(error) => match state.in_flight.remove(&key) {
                Some(job) => {
                    self.tokens.unregister(&key, token);
                    state.failed += 1;
                    FetchCompletion::Failed {
                        generation: job.generation,
                        error,
                        latency: job.started.elapsed(),
                    }
                }
                None => FetchCompletion::Cancelled,
            },
        };
        drop(state);
        self.work_ready.notify_all();
        completion
    }

    /// Release the compute slot of a finished decode
    ///
    /// Returns `None` if the result must be dropped.
    pub fn finish_decode(
        &self,
        key: ChunkKey,
        token: &CancellationToken,
        succeeded: bool,
    ) -> Option<DecodeCompletion> {
        let mut state = self.lock();
        state.compute.release(0);
        let completion = if token.is_cancelled() {
            None
        } else {
            state.in_flight.remove(&key).map(|job| {
                self.tokens.unregister(&key, token);
                if succeeded {
                    state.completed += 1;
                } else {
                    state.failed += 1;
                }
                DecodeCompletion {
                    generation: job.generation,
                    latency: job.started.elapsed(),
                }
            })
        };
        drop(state);
        self.work_ready.notify_one();
        completion
    }

    /// Block until work may be available or `timeout` elapses
    pub fn wait_for_work(&self, timeout: Duration) {
        let state = self.lock();
        let has_work = (state.compute.fits(0) && !state.decode_queue.is_empty())
            || (state.downloads.fits(0) && !state.fetch_queue.is_empty());
        if has_work {
            return;
        }
        let _ = self
            .work_ready
            .wait_timeout(state, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Wake every waiting worker, e.g. for shutdown
    pub fn wake_all(&self) {
        self.work_ready.notify_all();
    }

    /// Change the download or compute limits; running jobs finish normally
    pub fn set_limits(&self, kind: BudgetKind, limits: CapacityLimits) -> Result<(), CapacityError> {
        limits.validate(kind)?;
        let mut state = self.lock();
        match kind {
            BudgetKind::Downloads => state.downloads.set_limits(limits),
            BudgetKind::Compute => state.compute.set_limits(limits),
            BudgetKind::GpuMemory | BudgetKind::SystemMemory => return Ok(()),
        }
        drop(state);
        self.work_ready.notify_all();
        Ok(())
    }

    pub fn is_queued(&self, key: &ChunkKey) -> bool {
        self.lock().fetch_queue.contains(key)
    }

    pub fn is_in_flight(&self, key: &ChunkKey) -> bool {
        self.lock().in_flight.contains_key(key)
    }

    pub fn stats(&self) -> WorkerQueueStats {
        let state = self.lock();
        WorkerQueueStats {
            queued_fetches: state.fetch_queue.len(),
            queued_decodes: state.decode_queue.len(),
            in_flight: state.in_flight.len(),
            downloads: state.downloads.snapshot(),
            compute: state.compute.snapshot(),
            completed: state.completed,
            cancelled: state.cancelled,
            failed: state.failed,
        }
    }
}
