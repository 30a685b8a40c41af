//! Fetch and decode worker pool
//!
//! Worker threads pull jobs from a shared [`WorkerQueueManager`], run them
//! through a [`ChunkJobHandler`] and hand the slots back. A fetch that
//! succeeds is queued again for decoding; only decoded payloads and real
//! failures are reported to the handler. Results of cancelled work are
//! dropped silently.

use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chunkstream_cache::{ChunkError, ChunkKey, ChunkPayload, DecodeError, FetchError, Generation};

use crate::cancel::CancellationToken;
use crate::worker_queue::{FetchCompletion, WorkerJob, WorkerQueueManager};

/// Work performed by the pool's threads
///
/// `fetch` should check the token between steps and return
/// `FetchError::Cancelled` early once it is set.
pub trait ChunkJobHandler: Send + Sync + 'static {
    /// A fetch is about to start
    fn fetch_started(&self, _key: ChunkKey, _generation: Generation) {}

    fn fetch(&self, key: &ChunkKey, token: &CancellationToken) -> Result<Vec<u8>, FetchError>;

    fn decode(&self, key: &ChunkKey, bytes: Vec<u8>) -> Result<ChunkPayload, DecodeError>;

    /// A chunk finished, successfully or not
    fn completed(
        &self,
        key: ChunkKey,
        generation: Generation,
        result: Result<ChunkPayload, ChunkError>,
        latency: Duration,
    );
}

/// What a worker did on one turn of its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStep {
    Worked,
    Idle,
}

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads to spawn.
    /// Default: number of logical CPU cores.
    pub num_workers: usize,

    /// Maximum time an idle worker waits before checking for shutdown.
    /// Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Run at most one job from `queue`
///
/// Exposed so a single-threaded owner can drive the pipeline without a pool.
pub fn run_once(queue: &WorkerQueueManager, handler: &dyn ChunkJobHandler) -> WorkerStep {
    let Some(job) = queue.next_job() else {
        return WorkerStep::Idle;
    };

    match job {
        WorkerJob::Fetch {
            key,
            generation,
            token,
        } => {
            handler.fetch_started(key, generation);
            let result = if token.is_cancelled() {
                Err(FetchError::Cancelled)
            } else {
                handler.fetch(&key, &token)
            };
            match queue.finish_fetch(key, &token, result) {
                FetchCompletion::QueuedForDecode => {}
                FetchCompletion::Cancelled => log::trace!("fetch of {} cancelled", key),
                FetchCompletion::Abandoned { generation, latency } => {
                    log::trace!("fetch of {} gave up", key);
                    handler.completed(key, generation, Err(ChunkError::Cancelled), latency);
                }
                FetchCompletion::Failed {
                    generation,
                    error,
                    latency,
                } => {
                    log::debug!("fetch of {} failed: {}", key, error);
                    handler.completed(key, generation, Err(error.into()), latency);
                }
            }
        }
        WorkerJob::Decode {
            key, bytes, token, ..
        } => {
            let result = handler.decode(&key, bytes);
            if let Some(done) = queue.finish_decode(key, &token, result.is_ok()) {
                handler.completed(key, done.generation, result.map_err(ChunkError::from), done.latency);
            }
        }
    }
    WorkerStep::Worked
}

/// Pool of fetch/decode worker threads
///
/// # Example
///
/// ```
/// use chunkstream_cache::{
///     CapacityConfig, ChunkError, ChunkKey, ChunkPayload, ChunkPriority, DataType, DecodeError,
///     FetchError, Generation, GridPosition, SourceId,
/// };
/// use chunkstream_scheduler::{
///     CancellationToken, ChunkJobHandler, WorkerPool, WorkerPoolConfig, WorkerQueueManager,
/// };
/// use std::sync::{mpsc, Arc, Mutex};
/// use std::time::Duration;
///
/// struct Zeros(Mutex<mpsc::Sender<ChunkKey>>);
///
/// impl ChunkJobHandler for Zeros {
///     fn fetch(&self, _key: &ChunkKey, _token: &CancellationToken) -> Result<Vec<u8>, FetchError> {
///         Ok(vec![0; 8])
///     }
///     fn decode(&self, _key: &ChunkKey, bytes: Vec<u8>) -> Result<ChunkPayload, DecodeError> {
///         ChunkPayload::new([2, 2, 2], DataType::Uint8, bytes)
///     }
///     fn completed(&self, key: ChunkKey, _: Generation, _: Result<ChunkPayload, ChunkError>, _: Duration) {
///         self.0.lock().unwrap().send(key).unwrap();
///     }
/// }
///
/// let queue = Arc::new(WorkerQueueManager::new(&CapacityConfig::default()).unwrap());
/// let (tx, rx) = mpsc::channel();
/// let pool = WorkerPool::new(
///     queue.clone(),
///     Arc::new(Zeros(Mutex::new(tx))),
///     WorkerPoolConfig::new(2).with_poll_interval(Duration::from_millis(5)),
/// )
/// .unwrap();
///
/// let key = ChunkKey::new(SourceId(1), GridPosition::new(0, 0, 0));
/// queue.enqueue(key, ChunkPriority::visible(0.0), 0);
/// assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), key);
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    workers: Vec<Worker>,
    queue: Arc<WorkerQueueManager>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `config.num_workers` threads serving `queue`; zero workers is an error
    pub fn new(
        queue: Arc<WorkerQueueManager>,
        handler: Arc<dyn ChunkJobHandler>,
        config: WorkerPoolConfig,
    ) -> io::Result<Self> {
        if config.num_workers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one worker",
            ));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(config.num_workers);

        for id in 0..config.num_workers {
            let spawned = Worker::spawn(
                id,
                queue.clone(),
                handler.clone(),
                shutdown.clone(),
                config.poll_interval,
            );
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    shutdown.store(true, Ordering::Release);
                    queue.wake_all();
                    for worker in workers {
                        worker.join();
                    }
                    return Err(err);
                }
            }
        }

        log::debug!("started {} chunk workers", workers.len());
        Ok(Self {
            workers,
            queue,
            shutdown,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop all workers and wait for their current jobs to finish
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue.wake_all();
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        id: usize,
        queue: Arc<WorkerQueueManager>,
        handler: Arc<dyn ChunkJobHandler>,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("chunkstream-worker-{}", id))
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    if run_once(&queue, handler.as_ref()) == WorkerStep::Idle {
                        queue.wait_for_work(poll_interval);
                    }
                }
                log::trace!("chunk worker {} exiting", id);
            })?;

        Ok(Self {
            thread: Some(thread),
        })
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("chunk worker panicked");
            }
        }
    }
}

/// Number of logical CPU cores, falling back to 4
pub fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
