//! Worker side of the bridge
//!
//! A dispatcher thread applies frontend messages to the worker queue in the
//! order they were sent. A pool of worker threads runs the queued fetch and
//! decode jobs against the registered sources and reports every outcome back
//! over the channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chunkstream_cache::{
    CapacityConfig, ChunkError, ChunkKey, ChunkPayload, DecodeError, FetchError, Generation, LayerId,
    SourceId,
};
use chunkstream_scheduler::{
    CancellationToken, ChunkJobHandler, EnqueueOutcome, WorkerPool, WorkerPoolConfig,
    WorkerQueueManager, WorkerQueueStats,
};
use crossbeam_channel::Sender;

use crate::data_source::ChunkFetcher;
use crate::error::EngineResult;
use crate::rpc::{BackendEndpoint, BackendMessage, FrontendMessage};

type FetcherMap = Arc<RwLock<HashMap<SourceId, Arc<dyn ChunkFetcher>>>>;

/// Runs registered sources on behalf of the privileged context
struct SourceJobHandler {
    fetchers: FetcherMap,
    outbox: Sender<BackendMessage>,
}

impl SourceJobHandler {
    fn fetcher(&self, source: SourceId) -> Option<Arc<dyn ChunkFetcher>> {
        self.fetchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&source)
            .cloned()
    }
}

impl ChunkJobHandler for SourceJobHandler {
    fn fetch_started(&self, key: ChunkKey, generation: Generation) {
        let _ = self.outbox.send(BackendMessage::DownloadStarted { key, generation });
    }

    fn fetch(&self, key: &ChunkKey, token: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        let fetcher = self
            .fetcher(key.source)
            .ok_or_else(|| FetchError::NotFound(format!("{} is not registered", key.source)))?;
        let range = fetcher.byte_range(&key.position);
        fetcher.fetch(&key.position, range, token)
    }

    fn decode(&self, key: &ChunkKey, bytes: Vec<u8>) -> Result<ChunkPayload, DecodeError> {
        let fetcher = self
            .fetcher(key.source)
            .ok_or_else(|| DecodeError::InvalidData(format!("{} is not registered", key.source)))?;
        fetcher.decode(&key.position, bytes)
    }

    fn completed(
        &self,
        key: ChunkKey,
        generation: Generation,
        result: Result<ChunkPayload, ChunkError>,
        latency: Duration,
    ) {
        let _ = self.outbox.send(BackendMessage::ChunkReady {
            key,
            generation,
            result,
            latency,
        });
    }
}

/// Handle to a running worker backend
pub struct WorkerBackend {
    queue: Arc<WorkerQueueManager>,
    dispatcher: Option<JoinHandle<()>>,
}

impl WorkerBackend {
    /// Start the dispatcher and `pool.num_workers` worker threads
    ///
    /// The backend stops when it receives `FrontendMessage::Shutdown` or when
    /// the frontend endpoint is dropped.
    pub fn spawn(
        endpoint: BackendEndpoint,
        capacity: &CapacityConfig,
        pool: WorkerPoolConfig,
    ) -> EngineResult<Self> {
        let queue = Arc::new(WorkerQueueManager::new(capacity)?);
        let fetchers: FetcherMap = Arc::new(RwLock::new(HashMap::new()));
        let handler = Arc::new(SourceJobHandler {
            fetchers: fetchers.clone(),
            outbox: endpoint.sender(),
        });
        let workers = WorkerPool::new(queue.clone(), handler, pool)?;

        let dispatcher = Dispatcher {
            endpoint,
            queue: queue.clone(),
            fetchers,
            visible_layers: BTreeMap::new(),
        };
        let dispatcher = thread::Builder::new()
            .name("chunkstream-dispatch".to_string())
            .spawn(move || dispatcher.run(workers))?;

        Ok(Self {
            queue,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn stats(&self) -> WorkerQueueStats {
        self.queue.stats()
    }

    /// Wait for the dispatcher to exit; send `Shutdown` first
    pub fn join(mut self) {
        self.join_dispatcher();
    }

    fn join_dispatcher(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                log::error!("worker dispatcher panicked");
            }
        }
    }
}

impl Drop for WorkerBackend {
    fn drop(&mut self) {
        self.join_dispatcher();
    }
}

struct Dispatcher {
    endpoint: BackendEndpoint,
    queue: Arc<WorkerQueueManager>,
    fetchers: FetcherMap,
    visible_layers: BTreeMap<LayerId, Vec<SourceId>>,
}

impl Dispatcher {
    fn run(mut self, workers: WorkerPool) {
        while let Ok(message) = self.endpoint.recv() {
            log::trace!("backend received {:?}", message);
            if !self.apply(message) {
                break;
            }
        }
        self.queue.cancel_all();
        workers.shutdown();
        log::debug!("worker backend stopped");
    }

    /// Apply one message; false stops the backend
    fn apply(&mut self, message: FrontendMessage) -> bool {
        match message {
            FrontendMessage::RegisterSource { source, fetcher } => {
                self.fetchers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(source, fetcher);
            }
            FrontendMessage::DisposeSource { source } => {
                let cancelled = self.queue.cancel_source(source);
                self.fetchers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&source);
                log::debug!("disposed {} on worker, {} jobs cancelled", source, cancelled);
            }
            FrontendMessage::InvalidateSource { source, generation } => {
                self.queue.invalidate_source(source, generation);
            }
            FrontendMessage::AddVisibleLayer { layer, sources, .. } => {
                self.visible_layers.insert(layer, sources);
                let _ = self.endpoint.send(BackendMessage::LayerAdded { layer });
            }
            FrontendMessage::RemoveVisibleLayer { layer } => {
                self.visible_layers.remove(&layer);
                let _ = self.endpoint.send(BackendMessage::LayerRemoved { layer });
            }
            FrontendMessage::RequestChunk {
                key,
                priority,
                generation,
            } => {
                if self.queue.enqueue(key, priority, generation) == EnqueueOutcome::Stale {
                    log::debug!("ignoring request for {} at stale generation {}", key, generation);
                }
            }
            FrontendMessage::CancelChunk { key } => {
                self.queue.cancel(&key);
            }
            FrontendMessage::SetLimits { kind, limits } => {
                if let Err(err) = self.queue.set_limits(kind, limits) {
                    log::error!("rejected worker limits: {}", err);
                }
            }
            FrontendMessage::Shutdown => return false,
        }
        true
    }
}
