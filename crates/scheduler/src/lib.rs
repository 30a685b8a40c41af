//! Chunkstream Scheduler Library
//!
//! Worker-side admission and execution for chunk fetches.
//!
//! Fetch requests are queued by priority and admitted against the download
//! budget; fetched bytes are then admitted against the compute budget for
//! decoding. Requests can be requeued at a new priority, cancelled one by
//! one or per source, and superseded by a newer source generation. A thread
//! pool drives the pipeline, and [`UpdateThrottle`] coalesces recomputation
//! requests on the privileged side.
//!
//! # Example
//!
//! ```
//! use chunkstream_cache::{CapacityConfig, ChunkKey, ChunkPriority, GridPosition, SourceId};
//! use chunkstream_scheduler::{EnqueueOutcome, WorkerJob, WorkerQueueManager};
//!
//! let config = CapacityConfig::default().with_concurrent_downloads(1);
//! let queue = WorkerQueueManager::new(&config).unwrap();
//!
//! let near = ChunkKey::new(SourceId(1), GridPosition::new(0, 0, 0));
//! let far = ChunkKey::new(SourceId(1), GridPosition::new(9, 0, 0));
//! queue.enqueue(far, ChunkPriority::visible(9.0), 0);
//! assert_eq!(queue.enqueue(near, ChunkPriority::visible(0.0), 0), EnqueueOutcome::Queued);
//!
//! // One download slot: the nearer chunk goes first, the other waits
//! let job = queue.next_job().unwrap();
//! assert!(matches!(job, WorkerJob::Fetch { key, .. } if key == near));
//! assert!(queue.next_job().is_none());
//! ```

mod cancel;
mod priority;
mod throttle;
mod worker;
mod worker_queue;

pub use cancel::{CancellationRegistry, CancellationToken};
pub use priority::PriorityQueue;
pub use throttle::{UpdateThrottle, DEFAULT_QUANTUM};
pub use worker::{num_cpus, run_once, ChunkJobHandler, WorkerPool, WorkerPoolConfig, WorkerStep};
pub use worker_queue::{
    DecodeCompletion, EnqueueOutcome, FetchCompletion, WorkerJob, WorkerQueueManager,
    WorkerQueueStats,
};
