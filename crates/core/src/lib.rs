//! Chunkstream Core Library
//!
//! Connects the visibility engine to the chunk cache across the worker
//! bridge: shared chunk sources, the `ChunkManager` facade, the worker
//! backend and the `StreamingEngine` that drives them once per tick.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use chunkstream_cache::{CapacityConfig, LayerId};
//! use chunkstream_core::{EngineConfig, SourceSpec, StreamingEngine, SyntheticSource};
//! use viewer_core::{ChunkLayout, LayerTransform, SliceViewport};
//!
//! let config = EngineConfig::new(CapacityConfig::default()).with_workers(4);
//! let mut engine = StreamingEngine::new(config)?;
//! let source = Arc::new(SyntheticSource::new([32, 32, 32]));
//! let layout = ChunkLayout::new([32, 32, 32], [512, 512, 512]);
//! engine.add_layer(
//!     LayerId(1),
//!     LayerTransform::identity(),
//!     vec![SourceSpec::new("synthetic/s0", layout, source)],
//! )?;
//! engine.set_viewport(SliceViewport::new([256.0, 256.0, 256.0].into(), 800, 600, 1.0))?;
//! engine.run_until_settled(Duration::from_secs(10))?;
//! println!("{:?}", engine.statistics().total);
//! # Ok::<(), chunkstream_core::EngineError>(())
//! ```

pub mod backend;
pub mod chunk_manager;
pub mod data_source;
pub mod engine;
pub mod error;
pub mod rpc;
pub mod signal;
pub mod source;

pub use backend::WorkerBackend;
pub use chunk_manager::{ChunkManager, PendingChunk};
pub use data_source::{raw_source, ByteRange, ChunkFetcher, FnSource, SyntheticSource};
pub use engine::{EngineConfig, StreamingEngine, TickReport};
pub use error::{EngineError, EngineResult};
pub use rpc::{BackendEndpoint, BackendMessage, FrontendEndpoint, FrontendMessage, RpcEndpoint};
pub use signal::ResidencySignal;
pub use source::{ChunkSourceHandle, SourceKey, SourceSpec};
