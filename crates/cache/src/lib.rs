//! Chunkstream Cache Library
//!
//! Chunk data model, capacity budgets and the privileged-side queue manager
//! that keeps decoded chunks in system and GPU memory with eviction.

pub mod capacity;
pub mod chunk;
pub mod config;
pub mod error;
pub mod gpu;
pub mod payload;
pub mod queue_manager;
pub mod source;
pub mod stats;

pub use capacity::{BudgetKind, BudgetSnapshot, CapacityBudget, CapacityLimits, MemoryPressure};
pub use chunk::{
    ChunkKey, ChunkPriority, ChunkState, Generation, GridPosition, LayerId, ParseGridPositionError,
    PriorityTier, RequestId, SourceId,
};
pub use config::CapacityConfig;
pub use error::{CapacityError, ChunkError, ConfigError, DecodeError, FetchError};
pub use gpu::{GpuHandle, GpuUploader, NoopUploader, UploadError};
pub use payload::{ChunkPayload, DataType};
pub use queue_manager::{ChunkQueueManager, FetchAction, ResidencyEvent};
pub use source::{Chunk, ChunkSource, InterestId};
pub use stats::{AggregatedStatistics, ChunkStatistics, SourceStatistics};
