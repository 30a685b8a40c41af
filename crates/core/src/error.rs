use chunkstream_cache::{CapacityError, ChunkError, ConfigError, LayerId};
use thiserror::Error;
use viewer_core::VisibilityError;

/// Errors surfaced by the chunk manager and the streaming engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Visibility(#[from] VisibilityError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("failed to start worker threads: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("unknown layer {0}")]
    UnknownLayer(LayerId),

    #[error("worker backend disconnected")]
    Disconnected,
}

pub type EngineResult<T> = Result<T, EngineError>;
