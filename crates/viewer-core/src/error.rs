use chunkstream_cache::LayerId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VisibilityError {
    #[error("{layer} has an invalid transform: {reason}")]
    InvalidTransform { layer: LayerId, reason: String },

    #[error("{layer} has no scale levels")]
    NoScaleLevels { layer: LayerId },

    #[error("invalid viewport: {0}")]
    InvalidViewport(String),

    #[error("unknown {0}")]
    UnknownLayer(LayerId),
}
