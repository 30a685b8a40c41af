//! Error types for chunk fetching, decoding and capacity accounting

use std::path::PathBuf;

use thiserror::Error;

use crate::capacity::BudgetKind;

/// Failure reported by a data source while fetching raw chunk bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("chunk not found: {0}")]
    NotFound(String),

    #[error("fetch cancelled")]
    Cancelled,

    #[error("fetch failed: {0}")]
    Failed(String),
}

/// Failure turning fetched bytes into a chunk payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid chunk data: {0}")]
    InvalidData(String),

    #[error("decoded size {actual} does not match expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Capacity configuration error; reported once and never retried
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("chunk of {size} bytes exceeds the {budget} size limit of {limit} bytes")]
    ItemExceedsSizeLimit {
        budget: BudgetKind,
        size: usize,
        limit: usize,
    },

    #[error("{budget} has a zero limit and can never admit a chunk")]
    ZeroLimit { budget: BudgetKind },
}

/// Outcome of a failed chunk request, shared by every waiter of that chunk
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("chunk request cancelled")]
    Cancelled,

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("chunk source was disposed")]
    SourceDisposed,

    #[error("worker connection closed")]
    Disconnected,

    #[error("timed out waiting for chunk")]
    TimedOut,
}

impl ChunkError {
    /// Cancellation is an expected outcome, not a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ChunkError::Cancelled | ChunkError::Fetch(FetchError::Cancelled))
    }
}

/// Error loading or validating capacity configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Capacity(#[from] CapacityError),
}
