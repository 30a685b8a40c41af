//! Decoded chunk payloads
//!
//! Payloads are immutable once decoded and shared by reference count, so a
//! consumer holding a clone keeps the data alive even after the cache has
//! evicted the chunk.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Element type of decoded voxel data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
}

impl DataType {
    pub fn bytes_per_element(&self) -> usize {
        match self {
            DataType::Uint8 => 1,
            DataType::Uint16 => 2,
            DataType::Uint32 | DataType::Float32 => 4,
            DataType::Uint64 => 8,
        }
    }
}

/// Decoded voxel data of one chunk
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    data: Arc<[u8]>,
    shape: [u32; 3],
    data_type: DataType,
}

impl ChunkPayload {
    /// Wrap decoded bytes, checking they match `shape` and `data_type`
    pub fn new(shape: [u32; 3], data_type: DataType, data: Vec<u8>) -> Result<Self, DecodeError> {
        let expected = Self::expected_len(shape, data_type);
        if data.len() != expected {
            return Err(DecodeError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data: data.into(),
            shape,
            data_type,
        })
    }

    /// Number of bytes a chunk of this shape and type occupies
    pub fn expected_len(shape: [u32; 3], data_type: DataType) -> usize {
        shape.iter().map(|&d| d as usize).product::<usize>() * data_type.bytes_per_element()
    }

    pub fn shape(&self) -> [u32; 3] {
        self.shape
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Size charged against memory budgets
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Number of live handles sharing this payload's buffer
    pub fn shared_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

impl fmt::Debug for ChunkPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkPayload")
            .field("shape", &self.shape)
            .field("data_type", &self.data_type)
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}
