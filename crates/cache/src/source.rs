//! Privileged-side chunk records grouped by source

use std::collections::{BTreeMap, HashMap};

use crate::chunk::{
    ChunkKey, ChunkPriority, ChunkState, Generation, GridPosition, LayerId, RequestId, SourceId,
};
use crate::error::ChunkError;
use crate::gpu::GpuHandle;
use crate::payload::ChunkPayload;

/// Who is interested in a chunk: a visible layer's working set or an explicit request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InterestId {
    Layer(LayerId),
    Request(RequestId),
}

/// One chunk as seen by the privileged context
#[derive(Debug)]
pub struct Chunk {
    pub(crate) key: ChunkKey,
    pub(crate) state: ChunkState,
    pub(crate) size_bytes: usize,
    pub(crate) generation: Generation,
    pub(crate) interests: BTreeMap<InterestId, ChunkPriority>,
    pub(crate) payload: Option<ChunkPayload>,
    pub(crate) gpu_handle: Option<GpuHandle>,
    pub(crate) error: Option<ChunkError>,
    /// Fetched once but no room in system memory; re-requested when space frees
    pub(crate) deferred: bool,
    /// Tick at which the chunk was last part of a working set
    pub(crate) last_needed: u64,
}

impl Chunk {
    pub(crate) fn new(key: ChunkKey, generation: Generation, tick: u64) -> Self {
        Self {
            key,
            state: ChunkState::Queued,
            size_bytes: 0,
            generation,
            interests: BTreeMap::new(),
            payload: None,
            gpu_handle: None,
            error: None,
            deferred: false,
            last_needed: tick,
        }
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Decoded size once resident, 0 before the first arrival
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn payload(&self) -> Option<&ChunkPayload> {
        self.payload.as_ref()
    }

    pub fn error(&self) -> Option<&ChunkError> {
        self.error.as_ref()
    }

    pub fn is_needed(&self) -> bool {
        !self.interests.is_empty()
    }

    pub fn interest_count(&self) -> usize {
        self.interests.len()
    }

    /// Most urgent priority over all interests; `Recent` when nobody needs it
    pub fn priority(&self) -> ChunkPriority {
        self.interests
            .values()
            .min()
            .copied()
            .unwrap_or_else(ChunkPriority::recent)
    }

    pub fn is_layer_visible(&self) -> bool {
        self.interests.keys().any(|i| matches!(i, InterestId::Layer(_)))
    }
}

/// Chunk map and generation counter of one source
#[derive(Debug)]
pub struct ChunkSource {
    id: SourceId,
    generation: Generation,
    pub(crate) chunks: HashMap<GridPosition, Chunk>,
}

impl ChunkSource {
    pub fn new(id: SourceId) -> Self {
        Self {
            id,
            generation: 0,
            chunks: HashMap::new(),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn bump_generation(&mut self) -> Generation {
        self.generation += 1;
        self.generation
    }

    pub fn chunk(&self, position: &GridPosition) -> Option<&Chunk> {
        self.chunks.get(position)
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
