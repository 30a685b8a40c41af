//! Chunk identity, lifecycle state and priority
//!
//! A chunk is the unit of caching: one block of a volume at one resolution
//! level, addressed by the source it belongs to and its integer position in
//! that source's chunk grid.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capacity::BudgetKind;

/// Identifier of a chunk source (one resolution level of one data source)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Identifier of a render layer registered with the slice view
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerId(pub u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

/// Identifier of one explicit `request_chunk` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// Source generation, bumped every time the source is invalidated
pub type Generation = u64;

/// Integer position of a chunk in its source's chunk grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct GridPosition(pub [i64; 3]);

impl GridPosition {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self([x, y, z])
    }

    pub fn x(&self) -> i64 {
        self.0[0]
    }

    pub fn y(&self) -> i64 {
        self.0[1]
    }

    pub fn z(&self) -> i64 {
        self.0[2]
    }

    /// Returns the position offset by `delta` along `axis`
    pub fn offset(&self, axis: usize, delta: i64) -> Self {
        let mut coords = self.0;
        coords[axis] += delta;
        Self(coords)
    }
}

impl fmt::Display for GridPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Error returned when parsing a `"x,y,z"` grid position fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid grid position '{0}', expected \"x,y,z\"")]
pub struct ParseGridPositionError(pub String);

impl FromStr for GridPosition {
    type Err = ParseGridPositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut coords = [0i64; 3];
        let mut parts = s.split(',');
        for coord in coords.iter_mut() {
            *coord = parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .ok_or_else(|| ParseGridPositionError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseGridPositionError(s.to_string()));
        }
        Ok(Self(coords))
    }
}

/// Key uniquely identifying a chunk across all sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub source: SourceId,
    pub position: GridPosition,
}

impl ChunkKey {
    pub fn new(source: SourceId, position: GridPosition) -> Self {
        Self { source, position }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.source, self.position)
    }
}

/// Lifecycle state of a chunk
///
/// The residency states are ordered: a chunk only moves forward through
/// `Queued -> Downloading -> SystemMemory -> GpuMemory`, except for demotion
/// from GPU back to system memory and the terminal `Failed`/`Evicted` states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkState {
    Queued,
    Downloading,
    SystemMemory,
    GpuMemory,
    Failed,
    Evicted,
}

impl ChunkState {
    /// The memory budget a chunk in this state is counted against
    ///
    /// Only the privileged-side memory tiers are reported here. Download and
    /// compute slots are accounted on the worker side.
    pub fn budget(&self) -> Option<BudgetKind> {
        match self {
            ChunkState::SystemMemory => Some(BudgetKind::SystemMemory),
            ChunkState::GpuMemory => Some(BudgetKind::GpuMemory),
            _ => None,
        }
    }

    /// True if the decoded payload is held in memory
    pub fn is_resident(&self) -> bool {
        matches!(self, ChunkState::SystemMemory | ChunkState::GpuMemory)
    }

    /// True for states a chunk never leaves without a fresh request
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkState::Failed | ChunkState::Evicted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Queued => "queued",
            ChunkState::Downloading => "downloading",
            ChunkState::SystemMemory => "system_memory",
            ChunkState::GpuMemory => "gpu_memory",
            ChunkState::Failed => "failed",
            ChunkState::Evicted => "evicted",
        }
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier, lower is more urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriorityTier {
    /// Intersects the current view; wants GPU residency
    Visible = 0,
    /// Inside the prefetch margin; system memory only
    Prefetch = 1,
    /// No longer in any working set; evictable
    Recent = 2,
}

/// Tier plus a sub-rank within the tier, both lower = more urgent
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkPriority {
    pub tier: PriorityTier,
    pub rank: f32,
}

impl ChunkPriority {
    pub fn new(tier: PriorityTier, rank: f32) -> Self {
        Self { tier, rank }
    }

    pub fn visible(rank: f32) -> Self {
        Self::new(PriorityTier::Visible, rank)
    }

    pub fn prefetch(rank: f32) -> Self {
        Self::new(PriorityTier::Prefetch, rank)
    }

    pub fn recent() -> Self {
        Self::new(PriorityTier::Recent, 0.0)
    }

    /// True if the chunk should be uploaded to the GPU
    pub fn wants_gpu(&self) -> bool {
        self.tier == PriorityTier::Visible
    }
}

impl PartialEq for ChunkPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ChunkPriority {}

impl PartialOrd for ChunkPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then_with(|| self.rank.total_cmp(&other.rank))
    }
}
