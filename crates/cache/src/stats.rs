//! Chunk statistics per source and aggregated
//!
//! State counts are computed on demand by scanning the chunk map; eviction
//! counts and download latency are accumulated as events happen.

use std::time::Duration;

use serde::Serialize;

use crate::capacity::BudgetSnapshot;
use crate::chunk::{ChunkState, SourceId};
use crate::source::Chunk;

/// Weight of the newest sample in the latency moving average
const LATENCY_SMOOTHING: f64 = 0.2;

/// Counters accumulated over the lifetime of a source
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SourceCounters {
    pub evictions: u64,
    pub downloads_completed: u64,
    pub download_latency_ms: f64,
}

impl SourceCounters {
    pub fn record_download(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.download_latency_ms = if self.downloads_completed == 0 {
            sample
        } else {
            self.download_latency_ms * (1.0 - LATENCY_SMOOTHING) + sample * LATENCY_SMOOTHING
        };
        self.downloads_completed += 1;
    }
}

/// Snapshot of one source (or of all sources combined)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChunkStatistics {
    /// Chunks currently in some working set or explicitly requested
    pub visible_chunks: usize,
    pub visible_queued: usize,
    pub visible_downloading: usize,
    pub visible_system_memory: usize,
    pub visible_gpu_memory: usize,
    /// GPU bytes held by chunks that are still needed
    pub visible_gpu_bytes: usize,
    pub failed_chunks: usize,
    /// Resident chunks, needed or not
    pub resident_chunks: usize,
    pub resident_bytes: usize,
    pub evictions: u64,
    pub downloads_completed: u64,
    /// Exponential moving average of fetch plus decode time
    pub download_latency_ms: f64,
}

impl ChunkStatistics {
    pub(crate) fn collect<'a>(
        chunks: impl Iterator<Item = &'a Chunk>,
        counters: SourceCounters,
    ) -> Self {
        let mut stats = Self {
            evictions: counters.evictions,
            downloads_completed: counters.downloads_completed,
            download_latency_ms: counters.download_latency_ms,
            ..Self::default()
        };
        for chunk in chunks {
            if chunk.state().is_resident() {
                stats.resident_chunks += 1;
                stats.resident_bytes += chunk.size_bytes();
            }
            if chunk.state() == ChunkState::Failed {
                stats.failed_chunks += 1;
            }
            if !chunk.is_needed() {
                continue;
            }
            stats.visible_chunks += 1;
            match chunk.state() {
                ChunkState::Queued => stats.visible_queued += 1,
                ChunkState::Downloading => stats.visible_downloading += 1,
                ChunkState::SystemMemory => stats.visible_system_memory += 1,
                ChunkState::GpuMemory => {
                    stats.visible_gpu_memory += 1;
                    stats.visible_gpu_bytes += chunk.size_bytes();
                }
                ChunkState::Failed | ChunkState::Evicted => {}
            }
        }
        stats
    }

    /// Add another snapshot into this one; latency is weighted by download count
    pub fn merge(&mut self, other: &ChunkStatistics) {
        let total_downloads = self.downloads_completed + other.downloads_completed;
        if total_downloads > 0 {
            self.download_latency_ms = (self.download_latency_ms * self.downloads_completed as f64
                + other.download_latency_ms * other.downloads_completed as f64)
                / total_downloads as f64;
        }
        self.visible_chunks += other.visible_chunks;
        self.visible_queued += other.visible_queued;
        self.visible_downloading += other.visible_downloading;
        self.visible_system_memory += other.visible_system_memory;
        self.visible_gpu_memory += other.visible_gpu_memory;
        self.visible_gpu_bytes += other.visible_gpu_bytes;
        self.failed_chunks += other.failed_chunks;
        self.resident_chunks += other.resident_chunks;
        self.resident_bytes += other.resident_bytes;
        self.evictions += other.evictions;
        self.downloads_completed = total_downloads;
    }
}

/// Statistics of one source
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceStatistics {
    pub source: SourceId,
    pub generation: u64,
    pub stats: ChunkStatistics,
}

/// Statistics of every source plus budget usage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedStatistics {
    pub sources: Vec<SourceStatistics>,
    pub total: ChunkStatistics,
    pub gpu_memory: BudgetSnapshot,
    pub system_memory: BudgetSnapshot,
}
