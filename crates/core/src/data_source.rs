//! Data-source contract used by worker threads
//!
//! A source knows how to fetch the raw bytes of one chunk and how to decode
//! them. Wire formats live behind this trait; the engine only ever sees
//! `ChunkPayload`s.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chunkstream_cache::{ChunkPayload, DataType, DecodeError, FetchError, GridPosition};
use chunkstream_scheduler::CancellationToken;

/// Byte range of a chunk inside a larger stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.offset, self.end().saturating_sub(1))
    }
}

/// Fetch and decode operations of one chunk source
///
/// Implementations are called from worker threads and must be cheap to share.
/// `fetch` should check the token between steps and return
/// `FetchError::Cancelled` once it is cancelled.
pub trait ChunkFetcher: Send + Sync {
    /// Where a chunk lives inside a packed object, if the format packs chunks
    fn byte_range(&self, _position: &GridPosition) -> Option<ByteRange> {
        None
    }

    fn fetch(
        &self,
        position: &GridPosition,
        range: Option<ByteRange>,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError>;

    fn decode(&self, position: &GridPosition, bytes: Vec<u8>) -> Result<ChunkPayload, DecodeError>;
}

/// Source built from a pair of closures
pub struct FnSource<F, D> {
    fetch: F,
    decode: D,
}

impl<F, D> FnSource<F, D>
where
    F: Fn(&GridPosition, &CancellationToken) -> Result<Vec<u8>, FetchError> + Send + Sync,
    D: Fn(&GridPosition, Vec<u8>) -> Result<ChunkPayload, DecodeError> + Send + Sync,
{
    pub fn new(fetch: F, decode: D) -> Self {
        Self { fetch, decode }
    }
}

impl<F, D> ChunkFetcher for FnSource<F, D>
where
    F: Fn(&GridPosition, &CancellationToken) -> Result<Vec<u8>, FetchError> + Send + Sync,
    D: Fn(&GridPosition, Vec<u8>) -> Result<ChunkPayload, DecodeError> + Send + Sync,
{
    fn fetch(
        &self,
        position: &GridPosition,
        _range: Option<ByteRange>,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        (self.fetch)(position, token)
    }

    fn decode(&self, position: &GridPosition, bytes: Vec<u8>) -> Result<ChunkPayload, DecodeError> {
        (self.decode)(position, bytes)
    }
}

/// Closure source whose bytes are already raw voxels of a fixed shape
pub fn raw_source<F>(
    shape: [u32; 3],
    data_type: DataType,
    fetch: F,
) -> FnSource<F, impl Fn(&GridPosition, Vec<u8>) -> Result<ChunkPayload, DecodeError> + Send + Sync>
where
    F: Fn(&GridPosition, &CancellationToken) -> Result<Vec<u8>, FetchError> + Send + Sync,
{
    FnSource::new(fetch, move |_: &GridPosition, bytes: Vec<u8>| {
        ChunkPayload::new(shape, data_type, bytes)
    })
}

/// In-memory volume generating a deterministic pattern per chunk
///
/// Used by the CLI simulator and by tests. Every fetch sleeps for `latency`
/// in small steps so cancellation is observed promptly.
pub struct SyntheticSource {
    chunk_shape: [u32; 3],
    latency: Duration,
    failing: HashSet<GridPosition>,
    fetches: AtomicUsize,
}

impl SyntheticSource {
    pub fn new(chunk_shape: [u32; 3]) -> Self {
        Self {
            chunk_shape,
            latency: Duration::ZERO,
            failing: HashSet::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make fetches of `position` fail
    pub fn with_failure(mut self, position: GridPosition) -> Self {
        self.failing.insert(position);
        self
    }

    /// Number of fetches started so far, cancelled ones included
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn chunk_bytes(&self) -> usize {
        ChunkPayload::expected_len(self.chunk_shape, DataType::Uint8)
    }

    fn sleep_cancellable(&self, token: &CancellationToken) -> Result<(), FetchError> {
        let deadline = Instant::now() + self.latency;
        loop {
            if token.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(Duration::from_millis(2)));
        }
    }
}

impl ChunkFetcher for SyntheticSource {
    fn fetch(
        &self,
        position: &GridPosition,
        _range: Option<ByteRange>,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.sleep_cancellable(token)?;
        if self.failing.contains(position) {
            return Err(FetchError::Failed(format!("synthetic failure at {}", position)));
        }
        let seed = position.x() ^ position.y().rotate_left(8) ^ position.z().rotate_left(16);
        Ok((0..self.chunk_bytes())
            .map(|i| (seed.wrapping_add(i as i64) & 0xff) as u8)
            .collect())
    }

    fn decode(&self, _position: &GridPosition, bytes: Vec<u8>) -> Result<ChunkPayload, DecodeError> {
        ChunkPayload::new(self.chunk_shape, DataType::Uint8, bytes)
    }
}
