//! Shared chunk sources
//!
//! A source is identified by a `SourceKey` naming what it serves (dataset,
//! resolution level, encoding). The manager hands out one shared instance per
//! key; the source is disposed on both sides of the bridge when the last
//! handle is dropped.

use std::fmt;
use std::sync::{Arc, Weak};

use chunkstream_cache::{Generation, SourceId};
use viewer_core::ChunkLayout;

use crate::data_source::ChunkFetcher;

/// Stable parameter key of a chunk source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for SourceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Everything needed to open a source
#[derive(Clone)]
pub struct SourceSpec {
    pub key: SourceKey,
    pub layout: ChunkLayout,
    pub fetcher: Arc<dyn ChunkFetcher>,
}

impl SourceSpec {
    pub fn new(key: impl Into<SourceKey>, layout: ChunkLayout, fetcher: Arc<dyn ChunkFetcher>) -> Self {
        Self {
            key: key.into(),
            layout,
            fetcher,
        }
    }
}

impl fmt::Debug for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSpec")
            .field("key", &self.key)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Owner notified when a source's last handle goes away
pub(crate) trait SourceOwner: Send + Sync {
    fn release_source(&self, id: SourceId);
    fn invalidate_source(&self, id: SourceId) -> Option<Generation>;
}

struct SourceShared {
    id: SourceId,
    key: SourceKey,
    layout: ChunkLayout,
    owner: Weak<dyn SourceOwner>,
}

impl Drop for SourceShared {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.release_source(self.id);
        }
    }
}

/// Shared handle to a registered chunk source
#[derive(Clone)]
pub struct ChunkSourceHandle {
    shared: Arc<SourceShared>,
}

impl ChunkSourceHandle {
    pub(crate) fn new(id: SourceId, key: SourceKey, layout: ChunkLayout, owner: Weak<dyn SourceOwner>) -> Self {
        Self {
            shared: Arc::new(SourceShared {
                id,
                key,
                layout,
                owner,
            }),
        }
    }

    pub fn id(&self) -> SourceId {
        self.shared.id
    }

    pub fn key(&self) -> &SourceKey {
        &self.shared.key
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.shared.layout
    }

    /// Number of live handles to this source
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Bump the source generation, evicting its chunks and re-requesting the
    /// ones still needed; `None` once the manager is gone
    pub fn invalidate(&self) -> Option<Generation> {
        self.shared.owner.upgrade()?.invalidate_source(self.shared.id)
    }

    pub(crate) fn downgrade(&self) -> WeakSourceHandle {
        WeakSourceHandle(Arc::downgrade(&self.shared))
    }
}

impl fmt::Debug for ChunkSourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSourceHandle")
            .field("id", &self.shared.id)
            .field("key", &self.shared.key)
            .finish()
    }
}

/// Non-owning reference kept by the manager's source table
pub(crate) struct WeakSourceHandle(Weak<SourceShared>);

impl WeakSourceHandle {
    pub(crate) fn upgrade(&self) -> Option<ChunkSourceHandle> {
        self.0.upgrade().map(|shared| ChunkSourceHandle { shared })
    }
}
