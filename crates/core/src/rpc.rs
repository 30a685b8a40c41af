//! Message protocol between the privileged context and the worker backend
//!
//! Each direction is a single FIFO channel, so messages of one kind are
//! applied in send order. Chunk results carry their key and generation and
//! are matched by key on arrival, never by position in the stream.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chunkstream_cache::{
    BudgetKind, CapacityLimits, ChunkError, ChunkKey, ChunkPayload, ChunkPriority, Generation,
    LayerId, SourceId,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use viewer_core::LayerTransform;

use crate::data_source::ChunkFetcher;

/// Privileged context to worker
pub enum FrontendMessage {
    RegisterSource {
        source: SourceId,
        fetcher: Arc<dyn ChunkFetcher>,
    },
    DisposeSource {
        source: SourceId,
    },
    InvalidateSource {
        source: SourceId,
        generation: Generation,
    },
    AddVisibleLayer {
        layer: LayerId,
        sources: Vec<SourceId>,
        transform: LayerTransform,
    },
    RemoveVisibleLayer {
        layer: LayerId,
    },
    RequestChunk {
        key: ChunkKey,
        priority: ChunkPriority,
        generation: Generation,
    },
    CancelChunk {
        key: ChunkKey,
    },
    SetLimits {
        kind: BudgetKind,
        limits: CapacityLimits,
    },
    Shutdown,
}

impl FrontendMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            FrontendMessage::RegisterSource { .. } => "register_source",
            FrontendMessage::DisposeSource { .. } => "dispose_source",
            FrontendMessage::InvalidateSource { .. } => "invalidate_source",
            FrontendMessage::AddVisibleLayer { .. } => "add_visible_layer",
            FrontendMessage::RemoveVisibleLayer { .. } => "remove_visible_layer",
            FrontendMessage::RequestChunk { .. } => "request_chunk",
            FrontendMessage::CancelChunk { .. } => "cancel_chunk",
            FrontendMessage::SetLimits { .. } => "set_limits",
            FrontendMessage::Shutdown => "shutdown",
        }
    }
}

impl fmt::Debug for FrontendMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontendMessage::RegisterSource { source, .. } | FrontendMessage::DisposeSource { source } => {
                write!(f, "{}({})", self.kind(), source)
            }
            FrontendMessage::InvalidateSource { source, generation } => {
                write!(f, "{}({}, generation {})", self.kind(), source, generation)
            }
            FrontendMessage::AddVisibleLayer { layer, sources, .. } => {
                write!(f, "{}({}, {} sources)", self.kind(), layer, sources.len())
            }
            FrontendMessage::RemoveVisibleLayer { layer } => write!(f, "{}({})", self.kind(), layer),
            FrontendMessage::RequestChunk { key, priority, generation } => {
                write!(f, "{}({}, {:?}, generation {})", self.kind(), key, priority, generation)
            }
            FrontendMessage::CancelChunk { key } => write!(f, "{}({})", self.kind(), key),
            FrontendMessage::SetLimits { kind, limits } => write!(f, "{}({}, {:?})", self.kind(), kind, limits),
            FrontendMessage::Shutdown => f.write_str(self.kind()),
        }
    }
}

/// Worker to privileged context
#[derive(Debug, Clone)]
pub enum BackendMessage {
    DownloadStarted {
        key: ChunkKey,
        generation: Generation,
    },
    ChunkReady {
        key: ChunkKey,
        generation: Generation,
        result: Result<ChunkPayload, ChunkError>,
        latency: Duration,
    },
    LayerAdded {
        layer: LayerId,
    },
    LayerRemoved {
        layer: LayerId,
    },
}

/// One end of the bridge: sends `Out`, receives `In`
pub struct RpcEndpoint<Out, In> {
    tx: Sender<Out>,
    rx: Receiver<In>,
}

pub type FrontendEndpoint = RpcEndpoint<FrontendMessage, BackendMessage>;
pub type BackendEndpoint = RpcEndpoint<BackendMessage, FrontendMessage>;

/// Create a connected pair of endpoints
pub fn channel() -> (FrontendEndpoint, BackendEndpoint) {
    let (to_backend, from_frontend) = crossbeam_channel::unbounded();
    let (to_frontend, from_backend) = crossbeam_channel::unbounded();
    (
        RpcEndpoint {
            tx: to_backend,
            rx: from_backend,
        },
        RpcEndpoint {
            tx: to_frontend,
            rx: from_frontend,
        },
    )
}

impl<Out, In> RpcEndpoint<Out, In> {
    pub fn send(&self, message: Out) -> Result<(), ChunkError> {
        self.tx.send(message).map_err(|_| ChunkError::Disconnected)
    }

    /// Clone of the outgoing half, for worker threads
    pub fn sender(&self) -> Sender<Out> {
        self.tx.clone()
    }

    /// Clone of the incoming half
    pub fn receiver(&self) -> Receiver<In> {
        self.rx.clone()
    }

    /// Next message if one is waiting
    pub fn try_recv(&self) -> Result<Option<In>, ChunkError> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChunkError::Disconnected),
        }
    }

    pub fn recv(&self) -> Result<In, ChunkError> {
        self.rx.recv().map_err(|_| ChunkError::Disconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<In>, ChunkError> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ChunkError::Disconnected),
        }
    }

    /// Every message currently waiting
    pub fn drain(&self) -> Vec<In> {
        self.rx.try_iter().collect()
    }
}
