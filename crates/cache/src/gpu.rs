//! GPU upload hook
//!
//! The queue manager decides *when* a chunk enters or leaves GPU memory; the
//! renderer decides *how*. An [`GpuUploader`] receives the decoded payload on
//! promotion and returns an opaque texture handle, which is handed back when
//! the chunk is demoted or evicted.

use std::any::Any;
use std::fmt;

use crate::chunk::ChunkKey;
use crate::payload::ChunkPayload;

/// Opaque handle to GPU resources created for one chunk
///
/// Stores a platform-specific value (a texture, a buffer, an index into a
/// texture atlas) behind `dyn Any` so the cache stays backend agnostic.
pub struct GpuHandle {
    handle: Box<dyn Any + Send>,
    vram_size: usize,
}

impl GpuHandle {
    pub fn new<T: 'static + Send>(handle: T, vram_size: usize) -> Self {
        Self {
            handle: Box::new(handle),
            vram_size,
        }
    }

    /// Estimated VRAM usage in bytes
    pub fn vram_size(&self) -> usize {
        self.vram_size
    }

    /// Returns `None` if the handle is not a `T`
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }
}

impl fmt::Debug for GpuHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuHandle")
            .field("vram_size", &self.vram_size)
            .finish_non_exhaustive()
    }
}

/// Error raised by a renderer that could not upload a chunk
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("gpu upload failed: {0}")]
pub struct UploadError(pub String);

/// Renderer-side hook for creating and freeing GPU resources
pub trait GpuUploader: Send {
    /// Create GPU resources for a chunk being promoted to GPU memory
    fn upload(&mut self, key: &ChunkKey, payload: &ChunkPayload) -> Result<GpuHandle, UploadError>;

    /// Free GPU resources of a chunk leaving GPU memory
    fn release(&mut self, key: &ChunkKey, handle: GpuHandle);
}

/// Uploader that only records the payload size; used when no renderer is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUploader;

impl GpuUploader for NoopUploader {
    fn upload(&mut self, _key: &ChunkKey, payload: &ChunkPayload) -> Result<GpuHandle, UploadError> {
        Ok(GpuHandle::new((), payload.size_bytes()))
    }

    fn release(&mut self, _key: &ChunkKey, _handle: GpuHandle) {}
}
