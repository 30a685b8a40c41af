use chunkstream_cache::{GridPosition, LayerId, SourceId};
use glam::DVec3;

use crate::transform::LayerTransform;

/// Chunk grid of one resolution level
///
/// Sizes are in voxels of this level. `downsample` is the number of base
/// voxels covered by one voxel of this level along each axis, so chunk
/// bounds can be expressed in the layer's base coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkLayout {
    pub chunk_size: [u32; 3],
    pub volume_size: [u64; 3],
    pub downsample: DVec3,
}

impl ChunkLayout {
    pub fn new(chunk_size: [u32; 3], volume_size: [u64; 3]) -> Self {
        Self {
            chunk_size,
            volume_size,
            downsample: DVec3::ONE,
        }
    }

    pub fn with_downsample(mut self, downsample: DVec3) -> Self {
        self.downsample = downsample;
        self
    }

    /// Number of chunks along each axis
    pub fn grid_shape(&self) -> [i64; 3] {
        let mut shape = [0; 3];
        for axis in 0..3 {
            let chunk = u64::from(self.chunk_size[axis].max(1));
            shape[axis] = self.volume_size[axis].div_ceil(chunk) as i64;
        }
        shape
    }

    pub fn chunk_count(&self) -> u64 {
        self.grid_shape().iter().map(|n| *n as u64).product()
    }

    pub fn contains(&self, position: &GridPosition) -> bool {
        let shape = self.grid_shape();
        (0..3).all(|axis| (0..shape[axis]).contains(&position.0[axis]))
    }

    /// Extent of one full chunk in base voxels
    pub fn chunk_extent(&self) -> DVec3 {
        DVec3::new(
            f64::from(self.chunk_size[0]),
            f64::from(self.chunk_size[1]),
            f64::from(self.chunk_size[2]),
        ) * self.downsample
    }

    /// Extent of the whole volume in base voxels
    pub fn volume_extent(&self) -> DVec3 {
        DVec3::new(
            self.volume_size[0] as f64,
            self.volume_size[1] as f64,
            self.volume_size[2] as f64,
        ) * self.downsample
    }

    /// Bounds of a chunk in base voxels; edge chunks are clipped to the volume
    pub fn chunk_bounds(&self, position: &GridPosition) -> (DVec3, DVec3) {
        let extent = self.chunk_extent();
        let index = DVec3::new(
            position.x() as f64,
            position.y() as f64,
            position.z() as f64,
        );
        let min = index * extent;
        let max = (min + extent).min(self.volume_extent());
        (min, max)
    }

    /// Grid index of the chunk containing a base-voxel point, unclamped
    pub fn chunk_index(&self, point: DVec3) -> [i64; 3] {
        let index = (point / self.chunk_extent()).floor();
        [index.x as i64, index.y as i64, index.z as i64]
    }

    /// Size of one voxel of this level in display units
    ///
    /// Only axes along which the volume has extent are considered, so a
    /// single-slice layer is not sized by its thickness.
    pub fn voxel_size(&self, transform: &LayerTransform) -> f64 {
        let sizes: Vec<(u64, f64)> = (0..3)
            .map(|axis| {
                (
                    self.volume_size[axis],
                    transform.axis(axis).length() * self.downsample[axis],
                )
            })
            .collect();
        let spanned = sizes
            .iter()
            .filter(|(extent, _)| *extent > 1)
            .map(|(_, size)| *size)
            .fold(f64::NAN, f64::max);
        if spanned.is_nan() {
            sizes.iter().map(|(_, size)| *size).fold(0.0, f64::max)
        } else {
            spanned
        }
    }
}

/// One resolution level of a layer and the source serving it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleLevel {
    pub source: SourceId,
    pub layout: ChunkLayout,
}

impl ScaleLevel {
    pub fn new(source: SourceId, layout: ChunkLayout) -> Self {
        Self { source, layout }
    }
}

/// A layer the slice view renders: a transform and its multiscale sources
#[derive(Debug, Clone, PartialEq)]
pub struct RenderLayer {
    pub id: LayerId,
    pub transform: LayerTransform,
    scales: Vec<ScaleLevel>,
}

impl RenderLayer {
    /// Scales are kept ordered finest first
    pub fn new(id: LayerId, transform: LayerTransform, mut scales: Vec<ScaleLevel>) -> Self {
        scales.sort_by(|a, b| {
            a.layout
                .downsample
                .max_element()
                .total_cmp(&b.layout.downsample.max_element())
        });
        Self {
            id,
            transform,
            scales,
        }
    }

    pub fn scales(&self) -> &[ScaleLevel] {
        &self.scales
    }

    pub fn sources(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.scales.iter().map(|scale| scale.source)
    }
}
