//! Chunk–view intersection
//!
//! The view is an oriented box in display space (flat for a plane view).
//! A chunk is an axis-aligned box in layer coordinates, which the layer
//! transform turns into a parallelepiped in display space. The two convex
//! shapes are tested with the separating axis theorem.
//!
//! Visible chunks are found by a flood fill over the chunk grid starting
//! from the chunk under the view center, so the work done is proportional
//! to the number of chunks the view touches rather than to the grid size.

use std::collections::{HashSet, VecDeque};

use chunkstream_cache::GridPosition;
use glam::{DMat4, DVec3};

use crate::layout::ChunkLayout;
use crate::transform::LayerTransform;

/// Upper bound on chunks collected for one layer in one pass
pub const MAX_VISIBLE_CHUNKS: usize = 1 << 20;

const AXIS_EPSILON: f64 = 1e-12;

/// Oriented box in display space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewVolume {
    pub center: DVec3,
    /// Orthonormal box axes
    pub axes: [DVec3; 3],
    pub half_extents: DVec3,
}

/// A chunk touched by the view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleChunk {
    pub position: GridPosition,
    /// Display-space distance from the view center to the chunk center
    pub distance: f64,
}

impl ViewVolume {
    pub fn new(center: DVec3, axes: [DVec3; 3], half_extents: DVec3) -> Self {
        Self {
            center,
            axes,
            half_extents,
        }
    }

    /// The eight corners in display space
    pub fn corners(&self) -> [DVec3; 8] {
        let mut corners = [DVec3::ZERO; 8];
        for (i, corner) in corners.iter_mut().enumerate() {
            let mut point = self.center;
            for axis in 0..3 {
                let sign = if i & (1 << axis) == 0 { -1.0 } else { 1.0 };
                point += self.axes[axis] * (sign * self.half_extents[axis]);
            }
            *corner = point;
        }
        corners
    }

    fn radius_along(&self, direction: DVec3) -> f64 {
        (0..3)
            .map(|axis| self.half_extents[axis] * self.axes[axis].dot(direction).abs())
            .sum()
    }

    /// Separating axis test against a parallelepiped
    ///
    /// `edges` are the parallelepiped's edge directions and `half_lengths`
    /// its half size along each of them. Edge directions must be non-zero;
    /// half lengths may be zero.
    pub fn intersects_parallelepiped(&self, center: DVec3, edges: [DVec3; 3], half_lengths: DVec3) -> bool {
        let offset = center - self.center;
        let separated_along = |direction: DVec3| -> bool {
            if direction.length_squared() < AXIS_EPSILON {
                return false;
            }
            let box_radius: f64 = (0..3)
                .map(|axis| half_lengths[axis] * edges[axis].dot(direction).abs())
                .sum();
            let distance = offset.dot(direction).abs();
            let slack = AXIS_EPSILON.sqrt() * direction.length() * (1.0 + distance);
            distance > self.radius_along(direction) + box_radius + slack
        };

        for axis in &self.axes {
            if separated_along(*axis) {
                return false;
            }
        }
        for i in 0..3 {
            let normal = edges[(i + 1) % 3].cross(edges[(i + 2) % 3]);
            if separated_along(normal) {
                return false;
            }
        }
        for view_axis in &self.axes {
            for edge in &edges {
                if separated_along(view_axis.cross(*edge)) {
                    return false;
                }
            }
        }
        true
    }

    /// True if the chunk at `position` touches this volume
    pub fn intersects_chunk(&self, layout: &ChunkLayout, transform: &LayerTransform, position: &GridPosition) -> bool {
        let (min, max) = layout.chunk_bounds(position);
        let center = transform.to_display((min + max) / 2.0);
        let half = (max - min) / 2.0;
        let edges = [transform.axis(0), transform.axis(1), transform.axis(2)];
        self.intersects_parallelepiped(center, edges, half)
    }
}

fn chunk_center_distance(
    layout: &ChunkLayout,
    transform: &LayerTransform,
    volume: &ViewVolume,
    position: &GridPosition,
) -> f64 {
    let (min, max) = layout.chunk_bounds(position);
    transform.to_display((min + max) / 2.0).distance(volume.center)
}

/// Grid range covering the volume, clamped to the grid; `None` if disjoint
fn candidate_range(layout: &ChunkLayout, inverse: &DMat4, volume: &ViewVolume) -> Option<([i64; 3], [i64; 3])> {
    let shape = layout.grid_shape();
    if shape.iter().any(|n| *n <= 0) {
        return None;
    }
    let mut lo = [i64::MAX; 3];
    let mut hi = [i64::MIN; 3];
    for corner in volume.corners() {
        let index = layout.chunk_index(inverse.transform_point3(corner));
        for axis in 0..3 {
            lo[axis] = lo[axis].min(index[axis]);
            hi[axis] = hi[axis].max(index[axis]);
        }
    }
    // One chunk of slack on each side for chunks that only touch the volume
    for axis in 0..3 {
        lo[axis] = lo[axis].saturating_sub(1).max(0);
        hi[axis] = hi[axis].saturating_add(1).min(shape[axis] - 1);
        if lo[axis] > hi[axis] {
            return None;
        }
    }
    Some((lo, hi))
}

fn in_range(index: &[i64; 3], lo: &[i64; 3], hi: &[i64; 3]) -> bool {
    (0..3).all(|axis| lo[axis] <= index[axis] && index[axis] <= hi[axis])
}

/// Chunks of `layout` touched by `volume`, nearest first
///
/// `inverse` is the inverse of `transform`.
pub fn visible_chunks(
    layout: &ChunkLayout,
    transform: &LayerTransform,
    inverse: &DMat4,
    volume: &ViewVolume,
) -> Vec<VisibleChunk> {
    let Some((lo, hi)) = candidate_range(layout, inverse, volume) else {
        return Vec::new();
    };
    let touches = |index: [i64; 3]| volume.intersects_chunk(layout, transform, &GridPosition(index));

    let mut seed = layout.chunk_index(inverse.transform_point3(volume.center));
    for axis in 0..3 {
        seed[axis] = seed[axis].clamp(lo[axis], hi[axis]);
    }
    if !touches(seed) {
        // The center misses the volume data; look for any touched chunk in range
        let found = (lo[2]..=hi[2])
            .flat_map(|z| (lo[1]..=hi[1]).flat_map(move |y| (lo[0]..=hi[0]).map(move |x| [x, y, z])))
            .find(|index| touches(*index));
        match found {
            Some(index) => seed = index,
            None => return Vec::new(),
        }
    }

    let mut visited: HashSet<[i64; 3]> = HashSet::new();
    let mut queue = VecDeque::new();
    let mut chunks = Vec::new();
    visited.insert(seed);
    queue.push_back(seed);

    while let Some(index) = queue.pop_front() {
        let position = GridPosition(index);
        chunks.push(VisibleChunk {
            position,
            distance: chunk_center_distance(layout, transform, volume, &position),
        });
        if chunks.len() >= MAX_VISIBLE_CHUNKS {
            log::warn!("visible chunk limit of {} reached", MAX_VISIBLE_CHUNKS);
            break;
        }

        for dz in -1..=1 {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    if dx == 0 && dy == 0 && dz == 0 {
                        continue;
                    }
                    let next = [index[0] + dx, index[1] + dy, index[2] + dz];
                    if !in_range(&next, &lo, &hi) || visited.contains(&next) {
                        continue;
                    }
                    visited.insert(next);
                    if touches(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
    }

    chunks.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.position.cmp(&b.position))
    });
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::SliceViewport;
    use glam::DQuat;
    use std::f64::consts::FRAC_PI_4;

    fn brute_force(layout: &ChunkLayout, transform: &LayerTransform, volume: &ViewVolume) -> Vec<GridPosition> {
        let shape = layout.grid_shape();
        let mut hits = Vec::new();
        for z in 0..shape[2] {
            for y in 0..shape[1] {
                for x in 0..shape[0] {
                    let position = GridPosition::new(x, y, z);
                    if volume.intersects_chunk(layout, transform, &position) {
                        hits.push(position);
                    }
                }
            }
        }
        hits.sort();
        hits
    }

    fn positions(chunks: &[VisibleChunk]) -> Vec<GridPosition> {
        let mut positions: Vec<GridPosition> = chunks.iter().map(|chunk| chunk.position).collect();
        positions.sort();
        positions
    }

    #[test]
    fn axis_aligned_plane_hits_one_layer_of_chunks() {
        let layout = ChunkLayout::new([10, 10, 10], [100, 100, 100]);
        let transform = LayerTransform::identity();
        let viewport = SliceViewport::new(DVec3::new(50.0, 50.0, 35.0), 20, 20, 1.0);
        let volume = viewport.view_volume(0);

        let chunks = visible_chunks(&layout, &transform, &transform.inverse().unwrap(), &volume);
        // x and y span [40, 60]; the box edges at 40 and 60 touch neighbours
        let got = positions(&chunks);
        assert_eq!(got.len(), 16);
        assert!(got.iter().all(|p| p.z() == 3));
        assert!(got.contains(&GridPosition::new(3, 3, 3)));
        assert!(got.contains(&GridPosition::new(6, 6, 3)));
    }

    #[test]
    fn nearest_chunk_comes_first() {
        let layout = ChunkLayout::new([10, 10, 10], [100, 100, 100]);
        let transform = LayerTransform::identity();
        let viewport = SliceViewport::new(DVec3::new(55.0, 55.0, 55.0), 30, 30, 1.0);
        let chunks = visible_chunks(
            &layout,
            &transform,
            &transform.inverse().unwrap(),
            &viewport.view_volume(0),
        );
        assert_eq!(chunks[0].position, GridPosition::new(5, 5, 5));
        assert!(chunks.windows(2).all(|pair| pair[0].distance <= pair[1].distance));
    }

    #[test]
    fn oblique_plane_matches_exhaustive_search() {
        let layout = ChunkLayout::new([8, 8, 8], [64, 64, 64]);
        let transform = LayerTransform::identity();
        let orientation = DQuat::from_rotation_x(FRAC_PI_4) * DQuat::from_rotation_y(0.3);
        let viewport =
            SliceViewport::new(DVec3::new(30.0, 33.0, 29.0), 40, 30, 1.0).with_orientation(orientation);
        let volume = viewport.view_volume(0);

        let chunks = visible_chunks(&layout, &transform, &transform.inverse().unwrap(), &volume);
        assert_eq!(positions(&chunks), brute_force(&layout, &transform, &volume));
        assert!(!chunks.is_empty());
    }

    #[test]
    fn scaled_layer_matches_exhaustive_search() {
        let layout = ChunkLayout::new([16, 16, 4], [128, 128, 16]);
        let transform =
            LayerTransform::from_scale_translation(DVec3::new(2.0, 2.0, 10.0), DVec3::new(-40.0, 0.0, 0.0));
        let viewport = SliceViewport::new(DVec3::new(60.0, 100.0, 75.0), 64, 48, 2.0).with_depth(30.0);
        let volume = viewport.view_volume(0);

        let chunks = visible_chunks(&layout, &transform, &transform.inverse().unwrap(), &volume);
        assert_eq!(positions(&chunks), brute_force(&layout, &transform, &volume));
    }

    #[test]
    fn view_center_outside_volume_still_finds_chunks() {
        let layout = ChunkLayout::new([10, 10, 10], [40, 40, 40]);
        let transform = LayerTransform::identity();
        // centred beyond the +x face, wide enough to overlap the volume
        let viewport = SliceViewport::new(DVec3::new(55.0, 20.0, 15.0), 40, 10, 1.0);
        let volume = viewport.view_volume(0);

        let chunks = visible_chunks(&layout, &transform, &transform.inverse().unwrap(), &volume);
        assert_eq!(positions(&chunks), brute_force(&layout, &transform, &volume));
        assert!(chunks.iter().any(|chunk| chunk.position.x() == 3));
    }

    #[test]
    fn view_away_from_volume_sees_nothing() {
        let layout = ChunkLayout::new([10, 10, 10], [40, 40, 40]);
        let transform = LayerTransform::identity();
        let viewport = SliceViewport::new(DVec3::new(500.0, 500.0, 500.0), 10, 10, 1.0);
        let chunks = visible_chunks(
            &layout,
            &transform,
            &transform.inverse().unwrap(),
            &viewport.view_volume(0),
        );
        assert!(chunks.is_empty());
    }

    #[test]
    fn separating_axis_handles_rotated_boxes() {
        let volume = ViewVolume::new(DVec3::ZERO, [DVec3::X, DVec3::Y, DVec3::Z], DVec3::splat(1.0));
        // cube turned 45 degrees about z, its nearest corner 0.2 past the view face
        let rotation = DQuat::from_rotation_z(FRAC_PI_4);
        let edges = [rotation * DVec3::X, rotation * DVec3::Y, DVec3::Z];
        let clear = DVec3::new(2.0 + std::f64::consts::SQRT_2 * 0.5 + 0.2, 0.0, 0.0);
        assert!(!volume.intersects_parallelepiped(clear, edges, DVec3::splat(0.5)));
        let overlapping = DVec3::new(1.5, 0.0, 0.0);
        assert!(volume.intersects_parallelepiped(overlapping, edges, DVec3::splat(0.5)));
    }
}
