use crate::layout::ScaleLevel;
use crate::transform::LayerTransform;

/// Pick the resolution level to render
///
/// `pixel_size` is display units per screen pixel and `render_scale_target`
/// the largest acceptable voxel size in screen pixels. The coarsest level
/// whose voxels are no larger than the target wins; if even the finest
/// level is too coarse the finest is used. Returns `None` for no levels.
pub fn select_scale_level(
    scales: &[ScaleLevel],
    transform: &LayerTransform,
    pixel_size: f64,
    render_scale_target: f64,
) -> Option<usize> {
    let sizes: Vec<f64> = scales
        .iter()
        .map(|scale| scale.layout.voxel_size(transform) / pixel_size)
        .collect();

    let coarsest_within_target = sizes
        .iter()
        .enumerate()
        .filter(|(_, size)| **size <= render_scale_target)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, _)| index);

    coarsest_within_target.or_else(|| {
        sizes
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
    })
}
