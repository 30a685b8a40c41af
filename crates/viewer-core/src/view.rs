use glam::{DQuat, DVec3};

use crate::error::VisibilityError;
use crate::intersect::ViewVolume;

/// Camera state of a slice view
///
/// The view is a rectangle of `width_px` by `height_px` screen pixels
/// centred on `center`, lying in the plane spanned by the rotated x and y
/// axes. `depth` gives the view a slab thickness along the rotated z axis;
/// zero is a plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceViewport {
    pub center: DVec3,
    pub orientation: DQuat,
    pub width_px: u32,
    pub height_px: u32,
    /// Display units per screen pixel
    pub pixel_size: f64,
    pub depth: f64,
    /// Largest acceptable voxel size in screen pixels
    pub render_scale_target: f64,
    /// Border around the view, in pixels, whose chunks are prefetched
    pub prefetch_margin_px: u32,
}

impl SliceViewport {
    pub fn new(center: DVec3, width_px: u32, height_px: u32, pixel_size: f64) -> Self {
        Self {
            center,
            orientation: DQuat::IDENTITY,
            width_px,
            height_px,
            pixel_size,
            depth: 0.0,
            render_scale_target: 1.0,
            prefetch_margin_px: 0,
        }
    }

    pub fn with_orientation(mut self, orientation: DQuat) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_depth(mut self, depth: f64) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_render_scale_target(mut self, target: f64) -> Self {
        self.render_scale_target = target;
        self
    }

    pub fn with_prefetch_margin(mut self, margin_px: u32) -> Self {
        self.prefetch_margin_px = margin_px;
        self
    }

    pub fn validate(&self) -> Result<(), VisibilityError> {
        let invalid = |reason: &str| Err(VisibilityError::InvalidViewport(reason.to_string()));
        if self.width_px == 0 || self.height_px == 0 {
            return invalid("viewport has zero area");
        }
        if !self.center.is_finite() {
            return invalid("center is not finite");
        }
        if !(self.pixel_size.is_finite() && self.pixel_size > 0.0) {
            return invalid("pixel size must be positive");
        }
        if !(self.depth.is_finite() && self.depth >= 0.0) {
            return invalid("depth must be non-negative");
        }
        if !(self.render_scale_target.is_finite() && self.render_scale_target > 0.0) {
            return invalid("render scale target must be positive");
        }
        if !self.orientation.is_finite() || !self.orientation.is_normalized() {
            return invalid("orientation is not a unit quaternion");
        }
        Ok(())
    }

    /// Rotated x, y and z axes of the view
    pub fn axes(&self) -> [DVec3; 3] {
        [
            self.orientation * DVec3::X,
            self.orientation * DVec3::Y,
            self.orientation * DVec3::Z,
        ]
    }

    /// Volume covered by the view grown by `margin_px` pixels in-plane
    pub fn view_volume(&self, margin_px: u32) -> ViewVolume {
        let margin = f64::from(margin_px);
        ViewVolume::new(
            self.center,
            self.axes(),
            DVec3::new(
                (f64::from(self.width_px) / 2.0 + margin) * self.pixel_size,
                (f64::from(self.height_px) / 2.0 + margin) * self.pixel_size,
                self.depth / 2.0,
            ),
        )
    }
}
