use glam::{DMat4, DVec3, DVec4};

/// Columns whose normalized determinant falls below this are treated as singular
const SINGULAR_EPSILON: f64 = 1e-9;

/// Affine map from a layer's base voxel coordinates into display coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerTransform {
    matrix: DMat4,
}

impl LayerTransform {
    pub fn identity() -> Self {
        Self {
            matrix: DMat4::IDENTITY,
        }
    }

    pub fn from_matrix(matrix: DMat4) -> Self {
        Self { matrix }
    }

    /// Scale each axis, then translate
    pub fn from_scale_translation(scale: DVec3, translation: DVec3) -> Self {
        Self {
            matrix: DMat4::from_cols(
                DVec4::new(scale.x, 0.0, 0.0, 0.0),
                DVec4::new(0.0, scale.y, 0.0, 0.0),
                DVec4::new(0.0, 0.0, scale.z, 0.0),
                translation.extend(1.0),
            ),
        }
    }

    pub fn matrix(&self) -> DMat4 {
        self.matrix
    }

    /// Display-space direction of one step along layer axis `axis`
    pub fn axis(&self, axis: usize) -> DVec3 {
        self.matrix.col(axis).truncate()
    }

    pub fn to_display(&self, point: DVec3) -> DVec3 {
        self.matrix.transform_point3(point)
    }

    /// Checks the transform is a finite, invertible affine map
    pub fn validate(&self) -> Result<(), String> {
        if !self.matrix.is_finite() {
            return Err("matrix has non-finite entries".to_string());
        }
        if self.matrix.row(3) != DVec4::W {
            return Err("projective transforms are not supported".to_string());
        }
        let lengths = DVec3::new(
            self.axis(0).length(),
            self.axis(1).length(),
            self.axis(2).length(),
        );
        let scale = lengths.x * lengths.y * lengths.z;
        if scale == 0.0 {
            return Err("matrix maps an axis to zero".to_string());
        }
        let normalized = self.matrix.determinant() / scale;
        if normalized.abs() < SINGULAR_EPSILON {
            return Err(format!(
                "matrix is singular (determinant {:.3e})",
                self.matrix.determinant()
            ));
        }
        Ok(())
    }

    /// Display to layer map; fails with the reason the transform is invalid
    pub fn inverse(&self) -> Result<DMat4, String> {
        self.validate()?;
        Ok(self.matrix.inverse())
    }
}

impl Default for LayerTransform {
    fn default() -> Self {
        Self::identity()
    }
}

/// Display axes a layer actually spans
///
/// A layer one voxel thick along some axis (a 2D image placed in 3D) spans
/// fewer display dimensions than the display has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayDimensions {
    spanned: [bool; 3],
}

impl DisplayDimensions {
    /// `extent` is the layer's size in voxels along each layer axis
    pub fn spanned_by(transform: &LayerTransform, extent: [u64; 3]) -> Self {
        let mut spanned = [false; 3];
        for (axis, &size) in extent.iter().enumerate() {
            if size <= 1 {
                continue;
            }
            let direction = transform.axis(axis);
            for (dim, flag) in spanned.iter_mut().enumerate() {
                if direction[dim].abs() > f64::EPSILON {
                    *flag = true;
                }
            }
        }
        Self { spanned }
    }

    pub fn all() -> Self {
        Self {
            spanned: [true; 3],
        }
    }

    pub fn is_spanned(&self, dim: usize) -> bool {
        self.spanned.get(dim).copied().unwrap_or(false)
    }

    pub fn rank(&self) -> usize {
        self.spanned.iter().filter(|spanned| **spanned).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..3).filter(|dim| self.spanned[*dim])
    }
}
