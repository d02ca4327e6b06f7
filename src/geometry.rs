use nalgebra::{Matrix3, Vector3};

use crate::enums::LocationSource;

/// Cross products shorter than this are treated as a degenerate normal.
pub(crate) const DEGENERATE_NORM: f64 = 1e-6;

/// In-plane pixel spacing in millimetres.
///
/// `row` is the distance between the centres of adjacent rows (the vertical
/// spacing), `column` the distance between adjacent columns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelSpacing {
    pub row: f64,
    pub column: f64,
}

impl PixelSpacing {
    pub fn new(row: f64, column: f64) -> Self {
        Self { row, column }
    }

    pub fn isotropic(spacing: f64) -> Self {
        Self::new(spacing, spacing)
    }
}

/// Spatial metadata of one 2D slice.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceGeometry {
    /// Patient position of the first transmitted voxel, if known.
    pub position: Option<Vector3<f64>>,
    /// Unit direction of increasing column index.
    pub row_cosine: Vector3<f64>,
    /// Unit direction of increasing row index.
    pub column_cosine: Vector3<f64>,
    pub pixel_spacing: PixelSpacing,
    pub slice_thickness: Option<f64>,
    pub slice_location: Option<f64>,
    pub instance_number: Option<i32>,
    pub frame_of_reference: String,
}

impl SliceGeometry {
    /// Create a slice geometry. Direction cosines are normalized here; a
    /// zero-length cosine stays zero and is rejected later by the volume builder.
    pub fn new(
        position: Option<Vector3<f64>>,
        row_cosine: Vector3<f64>,
        column_cosine: Vector3<f64>,
        pixel_spacing: PixelSpacing,
        frame_of_reference: impl Into<String>,
    ) -> Self {
        Self {
            position,
            row_cosine: normalize_or_zero(row_cosine),
            column_cosine: normalize_or_zero(column_cosine),
            pixel_spacing,
            slice_thickness: None,
            slice_location: None,
            instance_number: None,
            frame_of_reference: frame_of_reference.into(),
        }
    }

    /// Axial slice at `z` with identity orientation.
    pub fn axial(z: f64, pixel_spacing: PixelSpacing, frame_of_reference: impl Into<String>) -> Self {
        Self::new(
            Some(Vector3::new(0.0, 0.0, z)),
            Vector3::x(),
            Vector3::y(),
            pixel_spacing,
            frame_of_reference,
        )
    }

    pub fn with_slice_thickness(mut self, thickness: f64) -> Self {
        self.slice_thickness = Some(thickness);
        self
    }

    pub fn with_slice_location(mut self, location: f64) -> Self {
        self.slice_location = Some(location);
        self
    }

    pub fn with_instance_number(mut self, instance_number: i32) -> Self {
        self.instance_number = Some(instance_number);
        self
    }

    /// Unit normal of the slice plane, or `None` when the cosines are degenerate.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        let normal = self.row_cosine.cross(&self.column_cosine);
        let norm = normal.norm();
        (norm > DEGENERATE_NORM).then(|| normal / norm)
    }

    /// Position, unless missing or carrying a non-finite component.
    pub fn usable_position(&self) -> Option<Vector3<f64>> {
        self.position.filter(|p| p.iter().all(|c| c.is_finite()))
    }

    /// Through-plane location of the slice.
    ///
    /// The position projected onto `series_normal` is preferred. Without a
    /// usable normal the patient z coordinate stands in. After that the
    /// declared slice location, then instance number times declared thickness.
    pub fn location(&self, series_normal: Option<&Vector3<f64>>) -> Option<(f64, LocationSource)> {
        if let Some(position) = self.usable_position() {
            let (location, source) = match series_normal {
                Some(normal) => (position.dot(normal), LocationSource::ProjectedPosition),
                None => (position.z, LocationSource::PositionZ),
            };
            if location.is_finite() {
                return Some((location, source));
            }
        }
        if let Some(location) = self.slice_location.filter(|l| l.is_finite()) {
            return Some((location, LocationSource::SliceLocation));
        }
        match (self.instance_number, self.slice_thickness) {
            (Some(number), Some(thickness)) if thickness.is_finite() && thickness > 0.0 => {
                Some((number as f64 * thickness, LocationSource::InstanceThickness))
            }
            _ => None,
        }
    }
}

fn normalize_or_zero(v: Vector3<f64>) -> Vector3<f64> {
    let norm = v.norm();
    if norm > DEGENERATE_NORM && norm.is_finite() {
        v / norm
    } else {
        Vector3::zeros()
    }
}

/// Derived description of a 3D sampling grid.
///
/// Voxel `(i, j, k)` = (column, row, slice) sits at
/// `origin + direction * (i * spacing.x, j * spacing.y, k * spacing.z)`.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGeometry {
    pub origin: Vector3<f64>,
    /// Columns are the row cosine, the column cosine and the slice normal.
    pub direction: Matrix3<f64>,
    /// Column spacing, row spacing, through-plane spacing.
    pub spacing: Vector3<f64>,
    /// Columns, rows, slices.
    pub dimensions: (usize, usize, usize),
}

impl VolumeGeometry {
    pub fn new(
        origin: Vector3<f64>,
        direction: Matrix3<f64>,
        spacing: Vector3<f64>,
        dimensions: (usize, usize, usize),
    ) -> Self {
        Self {
            origin,
            direction,
            spacing,
            dimensions,
        }
    }

    /// Array shape in ndarray order (slices, rows, columns)
    pub fn shape(&self) -> (usize, usize, usize) {
        let (columns, rows, slices) = self.dimensions;
        (slices, rows, columns)
    }

    pub fn slice_normal(&self) -> Vector3<f64> {
        self.direction.column(2).into_owned()
    }

    pub fn slice_spacing(&self) -> f64 {
        self.spacing.z
    }

    pub fn index_to_physical(&self, index: &Vector3<f64>) -> Vector3<f64> {
        self.origin + self.direction * index.component_mul(&self.spacing)
    }

    /// Continuous voxel index of a physical point. Assumes an orthonormal
    /// direction matrix, which the volume builder guarantees.
    pub fn physical_to_index(&self, point: &Vector3<f64>) -> Vector3<f64> {
        (self.direction.transpose() * (point - self.origin)).component_div(&self.spacing)
    }

    /// Physical size of the grid along its own axes, voxel centre to voxel centre.
    pub fn extent(&self) -> Vector3<f64> {
        let (columns, rows, slices) = self.dimensions;
        Vector3::new(
            columns.saturating_sub(1) as f64,
            rows.saturating_sub(1) as f64,
            slices.saturating_sub(1) as f64,
        )
        .component_mul(&self.spacing)
    }
}
