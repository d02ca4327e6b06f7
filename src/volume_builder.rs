//! Assembly of a [`VolumeGeometry`] from the per-slice geometry of a series.
//!
//! Slices are ordered by their through-plane location (see
//! [`SliceGeometry::location`]); slices without any location signal are
//! dropped and counted. The through-plane spacing is taken from the first
//! tier of an ordered strategy list that succeeds:
//!
//!  1. consecutive position differences projected onto the slice normal,
//!     exact for oblique acquisitions
//!  2. Euclidean distance between consecutive positions, used when the normal
//!     is degenerate; it overestimates by `1 / cos θ` for a tilt angle `θ`
//!  3. differences between declared slice locations
//!  4. the declared slice thickness, the only option for a single slice

use crate::enums::{LocationSource, SpacingSource};
use crate::error::GeometryError;
use crate::geometry::{DEGENERATE_NORM, PixelSpacing, SliceGeometry, VolumeGeometry};
use crate::series::ImageSeries;

use nalgebra::{Matrix3, Vector3};
use tracing::{debug, warn};

/// Differences below this are treated as duplicate slice positions.
const MIN_SLICE_GAP: f64 = 1e-6;

/// A slice that survived ordering, with its through-plane location.
#[derive(Debug, Clone, Copy)]
pub struct OrderedSlice<'a> {
    pub geometry: &'a SliceGeometry,
    pub location: f64,
    pub source: LocationSource,
}

/// One tier of the spacing fallback chain.
pub type SpacingStrategy = fn(&[OrderedSlice<'_>], Option<&Vector3<f64>>) -> Option<f64>;

/// Default fallback chain, tried in order.
pub const DEFAULT_SPACING_STRATEGIES: [(SpacingSource, SpacingStrategy); 4] = [
    (SpacingSource::NormalProjection, normal_projection),
    (SpacingSource::EuclideanDistance, euclidean_distance),
    (SpacingSource::LocationDifference, location_difference),
    (SpacingSource::DeclaredThickness, declared_thickness),
];

/// Geometry of a series together with how it was derived.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltVolume {
    pub geometry: VolumeGeometry,
    /// Indices into [`ImageSeries::slices`] in through-plane order.
    pub order: Vec<usize>,
    /// Through-plane location of each entry of `order`, ascending.
    pub locations: Vec<f64>,
    /// Number of slices left out for lack of a location.
    pub dropped: usize,
    pub spacing_source: SpacingSource,
}

impl BuiltVolume {
    /// Geometry of the slice at sorted position `index`.
    pub fn slice_geometry<'a>(&self, series: &'a ImageSeries, index: usize) -> Option<&'a SliceGeometry> {
        let &slice = self.order.get(index)?;
        series.slices().get(slice).map(|s| &s.geometry)
    }
}

pub struct VolumeGeometryBuilder {
    strategies: Vec<(SpacingSource, SpacingStrategy)>,
}

impl Default for VolumeGeometryBuilder {
    fn default() -> Self {
        Self {
            strategies: DEFAULT_SPACING_STRATEGIES.to_vec(),
        }
    }
}

impl VolumeGeometryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the spacing fallback chain.
    pub fn with_strategies(strategies: Vec<(SpacingSource, SpacingStrategy)>) -> Self {
        Self { strategies }
    }

    /// Build the volume geometry of a series
    ///
    /// # Errors
    ///
    /// Returns an error if no slice has a location, the through-plane spacing
    /// cannot be determined by any strategy, or the orientation is degenerate
    pub fn build(&self, series: &ImageSeries) -> Result<BuiltVolume, GeometryError> {
        let slices = series.slices();
        let normal = slices.iter().find_map(|slice| slice.geometry.normal());

        let mut ordered: Vec<(usize, OrderedSlice<'_>)> = slices
            .iter()
            .enumerate()
            .filter_map(|(index, slice)| {
                let (location, source) = slice.geometry.location(normal.as_ref())?;
                Some((
                    index,
                    OrderedSlice {
                        geometry: &slice.geometry,
                        location,
                        source,
                    },
                ))
            })
            .collect();

        let dropped = slices.len() - ordered.len();
        if ordered.is_empty() {
            return Err(GeometryError::NoPositionedSlices {
                total: slices.len(),
            });
        }
        if dropped > 0 {
            warn!(
                series = series.uid(),
                dropped, "Dropped slices without a usable position"
            );
        }

        ordered.sort_by(|(ia, a), (ib, b)| a.location.total_cmp(&b.location).then(ia.cmp(ib)));
        let (order, ordered): (Vec<usize>, Vec<OrderedSlice<'_>>) = ordered.into_iter().unzip();

        let (spacing_source, slice_spacing) = self
            .strategies
            .iter()
            .find_map(|(source, strategy)| {
                let spacing = strategy(ordered.as_slice(), normal.as_ref())?;
                (spacing.is_finite() && spacing > 0.0).then_some((*source, spacing))
            })
            .ok_or(GeometryError::NoThroughPlaneSpacing)?;
        debug!(
            series = series.uid(),
            %spacing_source, slice_spacing, "Resolved through-plane spacing"
        );

        let reference = ordered[0].geometry;
        let PixelSpacing { row, column } = reference.pixel_spacing;
        if !(row.is_finite() && row > 0.0 && column.is_finite() && column > 0.0) {
            return Err(GeometryError::InvalidPixelSpacing { row, column });
        }
        let direction = Self::direction_matrix(reference, normal.as_ref(), &ordered)?;
        let slice_normal = direction.column(2).into_owned();
        let origin = Self::origin(&ordered, &slice_normal);

        let (rows, columns) = series.slice_dim();
        let spacing = Vector3::new(
            reference.pixel_spacing.column,
            reference.pixel_spacing.row,
            slice_spacing,
        );

        Ok(BuiltVolume {
            geometry: VolumeGeometry::new(origin, direction, spacing, (columns, rows, ordered.len())),
            order,
            locations: ordered.iter().map(|s| s.location).collect(),
            dropped,
            spacing_source,
        })
    }

    /// Orthonormal direction matrix with the row cosine, column cosine and
    /// normal as columns. Without a usable normal the stacking direction of
    /// the positions is used instead.
    fn direction_matrix(
        reference: &SliceGeometry,
        normal: Option<&Vector3<f64>>,
        ordered: &[OrderedSlice<'_>],
    ) -> Result<Matrix3<f64>, GeometryError> {
        let normal = match normal {
            Some(normal) => *normal,
            None => stacking_direction(ordered).ok_or(GeometryError::DegenerateOrientation)?,
        };

        let row = reference.row_cosine - normal * reference.row_cosine.dot(&normal);
        let row = normalized(row)
            .or_else(|| normalized(reference.column_cosine.cross(&normal)))
            .ok_or(GeometryError::DegenerateOrientation)?;
        let column = normalized(normal.cross(&row)).ok_or(GeometryError::DegenerateOrientation)?;
        let normal = row.cross(&column);

        Ok(Matrix3::from_columns(&[row, column, normal]))
    }

    /// Position of the first ordered slice. When it has no position of its
    /// own, the nearest positioned slice is moved back along the normal.
    fn origin(ordered: &[OrderedSlice<'_>], normal: &Vector3<f64>) -> Vector3<f64> {
        let first = ordered[0].location;
        ordered
            .iter()
            .find_map(|slice| {
                let position = slice.geometry.usable_position()?;
                Some(position - normal * (slice.location - first))
            })
            .unwrap_or_else(|| normal * first)
    }
}

fn normalized(v: Vector3<f64>) -> Option<Vector3<f64>> {
    let norm = v.norm();
    (norm > DEGENERATE_NORM).then(|| v / norm)
}

fn stacking_direction(ordered: &[OrderedSlice<'_>]) -> Option<Vector3<f64>> {
    let mut positions = ordered.iter().filter_map(|s| s.geometry.usable_position());
    let first = positions.next()?;
    let last = positions.last()?;
    normalized(last - first)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .filter(|gap| *gap > MIN_SLICE_GAP)
        .fold((0.0, 0usize), |(sum, count), gap| (sum + gap, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn positioned_pairs<'a>(
    ordered: &'a [OrderedSlice<'a>],
) -> impl Iterator<Item = (Vector3<f64>, Vector3<f64>)> + 'a {
    ordered
        .windows(2)
        .filter_map(|pair| Some((pair[0].geometry.usable_position()?, pair[1].geometry.usable_position()?)))
}

/// Mean `|Δp · n|` over consecutive positioned slices.
pub fn normal_projection(ordered: &[OrderedSlice<'_>], normal: Option<&Vector3<f64>>) -> Option<f64> {
    let normal = normal?;
    mean(positioned_pairs(ordered).map(|(a, b)| (b - a).dot(normal).abs()))
}

/// Mean `|Δp|` over consecutive positioned slices.
pub fn euclidean_distance(ordered: &[OrderedSlice<'_>], _normal: Option<&Vector3<f64>>) -> Option<f64> {
    mean(positioned_pairs(ordered).map(|(a, b)| (b - a).norm()))
}

/// Mean difference between consecutive declared locations.
pub fn location_difference(ordered: &[OrderedSlice<'_>], _normal: Option<&Vector3<f64>>) -> Option<f64> {
    mean(
        ordered
            .windows(2)
            .filter(|pair| pair[0].source == pair[1].source)
            .map(|pair| (pair[1].location - pair[0].location).abs()),
    )
}

/// Declared thickness of the first slice that has one.
pub fn declared_thickness(ordered: &[OrderedSlice<'_>], _normal: Option<&Vector3<f64>>) -> Option<f64> {
    ordered
        .iter()
        .find_map(|s| s.geometry.slice_thickness.filter(|t| t.is_finite() && *t > 0.0))
}
