//! Fast 2D alignment: pick or blend the overlay slice at a base location and
//! map it into the base slice's pixel grid.

use crate::error::FusionError;
use crate::geometry::SliceGeometry;
use crate::interpolator::Interpolator;
use crate::series::{ImageSeries, Slice};
use crate::volume_builder::BuiltVolume;

use ndarray::{Array2, ArrayView2, Zip};
use tracing::debug;

/// Default tolerance, in millimetres, for treating two slice locations as equal.
pub const DEFAULT_MATCH_TOLERANCE: f64 = 0.01;

/// Marks canvas pixels that no overlay data maps onto.
pub const NO_OVERLAY: f32 = f32::NAN;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SliceMatch {
    /// An overlay slice lies within tolerance of the base location.
    Exact { index: usize },
    /// The base location lies between two overlay slices.
    Interpolated {
        lower: usize,
        upper: usize,
        weight: f64,
    },
    /// The base location is outside the overlay's covered range.
    Outside,
}

/// Manual in-plane translation in base pixels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PixelOffset {
    /// Columns to the right.
    pub dx: i64,
    /// Rows down.
    pub dy: i64,
}

impl PixelOffset {
    pub fn new(dx: i64, dy: i64) -> Self {
        Self { dx, dy }
    }
}

/// Overlay pixels for one base slice before the in-plane transform.
#[derive(Debug, Clone)]
pub struct MatchedSlice<'a> {
    pub pixels: Array2<f32>,
    pub geometry: &'a SliceGeometry,
    pub matched: SliceMatch,
}

pub struct SpatialMatcher {
    tolerance: f64,
}

impl Default for SpatialMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_TOLERANCE)
    }
}

impl SpatialMatcher {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance: tolerance.abs(),
        }
    }

    /// Locate `location` among ascending overlay locations.
    pub fn find(&self, location: f64, overlay_locations: &[f64]) -> SliceMatch {
        if !location.is_finite() {
            return SliceMatch::Outside;
        }
        let upper = overlay_locations.partition_point(|&l| l < location);

        let nearest = [upper.checked_sub(1), Some(upper)]
            .into_iter()
            .flatten()
            .filter_map(|i| Some((i, (overlay_locations.get(i)? - location).abs())))
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((index, distance)) = nearest {
            if distance < self.tolerance {
                return SliceMatch::Exact { index };
            }
        }

        if upper == 0 || upper >= overlay_locations.len() {
            return SliceMatch::Outside;
        }
        let lower = upper - 1;
        let (low, high) = (overlay_locations[lower], overlay_locations[upper]);
        SliceMatch::Interpolated {
            lower,
            upper,
            weight: (location - low) / (high - low),
        }
    }

    /// Elementwise `lower * (1 - weight) + upper * weight`
    ///
    /// # Errors
    ///
    /// Returns an error if the two slices differ in shape
    pub fn interpolate(
        lower: &ArrayView2<f32>,
        upper: &ArrayView2<f32>,
        weight: f64,
    ) -> Result<Array2<f32>, FusionError> {
        if lower.dim() != upper.dim() {
            return Err(FusionError::ShapeMismatch {
                expected: lower.dim(),
                found: upper.dim(),
            });
        }
        let weight = weight as f32;
        let keep = 1.0 - weight;
        Ok(Zip::from(lower)
            .and(upper)
            .map_collect(|&a, &b| a * keep + b * weight))
    }

    /// Overlay pixels at the base location, or `None` outside the overlay.
    ///
    /// # Errors
    ///
    /// Returns an error if the bracketing overlay slices differ in shape
    pub fn match_slice<'a>(
        &self,
        location: f64,
        overlay: &'a ImageSeries,
        overlay_volume: &BuiltVolume,
    ) -> Result<Option<MatchedSlice<'a>>, FusionError> {
        let matched = self.find(location, &overlay_volume.locations);
        let slice = |i: usize| ordered_slice(overlay, overlay_volume, i);

        let result = match matched {
            SliceMatch::Outside => None,
            SliceMatch::Exact { index } => Some(MatchedSlice {
                pixels: slice(index).pixels.clone(),
                geometry: &slice(index).geometry,
                matched,
            }),
            SliceMatch::Interpolated {
                lower,
                upper,
                weight,
            } => {
                let pixels = Self::interpolate(
                    &slice(lower).pixels.view(),
                    &slice(upper).pixels.view(),
                    weight,
                )?;
                Some(MatchedSlice {
                    pixels,
                    geometry: &slice(lower).geometry,
                    matched,
                })
            }
        };
        debug!(location, ?matched, "Matched overlay slice");
        Ok(result)
    }
}

/// Scale and translation taking overlay pixels into the base pixel grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InPlaneTransform {
    /// Base pixels per overlay pixel along rows and columns.
    pub scale_row: f64,
    pub scale_column: f64,
    pub offset: PixelOffset,
}

impl InPlaneTransform {
    /// Transform derived from the two slices' spacing and positions.
    pub fn between(base: &SliceGeometry, overlay: &SliceGeometry) -> Self {
        let scale_row = ratio(overlay.pixel_spacing.row, base.pixel_spacing.row);
        let scale_column = ratio(overlay.pixel_spacing.column, base.pixel_spacing.column);

        let offset = match (base.usable_position(), overlay.usable_position()) {
            (Some(base_position), Some(overlay_position)) => {
                let delta = overlay_position - base_position;
                PixelOffset {
                    dx: to_pixels(delta.dot(&base.row_cosine), base.pixel_spacing.column),
                    dy: to_pixels(delta.dot(&base.column_cosine), base.pixel_spacing.row),
                }
            }
            _ => PixelOffset::default(),
        };

        Self {
            scale_row,
            scale_column,
            offset,
        }
    }

    /// Replace the computed translation.
    pub fn with_offset(mut self, offset: PixelOffset) -> Self {
        self.offset = offset;
        self
    }

    /// Size, in base pixels, covered by an overlay slice of shape `dim`.
    pub fn scaled_dim(&self, dim: (usize, usize)) -> (usize, usize) {
        let (rows, columns) = dim;
        (
            (rows as f64 * self.scale_row).round() as usize,
            (columns as f64 * self.scale_column).round() as usize,
        )
    }

    /// Paint the overlay onto a canvas of `canvas_dim`. Canvas pixels not
    /// covered by the scaled overlay hold [`NO_OVERLAY`].
    pub fn apply(&self, overlay: &ArrayView2<f32>, canvas_dim: (usize, usize)) -> Array2<f32> {
        let (rows, columns) = overlay.dim();
        let (scaled_rows, scaled_columns) = self.scaled_dim((rows, columns));
        let mut canvas = Array2::from_elem(canvas_dim, NO_OVERLAY);
        if rows == 0 || columns == 0 || scaled_rows == 0 || scaled_columns == 0 {
            return canvas;
        }

        let row_factor = rows as f64 / scaled_rows as f64;
        let column_factor = columns as f64 / scaled_columns as f64;
        let PixelOffset { dx, dy } = self.offset;

        Zip::indexed(&mut canvas).par_for_each(|(r, c), value| {
            let local_row = r as i64 - dy;
            let local_column = c as i64 - dx;
            if local_row < 0
                || local_column < 0
                || local_row >= scaled_rows as i64
                || local_column >= scaled_columns as i64
            {
                return;
            }
            // pixel centres of the scaled overlay back in overlay coordinates
            let src_y = (local_row as f64 + 0.5) * row_factor - 0.5;
            let src_x = (local_column as f64 + 0.5) * column_factor - 0.5;
            *value = Interpolator::bilinear_interpolate(overlay, src_y as f32, src_x as f32);
        });

        canvas
    }
}

fn ordered_slice<'a>(series: &'a ImageSeries, volume: &BuiltVolume, index: usize) -> &'a Slice {
    &series.slices()[volume.order[index]]
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    let r = numerator / denominator;
    if r.is_finite() && r > 0.0 { r } else { 1.0 }
}

fn to_pixels(distance: f64, spacing: f64) -> i64 {
    if spacing.is_finite() && spacing > 0.0 {
        (distance / spacing).round() as i64
    } else {
        0
    }
}
