use crate::error::FusionError;
use crate::geometry::SliceGeometry;

use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SERIES_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one constructed [`ImageSeries`].
///
/// Two series built from the same files still get different identities, so
/// replacing a series always invalidates what was cached for the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesId(u64);

impl SeriesId {
    fn next() -> Self {
        Self(NEXT_SERIES_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Affine map from stored sample values to physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    pub slope: f64,
    pub intercept: f64,
}

impl Rescale {
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }
}

#[derive(Debug, Clone)]
pub struct Slice {
    pub geometry: SliceGeometry,
    /// Pixel values in physical units, shape (rows, columns).
    pub pixels: Array2<f32>,
    pub rescale: Option<Rescale>,
}

impl Slice {
    pub fn new(geometry: SliceGeometry, pixels: Array2<f32>) -> Self {
        Self {
            geometry,
            pixels,
            rescale: None,
        }
    }

    /// Apply a rescale pair to the stored values.
    pub fn with_rescale(mut self, rescale: Rescale) -> Self {
        let (slope, intercept) = (rescale.slope as f32, rescale.intercept as f32);
        self.pixels.mapv_inplace(|v| v.mul_add(slope, intercept));
        self.rescale = Some(rescale);
        self
    }

    pub fn dim(&self) -> (usize, usize) {
        self.pixels.dim()
    }
}

/// An immutable, ordered image series as handed over by the loading layer.
#[derive(Debug)]
pub struct ImageSeries {
    id: SeriesId,
    uid: String,
    slices: Vec<Slice>,
}

impl ImageSeries {
    /// Build a series from decoded slices
    ///
    /// # Errors
    ///
    /// Returns an error if there are no slices or the slices differ in shape
    pub fn new(uid: impl Into<String>, slices: Vec<Slice>) -> Result<Self, FusionError> {
        if slices.is_empty() {
            return Err(FusionError::EmptySeries);
        }
        Self::validate_dimensions(&slices)?;
        Ok(Self {
            id: SeriesId::next(),
            uid: uid.into(),
            slices,
        })
    }

    pub fn id(&self) -> SeriesId {
        self.id
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Shape (rows, columns) shared by every slice
    pub fn slice_dim(&self) -> (usize, usize) {
        self.slices[0].dim()
    }

    /// Frame of reference of the first slice.
    pub fn frame_of_reference(&self) -> &str {
        &self.slices[0].geometry.frame_of_reference
    }

    /// Stack the slices named by `order` into a (slices, rows, columns) volume.
    pub fn stack(&self, order: &[usize]) -> Array3<f32> {
        let (height, width) = self.slice_dim();
        let mut volume = Array3::<f32>::zeros((order.len(), height, width));

        for (i, &index) in order.iter().enumerate() {
            volume
                .slice_mut(s![i, .., ..])
                .assign(&self.slices[index].pixels);
        }

        volume
    }

    /// Minimum and maximum finite value across all slices.
    pub fn value_range(&self) -> Option<(f32, f32)> {
        self.slices
            .par_iter()
            .filter_map(|slice| finite_range(slice.pixels.iter().copied()))
            .reduce_with(|(lo_a, hi_a), (lo_b, hi_b)| (lo_a.min(lo_b), hi_a.max(hi_b)))
    }

    fn validate_dimensions(slices: &[Slice]) -> Result<(), FusionError> {
        let expected = slices[0].dim();
        match slices.iter().position(|slice| slice.dim() != expected) {
            Some(index) => Err(FusionError::InconsistentDimensions {
                index,
                expected,
                found: slices[index].dim(),
            }),
            None => Ok(()),
        }
    }
}

pub(crate) fn finite_range(values: impl Iterator<Item = f32>) -> Option<(f32, f32)> {
    values
        .filter(|v| v.is_finite())
        .fold(None, |range, v| match range {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PixelSpacing;
    use ndarray::array;

    fn slice(z: f64, pixels: Array2<f32>) -> Slice {
        Slice::new(SliceGeometry::axial(z, PixelSpacing::isotropic(1.0), "1.2.3"), pixels)
    }

    #[test]
    fn test_empty_series_is_rejected() {
        assert!(matches!(
            ImageSeries::new("empty", vec![]),
            Err(FusionError::EmptySeries)
        ));
    }

    #[test]
    fn test_inconsistent_dimensions() {
        let result = ImageSeries::new(
            "mixed",
            vec![
                slice(0.0, Array2::zeros((2, 2))),
                slice(1.0, Array2::zeros((2, 3))),
            ],
        );
        match result {
            Err(FusionError::InconsistentDimensions {
                index,
                expected,
                found,
            }) => {
                assert_eq!(index, 1);
                assert_eq!(expected, (2, 2));
                assert_eq!(found, (2, 3));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_identities_are_unique() {
        let a = ImageSeries::new("same", vec![slice(0.0, Array2::zeros((1, 1)))]).unwrap();
        let b = ImageSeries::new("same", vec![slice(0.0, Array2::zeros((1, 1)))]).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_rescale_is_applied() {
        let s = slice(0.0, array![[0.0, 10.0]]).with_rescale(Rescale::new(2.0, -1024.0));
        assert_eq!(s.pixels, array![[-1024.0, -1004.0]]);
    }

    #[test]
    fn test_stack_follows_order() {
        let series = ImageSeries::new(
            "stack",
            vec![
                slice(2.0, array![[2.0]]),
                slice(0.0, array![[0.0]]),
                slice(1.0, array![[1.0]]),
            ],
        )
        .unwrap();
        let volume = series.stack(&[1, 2, 0]);
        assert_eq!(volume.shape(), &[3, 1, 1]);
        assert_eq!(volume.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_value_range_ignores_nan() {
        let series = ImageSeries::new(
            "range",
            vec![
                slice(0.0, array![[f32::NAN, 3.0]]),
                slice(1.0, array![[-2.0, 8.0]]),
            ],
        )
        .unwrap();
        assert_eq!(series.value_range(), Some((-2.0, 8.0)));
    }
}
