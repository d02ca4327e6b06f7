use crate::colormap::{ColormapFn, ColormapRegistry, DEFAULT_COLORMAP};
use crate::error::FusionError;
use crate::series::finite_range;

use image::{Rgb, RgbImage};
use ndarray::{Array2, ArrayView2, Zip};

/// Linear contrast mapping given by its centre (`level`) and width (`window`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLevel {
    pub window: f32,
    pub level: f32,
}

impl WindowLevel {
    pub fn new(window: f32, level: f32) -> Self {
        Self { window, level }
    }

    /// Window spanning `[min, max]`.
    pub fn from_range(min: f32, max: f32) -> Self {
        Self {
            window: max - min,
            level: min + (max - min) / 2.0,
        }
    }

    /// Window spanning the finite values of `values`, if there are any.
    pub fn from_values(values: &ArrayView2<f32>) -> Option<Self> {
        finite_range(values.iter().copied()).map(|(min, max)| Self::from_range(min, max))
    }

    /// `clip((value - (level - window / 2)) / window, 0, 1)`.
    ///
    /// A degenerate window maps everything to zero. NaN stays NaN so that
    /// "no overlay" pixels survive normalization.
    #[inline]
    pub fn normalize(&self, value: f32) -> f32 {
        if value.is_nan() {
            return value;
        }
        if !(self.window > 0.0) || !self.window.is_finite() || !self.level.is_finite() {
            return 0.0;
        }
        ((value - (self.level - self.window / 2.0)) / self.window).clamp(0.0, 1.0)
    }

    pub fn normalize_slice(&self, values: &ArrayView2<f32>) -> Array2<f32> {
        values.mapv(|v| self.normalize(v))
    }
}

/// Per-frame blend parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendParams {
    pub opacity: f32,
    pub threshold: f32,
    pub colormap: String,
    pub window: WindowLevel,
}

impl Default for BlendParams {
    fn default() -> Self {
        Self {
            opacity: 0.5,
            threshold: 0.0,
            colormap: DEFAULT_COLORMAP.to_string(),
            window: WindowLevel::new(1.0, 0.5),
        }
    }
}

#[inline]
fn unit(value: f32) -> f32 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

#[inline]
fn to_byte(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Colorizes, thresholds and alpha-blends an aligned overlay onto a base slice.
#[derive(Debug, Clone, Default)]
pub struct FusionBlender {
    registry: ColormapRegistry,
}

impl FusionBlender {
    pub fn new(registry: ColormapRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ColormapRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ColormapRegistry {
        &mut self.registry
    }

    /// Blend `overlay` onto `base`
    ///
    /// `base` holds display-normalized gray values in [0, 1]; `overlay` holds
    /// raw overlay values aligned to the base grid, NaN where there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the two arrays differ in shape
    pub fn blend(
        &self,
        base: &ArrayView2<f32>,
        overlay: &ArrayView2<f32>,
        params: &BlendParams,
    ) -> Result<RgbImage, FusionError> {
        if base.dim() != overlay.dim() {
            return Err(FusionError::ShapeMismatch {
                expected: base.dim(),
                found: overlay.dim(),
            });
        }
        let colormap = self.registry.resolve(&params.colormap);
        let opacity = unit(params.opacity);
        let threshold = unit(params.threshold);
        let window = params.window;

        let pixels = Zip::from(base).and(overlay).par_map_collect(|&b, &o| {
            let normalized = window.normalize(o);
            // a threshold of 1 hides even saturated pixels
            let visible = threshold < 1.0 && !normalized.is_nan() && normalized >= threshold;
            let alpha = if visible { opacity } else { 0.0 };
            let gray = unit(b);
            let color = colormap(unit(normalized));
            color.map(|c| to_byte(gray * (1.0 - alpha) + c * alpha))
        });
        Ok(Self::rgb_image(&pixels))
    }

    /// The overlay alone through window and colormap; "no overlay" is black.
    pub fn colorize(&self, overlay: &ArrayView2<f32>, window: WindowLevel, colormap: &str) -> RgbImage {
        let colormap: ColormapFn = self.registry.resolve(colormap);
        let pixels = overlay.mapv(|o| {
            let normalized = window.normalize(o);
            if normalized.is_nan() {
                [0; 3]
            } else {
                colormap(normalized).map(to_byte)
            }
        });
        Self::rgb_image(&pixels)
    }

    /// Base slice as an unblended RGB image.
    pub fn grayscale(base: &ArrayView2<f32>) -> RgbImage {
        let pixels = base.mapv(|b| [to_byte(unit(b)); 3]);
        Self::rgb_image(&pixels)
    }

    fn rgb_image(pixels: &Array2<[u8; 3]>) -> RgbImage {
        let (_, width) = pixels.dim();
        RgbImage::from_fn(width as u32, pixels.nrows() as u32, |x, y| {
            Rgb(pixels[[y as usize, x as usize]])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colormap::hot;
    use ndarray::array;
    use rstest::rstest;

    fn base() -> Array2<f32> {
        array![[0.0, 0.25, 0.5], [0.75, 1.0, 0.1]]
    }

    fn overlay() -> Array2<f32> {
        array![[0.0, 100.0, 200.0], [300.0, f32::NAN, 400.0]]
    }

    fn params(opacity: f32, threshold: f32) -> BlendParams {
        BlendParams {
            opacity,
            threshold,
            colormap: "hot".to_string(),
            window: WindowLevel::new(400.0, 200.0),
        }
    }

    #[rstest]
    #[case(WindowLevel::new(400.0, 200.0), 100.0, 0.25)]
    #[case(WindowLevel::new(400.0, 200.0), -50.0, 0.0)]
    #[case(WindowLevel::new(400.0, 200.0), 900.0, 1.0)]
    #[case(WindowLevel::new(0.0, 200.0), 100.0, 0.0)]
    #[case(WindowLevel::new(-10.0, 200.0), 100.0, 0.0)]
    fn test_normalize(#[case] window: WindowLevel, #[case] value: f32, #[case] expected: f32) {
        assert_eq!(window.normalize(value), expected);
    }

    #[test]
    fn test_normalize_keeps_no_overlay() {
        assert!(WindowLevel::new(0.0, 0.0).normalize(f32::NAN).is_nan());
    }

    #[test]
    fn test_from_values() {
        let window = WindowLevel::from_values(&overlay().view()).unwrap();
        assert_eq!(window, WindowLevel::new(400.0, 200.0));
    }

    #[rstest]
    #[case(0.0)]
    #[case(0.7)]
    fn test_zero_opacity_reproduces_base(#[case] threshold: f32) {
        let blender = FusionBlender::default();
        let composite = blender
            .blend(&base().view(), &overlay().view(), &params(0.0, threshold))
            .unwrap();
        assert_eq!(composite, FusionBlender::grayscale(&base().view()));
    }

    #[test]
    fn test_full_opacity_reproduces_colorized_overlay() {
        let blender = FusionBlender::default();
        let composite = blender
            .blend(&base().view(), &overlay().view(), &params(1.0, 0.0))
            .unwrap();
        let colorized = blender.colorize(&overlay().view(), WindowLevel::new(400.0, 200.0), "hot");
        let gray = FusionBlender::grayscale(&base().view());
        for (x, y, pixel) in composite.enumerate_pixels() {
            if overlay()[[y as usize, x as usize]].is_nan() {
                assert_eq!(pixel, gray.get_pixel(x, y));
            } else {
                assert_eq!(pixel, colorized.get_pixel(x, y));
            }
        }
    }

    #[rstest]
    #[case(0.5)]
    #[case(1.0)]
    fn test_threshold_one_suppresses_everything(#[case] opacity: f32) {
        let blender = FusionBlender::default();
        let saturated = Array2::from_elem((2, 3), 10_000.0f32);
        let composite = blender
            .blend(&base().view(), &saturated.view(), &params(opacity, 1.0))
            .unwrap();
        assert_eq!(composite, FusionBlender::grayscale(&base().view()));
    }

    #[test]
    fn test_threshold_masks_low_values() {
        let blender = FusionBlender::default();
        let composite = blender
            .blend(&base().view(), &overlay().view(), &params(1.0, 0.5))
            .unwrap();
        let gray = FusionBlender::grayscale(&base().view());
        // 100 normalizes to 0.25, below the threshold
        assert_eq!(composite.get_pixel(1, 0), gray.get_pixel(1, 0));
        // 300 normalizes to 0.75
        let expected = Rgb(hot(0.75).map(to_byte));
        assert_eq!(*composite.get_pixel(0, 1), expected);
    }

    #[test]
    fn test_half_opacity() {
        let blender = FusionBlender::default();
        let base = Array2::from_elem((1, 1), 0.0f32);
        let overlay = Array2::from_elem((1, 1), 400.0f32);
        let composite = blender
            .blend(&base.view(), &overlay.view(), &params(0.5, 0.0))
            .unwrap();
        assert_eq!(*composite.get_pixel(0, 0), Rgb([128, 128, 128]));
    }

    #[test]
    fn test_out_of_range_user_input_is_absorbed() {
        let blender = FusionBlender::default();
        let bad = BlendParams {
            opacity: 3.0,
            threshold: -1.0,
            colormap: "unknown".to_string(),
            window: WindowLevel::new(-5.0, f32::NAN),
        };
        let composite = blender.blend(&base().view(), &overlay().view(), &bad).unwrap();
        assert_eq!(composite.dimensions(), (3, 2));
    }

    #[test]
    fn test_blend_shape_mismatch() {
        let blender = FusionBlender::default();
        let overlay = Array2::<f32>::zeros((3, 3));
        let result = blender.blend(&base().view(), &overlay.view(), &params(0.5, 0.0));
        assert!(matches!(result, Err(FusionError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_blend_is_deterministic() {
        let blender = FusionBlender::default();
        let first = blender.blend(&base().view(), &overlay().view(), &params(0.6, 0.2)).unwrap();
        let second = blender.blend(&base().view(), &overlay().view(), &params(0.6, 0.2)).unwrap();
        assert_eq!(first, second);
    }
}
