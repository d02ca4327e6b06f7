use crate::enums::Interpolation;

use ndarray::{ArrayView2, ArrayView3};

pub(crate) struct Interpolator;

impl Interpolator {
    /// Bilinear sample of a slice at continuous (row, column) coordinates,
    /// clamped to the slice bounds.
    #[inline]
    pub(crate) fn bilinear_interpolate(slice: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
        let (height, width) = slice.dim();

        let y = y.max(0.0).min((height - 1) as f32);
        let x = x.max(0.0).min((width - 1) as f32);

        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dy = y - y0 as f32;
        let dx = x - x0 as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let v00 = slice[[y0, x0]];
        let v01 = slice[[y0, x1]];
        let v10 = slice[[y1, x0]];
        let v11 = slice[[y1, x1]];

        let v0 = v00.mul_add(one_minus_dx, v01 * dx);
        let v1 = v10.mul_add(one_minus_dx, v11 * dx);

        v0.mul_add(one_minus_dy, v1 * dy)
    }

    /// Sample a (slices, rows, columns) volume at a continuous index.
    ///
    /// Taps that fall outside the volume read as zero, so samples near the
    /// border are attenuated and samples far outside are exactly zero.
    #[inline]
    pub(crate) fn sample(volume: &ArrayView3<f32>, z: f64, y: f64, x: f64, method: Interpolation) -> f32 {
        match method {
            Interpolation::Nearest => Self::nearest(volume, z, y, x),
            Interpolation::Linear => Self::trilinear(volume, z, y, x),
            Interpolation::Cubic => Self::tricubic(volume, z, y, x),
        }
    }

    #[inline]
    fn tap(volume: &ArrayView3<f32>, z: isize, y: isize, x: isize) -> f32 {
        let (depth, height, width) = volume.dim();
        if z < 0 || y < 0 || x < 0 {
            return 0.0;
        }
        let (z, y, x) = (z as usize, y as usize, x as usize);
        if z >= depth || y >= height || x >= width {
            return 0.0;
        }
        volume[[z, y, x]]
    }

    fn nearest(volume: &ArrayView3<f32>, z: f64, y: f64, x: f64) -> f32 {
        if !(z.is_finite() && y.is_finite() && x.is_finite()) {
            return 0.0;
        }
        Self::tap(volume, z.round() as isize, y.round() as isize, x.round() as isize)
    }

    fn trilinear(volume: &ArrayView3<f32>, z: f64, y: f64, x: f64) -> f32 {
        if !(z.is_finite() && y.is_finite() && x.is_finite()) {
            return 0.0;
        }
        let (z0, y0, x0) = (z.floor(), y.floor(), x.floor());
        let (dz, dy, dx) = ((z - z0) as f32, (y - y0) as f32, (x - x0) as f32);
        let (z0, y0, x0) = (z0 as isize, y0 as isize, x0 as isize);

        let mut value = 0.0f32;
        for (oz, wz) in [(0, 1.0 - dz), (1, dz)] {
            if wz == 0.0 {
                continue;
            }
            for (oy, wy) in [(0, 1.0 - dy), (1, dy)] {
                if wy == 0.0 {
                    continue;
                }
                for (ox, wx) in [(0, 1.0 - dx), (1, dx)] {
                    if wx == 0.0 {
                        continue;
                    }
                    value += Self::tap(volume, z0 + oz, y0 + oy, x0 + ox) * (wz * wy * wx);
                }
            }
        }
        value
    }

    fn tricubic(volume: &ArrayView3<f32>, z: f64, y: f64, x: f64) -> f32 {
        if !(z.is_finite() && y.is_finite() && x.is_finite()) {
            return 0.0;
        }
        let (z0, y0, x0) = (z.floor(), y.floor(), x.floor());
        let wz = catmull_rom_weights(z - z0);
        let wy = catmull_rom_weights(y - y0);
        let wx = catmull_rom_weights(x - x0);
        let (z0, y0, x0) = (z0 as isize, y0 as isize, x0 as isize);

        let mut value = 0.0f64;
        for (oz, wz) in (-1..=2).zip(wz) {
            if wz == 0.0 {
                continue;
            }
            for (oy, wy) in (-1..=2).zip(wy) {
                if wy == 0.0 {
                    continue;
                }
                for (ox, wx) in (-1..=2).zip(wx) {
                    if wx == 0.0 {
                        continue;
                    }
                    let v = Self::tap(volume, z0 + oz, y0 + oy, x0 + ox) as f64;
                    value += v * wz * wy * wx;
                }
            }
        }
        value as f32
    }
}

/// Catmull-Rom weights for the taps at offsets -1, 0, 1, 2 of a fractional
/// position `t` in [0, 1).
fn catmull_rom_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        -0.5 * t3 + t2 - 0.5 * t,
        1.5 * t3 - 2.5 * t2 + 1.0,
        -1.5 * t3 + 2.0 * t2 + 0.5 * t,
        0.5 * t3 - 0.5 * t2,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};
    use rstest::rstest;

    fn ramp() -> Array3<f32> {
        Array3::from_shape_fn((4, 4, 4), |(z, y, x)| (z * 16 + y * 4 + x) as f32)
    }

    #[test]
    fn test_bilinear_center() {
        let slice = Array2::from_shape_vec((2, 2), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let value = Interpolator::bilinear_interpolate(&slice.view(), 0.5, 0.5);
        assert_eq!(value, 1.5);
    }

    #[test]
    fn test_bilinear_clamps() {
        let slice = Array2::from_shape_vec((2, 2), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        assert_eq!(Interpolator::bilinear_interpolate(&slice.view(), -4.0, 9.0), 1.0);
    }

    #[rstest]
    #[case(Interpolation::Nearest)]
    #[case(Interpolation::Linear)]
    #[case(Interpolation::Cubic)]
    fn test_grid_points_are_exact(#[case] method: Interpolation) {
        let volume = ramp();
        for (z, y, x) in [(0, 0, 0), (1, 2, 3), (3, 3, 3), (2, 0, 1)] {
            let value = Interpolator::sample(&volume.view(), z as f64, y as f64, x as f64, method);
            assert_eq!(value, volume[[z, y, x]]);
        }
    }

    #[rstest]
    #[case(Interpolation::Nearest)]
    #[case(Interpolation::Linear)]
    #[case(Interpolation::Cubic)]
    fn test_far_outside_is_zero(#[case] method: Interpolation) {
        let volume = Array3::from_elem((3, 3, 3), 7.0f32);
        assert_eq!(Interpolator::sample(&volume.view(), -5.0, 1.0, 1.0, method), 0.0);
        assert_eq!(Interpolator::sample(&volume.view(), 1.0, 1.0, 10.0, method), 0.0);
        assert_eq!(Interpolator::sample(&volume.view(), f64::NAN, 1.0, 1.0, method), 0.0);
    }

    #[test]
    fn test_linear_midpoint() {
        let volume = ramp();
        let value = Interpolator::sample(&volume.view(), 1.5, 1.5, 1.5, Interpolation::Linear);
        assert!((value - (1.5 * 16.0 + 1.5 * 4.0 + 1.5)).abs() < 1e-4);
    }

    #[test]
    fn test_linear_border_is_attenuated() {
        let volume = Array3::from_elem((2, 2, 2), 8.0f32);
        let value = Interpolator::sample(&volume.view(), -0.5, 0.0, 0.0, Interpolation::Linear);
        assert_eq!(value, 4.0);
    }

    #[test]
    fn test_cubic_reproduces_linear_ramp_inside() {
        let volume = ramp();
        let value = Interpolator::sample(&volume.view(), 1.5, 1.25, 1.75, Interpolation::Cubic);
        let expected = 1.5 * 16.0 + 1.25 * 4.0 + 1.75;
        assert!((value - expected).abs() < 1e-4);
    }

    #[test]
    fn test_catmull_rom_weights_sum_to_one() {
        for t in [0.0, 0.1, 0.5, 0.9] {
            let sum: f64 = catmull_rom_weights(t).iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }
}
