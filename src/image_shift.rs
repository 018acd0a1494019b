// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, invalid_argument_error};
use rustfft::{FftPlanner, num_complex::Complex64};

use crate::hardware::ImageFrame;

/// Measured translation of a frame's content relative to a reference frame.
/// `dx` and `dy` are the apparent motion in pixels: a star at pixel (x, y)
/// in the reference appears at (x + dx, y + dy) in the current frame.
#[derive(Copy, Clone, Debug)]
pub struct PixelShift {
    pub dx: f64,
    pub dy: f64,

    /// Correlation peak value, normalized to 1.0 for identical frames.
    pub peak_response: f64,
}

/// Measures the translational shift between two frames of the same star
/// field by phase correlation: the cross-power spectrum of the two frames
/// has a delta-function peak at the displacement. Sub-pixel accuracy comes
/// from parabolic interpolation around the peak.
pub fn measure_shift(reference: &ImageFrame, current: &ImageFrame)
                     -> Result<PixelShift, CanonicalError> {
    if reference.width != current.width ||
        reference.height != current.height {
        return Err(invalid_argument_error(
            &format!("Frame geometry mismatch: {}x{} vs {}x{}",
                     reference.width, reference.height,
                     current.width, current.height)));
    }
    if reference.binning != current.binning {
        return Err(invalid_argument_error(
            &format!("Frame binning mismatch: {} vs {}",
                     reference.binning, current.binning)));
    }
    let width = reference.width;
    let height = reference.height;
    if width < 8 || height < 8 {
        return Err(invalid_argument_error(
            &format!("Frame too small for correlation: {}x{}",
                     width, height)));
    }

    let mut ref_spectrum = windowed_complex(&reference.data, width, height);
    let mut cur_spectrum = windowed_complex(&current.data, width, height);
    fft_2d(&mut ref_spectrum, width, height, /*inverse=*/false);
    fft_2d(&mut cur_spectrum, width, height, /*inverse=*/false);

    // Normalized cross-power spectrum. With current(x) = reference(x - d)
    // this is exp(-2*pi*i*k*d/N), whose inverse transform peaks at d.
    let mut cross: Vec<Complex64> = ref_spectrum
        .iter()
        .zip(cur_spectrum.iter())
        .map(|(r, c)| {
            let product = r.conj() * c;
            let norm = product.norm();
            if norm > 1e-12 {
                product / norm
            } else {
                Complex64::new(0.0, 0.0)
            }
        })
        .collect();
    fft_2d(&mut cross, width, height, /*inverse=*/true);

    let correlation: Vec<f64> = cross.iter().map(|c| c.re).collect();
    let mut peak_index = 0;
    let mut peak_value = f64::MIN;
    for (i, &value) in correlation.iter().enumerate() {
        if value > peak_value {
            peak_value = value;
            peak_index = i;
        }
    }
    let peak_x = peak_index % width;
    let peak_y = peak_index / width;

    let sample = |x: i64, y: i64| -> f64 {
        let x = x.rem_euclid(width as i64) as usize;
        let y = y.rem_euclid(height as i64) as usize;
        correlation[y * width + x]
    };
    let sub_x = parabolic_offset(sample(peak_x as i64 - 1, peak_y as i64),
                                 peak_value,
                                 sample(peak_x as i64 + 1, peak_y as i64));
    let sub_y = parabolic_offset(sample(peak_x as i64, peak_y as i64 - 1),
                                 peak_value,
                                 sample(peak_x as i64, peak_y as i64 + 1));

    Ok(PixelShift {
        dx: to_signed(peak_x, width) + sub_x,
        dy: to_signed(peak_y, height) + sub_y,
        peak_response: peak_value / (width * height) as f64,
    })
}

// Mean-subtracted pixels under a Hann window, as complex values. The window
// suppresses the spectral leakage from content crossing the frame edge.
fn windowed_complex(data: &[u16], width: usize, height: usize)
                    -> Vec<Complex64> {
    let mean = data.iter().map(|&p| p as f64).sum::<f64>()
        / data.len() as f64;
    let hann = |i: usize, n: usize| -> f64 {
        0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64
                      / (n - 1) as f64).cos())
    };
    let col_window: Vec<f64> = (0..width).map(|x| hann(x, width)).collect();
    let row_window: Vec<f64> = (0..height).map(|y| hann(y, height)).collect();

    let mut result = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let value = (data[y * width + x] as f64 - mean)
                * col_window[x] * row_window[y];
            result.push(Complex64::new(value, 0.0));
        }
    }
    result
}

// In-place 2D FFT: rows, then columns through a gather/scatter buffer.
fn fft_2d(buffer: &mut [Complex64], width: usize, height: usize,
          inverse: bool) {
    let mut planner = FftPlanner::new();
    let row_fft = if inverse {
        planner.plan_fft_inverse(width)
    } else {
        planner.plan_fft_forward(width)
    };
    let col_fft = if inverse {
        planner.plan_fft_inverse(height)
    } else {
        planner.plan_fft_forward(height)
    };

    for row in buffer.chunks_exact_mut(width) {
        row_fft.process(row);
    }
    let mut column = vec![Complex64::new(0.0, 0.0); height];
    for x in 0..width {
        for y in 0..height {
            column[y] = buffer[y * width + x];
        }
        col_fft.process(&mut column);
        for y in 0..height {
            buffer[y * width + x] = column[y];
        }
    }
}

// Sub-pixel peak refinement from the peak and its two neighbors. Returns
// an offset in [-0.5, 0.5].
fn parabolic_offset(before: f64, peak: f64, after: f64) -> f64 {
    let denom = before - 2.0 * peak + after;
    if denom.abs() < 1e-12 {
        return 0.0;
    }
    (0.5 * (before - after) / denom).clamp(-0.5, 0.5)
}

// Correlation indices above the midpoint wrap to negative displacements.
fn to_signed(index: usize, extent: usize) -> f64 {
    if index > extent / 2 {
        index as f64 - extent as f64
    } else {
        index as f64
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use std::time::{Duration, SystemTime};
    use super::*;

    // Renders a handful of Gaussian stars displaced by (dx, dy).
    fn render_frame(stars: &[(f64, f64)], width: usize, height: usize,
                    dx: f64, dy: f64) -> ImageFrame {
        let mut data = vec![800u16; width * height];
        for &(sx, sy) in stars {
            let cx = sx + dx;
            let cy = sy + dy;
            let sigma = 1.5;
            let radius = 5;
            for y in (cy as i64 - radius).max(0)
                ..=(cy as i64 + radius).min(height as i64 - 1) {
                for x in (cx as i64 - radius).max(0)
                    ..=(cx as i64 + radius).min(width as i64 - 1) {
                    let dist2 = (x as f64 - cx).powi(2)
                        + (y as f64 - cy).powi(2);
                    let value =
                        20000.0 * (-dist2 / (2.0 * sigma * sigma)).exp();
                    let pixel = &mut data[y as usize * width + x as usize];
                    *pixel = pixel.saturating_add(value as u16);
                }
            }
        }
        ImageFrame {
            data,
            width,
            height,
            binning: 1,
            exposure_duration: Duration::from_millis(100),
            capture_time: SystemTime::now(),
        }
    }

    fn test_stars() -> Vec<(f64, f64)> {
        vec![(30.2, 40.7), (70.5, 25.3), (50.0, 90.8), (95.4, 60.1),
             (20.9, 75.6), (85.3, 95.2), (60.7, 55.5)]
    }

    #[test]
    fn test_zero_shift() {
        let reference = render_frame(&test_stars(), 128, 128, 0.0, 0.0);
        let current = render_frame(&test_stars(), 128, 128, 0.0, 0.0);
        let shift = measure_shift(&reference, &current).unwrap();
        assert_abs_diff_eq!(shift.dx, 0.0, epsilon = 0.05);
        assert_abs_diff_eq!(shift.dy, 0.0, epsilon = 0.05);
        assert!(shift.peak_response > 0.0);
    }

    #[test]
    fn test_integer_shift() {
        let reference = render_frame(&test_stars(), 128, 128, 0.0, 0.0);
        let current = render_frame(&test_stars(), 128, 128, 10.0, 5.0);
        let shift = measure_shift(&reference, &current).unwrap();
        assert_abs_diff_eq!(shift.dx, 10.0, epsilon = 0.2);
        assert_abs_diff_eq!(shift.dy, 5.0, epsilon = 0.2);
    }

    #[test]
    fn test_subpixel_shift() {
        let reference = render_frame(&test_stars(), 128, 128, 0.0, 0.0);
        let current = render_frame(&test_stars(), 128, 128, 3.4, -2.6);
        let shift = measure_shift(&reference, &current).unwrap();
        assert_abs_diff_eq!(shift.dx, 3.4, epsilon = 0.2);
        assert_abs_diff_eq!(shift.dy, -2.6, epsilon = 0.2);
    }

    #[test]
    fn test_negative_shift() {
        let reference = render_frame(&test_stars(), 128, 128, 0.0, 0.0);
        let current = render_frame(&test_stars(), 128, 128, -8.25, 0.0);
        let shift = measure_shift(&reference, &current).unwrap();
        assert_abs_diff_eq!(shift.dx, -8.25, epsilon = 0.2);
        assert_abs_diff_eq!(shift.dy, 0.0, epsilon = 0.2);
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let reference = render_frame(&test_stars(), 128, 128, 0.0, 0.0);
        let current = render_frame(&test_stars(), 64, 64, 0.0, 0.0);
        assert!(measure_shift(&reference, &current).is_err());
    }
}  // mod tests.
