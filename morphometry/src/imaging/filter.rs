//! Separable smoothing built from repeated box filters.
//!
//! `n` box passes of suitably chosen odd widths approximate a Gaussian of a
//! given sigma (Kovesi's construction). Each pass is a running-sum filter
//! whose window shrinks at the borders, so the cost does not depend on the
//! kernel width.

use ndarray::{Array3, Axis, Zip};

/// Odd box widths whose `n`-fold convolution approximates a Gaussian with
/// standard deviation `sigma` (in samples).
pub(crate) fn box_sizes(sigma: f32, n: usize) -> Vec<usize> {
    if !(sigma > 0.0) || n == 0 {
        return vec![1; n];
    }

    let sigma = sigma as f64;
    let nf = n as f64;
    let ideal = (12.0 * sigma * sigma / nf + 1.0).sqrt();

    let mut lower = ideal.floor() as usize;
    if lower % 2 == 0 {
        lower = lower.saturating_sub(1);
    }
    let lower = lower.max(1);
    let upper = lower + 2;

    let wl = lower as f64;
    let m = (12.0 * sigma * sigma - nf * wl * wl - 4.0 * nf * wl - 3.0 * nf) / (-4.0 * wl - 4.0);
    let m = m.round().clamp(0.0, nf) as usize;

    (0..n).map(|i| if i < m { lower } else { upper }).collect()
}

/// Largest odd width not exceeding `len`.
fn fit_to(size: usize, len: usize) -> usize {
    if size <= len {
        return size;
    }
    if len % 2 == 0 {
        len.saturating_sub(1)
    } else {
        len
    }
}

/// Mean over a centered window of `size` samples, truncated at the ends.
fn box_line(line: &mut [f32], size: usize, prefix: &mut Vec<f64>) {
    let n = line.len();
    if size < 3 || n < 2 {
        return;
    }
    let r = size / 2;

    prefix.clear();
    prefix.push(0.0);
    let mut acc = 0.0f64;
    for &v in line.iter() {
        acc += v as f64;
        prefix.push(acc);
    }

    for (i, out) in line.iter_mut().enumerate() {
        let lo = i.saturating_sub(r);
        let hi = (i + r + 1).min(n);
        *out = ((prefix[hi] - prefix[lo]) / (hi - lo) as f64) as f32;
    }
}

fn box_filter_axis(data: &mut Array3<f32>, axis: usize, size: usize) {
    Zip::from(data.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
        let mut line: Vec<f32> = lane.to_vec();
        let mut prefix = Vec::with_capacity(line.len() + 1);
        box_line(&mut line, size, &mut prefix);
        lane.iter_mut().zip(line).for_each(|(dst, src)| *dst = src);
    });
}

/// In-place approximate Gaussian smoothing with a per-axis sigma in voxels.
pub(crate) fn gaussian_smooth(data: &mut Array3<f32>, sigma: [f32; 3], passes: usize) {
    let shape = data.shape().to_vec();
    for (axis, &s) in sigma.iter().enumerate() {
        for size in box_sizes(s, passes) {
            let size = fit_to(size, shape[axis]);
            if size >= 3 {
                box_filter_axis(data, axis, size);
            }
        }
    }
}

/// Smooths `values` using only samples where `weights` is non-zero:
/// `S(values * weights) / S(weights)`. Voxels with no support are zero.
pub(crate) fn normalized_smooth(
    values: &Array3<f32>,
    weights: &Array3<f32>,
    sigma: [f32; 3],
    passes: usize,
) -> Array3<f32> {
    let mut numerator = values * weights;
    let mut denominator = weights.clone();
    gaussian_smooth(&mut numerator, sigma, passes);
    gaussian_smooth(&mut denominator, sigma, passes);

    Zip::from(&mut numerator)
        .and(&denominator)
        .par_for_each(|n, &d| *n = if d > 1e-6 { *n / d } else { 0.0 });
    numerator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_sizes_match_target_variance() {
        for sigma in [1.0f32, 2.5, 6.0] {
            let sizes = box_sizes(sigma, 3);
            assert_eq!(sizes.len(), 3);
            assert!(sizes.iter().all(|s| s % 2 == 1));
            // variance of a width-w box is (w² - 1) / 12
            let variance: f64 = sizes.iter().map(|&w| ((w * w - 1) as f64) / 12.0).sum();
            let target = (sigma * sigma) as f64;
            assert!(
                (variance - target).abs() <= 0.25 * target + 0.5,
                "sigma {sigma}: {sizes:?}"
            );
        }
        assert_eq!(box_sizes(0.0, 2), [1, 1]);
    }

    #[test]
    fn smoothing_keeps_constants_and_mass_center() {
        let mut flat = Array3::from_elem((6, 7, 8), 3.0f32);
        gaussian_smooth(&mut flat, [2.0; 3], 3);
        assert!(flat.iter().all(|&v| (v - 3.0).abs() < 1e-5));

        let mut spike = Array3::<f32>::zeros((9, 9, 9));
        spike[[4, 4, 4]] = 1.0;
        // sigma 2 over 3 passes gives boxes [3, 3, 5]
        gaussian_smooth(&mut spike, [2.0; 3], 3);
        assert!(spike[[4, 4, 4]] < 1.0);
        assert!(spike[[4, 4, 4]] > spike[[3, 4, 4]]);
        assert!(spike[[3, 4, 4]] > spike[[2, 4, 4]]);
        assert!(spike[[2, 4, 4]] > 0.0);
        assert!((spike[[3, 4, 4]] - spike[[5, 4, 4]]).abs() < 1e-6);
    }

    #[test]
    fn normalized_smoothing_ignores_unsupported_voxels() {
        let values = Array3::from_shape_fn((8, 8, 8), |(x, _, _)| if x < 4 { 2.0 } else { 100.0 });
        let weights = Array3::from_shape_fn((8, 8, 8), |(x, _, _)| if x < 4 { 1.0 } else { 0.0 });

        let smoothed = normalized_smooth(&values, &weights, [2.0; 3], 3);
        for x in 0..4 {
            assert!((smoothed[[x, 3, 3]] - 2.0).abs() < 1e-4);
        }
    }
}
