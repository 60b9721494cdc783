//! Voxel sampling at fractional coordinates.

use ndarray::Array3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Interpolation {
    /// Label-preserving.
    Nearest,
    /// Trilinear, value-preserving.
    #[default]
    Linear,
}

/// What to return for coordinates outside the volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Border {
    Constant(f32),
    Clamp,
}

#[inline]
fn clamp_index(i: isize, n: usize) -> usize {
    i.clamp(0, n as isize - 1) as usize
}

#[inline]
fn outside(p: [f32; 3], dims: [usize; 3]) -> bool {
    (0..3).any(|a| p[a] < -0.5 || p[a] > dims[a] as f32 - 0.5)
}

pub(crate) fn sample_nearest(data: &Array3<f32>, p: [f32; 3], border: Border) -> f32 {
    let (nx, ny, nz) = data.dim();
    let dims = [nx, ny, nz];
    if let Border::Constant(value) = border {
        if outside(p, dims) {
            return value;
        }
    }
    let idx = [0, 1, 2].map(|a| clamp_index(p[a].round() as isize, dims[a]));
    data[idx]
}

pub(crate) fn sample_linear(data: &Array3<f32>, p: [f32; 3], border: Border) -> f32 {
    let (nx, ny, nz) = data.dim();
    let dims = [nx, ny, nz];
    if let Border::Constant(value) = border {
        if outside(p, dims) {
            return value;
        }
    }

    let base = p.map(|c| c.floor());
    let frac = [p[0] - base[0], p[1] - base[1], p[2] - base[2]];
    let lo = [0, 1, 2].map(|a| clamp_index(base[a] as isize, dims[a]));
    let hi = [0, 1, 2].map(|a| clamp_index(base[a] as isize + 1, dims[a]));

    let mut acc = 0.0f32;
    for (cx, wx) in [(lo[0], 1.0 - frac[0]), (hi[0], frac[0])] {
        for (cy, wy) in [(lo[1], 1.0 - frac[1]), (hi[1], frac[1])] {
            for (cz, wz) in [(lo[2], 1.0 - frac[2]), (hi[2], frac[2])] {
                let w = wx * wy * wz;
                if w != 0.0 {
                    acc += w * data[[cx, cy, cz]];
                }
            }
        }
    }
    acc
}

pub(crate) fn sample(
    data: &Array3<f32>,
    p: [f32; 3],
    interpolation: Interpolation,
    border: Border,
) -> f32 {
    match interpolation {
        Interpolation::Nearest => sample_nearest(data, p, border),
        Interpolation::Linear => sample_linear(data, p, border),
    }
}
