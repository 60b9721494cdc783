//! Deformable registration of a subject volume onto the template.
//!
//! Moments of the foreground give an axis-aligned affine start (centroid and
//! per-axis extent), then Thirion's demons refine a dense displacement field
//! that is Gaussian-regularized after every update.

use ndarray::{Array3, Zip};
use tracing::debug;

use super::filter::gaussian_smooth;
use super::interpolation::{sample_linear, Border};
use super::jacobian::central_gradient;
use super::{ImagingError, ImagingResult};
use crate::config::RegistrationConfig;
use crate::volume::Volume;

const FIELD_BOX_PASSES: usize = 3;

/// Forward spatial transform from template (fixed) voxel indices to subject
/// (moving) voxel indices: `p -> matrix * (p + u(p)) + offset`.
#[derive(Clone, Debug, PartialEq)]
pub struct Transform {
    pub matrix: [[f32; 3]; 3],
    pub offset: [f32; 3],
    /// `u`, in fixed voxels, one array per axis. `None` for a pure affine.
    pub displacement: Option<[Array3<f32>; 3]>,
    pub fixed_shape: [usize; 3],
    pub fixed_spacing: [f32; 3],
    pub moving_spacing: [f32; 3],
}

/// Output of [`Imaging::register`](super::Imaging::register).
#[derive(Clone, Debug)]
pub struct Registration {
    /// The moving volume resampled onto the fixed grid.
    pub warped: Volume,
    pub transform: Transform,
}

impl Transform {
    pub fn identity(fixed: &Volume) -> Self {
        Self::affine(
            fixed,
            fixed.spacing,
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            [0.0; 3],
        )
    }

    pub fn affine(
        fixed: &Volume,
        moving_spacing: [f32; 3],
        matrix: [[f32; 3]; 3],
        offset: [f32; 3],
    ) -> Self {
        Self {
            matrix,
            offset,
            displacement: None,
            fixed_shape: fixed.shape(),
            fixed_spacing: fixed.spacing,
            moving_spacing,
        }
    }

    #[inline]
    pub fn apply(&self, p: [usize; 3]) -> [f32; 3] {
        let mut q = p.map(|c| c as f32);
        if let Some(u) = &self.displacement {
            for (axis, component) in u.iter().enumerate() {
                q[axis] += component[p];
            }
        }
        let m = &self.matrix;
        [0, 1, 2].map(|row| {
            m[row][0] * q[0] + m[row][1] * q[1] + m[row][2] * q[2] + self.offset[row]
        })
    }

    pub(crate) fn affine_determinant(&self) -> f32 {
        det3(&self.matrix)
    }
}

#[inline]
pub(crate) fn det3(m: &[[f32; 3]; 3]) -> f32 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Resamples `moving` onto the fixed grid through `transform`. Samples that
/// fall outside the moving volume are zero.
pub(crate) fn warp(moving: &Volume, transform: &Transform) -> Volume {
    let mut out = Array3::<f32>::zeros(transform.fixed_shape);
    Zip::indexed(&mut out).par_for_each(|(x, y, z), v| {
        *v = sample_linear(&moving.data, transform.apply([x, y, z]), Border::Constant(0.0));
    });
    Volume::new(out, transform.fixed_spacing)
}

fn moments_init(fixed: &Volume, moving: &Volume) -> ImagingResult<Transform> {
    let (Some(cf), Some(sf)) = (fixed.centroid(), fixed.spread()) else {
        return Err(ImagingError::EmptyVolume("registration template"));
    };
    let (Some(cm), Some(sm)) = (moving.centroid(), moving.spread()) else {
        return Err(ImagingError::EmptyVolume("registration subject"));
    };

    let scale = [0, 1, 2].map(|a| if sf[a] > 1e-6 { sm[a] / sf[a] } else { 1.0 });
    let mut matrix = [[0.0f32; 3]; 3];
    for a in 0..3 {
        matrix[a][a] = scale[a] as f32;
    }
    let offset = [0, 1, 2].map(|a| (cm[a] - scale[a] * cf[a]) as f32);

    Ok(Transform::affine(fixed, moving.spacing, matrix, offset))
}

fn foreground_mean(volume: &Volume) -> f64 {
    let (sum, count) = volume
        .data
        .iter()
        .filter(|&&v| v > 0.0)
        .fold((0.0f64, 0usize), |(s, c), &v| (s + v as f64, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

pub(crate) fn register(
    fixed: &Volume,
    moving: &Volume,
    config: &RegistrationConfig,
) -> ImagingResult<Registration> {
    let mut transform = moments_init(fixed, moving)?;
    let mut warped = warp(moving, &transform);

    let warped_mean = foreground_mean(&warped);
    let gain = if warped_mean > 0.0 {
        (foreground_mean(fixed) / warped_mean) as f32
    } else {
        1.0
    };

    if config.iterations > 0 {
        transform.displacement = Some([0, 1, 2].map(|_| Array3::zeros(transform.fixed_shape)));
    }

    for iteration in 0..config.iterations {
        let gradient = central_gradient(&warped.data);
        let Some(field) = transform.displacement.as_mut() else {
            break;
        };

        let mut energy = 0.0f64;
        let max_step = config.max_step;
        let [ux, uy, uz] = &mut *field;
        Zip::indexed(ux)
            .and(uy)
            .and(uz)
            .for_each(|p, ux, uy, uz| {
                let p = [p.0, p.1, p.2];
                let diff = fixed.data[p] - gain * warped.data[p];
                let g = [
                    gain * gradient[0][p],
                    gain * gradient[1][p],
                    gain * gradient[2][p],
                ];
                energy += (diff as f64) * (diff as f64);

                let denom = g[0] * g[0] + g[1] * g[1] + g[2] * g[2] + diff * diff;
                if denom < 1e-9 {
                    return;
                }
                let mut step = g.map(|c| diff * c / denom);
                let norm = (step[0] * step[0] + step[1] * step[1] + step[2] * step[2]).sqrt();
                if norm > max_step {
                    step = step.map(|c| c * max_step / norm);
                }
                *ux += step[0];
                *uy += step[1];
                *uz += step[2];
            });

        for component in field.iter_mut() {
            gaussian_smooth(component, [config.field_sigma; 3], FIELD_BOX_PASSES);
        }

        warped = warp(moving, &transform);
        debug!(iteration, energy, "Demons iteration");
    }

    Ok(Registration { warped, transform })
}
