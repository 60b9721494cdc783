use ndarray::{Array3, Zip};

use super::registration::{det3, Transform};
use super::{ImagingError, ImagingResult};
use crate::volume::Volume;

/// Per-axis derivatives in voxel units: central differences inside,
/// one-sided at the borders.
pub(crate) fn central_gradient(data: &Array3<f32>) -> [Array3<f32>; 3] {
    let (nx, ny, nz) = data.dim();
    let dims = [nx, ny, nz];

    [0, 1, 2].map(|axis| {
        let mut out = Array3::<f32>::zeros(data.raw_dim());
        let n = dims[axis];
        if n < 2 {
            return out;
        }
        Zip::indexed(&mut out).par_for_each(|(x, y, z), g| {
            let p = [x, y, z];
            let i = p[axis];
            let (lo, hi) = (i.saturating_sub(1), (i + 1).min(n - 1));
            let mut a = p;
            let mut b = p;
            a[axis] = lo;
            b[axis] = hi;
            *g = (data[b] - data[a]) / (hi - lo) as f32;
        });
        out
    })
}

/// Determinant of the transform's spatial derivative at every fixed voxel,
/// scaled to physical volume change.
pub(crate) fn jacobian_determinant(fixed: &Volume, transform: &Transform) -> ImagingResult<Volume> {
    if transform.fixed_shape != fixed.shape() {
        return Err(ImagingError::ShapeMismatch {
            operation: "jacobian",
            expected: fixed.shape(),
            actual: transform.fixed_shape,
        });
    }

    let moving_voxel: f32 = transform.moving_spacing.iter().product();
    let fixed_voxel: f32 = fixed.voxel_volume();
    let scale = transform.affine_determinant() * moving_voxel / fixed_voxel.max(f32::EPSILON);

    let Some(field) = &transform.displacement else {
        return Ok(fixed.with_data(Array3::from_elem(fixed.data.raw_dim(), scale)));
    };

    // du[i][j] = d u_i / d x_j
    let du = [
        central_gradient(&field[0]),
        central_gradient(&field[1]),
        central_gradient(&field[2]),
    ];

    let mut out = Array3::<f32>::zeros(fixed.data.raw_dim());
    Zip::indexed(&mut out).par_for_each(|(x, y, z), v| {
        let p = [x, y, z];
        let mut m = [[0.0f32; 3]; 3];
        for (i, row) in m.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = du[i][j][p] + if i == j { 1.0 } else { 0.0 };
            }
        }
        *v = scale * det3(&m);
    });

    Ok(fixed.with_data(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_of_a_ramp() {
        let data = Array3::from_shape_fn((5, 4, 3), |(x, y, z)| (2 * x + 3 * y + 5 * z) as f32);
        let [gx, gy, gz] = central_gradient(&data);
        assert!(gx.iter().all(|&g| (g - 2.0).abs() < 1e-6));
        assert!(gy.iter().all(|&g| (g - 3.0).abs() < 1e-6));
        assert!(gz.iter().all(|&g| (g - 5.0).abs() < 1e-6));
    }

    #[test]
    fn affine_jacobian_is_constant() {
        let fixed = Volume::new(Array3::zeros((4, 4, 4)), [1.0; 3]);
        let t = Transform::affine(
            &fixed,
            [1.0; 3],
            [[2.0, 0.0, 0.0], [0.0, 1.5, 0.0], [0.0, 0.0, 1.0]],
            [0.0; 3],
        );
        let jac = jacobian_determinant(&fixed, &t).unwrap();
        assert!(jac.data.iter().all(|&v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn stretching_field_scales_volume() {
        let fixed = Volume::new(Array3::zeros((6, 6, 6)), [2.0; 3]);
        let mut t = Transform::identity(&fixed);
        // u_x = 0.5 x, so d(phi_x)/dx = 1.5
        t.displacement = Some([
            Array3::from_shape_fn((6, 6, 6), |(x, _, _)| 0.5 * x as f32),
            Array3::zeros((6, 6, 6)),
            Array3::zeros((6, 6, 6)),
        ]);
        let jac = jacobian_determinant(&fixed, &t).unwrap();
        assert!(jac.data.iter().all(|&v| (v - 1.5).abs() < 1e-5));
    }

    #[test]
    fn rejects_foreign_grid() {
        let fixed = Volume::zeros([4, 4, 4]);
        let t = Transform::identity(&Volume::zeros([4, 4, 5]));
        assert!(matches!(
            jacobian_determinant(&fixed, &t),
            Err(ImagingError::ShapeMismatch { .. })
        ));
    }
}
