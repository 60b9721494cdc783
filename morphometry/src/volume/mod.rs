//! Scalar 3D volumes and their NIfTI representation.

use ndarray::{Array3, Zip};
use thiserror::Error;

mod nifti_io;

pub use nifti_io::{read_nifti, write_nifti};

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),
    #[error("Expected a 3D volume, got {ndim} dimensions")]
    Dimensionality { ndim: usize },
    #[error("Volume shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Voxel intensities indexed `[x, y, z]` plus physical voxel size in mm.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    pub data: Array3<f32>,
    pub spacing: [f32; 3],
}

impl Volume {
    pub fn new(data: Array3<f32>, spacing: [f32; 3]) -> Self {
        Self { data, spacing }
    }

    /// Unit-spacing volume of zeros.
    pub fn zeros(shape: [usize; 3]) -> Self {
        Self::new(Array3::zeros(shape), [1.0; 3])
    }

    pub fn shape(&self) -> [usize; 3] {
        let dim = self.data.dim();
        [dim.0, dim.1, dim.2]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Volume of one voxel in mm³.
    pub fn voxel_volume(&self) -> f32 {
        self.spacing.iter().product()
    }

    /// Same geometry, new intensities.
    pub fn with_data(&self, data: Array3<f32>) -> Self {
        Self::new(data, self.spacing)
    }

    pub fn map(&self, f: impl Fn(f32) -> f32 + Sync + Send) -> Self {
        self.with_data(self.data.mapv(f))
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Intensity-weighted centroid in voxel coordinates, `None` for an
    /// all-zero volume.
    pub fn centroid(&self) -> Option<[f64; 3]> {
        let mut total = 0.0f64;
        let mut acc = [0.0f64; 3];
        for ((x, y, z), &v) in self.data.indexed_iter() {
            if v > 0.0 {
                let w = v as f64;
                total += w;
                acc[0] += w * x as f64;
                acc[1] += w * y as f64;
                acc[2] += w * z as f64;
            }
        }
        (total > 0.0).then(|| acc.map(|a| a / total))
    }

    /// Standard deviation of the foreground coordinates along each axis.
    pub fn spread(&self) -> Option<[f64; 3]> {
        let center = self.centroid()?;
        let mut total = 0.0f64;
        let mut acc = [0.0f64; 3];
        for ((x, y, z), &v) in self.data.indexed_iter() {
            if v > 0.0 {
                let w = v as f64;
                total += w;
                for (axis, c) in [x, y, z].into_iter().enumerate() {
                    let d = c as f64 - center[axis];
                    acc[axis] += w * d * d;
                }
            }
        }
        Some(acc.map(|a| (a / total).sqrt()))
    }

    /// Elementwise absolute value.
    pub fn abs(&self) -> Self {
        let mut data = self.data.clone();
        Zip::from(&mut data).par_for_each(|v| *v = v.abs());
        self.with_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centroid_of_single_voxel() {
        let mut volume = Volume::zeros([4, 5, 6]);
        volume.data[[1, 2, 3]] = 7.0;
        assert_eq!(volume.centroid(), Some([1.0, 2.0, 3.0]));
        assert_eq!(volume.spread(), Some([0.0, 0.0, 0.0]));
        assert_eq!(Volume::zeros([2, 2, 2]).centroid(), None);
    }

    #[test]
    fn voxel_volume_uses_spacing() {
        let volume = Volume::new(Array3::zeros((2, 2, 2)), [1.0, 2.0, 1.5]);
        assert_eq!(volume.voxel_volume(), 3.0);
        assert_eq!(volume.shape(), [2, 2, 2]);
    }
}
