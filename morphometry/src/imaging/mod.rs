//! Numerical imaging primitives consumed by the per-image stage.
//!
//! The pipeline talks to these only through the [`Imaging`] trait, so the
//! numerical backend can be swapped (or wrapped, as the tests do to inject
//! failures) without touching orchestration code.

use std::path::Path;

use thiserror::Error;

use crate::volume::{read_nifti, write_nifti, Volume, VolumeError};

mod bias;
mod filter;
mod interpolation;
mod jacobian;
mod native;
mod registration;
mod resample;
mod segmentation;

pub use interpolation::Interpolation;
pub use native::NativeImaging;
pub use registration::{Registration, Transform};
pub use resample::downsampled_shape;

// ============================================================================
// Tissue labels
// ============================================================================

pub const LABEL_BACKGROUND: f32 = 0.0;
pub const LABEL_CSF: f32 = 1.0;
pub const LABEL_GREY: f32 = 2.0;
pub const LABEL_WHITE: f32 = 3.0;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error("{operation}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        operation: &'static str,
        expected: [usize; 3],
        actual: [usize; 3],
    },
    #[error("{0}: volume has no foreground")]
    EmptyVolume(&'static str),
    #[error("{0}")]
    Numerical(String),
}

pub type ImagingResult<T> = std::result::Result<T, ImagingError>;

pub(crate) fn check_shape(
    operation: &'static str,
    expected: [usize; 3],
    actual: [usize; 3],
) -> ImagingResult<()> {
    if expected != actual {
        return Err(ImagingError::ShapeMismatch {
            operation,
            expected,
            actual,
        });
    }
    Ok(())
}

/// CSF, grey and white matter probability maps in template space.
#[derive(Clone, Debug)]
pub struct TissuePriors {
    pub csf: Volume,
    pub grey: Volume,
    pub white: Volume,
}

impl TissuePriors {
    pub fn iter(&self) -> impl Iterator<Item = &Volume> {
        [&self.csf, &self.grey, &self.white].into_iter()
    }

    pub fn shape(&self) -> [usize; 3] {
        self.csf.shape()
    }

    #[inline]
    pub(crate) fn at(&self, p: [usize; 3]) -> [f32; 3] {
        [self.csf.data[p], self.grey.data[p], self.white.data[p]]
    }
}

pub trait Imaging: Send + Sync {
    fn read(&self, path: &Path) -> ImagingResult<Volume> {
        Ok(read_nifti(path)?)
    }

    fn write(&self, volume: &Volume, path: &Path) -> ImagingResult<()> {
        Ok(write_nifti(volume, path)?)
    }

    fn bias_correct(&self, volume: &Volume) -> ImagingResult<Volume>;

    /// Deformably aligns `moving` to `fixed`.
    fn register(&self, fixed: &Volume, moving: &Volume) -> ImagingResult<Registration>;

    /// Signed volume-change determinant of `transform` on the grid of `fixed`.
    fn jacobian(&self, fixed: &Volume, transform: &Transform) -> ImagingResult<Volume>;

    /// Tissue label map (see the `LABEL_*` constants); voxels outside `mask`
    /// are background.
    fn segment(
        &self,
        volume: &Volume,
        priors: &TissuePriors,
        mask: &Volume,
    ) -> ImagingResult<Volume>;

    fn resample(
        &self,
        volume: &Volume,
        shape: [usize; 3],
        interpolation: Interpolation,
    ) -> ImagingResult<Volume>;

    /// Transform type recorded on registered artifacts.
    fn registration_type(&self) -> &str {
        "deformable"
    }
}
