use tracing::instrument;

use super::interpolation::Interpolation;
use super::registration::{Registration, Transform};
use super::{bias, jacobian, registration, resample, segmentation};
use super::{Imaging, ImagingResult, TissuePriors};
use crate::config::ImagingConfig;
use crate::volume::Volume;

/// In-process implementation of [`Imaging`] on `ndarray` + `rayon`.
#[derive(Debug, Clone, Default)]
pub struct NativeImaging {
    config: ImagingConfig,
}

impl NativeImaging {
    pub fn new(config: ImagingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ImagingConfig {
        &self.config
    }
}

impl Imaging for NativeImaging {
    #[instrument(level = "debug", skip_all)]
    fn bias_correct(&self, volume: &Volume) -> ImagingResult<Volume> {
        Ok(bias::bias_correct(volume, &self.config.bias))
    }

    #[instrument(level = "debug", skip_all)]
    fn register(&self, fixed: &Volume, moving: &Volume) -> ImagingResult<Registration> {
        registration::register(fixed, moving, &self.config.registration)
    }

    #[instrument(level = "debug", skip_all)]
    fn jacobian(&self, fixed: &Volume, transform: &Transform) -> ImagingResult<Volume> {
        jacobian::jacobian_determinant(fixed, transform)
    }

    #[instrument(level = "debug", skip_all)]
    fn segment(
        &self,
        volume: &Volume,
        priors: &TissuePriors,
        mask: &Volume,
    ) -> ImagingResult<Volume> {
        segmentation::segment(volume, priors, mask, &self.config.segmentation)
    }

    fn resample(
        &self,
        volume: &Volume,
        shape: [usize; 3],
        interpolation: Interpolation,
    ) -> ImagingResult<Volume> {
        resample::resample(volume, shape, interpolation)
    }
}
