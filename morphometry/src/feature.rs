use ndarray::Zip;

use crate::error::{Error, Result};
use crate::imaging::{check_shape, downsampled_shape, Imaging, Interpolation, LABEL_GREY};
use crate::volume::Volume;

/// Jacobian restricted to grey matter: `jacobian[v]` where the label is
/// grey, `0` elsewhere.
pub fn grey_matter_map(jacobian: &Volume, segmentation: &Volume) -> Result<Volume> {
    check_shape("feature", jacobian.shape(), segmentation.shape())?;

    let mut feature = jacobian.data.clone();
    Zip::from(&mut feature)
        .and(&segmentation.data)
        .par_for_each(|f, &label| {
            if label.round() != LABEL_GREY {
                *f = 0.0;
            }
        });

    Ok(jacobian.with_data(feature))
}

/// Grey matter map, resampled to `round(shape / factor)` when the factor
/// is above 1.
pub fn extract_feature(
    imaging: &dyn Imaging,
    jacobian: &Volume,
    segmentation: &Volume,
    downsample_factor: f64,
) -> Result<Volume> {
    if !downsample_factor.is_finite() || downsample_factor < 1.0 {
        return Err(Error::Config(format!(
            "downsample factor must be >= 1, got {downsample_factor}"
        )));
    }

    let feature = grey_matter_map(jacobian, segmentation)?;
    if downsample_factor == 1.0 {
        return Ok(feature);
    }

    let shape = downsampled_shape(feature.shape(), downsample_factor);
    Ok(imaging.resample(&feature, shape, Interpolation::Linear)?)
}
