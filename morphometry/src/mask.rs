use ndarray::{Array3, Zip};

use crate::imaging::{check_shape, ImagingResult, TissuePriors};
use crate::volume::Volume;

/// Binary brain mask: 1 where any tissue prior is positive, 0 elsewhere.
/// Geometry follows the CSF prior.
pub fn tissue_mask(priors: &TissuePriors) -> ImagingResult<Volume> {
    let shape = priors.shape();
    check_shape("tissue mask", shape, priors.grey.shape())?;
    check_shape("tissue mask", shape, priors.white.shape())?;

    let mut mask = Array3::<f32>::zeros(priors.csf.data.raw_dim());
    Zip::from(&mut mask)
        .and(&priors.csf.data)
        .and(&priors.grey.data)
        .and(&priors.white.data)
        .par_for_each(|m, &csf, &grey, &white| {
            *m = if csf > 0.0 || grey > 0.0 || white > 0.0 {
                1.0
            } else {
                0.0
            };
        });

    Ok(priors.csf.with_data(mask))
}
