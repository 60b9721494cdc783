use ndarray::{Array3, Zip};

use super::interpolation::{sample, Border, Interpolation};
use super::{ImagingError, ImagingResult};
use crate::volume::Volume;

/// Target shape for downsampling by `factor`: `round(n / factor)`, at least 1.
pub fn downsampled_shape(shape: [usize; 3], factor: f64) -> [usize; 3] {
    shape.map(|n| ((n as f64 / factor).round() as usize).max(1))
}

/// Resamples onto a grid of `shape` covering the same field of view. Voxel
/// centers are aligned, and spacing grows by the inverse of the size ratio.
pub(crate) fn resample(
    volume: &Volume,
    shape: [usize; 3],
    interpolation: Interpolation,
) -> ImagingResult<Volume> {
    if shape.iter().any(|&n| n == 0) || volume.is_empty() {
        return Err(ImagingError::EmptyVolume("resample"));
    }

    let src = volume.shape();
    if src == shape {
        return Ok(volume.clone());
    }

    let ratio = [0, 1, 2].map(|a| src[a] as f32 / shape[a] as f32);
    let mut out = Array3::<f32>::zeros(shape);
    Zip::indexed(&mut out).par_for_each(|(x, y, z), v| {
        let p = [x, y, z];
        let q = [0, 1, 2].map(|a| (p[a] as f32 + 0.5) * ratio[a] - 0.5);
        *v = sample(&volume.data, q, interpolation, Border::Clamp);
    });

    let spacing = [0, 1, 2].map(|a| volume.spacing[a] * ratio[a]);
    Ok(Volume::new(out, spacing))
}
