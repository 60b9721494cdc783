//! Intensity inhomogeneity correction.
//!
//! The bias field is modelled as a smooth multiplicative term. Each round
//! estimates it as the masked, normalized Gaussian smoothing of the log image
//! and divides it out. The foreground mean is preserved.

use ndarray::{Array3, Zip};

use super::filter::normalized_smooth;
use crate::config::BiasConfig;
use crate::volume::Volume;

pub(crate) fn bias_correct(volume: &Volume, config: &BiasConfig) -> Volume {
    let foreground: Array3<f32> = volume.data.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
    let count = foreground.sum();
    if count == 0.0 || config.iterations == 0 {
        return volume.clone();
    }

    let original_mean = foreground_mean(&volume.data, &foreground, count);
    let sigma = volume.spacing.map(|s| config.sigma_mm / s.max(f32::EPSILON));

    let mut log = volume.data.mapv(|v| if v > 0.0 { v.ln() } else { 0.0 });
    for _ in 0..config.iterations {
        let field = normalized_smooth(&log, &foreground, sigma, config.box_passes);
        let field_mean = foreground_mean(&field, &foreground, count);
        Zip::from(&mut log)
            .and(&field)
            .and(&foreground)
            .par_for_each(|l, &b, &m| {
                if m > 0.0 {
                    *l -= b - field_mean;
                }
            });
    }

    let mut corrected = volume.data.clone();
    Zip::from(&mut corrected)
        .and(&log)
        .and(&foreground)
        .par_for_each(|v, &l, &m| {
            if m > 0.0 {
                *v = l.exp();
            }
        });

    let corrected_mean = foreground_mean(&corrected, &foreground, count);
    if corrected_mean > 0.0 {
        let scale = original_mean / corrected_mean;
        Zip::from(&mut corrected)
            .and(&foreground)
            .par_for_each(|v, &m| {
                if m > 0.0 {
                    *v *= scale;
                }
            });
    }

    volume.with_data(corrected)
}

fn foreground_mean(data: &Array3<f32>, foreground: &Array3<f32>, count: f32) -> f32 {
    let sum: f64 = data
        .iter()
        .zip(foreground.iter())
        .filter(|(_, &m)| m > 0.0)
        .map(|(&v, _)| v as f64)
        .sum();
    (sum / count as f64) as f32
}
