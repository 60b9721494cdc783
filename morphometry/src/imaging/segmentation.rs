//! Prior-based three-class tissue segmentation.
//!
//! A Gaussian mixture over masked intensities where every voxel's class
//! posterior is additionally weighted by the atlas tissue probability raised
//! to `prior_weight`. Class `k` is tied to prior `k`, so labels keep their
//! anatomical meaning regardless of intensity ordering.

use ndarray::Array3;
use rayon::prelude::*;
use tracing::debug;

use super::{check_shape, ImagingResult, TissuePriors, LABEL_BACKGROUND};
use crate::config::SegmentationConfig;
use crate::volume::Volume;

const CLASSES: usize = 3;
const PRIOR_FLOOR: f64 = 1e-4;

#[derive(Clone, Copy, Debug)]
struct Class {
    mean: f64,
    variance: f64,
    weight: f64,
}

impl Class {
    #[inline]
    fn log_density(&self, x: f64) -> f64 {
        let d = x - self.mean;
        self.weight.ln() - 0.5 * self.variance.ln() - 0.5 * d * d / self.variance
    }
}

#[derive(Clone, Copy, Default)]
struct Moments {
    n: [f64; CLASSES],
    sx: [f64; CLASSES],
    sxx: [f64; CLASSES],
}

impl Moments {
    fn add(mut self, x: f64, r: &[f64; CLASSES]) -> Self {
        for k in 0..CLASSES {
            self.n[k] += r[k];
            self.sx[k] += r[k] * x;
            self.sxx[k] += r[k] * x * x;
        }
        self
    }

    fn merge(mut self, other: Self) -> Self {
        for k in 0..CLASSES {
            self.n[k] += other.n[k];
            self.sx[k] += other.sx[k];
            self.sxx[k] += other.sxx[k];
        }
        self
    }

    fn classes(&self, fallback: &[Class; CLASSES], floor: f64, total: f64) -> [Class; CLASSES] {
        std::array::from_fn(|k| {
            if self.n[k] <= 1e-9 {
                return fallback[k];
            }
            let mean = self.sx[k] / self.n[k];
            let variance = (self.sxx[k] / self.n[k] - mean * mean).max(0.0) + floor;
            Class {
                mean,
                variance,
                weight: (self.n[k] / total).max(1e-9),
            }
        })
    }
}

struct Sample {
    at: [usize; 3],
    x: f64,
    prior: [f64; CLASSES],
    log_prior: [f64; CLASSES],
}

fn responsibilities(sample: &Sample, classes: &[Class; CLASSES]) -> [f64; CLASSES] {
    let log: [f64; CLASSES] =
        std::array::from_fn(|k| classes[k].log_density(sample.x) + sample.log_prior[k]);
    let max = log.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut r = log.map(|l| (l - max).exp());
    let sum: f64 = r.iter().sum();
    r.iter_mut().for_each(|v| *v /= sum);
    r
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx]
}

pub(crate) fn segment(
    volume: &Volume,
    priors: &TissuePriors,
    mask: &Volume,
    config: &SegmentationConfig,
) -> ImagingResult<Volume> {
    let shape = volume.shape();
    check_shape("segmentation", shape, mask.shape())?;
    for prior in priors.iter() {
        check_shape("segmentation", shape, prior.shape())?;
    }

    let w = config.prior_weight as f64;
    let samples: Vec<Sample> = volume
        .data
        .indexed_iter()
        .filter(|((x, y, z), _)| mask.data[[*x, *y, *z]] > 0.0)
        .map(|((x, y, z), &value)| {
            let at = [x, y, z];
            let prior = priors.at(at).map(|p| p.max(0.0) as f64);
            Sample {
                at,
                x: value as f64,
                prior,
                log_prior: prior.map(|p| w * (p + PRIOR_FLOOR).ln()),
            }
        })
        .collect();

    let mut labels = volume.with_data(Array3::from_elem(volume.data.raw_dim(), LABEL_BACKGROUND));
    if samples.is_empty() {
        return Ok(labels);
    }

    let total = samples.len() as f64;
    let mut sorted: Vec<f64> = samples.iter().map(|s| s.x).collect();
    sorted.sort_by(f64::total_cmp);
    let spread = quantile(&sorted, 0.95) - quantile(&sorted, 0.05);
    let floor = (1e-4 * spread * spread).max(1e-6);

    // initial classes: prior-weighted moments, quantiles where a prior is empty
    let fallback: [Class; CLASSES] = std::array::from_fn(|k| Class {
        mean: quantile(&sorted, (k + 1) as f64 / (CLASSES + 1) as f64),
        variance: (spread * spread / 16.0).max(floor),
        weight: 1.0 / CLASSES as f64,
    });
    let initial = samples
        .par_iter()
        .fold(Moments::default, |acc, s| acc.add(s.x, &s.prior))
        .reduce(Moments::default, Moments::merge);
    let mut classes = initial.classes(&fallback, floor, total);
    for class in classes.iter_mut() {
        class.weight = 1.0 / CLASSES as f64;
    }

    for iteration in 0..config.iterations {
        let moments = samples
            .par_iter()
            .fold(Moments::default, |acc, s| {
                acc.add(s.x, &responsibilities(s, &classes))
            })
            .reduce(Moments::default, Moments::merge);
        let updated = moments.classes(&classes, floor, total);

        let shift = classes
            .iter()
            .zip(updated.iter())
            .map(|(a, b)| (a.mean - b.mean).abs() / spread.max(1e-9))
            .fold(0.0, f64::max);
        classes = updated;

        debug!(iteration, shift, "Segmentation EM step");
        if shift < config.tolerance as f64 {
            break;
        }
    }

    for sample in &samples {
        let r = responsibilities(sample, &classes);
        let best = (0..CLASSES)
            .max_by(|&a, &b| r[a].total_cmp(&r[b]))
            .unwrap_or(0);
        labels.data[sample.at] = (best + 1) as f32;
    }

    Ok(labels)
}
