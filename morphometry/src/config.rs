//! Pipeline configuration, passed explicitly into the orchestrator.

use std::path::{Path, PathBuf};

use common::SerdeFormat;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::error::{Error, Result};

/// Role an atlas plays in preprocessing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum AtlasRole {
    Template,
    Csf,
    Grey,
    White,
}

/// Well-known atlas names looked up in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasNames {
    pub template: String,
    pub csf: String,
    pub grey: String,
    pub white: String,
}

impl Default for AtlasNames {
    fn default() -> Self {
        Self {
            template: "T1.nii.gz".to_string(),
            csf: "csf.nii.gz".to_string(),
            grey: "grey.nii.gz".to_string(),
            white: "white.nii.gz".to_string(),
        }
    }
}

impl AtlasNames {
    pub fn name(&self, role: AtlasRole) -> &str {
        match role {
            AtlasRole::Template => &self.template,
            AtlasRole::Csf => &self.csf,
            AtlasRole::Grey => &self.grey,
            AtlasRole::White => &self.white,
        }
    }
}

/// Log-domain bias field estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasConfig {
    /// Number of estimate-and-divide rounds.
    pub iterations: usize,
    /// Width of the smoothing kernel used for the field, in mm.
    pub sigma_mm: f32,
    /// Box filter passes approximating the Gaussian.
    pub box_passes: usize,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            iterations: 2,
            sigma_mm: 20.0,
            box_passes: 3,
        }
    }
}

/// Deformable (demons) registration to the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Demons iterations after the affine initialization.
    pub iterations: usize,
    /// Regularization of the displacement field, in voxels.
    pub field_sigma: f32,
    /// Largest displacement update per iteration, in voxels.
    pub max_step: f32,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            iterations: 30,
            field_sigma: 1.5,
            max_step: 1.0,
        }
    }
}

/// Prior-weighted Gaussian mixture segmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Maximum EM iterations.
    pub iterations: usize,
    /// Exponent applied to the tissue priors. 0 ignores them.
    pub prior_weight: f32,
    /// EM stops once no class mean moves by more than this (relative).
    pub tolerance: f32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            prior_weight: 0.25,
            tolerance: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    pub bias: BiasConfig,
    pub registration: RegistrationConfig,
    pub segmentation: SegmentationConfig,
}

/// External statistical program run by the analysis stage. It is invoked as
/// `program [args..] script <input_dir> <variables_csv> <output_dir>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub program: String,
    pub script: PathBuf,
    pub args: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            program: "Rscript".to_string(),
            script: PathBuf::from("utm/run_analysis.R"),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub atlases: AtlasNames,
    /// Local directory holding atlas files, shared by all workers.
    pub cache_dir: PathBuf,
    /// Feature map downsampling; 1 keeps the template resolution.
    pub downsample_factor: f64,
    /// Images processed concurrently within one batch.
    pub workers: usize,
    pub imaging: ImagingConfig,
    pub analysis: AnalysisConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            atlases: AtlasNames::default(),
            cache_dir: std::env::temp_dir().join("morphometry-atlases"),
            downsample_factor: 2.0,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            imaging: ImagingConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads a config file; the format follows the extension.
    pub fn load(path: &Path) -> Result<Self> {
        let config: PipelineConfig =
            common::load_from_file(path).map_err(|err| Error::Config(format!("{err:#}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_text(&self, format: SerdeFormat) -> Result<String> {
        common::serialize(self, format).map_err(|err| Error::Config(format!("{err:#}")))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.downsample_factor.is_finite() || self.downsample_factor < 1.0 {
            return Err(Error::Config(format!(
                "downsample_factor must be a finite number >= 1, got {}",
                self.downsample_factor
            )));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".to_string()));
        }
        let names = [
            &self.atlases.template,
            &self.atlases.csf,
            &self.atlases.grey,
            &self.atlases.white,
        ];
        if names.iter().any(|name| name.trim().is_empty()) {
            return Err(Error::Config("atlas names must not be empty".to_string()));
        }
        if self.imaging.bias.box_passes == 0 {
            return Err(Error::Config("bias.box_passes must be positive".to_string()));
        }
        if !(self.imaging.bias.sigma_mm > 0.0) {
            return Err(Error::Config("bias.sigma_mm must be positive".to_string()));
        }
        if !(self.imaging.registration.max_step > 0.0) {
            return Err(Error::Config(
                "registration.max_step must be positive".to_string(),
            ));
        }
        if !(self.imaging.segmentation.prior_weight >= 0.0) {
            return Err(Error::Config(
                "segmentation.prior_weight must not be negative".to_string(),
            ));
        }
        if self.analysis.program.trim().is_empty() {
            return Err(Error::Config("analysis.program must be set".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.atlases.name(AtlasRole::Template), "T1.nii.gz");
        assert_eq!(config.downsample_factor, 2.0);
        assert!(config.workers >= 1);
    }

    #[test]
    fn rejects_bad_downsample_and_workers() {
        for factor in [0.5, f64::NAN, f64::INFINITY] {
            let config = PipelineConfig {
                downsample_factor: factor,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }

        let config = PipelineConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.atlases.grey = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_files_fill_in_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(
            &path,
            "downsample_factor: 3.0\nimaging:\n  segmentation:\n    iterations: 4\n",
        )?;

        let config = PipelineConfig::load(&path)?;
        assert_eq!(config.downsample_factor, 3.0);
        assert_eq!(config.imaging.segmentation.iterations, 4);
        assert_eq!(config.imaging.segmentation.prior_weight, 0.25);
        assert_eq!(config.atlases, AtlasNames::default());

        Ok(())
    }

    #[test]
    fn every_format_reloads() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = PipelineConfig {
            workers: 3,
            ..Default::default()
        };
        for (format, ext) in SerdeFormat::all_formats_for_testing()
            .into_iter()
            .zip(["yaml", "json", "toml"])
        {
            let path = dir.path().join(format!("pipeline.{ext}"));
            std::fs::write(&path, config.to_text(format)?)?;
            assert_eq!(PipelineConfig::load(&path)?, config);
        }
        Ok(())
    }
}
