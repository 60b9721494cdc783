//! Synthetic volumes and collaborators for pipeline tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::Array3;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use crate::analysis::{AnalysisError, ProgramOutput, StatisticalProgram};
use crate::blob::{BlobRef, BlobStore, LocalBlobStore};
use crate::config::PipelineConfig;
use crate::imaging::{
    Imaging, ImagingError, ImagingResult, Interpolation, NativeImaging, Registration,
    TissuePriors, Transform,
};
use crate::model::{
    AnalysisData, AnalysisId, AnalysisResult, Artifact, Atlas, AtlasId, BatchId, Dataset,
    DatasetId, Image, ImageId, PreprocessingBatch, Status,
};
use crate::service::Morphometry;
use crate::store::{MemoryStore, Store, StoreError, StoreResult};
use crate::volume::{write_nifti, Volume};

pub const SHAPE: [usize; 3] = [12, 12, 12];

// ============================================================================
// Synthetic brains
// ============================================================================

/// Concentric tissue shells: white core, grey shell, CSF rim, empty outside.
/// `shift` moves the center in voxels, `scale` the radius.
pub fn brain(shift: [f32; 3], scale: f32) -> Volume {
    let center = SHAPE.map(|n| (n as f32 - 1.0) / 2.0);
    let radius = 4.5 * scale;
    let data = Array3::from_shape_fn((SHAPE[0], SHAPE[1], SHAPE[2]), |(x, y, z)| {
        let d = [x as f32, y as f32, z as f32]
            .iter()
            .zip(center.iter().zip(shift.iter()))
            .map(|(p, (c, s))| (p - c - s).powi(2))
            .sum::<f32>()
            .sqrt()
            / radius;
        match d {
            d if d < 0.45 => 100.0,
            d if d < 0.8 => 60.0,
            d if d <= 1.0 => 25.0,
            _ => 0.0,
        }
    });
    Volume::new(data, [1.0; 3])
}

/// Soft tissue priors matching the shells of `brain([0; 3], 1.0)`.
pub fn priors() -> TissuePriors {
    let template = brain([0.0; 3], 1.0);
    let prior = |intensity: f32| {
        template.map(move |v| {
            if v == 0.0 {
                0.0
            } else if v == intensity {
                0.8
            } else {
                0.1
            }
        })
    };
    TissuePriors {
        csf: prior(25.0),
        grey: prior(60.0),
        white: prior(100.0),
    }
}

pub fn nifti_bytes(volume: &Volume) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.nii.gz");
    write_nifti(volume, &path).unwrap();
    std::fs::read(&path).unwrap()
}

/// A subject: the template brain slightly shifted and scaled.
pub fn subject_bytes(index: usize) -> Vec<u8> {
    let offset = index as f32 * 0.3;
    nifti_bytes(&brain([offset, -offset, 0.5], 0.95 + 0.03 * index as f32))
}

// ============================================================================
// Collaborators
// ============================================================================

/// [`NativeImaging`] that counts bias corrections and can fail the n-th one.
#[derive(Debug)]
pub struct FaultyImaging {
    inner: NativeImaging,
    bias_calls: AtomicUsize,
    /// 1-based index of the bias correction call that fails.
    fail_on: Option<usize>,
}

impl FaultyImaging {
    pub fn new(inner: NativeImaging, fail_on: Option<usize>) -> Self {
        Self {
            inner,
            bias_calls: AtomicUsize::new(0),
            fail_on,
        }
    }

    pub fn bias_calls(&self) -> usize {
        self.bias_calls.load(Ordering::SeqCst)
    }
}

impl Imaging for FaultyImaging {
    fn bias_correct(&self, volume: &Volume) -> ImagingResult<Volume> {
        let call = self.bias_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(call) {
            return Err(ImagingError::Numerical(format!(
                "injected failure on call {call}"
            )));
        }
        self.inner.bias_correct(volume)
    }

    fn register(&self, fixed: &Volume, moving: &Volume) -> ImagingResult<Registration> {
        self.inner.register(fixed, moving)
    }

    fn jacobian(&self, fixed: &Volume, transform: &Transform) -> ImagingResult<Volume> {
        self.inner.jacobian(fixed, transform)
    }

    fn segment(
        &self,
        volume: &Volume,
        priors: &TissuePriors,
        mask: &Volume,
    ) -> ImagingResult<Volume> {
        self.inner.segment(volume, priors, mask)
    }

    fn resample(
        &self,
        volume: &Volume,
        shape: [usize; 3],
        interpolation: Interpolation,
    ) -> ImagingResult<Volume> {
        self.inner.resample(volume, shape, interpolation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramMode {
    Succeed,
    Exit(i32),
}

/// Stand-in for the statistical program. On success writes one
/// correlation/p-value pair per covariate plus a summary file.
#[derive(Debug)]
pub struct FakeProgram {
    mode: ProgramMode,
    runs: AtomicUsize,
    last_variables: Mutex<Option<String>>,
    last_inputs: Mutex<Vec<String>>,
}

impl FakeProgram {
    pub fn new(mode: ProgramMode) -> Self {
        Self {
            mode,
            runs: AtomicUsize::new(0),
            last_variables: Mutex::new(None),
            last_inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_variables(&self) -> Option<String> {
        self.last_variables.lock().clone()
    }

    pub fn last_inputs(&self) -> Vec<String> {
        self.last_inputs.lock().clone()
    }
}

impl StatisticalProgram for FakeProgram {
    fn run(
        &self,
        input_dir: &Path,
        variables_csv: &Path,
        output_dir: &Path,
    ) -> Result<ProgramOutput, AnalysisError> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        let variables = std::fs::read_to_string(variables_csv)
            .map_err(|e| AnalysisError::io(variables_csv, e))?;
        let mut inputs: Vec<String> = std::fs::read_dir(input_dir)
            .map_err(|e| AnalysisError::io(input_dir, e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        inputs.sort();
        *self.last_inputs.lock() = inputs;

        let header: Vec<String> = variables
            .lines()
            .next()
            .unwrap_or_default()
            .split(',')
            .skip(1)
            .map(str::to_string)
            .collect();
        *self.last_variables.lock() = Some(variables);

        if let ProgramMode::Exit(code) = self.mode {
            return Ok(ProgramOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: "model did not converge".to_string(),
            });
        }

        for variable in header {
            for kind in ["correlation", "pvalue"] {
                let path = output_dir.join(format!("{variable}.grey.{kind}.nii.gz"));
                std::fs::write(&path, kind).map_err(|e| AnalysisError::io(&path, e))?;
            }
        }
        let summary = output_dir.join("summary.txt");
        std::fs::write(&summary, "ok").map_err(|e| AnalysisError::io(&summary, e))?;

        Ok(ProgramOutput {
            code: Some(0),
            stdout: "done".to_string(),
            stderr: String::new(),
        })
    }
}

/// Delegates to another store but refuses to record analysis outputs.
pub struct OutputRejectingStore {
    inner: Arc<dyn Store>,
}

impl OutputRejectingStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self { inner }
    }
}

impl Store for OutputRejectingStore {
    fn insert_atlas(&self, atlas: Atlas) -> StoreResult<Atlas> {
        self.inner.insert_atlas(atlas)
    }
    fn atlas(&self, id: AtlasId) -> StoreResult<Atlas> {
        self.inner.atlas(id)
    }
    fn atlas_by_name(&self, name: &str) -> StoreResult<Option<Atlas>> {
        self.inner.atlas_by_name(name)
    }
    fn insert_dataset(&self, dataset: Dataset) -> StoreResult<Dataset> {
        self.inner.insert_dataset(dataset)
    }
    fn dataset(&self, id: DatasetId) -> StoreResult<Dataset> {
        self.inner.dataset(id)
    }
    fn set_dataset_preprocessing(
        &self,
        id: DatasetId,
        batch: BatchId,
        status: Status,
    ) -> StoreResult<()> {
        self.inner.set_dataset_preprocessing(id, batch, status)
    }
    fn set_dataset_analysis(
        &self,
        id: DatasetId,
        analysis: AnalysisId,
        status: Status,
    ) -> StoreResult<()> {
        self.inner.set_dataset_analysis(id, analysis, status)
    }
    fn insert_image(&self, image: Image) -> StoreResult<Image> {
        self.inner.insert_image(image)
    }
    fn image(&self, id: ImageId) -> StoreResult<Image> {
        self.inner.image(id)
    }
    fn images(&self, dataset: DatasetId) -> StoreResult<Vec<Image>> {
        self.inner.images(dataset)
    }
    fn image_count(&self, dataset: DatasetId) -> StoreResult<usize> {
        self.inner.image_count(dataset)
    }
    fn insert_batch(&self, batch: PreprocessingBatch) -> StoreResult<PreprocessingBatch> {
        self.inner.insert_batch(batch)
    }
    fn batch(&self, id: BatchId) -> StoreResult<PreprocessingBatch> {
        self.inner.batch(id)
    }
    fn transition_batch(&self, id: BatchId, from: &[Status], to: Status) -> StoreResult<bool> {
        self.inner.transition_batch(id, from, to)
    }
    fn append_batch_error(&self, id: BatchId, message: &str) -> StoreResult<()> {
        self.inner.append_batch_error(id, message)
    }
    fn insert_artifact(&self, artifact: Artifact) -> StoreResult<Artifact> {
        self.inner.insert_artifact(artifact)
    }
    fn artifacts(&self, batch: BatchId) -> StoreResult<Vec<Artifact>> {
        self.inner.artifacts(batch)
    }
    fn image_artifacts(&self, batch: BatchId, image: ImageId) -> StoreResult<Vec<Artifact>> {
        self.inner.image_artifacts(batch, image)
    }
    fn artifact_count(&self, batch: BatchId) -> StoreResult<usize> {
        self.inner.artifact_count(batch)
    }
    fn delete_artifacts(&self, batch: BatchId, image: ImageId) -> StoreResult<Vec<Artifact>> {
        self.inner.delete_artifacts(batch, image)
    }
    fn insert_analysis(&self, analysis: AnalysisResult) -> StoreResult<AnalysisResult> {
        self.inner.insert_analysis(analysis)
    }
    fn analysis(&self, id: AnalysisId) -> StoreResult<AnalysisResult> {
        self.inner.analysis(id)
    }
    fn transition_analysis(
        &self,
        id: AnalysisId,
        from: &[Status],
        to: Status,
    ) -> StoreResult<bool> {
        self.inner.transition_analysis(id, from, to)
    }
    fn append_analysis_error(&self, id: AnalysisId, message: &str) -> StoreResult<()> {
        self.inner.append_analysis_error(id, message)
    }
    fn set_analysis_output(
        &self,
        _id: AnalysisId,
        _zip_file: BlobRef,
        _data: AnalysisData,
    ) -> StoreResult<()> {
        Err(StoreError::Invalid {
            entity: "analysis",
            detail: "output column is read-only".to_string(),
        })
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub fn test_config(dir: &Path, workers: usize) -> PipelineConfig {
    let mut config = PipelineConfig {
        cache_dir: dir.join("atlas-cache"),
        downsample_factor: 2.0,
        workers,
        ..PipelineConfig::default()
    };
    config.imaging.bias.iterations = 1;
    config.imaging.bias.sigma_mm = 4.0;
    config.imaging.registration.iterations = 3;
    config.imaging.segmentation.iterations = 4;
    config
}

pub struct Fixture {
    pub dir: TempDir,
    pub service: Morphometry,
    pub store: Arc<dyn Store>,
    pub blobs: Arc<dyn BlobStore>,
    pub imaging: Arc<FaultyImaging>,
    pub program: Arc<FakeProgram>,
}

impl Fixture {
    pub fn new(workers: usize) -> Self {
        Self::with(workers, None, ProgramMode::Succeed)
    }

    /// `fail_on` is the 1-based bias correction call that fails.
    pub fn with(workers: usize, fail_on: Option<usize>, mode: ProgramMode) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), workers);
        let imaging = FaultyImaging::new(NativeImaging::new(config.imaging.clone()), fail_on);
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let blobs: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(dir.path().join("blobs")).unwrap());
        let imaging = Arc::new(imaging);
        let program = Arc::new(FakeProgram::new(mode));

        let service = Morphometry::new(
            config,
            store.clone(),
            blobs.clone(),
            imaging.clone(),
            program.clone(),
        )
        .unwrap();

        Self {
            dir,
            service,
            store,
            blobs,
            imaging,
            program,
        }
    }

    pub fn register_atlases(&self) {
        let priors = priors();
        let atlases = [
            ("T1.nii.gz", brain([0.0; 3], 1.0)),
            ("csf.nii.gz", priors.csf),
            ("grey.nii.gz", priors.grey),
            ("white.nii.gz", priors.white),
        ];
        for (name, volume) in atlases {
            self.service
                .register_atlas(name, &nifti_bytes(&volume))
                .unwrap();
        }
    }

    /// Dataset with `count` subjects named `sub01.nii.gz`, `sub02.nii.gz`, ...
    pub fn dataset(&self, count: usize) -> (Dataset, Vec<Image>) {
        let dataset = self.service.create_dataset("study", "owner").unwrap();
        let images = (1..=count)
            .map(|i| {
                self.service
                    .upload_image(
                        dataset.id,
                        &format!("sub{i:02}.nii.gz"),
                        &subject_bytes(i),
                        json!({"age": 20 + i, "site": if i % 2 == 0 { "a" } else { "b" }}),
                    )
                    .unwrap()
            })
            .collect();
        (dataset, images)
    }
}
