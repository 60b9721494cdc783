//! Caller-facing operations: uploads, dispatch and status queries.
//!
//! Preconditions are checked synchronously so the caller gets a typed error
//! before any background work starts. Dispatches return a handle to the
//! spawned tokio task; the records themselves are the source of truth for
//! progress and outcome.

use std::path::Path;
use std::sync::Arc;

use hashbrown::HashMap;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analysis::{AnalysisRunner, RscriptProgram, StatisticalProgram};
use crate::blob::{validate_name, BlobRef, BlobStore, LocalBlobStore};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::imaging::{Imaging, NativeImaging};
use crate::model::{
    AnalysisData, AnalysisId, AnalysisResult, Artifact, ArtifactKind, Atlas, AtlasId, BatchId,
    Dataset, DatasetId, Image, ImageId, PreprocessingBatch, Status,
};
use crate::orchestrator::{BatchOrchestrator, BatchReport};
use crate::store::{MemoryStore, Store};

#[derive(Debug)]
pub struct PreprocessingHandle {
    pub batch: BatchId,
    task: JoinHandle<Result<BatchReport>>,
}

impl PreprocessingHandle {
    pub async fn join(self) -> Result<BatchReport> {
        self.task.await?
    }
}

#[derive(Debug)]
pub struct AnalysisHandle {
    pub analysis: AnalysisId,
    task: JoinHandle<Result<Status>>,
}

impl AnalysisHandle {
    pub async fn join(self) -> Result<Status> {
        self.task.await?
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchStatus {
    pub status: Status,
    pub progress: f64,
    /// Name of the first image still missing artifacts.
    pub current_image: Option<String>,
    pub error_message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisStatus {
    pub status: Status,
    pub data: AnalysisData,
    pub zip_url: Option<String>,
    pub error_message: String,
}

/// Artifacts of one source image within a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageArtifacts {
    pub image: Image,
    pub registered: Option<Artifact>,
    pub jacobian: Option<Artifact>,
    pub segmented: Option<Artifact>,
    pub feature: Option<Artifact>,
}

impl ImageArtifacts {
    fn new(image: Image) -> Self {
        Self {
            image,
            registered: None,
            jacobian: None,
            segmented: None,
            feature: None,
        }
    }

    fn slot(&mut self, kind: ArtifactKind) -> &mut Option<Artifact> {
        match kind {
            ArtifactKind::Registered => &mut self.registered,
            ArtifactKind::Jacobian => &mut self.jacobian,
            ArtifactKind::Segmented => &mut self.segmented,
            ArtifactKind::Feature => &mut self.feature,
        }
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&Artifact> {
        match kind {
            ArtifactKind::Registered => self.registered.as_ref(),
            ArtifactKind::Jacobian => self.jacobian.as_ref(),
            ArtifactKind::Segmented => self.segmented.as_ref(),
            ArtifactKind::Feature => self.feature.as_ref(),
        }
    }
}

pub struct Morphometry {
    config: PipelineConfig,
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    orchestrator: BatchOrchestrator,
    analysis: AnalysisRunner,
}

impl std::fmt::Debug for Morphometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Morphometry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Morphometry {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        imaging: Arc<dyn Imaging>,
        program: Arc<dyn StatisticalProgram>,
    ) -> Result<Self> {
        let orchestrator =
            BatchOrchestrator::new(config.clone(), store.clone(), blobs.clone(), imaging)?;
        let analysis = AnalysisRunner::new(store.clone(), blobs.clone(), program);

        Ok(Self {
            config,
            store,
            blobs,
            orchestrator,
            analysis,
        })
    }

    /// In-memory records, blobs under `workdir/blobs`, native imaging and
    /// the configured analysis program.
    pub fn local(config: PipelineConfig, workdir: &Path) -> Result<Self> {
        let blobs = LocalBlobStore::new(workdir.join("blobs"))?;
        let imaging = NativeImaging::new(config.imaging.clone());
        let program = RscriptProgram::from_config(&config.analysis);

        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(blobs),
            Arc::new(imaging),
            Arc::new(program),
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn orchestrator(&self) -> &BatchOrchestrator {
        &self.orchestrator
    }

    // ===================================================================
    // Uploads
    // ===================================================================

    pub fn register_atlas(&self, name: &str, bytes: &[u8]) -> Result<Atlas> {
        validate_name(name)?;
        let blob = self.blobs.write_bytes(bytes, name)?;
        let atlas = Atlas {
            id: AtlasId::unique(),
            name: name.to_string(),
            blob,
        };
        let atlas = self.insert_or_drop_blob(atlas.blob.clone(), || {
            self.store.insert_atlas(atlas)
        })?;

        info!(atlas = %atlas.name, "Atlas registered");
        Ok(atlas)
    }

    pub fn create_dataset(&self, name: &str, owner: &str) -> Result<Dataset> {
        Ok(self.store.insert_dataset(Dataset::new(name, owner))?)
    }

    /// `metadata` must be a JSON object; it becomes the image's covariates.
    pub fn upload_image(
        &self,
        dataset: DatasetId,
        name: &str,
        bytes: &[u8],
        metadata: serde_json::Value,
    ) -> Result<Image> {
        let serde_json::Value::Object(metadata) = metadata else {
            return Err(Error::InvalidMetadata);
        };
        validate_name(name)?;
        self.store.dataset(dataset)?;

        let blob = self.blobs.write_bytes(bytes, name)?;
        let image = Image {
            id: ImageId::unique(),
            dataset,
            name: name.to_string(),
            blob,
            metadata,
        };
        self.insert_or_drop_blob(image.blob.clone(), || self.store.insert_image(image))
    }

    fn insert_or_drop_blob<T>(
        &self,
        blob: BlobRef,
        insert: impl FnOnce() -> crate::store::StoreResult<T>,
    ) -> Result<T> {
        insert().map_err(|err| {
            if let Err(delete_err) = self.blobs.delete(&blob) {
                warn!(%blob, "Failed to remove unreferenced blob: {delete_err}");
            }
            err.into()
        })
    }

    // ===================================================================
    // Preprocessing
    // ===================================================================

    /// Starts preprocessing of the dataset's current batch, or of a new
    /// batch when there is none or the current one failed.
    pub fn dispatch_preprocessing(
        &self,
        dataset_id: DatasetId,
        replace: bool,
    ) -> Result<PreprocessingHandle> {
        let dataset = self.store.dataset(dataset_id)?;
        if self.store.image_count(dataset_id)? == 0 {
            return Err(Error::EmptyDataset);
        }

        let current = dataset
            .current_preprocessing_batch
            .map(|id| self.store.batch(id))
            .transpose()?;
        if current.as_ref().is_some_and(|b| b.status == Status::Running) {
            return Err(Error::PreprocessingRunning);
        }

        self.orchestrator.resolve_atlases()?;

        let batch = match current {
            Some(batch) if batch.status != Status::Failed => batch,
            _ => self
                .store
                .insert_batch(PreprocessingBatch::new(dataset_id))?,
        };
        self.store
            .set_dataset_preprocessing(dataset_id, batch.id, batch.status)?;
        info!(dataset = %dataset.name, batch = %batch.id, replace, "Preprocessing dispatched");

        let orchestrator = self.orchestrator.clone();
        let batch_id = batch.id;
        let task = tokio::spawn(async move { orchestrator.dispatch(batch_id, replace).await });

        Ok(PreprocessingHandle {
            batch: batch_id,
            task,
        })
    }

    pub fn get_batch_status(&self, batch_id: BatchId) -> Result<BatchStatus> {
        let batch = self.store.batch(batch_id)?;
        Ok(BatchStatus {
            status: batch.status,
            progress: self.orchestrator.get_progress(batch_id)?,
            current_image: self
                .orchestrator
                .get_current_image(batch_id)?
                .map(|image| image.name),
            error_message: batch.error_message,
        })
    }

    /// Every source image of the batch's dataset in name order, with the
    /// artifacts present so far.
    pub fn batch_images(&self, batch_id: BatchId) -> Result<Vec<ImageArtifacts>> {
        let batch = self.store.batch(batch_id)?;
        let mut by_image: HashMap<ImageId, Vec<Artifact>> = HashMap::new();
        for artifact in self.store.artifacts(batch_id)? {
            by_image
                .entry(artifact.source_image)
                .or_default()
                .push(artifact);
        }

        let images = self.store.images(batch.dataset)?;
        Ok(images
            .into_iter()
            .map(|image| {
                let artifacts = by_image.remove(&image.id).unwrap_or_default();
                let mut entry = ImageArtifacts::new(image);
                for artifact in artifacts {
                    let kind = artifact.kind();
                    *entry.slot(kind) = Some(artifact);
                }
                entry
            })
            .collect())
    }

    // ===================================================================
    // Analysis
    // ===================================================================

    pub fn dispatch_analysis(&self, batch_id: BatchId) -> Result<AnalysisHandle> {
        let batch = self.store.batch(batch_id)?;
        if batch.status != Status::Finished {
            return Err(Error::PreprocessingNotFinished);
        }

        let dataset = self.store.dataset(batch.dataset)?;
        if let Some(current) = dataset.current_analysis_result {
            if self.store.analysis(current)?.status.is_active() {
                return Err(Error::AnalysisRunning);
            }
        }

        let analysis = self.store.insert_analysis(AnalysisResult::new(batch_id))?;
        self.store
            .set_dataset_analysis(dataset.id, analysis.id, analysis.status)?;
        info!(dataset = %dataset.name, analysis = %analysis.id, "Analysis dispatched");

        let runner = self.analysis.clone();
        let analysis_id = analysis.id;
        let task = tokio::spawn(async move { runner.run(analysis_id).await });

        Ok(AnalysisHandle {
            analysis: analysis_id,
            task,
        })
    }

    pub fn get_analysis_result(&self, analysis_id: AnalysisId) -> Result<AnalysisStatus> {
        let analysis = self.store.analysis(analysis_id)?;
        Ok(AnalysisStatus {
            status: analysis.status,
            zip_url: analysis.zip_file.as_ref().map(|blob| self.blobs.url(blob)),
            data: analysis.data,
            error_message: analysis.error_message,
        })
    }
}
