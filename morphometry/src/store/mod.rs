//! Relational persistence collaborator.
//!
//! The pipeline only needs the narrow set of queries below; status columns
//! change exclusively through compare-and-set transitions so concurrent
//! workers cannot finalize a record twice.

use thiserror::Error;

use crate::blob::BlobRef;
use crate::model::{
    AnalysisData, AnalysisId, AnalysisResult, Artifact, ArtifactSet, Atlas, AtlasId, BatchId,
    Dataset, DatasetId, Image, ImageId, PreprocessingBatch, Status,
};

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Duplicate {entity}: {detail}")]
    Duplicate {
        entity: &'static str,
        detail: String,
    },
    #[error("Invalid {entity}: {detail}")]
    Invalid {
        entity: &'static str,
        detail: String,
    },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub trait Store: Send + Sync {
    // === Atlases ===

    fn insert_atlas(&self, atlas: Atlas) -> StoreResult<Atlas>;
    fn atlas(&self, id: AtlasId) -> StoreResult<Atlas>;
    fn atlas_by_name(&self, name: &str) -> StoreResult<Option<Atlas>>;

    // === Datasets and images ===

    fn insert_dataset(&self, dataset: Dataset) -> StoreResult<Dataset>;
    fn dataset(&self, id: DatasetId) -> StoreResult<Dataset>;
    /// Points the dataset at `batch` and mirrors its status.
    fn set_dataset_preprocessing(
        &self,
        id: DatasetId,
        batch: BatchId,
        status: Status,
    ) -> StoreResult<()>;
    /// Points the dataset at `analysis` and mirrors its status.
    fn set_dataset_analysis(
        &self,
        id: DatasetId,
        analysis: AnalysisId,
        status: Status,
    ) -> StoreResult<()>;

    /// Image names are unique within a dataset.
    fn insert_image(&self, image: Image) -> StoreResult<Image>;
    fn image(&self, id: ImageId) -> StoreResult<Image>;
    /// Images of a dataset ordered by name.
    fn images(&self, dataset: DatasetId) -> StoreResult<Vec<Image>>;
    fn image_count(&self, dataset: DatasetId) -> StoreResult<usize>;

    // === Preprocessing batches ===

    fn insert_batch(&self, batch: PreprocessingBatch) -> StoreResult<PreprocessingBatch>;
    fn batch(&self, id: BatchId) -> StoreResult<PreprocessingBatch>;
    /// Sets the status to `to` only when the current status is one of `from`.
    /// Returns whether the status changed.
    fn transition_batch(&self, id: BatchId, from: &[Status], to: Status) -> StoreResult<bool>;
    fn append_batch_error(&self, id: BatchId, message: &str) -> StoreResult<()>;

    // === Artifacts ===

    /// Fails with [`StoreError::Duplicate`] when the (batch, image, kind)
    /// triple already exists.
    fn insert_artifact(&self, artifact: Artifact) -> StoreResult<Artifact>;
    fn artifacts(&self, batch: BatchId) -> StoreResult<Vec<Artifact>>;
    fn image_artifacts(&self, batch: BatchId, image: ImageId) -> StoreResult<Vec<Artifact>>;
    fn artifact_count(&self, batch: BatchId) -> StoreResult<usize>;
    /// Removes every artifact of `image` in `batch` in one step and returns them.
    fn delete_artifacts(&self, batch: BatchId, image: ImageId) -> StoreResult<Vec<Artifact>>;

    fn artifact_kinds(&self, batch: BatchId, image: ImageId) -> StoreResult<ArtifactSet> {
        Ok(self
            .image_artifacts(batch, image)?
            .iter()
            .map(Artifact::kind)
            .collect())
    }

    // === Analysis results ===

    fn insert_analysis(&self, analysis: AnalysisResult) -> StoreResult<AnalysisResult>;
    fn analysis(&self, id: AnalysisId) -> StoreResult<AnalysisResult>;
    fn transition_analysis(
        &self,
        id: AnalysisId,
        from: &[Status],
        to: Status,
    ) -> StoreResult<bool>;
    fn append_analysis_error(&self, id: AnalysisId, message: &str) -> StoreResult<()>;
    fn set_analysis_output(
        &self,
        id: AnalysisId,
        zip_file: BlobRef,
        data: AnalysisData,
    ) -> StoreResult<()>;
}
