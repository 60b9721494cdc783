//! Per-image processing: source volume to the four derived artifacts.
//!
//! Steps run in a fixed order (bias correction, registration, jacobian,
//! segmentation, feature) but only the artifacts an image is still missing
//! for the batch are persisted. Inputs of a missing step that already exist
//! as artifacts are read back instead of recomputed, and an image with all
//! four artifacts is skipped outright.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::error::{Error, Result};
use crate::feature::extract_feature;
use crate::imaging::{Imaging, TissuePriors, Transform};
use crate::model::{
    Artifact, ArtifactFields, ArtifactKind, ArtifactSet, AtlasId, BatchId, Image, Status,
};
use crate::store::Store;
use crate::volume::Volume;

/// Inputs shared by every image of one batch dispatch.
#[derive(Debug)]
pub struct StageContext {
    pub batch: BatchId,
    /// Template atlas the artifacts are recorded against.
    pub atlas: AtlasId,
    pub template: Volume,
    pub priors: TissuePriors,
    pub mask: Volume,
    pub downsample_factor: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// All four artifacts already existed.
    Skipped,
    /// The batch failed before this image was picked up.
    Abandoned,
    /// Artifacts created by this call. Kinds inserted concurrently by another
    /// worker are not included.
    Processed(ArtifactSet),
}

#[derive(Clone)]
pub struct ImageStage {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    imaging: Arc<dyn Imaging>,
    context: Arc<StageContext>,
}

impl std::fmt::Debug for ImageStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStage")
            .field("batch", &self.context.batch)
            .finish_non_exhaustive()
    }
}

impl ImageStage {
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        imaging: Arc<dyn Imaging>,
        context: Arc<StageContext>,
    ) -> Self {
        Self {
            store,
            blobs,
            imaging,
            context,
        }
    }

    pub fn batch(&self) -> BatchId {
        self.context.batch
    }

    /// Blocking; run it off the async executor.
    pub fn process(&self, image: &Image) -> Result<StageOutcome> {
        let batch = self.context.batch;
        if self.store.batch(batch)?.status == Status::Failed {
            debug!(image = %image.name, "Batch failed, not processing");
            return Ok(StageOutcome::Abandoned);
        }

        let present = self.store.artifact_kinds(batch, image.id)?;
        if present.is_complete() {
            debug!(image = %image.name, "Already preprocessed");
            return Ok(StageOutcome::Skipped);
        }
        let missing = present.missing();

        let scratch = TempDir::new().map_err(|e| Error::io(std::env::temp_dir(), e))?;
        let mut created = ArtifactSet::default();

        // registration feeds both the registered volume and the jacobian
        let mut registered: Option<Volume> = None;
        let mut transform: Option<Transform> = None;
        if missing.contains(ArtifactKind::Registered) || missing.contains(ArtifactKind::Jacobian) {
            let source = self.read_source(image, scratch.path())?;

            info!(image = %image.name, "Running bias correction");
            let corrected = self.imaging.bias_correct(&source)?;
            drop(source);

            info!(image = %image.name, "Running registration");
            let registration = self.imaging.register(&self.context.template, &corrected)?;
            registered = Some(registration.warped);
            transform = Some(registration.transform);
        }

        if let Some(volume) = registered.as_ref().filter(|_| missing.contains(ArtifactKind::Registered)) {
            let fields = ArtifactFields::Registered {
                registration_type: self.imaging.registration_type().to_string(),
            };
            self.persist(image, volume, fields, scratch.path(), &mut created)?;
        }

        let jacobian = match transform.take() {
            Some(transform) if missing.contains(ArtifactKind::Jacobian) => {
                info!(image = %image.name, "Computing jacobian determinant");
                let jacobian = self
                    .imaging
                    .jacobian(&self.context.template, &transform)?
                    .abs();
                self.persist(image, &jacobian, ArtifactFields::Jacobian, scratch.path(), &mut created)?;
                Some(jacobian)
            }
            _ if missing.contains(ArtifactKind::Feature) => {
                Some(self.read_artifact(image, ArtifactKind::Jacobian, scratch.path())?)
            }
            _ => None,
        };

        let segmentation = if missing.contains(ArtifactKind::Segmented) {
            let registered = match registered.take() {
                Some(volume) => volume,
                None => self.read_artifact(image, ArtifactKind::Registered, scratch.path())?,
            };
            info!(image = %image.name, "Running segmentation");
            let labels =
                self.imaging
                    .segment(&registered, &self.context.priors, &self.context.mask)?;
            self.persist(image, &labels, ArtifactFields::Segmented, scratch.path(), &mut created)?;
            Some(labels)
        } else if missing.contains(ArtifactKind::Feature) {
            Some(self.read_artifact(image, ArtifactKind::Segmented, scratch.path())?)
        } else {
            None
        };

        if let (Some(jacobian), Some(segmentation)) = (&jacobian, &segmentation) {
            if missing.contains(ArtifactKind::Feature) {
                info!(image = %image.name, "Extracting feature map");
                let feature = extract_feature(
                    self.imaging.as_ref(),
                    jacobian,
                    segmentation,
                    self.context.downsample_factor,
                )?;
                let fields = ArtifactFields::Feature {
                    downsample_factor: self.context.downsample_factor,
                };
                self.persist(image, &feature, fields, scratch.path(), &mut created)?;
            }
        }

        info!(image = %image.name, created = created.len(), "Image preprocessed");
        Ok(StageOutcome::Processed(created))
    }

    fn read_source(&self, image: &Image, scratch: &Path) -> Result<Volume> {
        // keep the uploaded suffix so the reader can tell .nii from .nii.gz
        let path = scratch.join(format!("source_{}", image.blob.name()));
        self.download(&image.blob, &path)?;
        Ok(self.imaging.read(&path)?)
    }

    fn read_artifact(&self, image: &Image, kind: ArtifactKind, scratch: &Path) -> Result<Volume> {
        let artifact = self
            .store
            .image_artifacts(self.context.batch, image.id)?
            .into_iter()
            .find(|a| a.kind() == kind)
            .ok_or_else(|| {
                Error::Store(crate::store::StoreError::not_found(
                    "artifact",
                    format!("{kind} of image {}", image.id),
                ))
            })?;

        debug!(image = %image.name, %kind, "Reusing existing artifact");
        let path = scratch.join(format!("existing_{}", kind.file_name()));
        self.download(&artifact.blob, &path)?;
        Ok(self.imaging.read(&path)?)
    }

    fn download(&self, blob: &crate::blob::BlobRef, path: &Path) -> Result<()> {
        let mut reader = self.blobs.open(blob)?;
        let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
        std::io::copy(&mut reader, &mut file).map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    /// Writes the volume, uploads it and records the artifact. A concurrent
    /// insert of the same kind wins; the redundant blob is removed.
    fn persist(
        &self,
        image: &Image,
        volume: &Volume,
        fields: ArtifactFields,
        scratch: &Path,
        created: &mut ArtifactSet,
    ) -> Result<()> {
        let kind = fields.kind();
        let path = scratch.join(kind.file_name());
        self.imaging.write(volume, &path)?;

        let mut file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let blob = self.blobs.write(&mut file, kind.file_name())?;

        let artifact = Artifact::create(self.context.batch, image.id, self.context.atlas, blob, fields);
        match self.store.insert_artifact(artifact.clone()) {
            Ok(_) => {
                created.insert(kind);
                Ok(())
            }
            Err(err) => {
                if let Err(delete_err) = self.blobs.delete(&artifact.blob) {
                    warn!(blob = %artifact.blob, "Failed to remove orphan blob: {delete_err}");
                }
                if err.is_duplicate() {
                    debug!(image = %image.name, %kind, "Artifact inserted concurrently");
                    Ok(())
                } else {
                    Err(err.into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::tissue_mask;
    use crate::model::PreprocessingBatch;
    use crate::test_utils::{brain, priors, Fixture};

    fn stage_for(fixture: &Fixture, batch: BatchId) -> ImageStage {
        let priors = priors();
        let mask = tissue_mask(&priors).unwrap();
        let atlas = fixture.store.atlas_by_name("T1.nii.gz").unwrap().unwrap();
        ImageStage::new(
            fixture.store.clone(),
            fixture.blobs.clone(),
            fixture.imaging.clone(),
            Arc::new(StageContext {
                batch,
                atlas: atlas.id,
                template: brain([0.0; 3], 1.0),
                priors,
                mask,
                downsample_factor: 2.0,
            }),
        )
    }

    fn blob_count(fixture: &Fixture) -> usize {
        std::fs::read_dir(fixture.dir.path().join("blobs"))
            .unwrap()
            .count()
    }

    #[test]
    fn duplicate_persist_removes_its_blob() -> anyhow::Result<()> {
        let fixture = Fixture::new(1);
        fixture.register_atlases();
        let (dataset, images) = fixture.dataset(1);
        let batch = fixture.store.insert_batch(PreprocessingBatch::new(dataset.id))?;
        let stage = stage_for(&fixture, batch.id);
        let scratch = tempfile::tempdir()?;
        let volume = brain([0.0; 3], 1.0);

        let mut created = ArtifactSet::default();
        stage.persist(&images[0], &volume, ArtifactFields::Jacobian, scratch.path(), &mut created)?;
        assert!(created.contains(ArtifactKind::Jacobian));
        let first = fixture.store.image_artifacts(batch.id, images[0].id)?;
        let blobs_before = blob_count(&fixture);

        // another worker got there first
        let mut created = ArtifactSet::default();
        stage.persist(&images[0], &volume, ArtifactFields::Jacobian, scratch.path(), &mut created)?;
        assert!(created.is_empty());
        assert_eq!(fixture.store.image_artifacts(batch.id, images[0].id)?, first);
        assert_eq!(blob_count(&fixture), blobs_before);
        assert!(fixture.blobs.open(&first[0].blob).is_ok());

        Ok(())
    }

    #[test]
    fn complete_image_is_skipped_and_failed_batch_abandons() -> anyhow::Result<()> {
        let fixture = Fixture::new(1);
        fixture.register_atlases();
        let (dataset, images) = fixture.dataset(1);
        let batch = fixture.store.insert_batch(PreprocessingBatch::new(dataset.id))?;
        let stage = stage_for(&fixture, batch.id);

        let outcome = stage.process(&images[0])?;
        assert_eq!(outcome, StageOutcome::Processed(ArtifactSet::complete()));
        assert_eq!(stage.process(&images[0])?, StageOutcome::Skipped);
        assert_eq!(fixture.store.artifact_count(batch.id)?, 4);

        fixture
            .store
            .transition_batch(batch.id, &[Status::Pending], Status::Failed)?;
        assert_eq!(stage.process(&images[0])?, StageOutcome::Abandoned);
        Ok(())
    }
}
