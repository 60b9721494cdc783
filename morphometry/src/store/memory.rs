use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{Store, StoreError, StoreResult};
use crate::blob::BlobRef;
use crate::model::{
    append_log, AnalysisData, AnalysisId, AnalysisResult, Artifact, ArtifactId, ArtifactKind,
    Atlas, AtlasId, BatchId, Dataset, DatasetId, Image, ImageId, PreprocessingBatch, Status,
};

type ArtifactKey = (BatchId, ImageId, ArtifactKind);

#[derive(Debug, Default)]
struct Tables {
    atlases: HashMap<AtlasId, Atlas>,
    datasets: HashMap<DatasetId, Dataset>,
    images: HashMap<ImageId, Image>,
    batches: HashMap<BatchId, PreprocessingBatch>,
    artifacts: HashMap<ArtifactId, Artifact>,
    artifact_index: HashMap<ArtifactKey, ArtifactId>,
    analyses: HashMap<AnalysisId, AnalysisResult>,
}

impl Tables {
    fn dataset_mut(&mut self, id: DatasetId) -> StoreResult<&mut Dataset> {
        self.datasets
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("dataset", id))
    }

    fn batch_mut(&mut self, id: BatchId) -> StoreResult<&mut PreprocessingBatch> {
        self.batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("preprocessing batch", id))
    }

    fn analysis_mut(&mut self, id: AnalysisId) -> StoreResult<&mut AnalysisResult> {
        self.analyses
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("analysis result", id))
    }

    fn batch_artifacts(&self, batch: BatchId) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values().filter(move |a| a.batch == batch)
    }
}

/// Process-local [`Store`] backed by hash maps behind one lock.
///
/// Every trait method takes the lock once, so each call is atomic with
/// respect to the others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_atlas(&self, atlas: Atlas) -> StoreResult<Atlas> {
        let mut tables = self.tables.write();
        if tables.atlases.values().any(|a| a.name == atlas.name) {
            return Err(StoreError::Duplicate {
                entity: "atlas",
                detail: atlas.name,
            });
        }
        tables.atlases.insert(atlas.id, atlas.clone());
        Ok(atlas)
    }

    fn atlas(&self, id: AtlasId) -> StoreResult<Atlas> {
        self.tables
            .read()
            .atlases
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("atlas", id))
    }

    fn atlas_by_name(&self, name: &str) -> StoreResult<Option<Atlas>> {
        Ok(self
            .tables
            .read()
            .atlases
            .values()
            .find(|a| a.name == name)
            .cloned())
    }

    fn insert_dataset(&self, dataset: Dataset) -> StoreResult<Dataset> {
        let mut tables = self.tables.write();
        let clash = tables
            .datasets
            .values()
            .any(|d| d.owner == dataset.owner && d.name == dataset.name);
        if clash {
            return Err(StoreError::Duplicate {
                entity: "dataset",
                detail: format!("{} (owner {})", dataset.name, dataset.owner),
            });
        }
        tables.datasets.insert(dataset.id, dataset.clone());
        Ok(dataset)
    }

    fn dataset(&self, id: DatasetId) -> StoreResult<Dataset> {
        self.tables
            .read()
            .datasets
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("dataset", id))
    }

    fn set_dataset_preprocessing(
        &self,
        id: DatasetId,
        batch: BatchId,
        status: Status,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let dataset = tables.dataset_mut(id)?;
        dataset.current_preprocessing_batch = Some(batch);
        dataset.preprocessing_status = status;
        Ok(())
    }

    fn set_dataset_analysis(
        &self,
        id: DatasetId,
        analysis: AnalysisId,
        status: Status,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let dataset = tables.dataset_mut(id)?;
        dataset.current_analysis_result = Some(analysis);
        dataset.analysis_status = status;
        Ok(())
    }

    fn insert_image(&self, image: Image) -> StoreResult<Image> {
        let mut tables = self.tables.write();
        if !tables.datasets.contains_key(&image.dataset) {
            return Err(StoreError::not_found("dataset", image.dataset));
        }
        let clash = tables
            .images
            .values()
            .any(|i| i.dataset == image.dataset && i.name == image.name);
        if clash {
            return Err(StoreError::Duplicate {
                entity: "image",
                detail: image.name,
            });
        }
        tables.images.insert(image.id, image.clone());
        Ok(image)
    }

    fn image(&self, id: ImageId) -> StoreResult<Image> {
        self.tables
            .read()
            .images
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("image", id))
    }

    fn images(&self, dataset: DatasetId) -> StoreResult<Vec<Image>> {
        let tables = self.tables.read();
        let mut images: Vec<Image> = tables
            .images
            .values()
            .filter(|i| i.dataset == dataset)
            .cloned()
            .collect();
        images.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(images)
    }

    fn image_count(&self, dataset: DatasetId) -> StoreResult<usize> {
        Ok(self
            .tables
            .read()
            .images
            .values()
            .filter(|i| i.dataset == dataset)
            .count())
    }

    fn insert_batch(&self, batch: PreprocessingBatch) -> StoreResult<PreprocessingBatch> {
        let mut tables = self.tables.write();
        if !tables.datasets.contains_key(&batch.dataset) {
            return Err(StoreError::not_found("dataset", batch.dataset));
        }
        tables.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    fn batch(&self, id: BatchId) -> StoreResult<PreprocessingBatch> {
        self.tables
            .read()
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("preprocessing batch", id))
    }

    fn transition_batch(&self, id: BatchId, from: &[Status], to: Status) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let batch = tables.batch_mut(id)?;
        if !from.contains(&batch.status) {
            return Ok(false);
        }
        batch.status = to;
        Ok(true)
    }

    fn append_batch_error(&self, id: BatchId, message: &str) -> StoreResult<()> {
        let mut tables = self.tables.write();
        append_log(&mut tables.batch_mut(id)?.error_message, message);
        Ok(())
    }

    fn insert_artifact(&self, artifact: Artifact) -> StoreResult<Artifact> {
        let mut tables = self.tables.write();

        let batch = tables
            .batches
            .get(&artifact.batch)
            .ok_or_else(|| StoreError::not_found("preprocessing batch", artifact.batch))?;
        let image = tables
            .images
            .get(&artifact.source_image)
            .ok_or_else(|| StoreError::not_found("image", artifact.source_image))?;
        if image.dataset != batch.dataset {
            return Err(StoreError::Invalid {
                entity: "artifact",
                detail: format!(
                    "image {} does not belong to the dataset of batch {}",
                    image.id, batch.id
                ),
            });
        }

        let key = (artifact.batch, artifact.source_image, artifact.kind());
        if tables.artifact_index.contains_key(&key) {
            return Err(StoreError::Duplicate {
                entity: "artifact",
                detail: format!("{} of image {}", artifact.kind(), artifact.source_image),
            });
        }

        tables.artifact_index.insert(key, artifact.id);
        tables.artifacts.insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    fn artifacts(&self, batch: BatchId) -> StoreResult<Vec<Artifact>> {
        let tables = self.tables.read();
        let mut artifacts: Vec<Artifact> = tables.batch_artifacts(batch).cloned().collect();
        artifacts.sort_by_key(|a| (a.source_image, a.kind()));
        Ok(artifacts)
    }

    fn image_artifacts(&self, batch: BatchId, image: ImageId) -> StoreResult<Vec<Artifact>> {
        let tables = self.tables.read();
        let mut artifacts: Vec<Artifact> = ArtifactKind::all()
            .filter_map(|kind| tables.artifact_index.get(&(batch, image, kind)))
            .filter_map(|id| tables.artifacts.get(id))
            .cloned()
            .collect();
        artifacts.sort_by_key(Artifact::kind);
        Ok(artifacts)
    }

    fn artifact_count(&self, batch: BatchId) -> StoreResult<usize> {
        Ok(self.tables.read().batch_artifacts(batch).count())
    }

    fn delete_artifacts(&self, batch: BatchId, image: ImageId) -> StoreResult<Vec<Artifact>> {
        let mut tables = self.tables.write();
        let mut removed = Vec::new();
        for kind in ArtifactKind::all() {
            if let Some(id) = tables.artifact_index.remove(&(batch, image, kind)) {
                if let Some(artifact) = tables.artifacts.remove(&id) {
                    removed.push(artifact);
                }
            }
        }
        Ok(removed)
    }

    fn insert_analysis(&self, analysis: AnalysisResult) -> StoreResult<AnalysisResult> {
        let mut tables = self.tables.write();
        if !tables.batches.contains_key(&analysis.batch) {
            return Err(StoreError::not_found("preprocessing batch", analysis.batch));
        }
        tables.analyses.insert(analysis.id, analysis.clone());
        Ok(analysis)
    }

    fn analysis(&self, id: AnalysisId) -> StoreResult<AnalysisResult> {
        self.tables
            .read()
            .analyses
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("analysis result", id))
    }

    fn transition_analysis(
        &self,
        id: AnalysisId,
        from: &[Status],
        to: Status,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let analysis = tables.analysis_mut(id)?;
        if !from.contains(&analysis.status) {
            return Ok(false);
        }
        analysis.status = to;
        Ok(true)
    }

    fn append_analysis_error(&self, id: AnalysisId, message: &str) -> StoreResult<()> {
        let mut tables = self.tables.write();
        append_log(&mut tables.analysis_mut(id)?.error_message, message);
        Ok(())
    }

    fn set_analysis_output(
        &self,
        id: AnalysisId,
        zip_file: BlobRef,
        data: AnalysisData,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let analysis = tables.analysis_mut(id)?;
        analysis.zip_file = Some(zip_file);
        analysis.data = data;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArtifactFields;

    fn seeded() -> (MemoryStore, Dataset, Vec<Image>) {
        let store = MemoryStore::new();
        let dataset = store.insert_dataset(Dataset::new("cohort", "owner@example.com")).unwrap();
        let images = ["subj-b.nii", "subj-a.nii"]
            .into_iter()
            .map(|name| {
                store
                    .insert_image(Image {
                        id: ImageId::unique(),
                        dataset: dataset.id,
                        name: name.to_string(),
                        blob: BlobRef::new(format!("k/{name}")),
                        metadata: Default::default(),
                    })
                    .unwrap()
            })
            .collect();
        (store, dataset, images)
    }

    fn artifact(batch: BatchId, image: ImageId, fields: ArtifactFields) -> Artifact {
        Artifact::create(batch, image, AtlasId::unique(), BlobRef::new("k/a"), fields)
    }

    #[test]
    fn images_are_listed_by_name() {
        let (store, dataset, _) = seeded();
        let names: Vec<_> = store
            .images(dataset.id)
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, ["subj-a.nii", "subj-b.nii"]);
        assert_eq!(store.image_count(dataset.id).unwrap(), 2);
    }

    #[test]
    fn image_names_are_unique_per_dataset() {
        let (store, dataset, images) = seeded();
        let mut copy = images[0].clone();
        copy.id = ImageId::unique();
        assert!(store.insert_image(copy).unwrap_err().is_duplicate());

        let other = store.insert_dataset(Dataset::new("other", "owner@example.com")).unwrap();
        let mut moved = images[0].clone();
        moved.id = ImageId::unique();
        moved.dataset = other.id;
        assert!(store.insert_image(moved).is_ok());
        assert_eq!(store.image_count(dataset.id).unwrap(), 2);
    }

    #[test]
    fn artifact_triples_are_unique() {
        let (store, dataset, images) = seeded();
        let batch = store.insert_batch(PreprocessingBatch::new(dataset.id)).unwrap();

        store
            .insert_artifact(artifact(batch.id, images[0].id, ArtifactFields::Jacobian))
            .unwrap();
        let err = store
            .insert_artifact(artifact(batch.id, images[0].id, ArtifactFields::Jacobian))
            .unwrap_err();
        assert!(err.is_duplicate());

        store
            .insert_artifact(artifact(batch.id, images[1].id, ArtifactFields::Jacobian))
            .unwrap();
        assert_eq!(store.artifact_count(batch.id).unwrap(), 2);
        assert_eq!(
            store.artifact_kinds(batch.id, images[0].id).unwrap().len(),
            1
        );
    }

    #[test]
    fn delete_artifacts_removes_only_one_image() {
        let (store, dataset, images) = seeded();
        let batch = store.insert_batch(PreprocessingBatch::new(dataset.id)).unwrap();
        for image in &images {
            store
                .insert_artifact(artifact(batch.id, image.id, ArtifactFields::Segmented))
                .unwrap();
            store
                .insert_artifact(artifact(
                    batch.id,
                    image.id,
                    ArtifactFields::Feature {
                        downsample_factor: 2.0,
                    },
                ))
                .unwrap();
        }

        let removed = store.delete_artifacts(batch.id, images[0].id).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.artifact_count(batch.id).unwrap(), 2);
        assert!(store.artifact_kinds(batch.id, images[0].id).unwrap().is_empty());

        // the slot is free again
        store
            .insert_artifact(artifact(batch.id, images[0].id, ArtifactFields::Segmented))
            .unwrap();
    }

    #[test]
    fn artifacts_must_match_batch_dataset() {
        let (store, _, images) = seeded();
        let other = store.insert_dataset(Dataset::new("other", "someone")).unwrap();
        let batch = store.insert_batch(PreprocessingBatch::new(other.id)).unwrap();

        let err = store
            .insert_artifact(artifact(batch.id, images[0].id, ArtifactFields::Jacobian))
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid { .. }));
    }

    #[test]
    fn transitions_are_compare_and_set() {
        let (store, dataset, _) = seeded();
        let batch = store.insert_batch(PreprocessingBatch::new(dataset.id)).unwrap();

        assert!(store
            .transition_batch(batch.id, &[Status::Pending], Status::Running)
            .unwrap());
        assert!(!store
            .transition_batch(batch.id, &[Status::Pending], Status::Running)
            .unwrap());
        assert!(store
            .transition_batch(batch.id, &[Status::Running], Status::Finished)
            .unwrap());
        assert!(!store
            .transition_batch(batch.id, &[Status::Running], Status::Finished)
            .unwrap());
        assert_eq!(store.batch(batch.id).unwrap().status, Status::Finished);

        store.append_batch_error(batch.id, "one").unwrap();
        store.append_batch_error(batch.id, "two").unwrap();
        assert_eq!(store.batch(batch.id).unwrap().error_message, "one\ntwo");
    }
}
