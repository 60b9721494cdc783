//! Preprocessing batch state machine.
//!
//! `Pending -> Running -> {Finished, Failed}`. A dispatch resolves the atlases,
//! builds the tissue mask once and fans the images still missing artifacts out
//! to a [`Worker`]. Completion is decided from the artifact count alone, and
//! every status write is a compare-and-set so a batch is finalized once.

use std::sync::Arc;

use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, error, info, instrument, warn};

use crate::atlas_cache::{AtlasCache, AtlasSet};
use crate::blob::BlobStore;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::imaging::Imaging;
use crate::mask::tissue_mask;
use crate::model::{BatchId, Image, PreprocessingBatch, Status, ARTIFACTS_PER_IMAGE};
use crate::stage::{ImageStage, StageContext, StageOutcome};
use crate::store::Store;

mod worker;

pub use worker::{WorkOutcome, Worker, WorkerMessage};

/// What one dispatch call did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchReport {
    pub batch: BatchId,
    pub status: Status,
    pub processed: usize,
    pub skipped: usize,
    pub abandoned: usize,
    pub failed: usize,
}

impl BatchReport {
    fn new(batch: BatchId, status: Status) -> Self {
        Self {
            batch,
            status,
            processed: 0,
            skipped: 0,
            abandoned: 0,
            failed: 0,
        }
    }
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    config: PipelineConfig,
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    imaging: Arc<dyn Imaging>,
    cache: AtlasCache,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl BatchOrchestrator {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        imaging: Arc<dyn Imaging>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = AtlasCache::new(config.cache_dir.clone(), blobs.clone());

        Ok(Self {
            config,
            store,
            blobs,
            imaging,
            cache,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn resolve_atlases(&self) -> Result<AtlasSet> {
        AtlasSet::resolve(self.store.as_ref(), &self.config.atlases)
    }

    /// Runs the batch to completion and returns once every dispatched image
    /// has been reported. A batch that is already running is left alone.
    /// With `replace`, existing artifacts are deleted and every image is
    /// processed again.
    #[instrument(level = "info", skip(self, batch_id), fields(batch = %batch_id))]
    pub async fn dispatch(&self, batch_id: BatchId, replace: bool) -> Result<BatchReport> {
        let batch = self.store.batch(batch_id)?;
        match batch.status {
            Status::Running => {
                info!("Batch already running");
                return Ok(BatchReport::new(batch_id, Status::Running));
            }
            Status::Failed => {
                return Err(Error::InvalidTransition {
                    batch: batch_id,
                    status: Status::Failed,
                });
            }
            Status::Pending | Status::Finished => {}
        }

        let atlases = match self.resolve_atlases() {
            Ok(atlases) => atlases,
            Err(err) => {
                self.fail_batch(&batch, &error_text(&err))?;
                return Err(err);
            }
        };

        let images = self.store.images(batch.dataset)?;
        let image_count = images.len();

        let pending = if replace {
            images
        } else {
            let mut pending = Vec::with_capacity(images.len());
            for image in images {
                if !self.store.artifact_kinds(batch_id, image.id)?.is_complete() {
                    pending.push(image);
                }
            }
            pending
        };

        if pending.is_empty() && !replace {
            // nothing to do, only a fresh batch changes status
            if self
                .store
                .transition_batch(batch_id, &[Status::Pending], Status::Finished)?
            {
                self.mirror(&batch, Status::Finished)?;
            }
            let mut report = BatchReport::new(batch_id, self.store.batch(batch_id)?.status);
            report.skipped = image_count;
            info!(images = image_count, "All images already preprocessed");
            return Ok(report);
        }

        if !self
            .store
            .transition_batch(batch_id, &[Status::Pending, Status::Finished], Status::Running)?
        {
            let status = self.store.batch(batch_id)?.status;
            info!(%status, "Batch was dispatched concurrently");
            return Ok(BatchReport::new(batch_id, status));
        }
        self.mirror(&batch, Status::Running)?;
        info!(images = pending.len(), replace, "Batch running");

        match self.run(&batch, atlases, pending, replace).await {
            Ok(mut report) => {
                report.status = self.finalize(&batch, image_count)?;
                info!(
                    status = %report.status,
                    processed = report.processed,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Batch dispatch finished"
                );
                Ok(report)
            }
            Err(err) => {
                error!("Batch aborted: {}", error_text(&err));
                self.fail_batch(&batch, &error_text(&err))?;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        batch: &PreprocessingBatch,
        atlases: AtlasSet,
        pending: Vec<Image>,
        replace: bool,
    ) -> Result<BatchReport> {
        if replace {
            for image in &pending {
                self.clear_artifacts(batch.id, image)?;
            }
        }

        let context = self.load_context(batch.id, atlases).await?;
        let stage = Arc::new(ImageStage::new(
            self.store.clone(),
            self.blobs.clone(),
            self.imaging.clone(),
            Arc::new(context),
        ));

        // failures are recorded before the worker starts its next image
        let (tx, mut rx) = unbounded_channel::<WorkOutcome>();
        let hook = self.clone();
        let hook_batch = batch.clone();
        let concurrency = self.config.workers.min(pending.len()).max(1);
        let worker = Worker::new(stage, concurrency, move |outcome: WorkOutcome| {
            if let Err(err) = &outcome.result {
                let message = format!("image {}: {}", outcome.image.name, error_text(err));
                error!("Preprocessing failed for {message}");
                if let Err(store_err) = hook.fail_batch(&hook_batch, &message) {
                    error!("Failed to record batch failure: {store_err}");
                }
            }
            // the receiver only goes away with the dispatch future
            let _ = tx.send(outcome);
        });

        for image in pending {
            worker.process(image);
        }
        worker.exit();

        let mut report = BatchReport::new(batch.id, Status::Running);
        while let Some(outcome) = rx.recv().await {
            match outcome.result {
                Ok(StageOutcome::Processed(created)) => {
                    debug!(image = %outcome.image.name, created = created.len(), "Image done");
                    report.processed += 1;
                }
                Ok(StageOutcome::Skipped) => report.skipped += 1,
                Ok(StageOutcome::Abandoned) => report.abandoned += 1,
                Err(_) => report.failed += 1,
            }
        }

        worker.join().await?;
        Ok(report)
    }

    async fn load_context(&self, batch: BatchId, atlases: AtlasSet) -> Result<StageContext> {
        let cache = self.cache.clone();
        let imaging = self.imaging.clone();
        let downsample_factor = self.config.downsample_factor;

        tokio::task::spawn_blocking(move || -> Result<StageContext> {
            let loaded = cache.load(&atlases, imaging.as_ref())?;
            let mask = tissue_mask(&loaded.priors)?;
            debug!(shape = ?mask.shape(), "Tissue mask built");

            Ok(StageContext {
                batch,
                atlas: atlases.template.id,
                template: loaded.template,
                priors: loaded.priors,
                mask,
                downsample_factor,
            })
        })
        .await?
    }

    fn clear_artifacts(&self, batch: BatchId, image: &Image) -> Result<()> {
        let removed = self.store.delete_artifacts(batch, image.id)?;
        for artifact in &removed {
            if let Err(err) = self.blobs.delete(&artifact.blob) {
                warn!(blob = %artifact.blob, "Failed to delete replaced artifact blob: {err}");
            }
        }
        if !removed.is_empty() {
            debug!(image = %image.name, removed = removed.len(), "Cleared artifacts");
        }
        Ok(())
    }

    fn finalize(&self, batch: &PreprocessingBatch, image_count: usize) -> Result<Status> {
        let count = self.store.artifact_count(batch.id)?;
        let expected = ARTIFACTS_PER_IMAGE * image_count;

        if count >= expected {
            if self
                .store
                .transition_batch(batch.id, &[Status::Running], Status::Finished)?
            {
                self.mirror(batch, Status::Finished)?;
            }
        } else if self.store.batch(batch.id)?.status == Status::Running {
            self.fail_batch(
                batch,
                &format!("Batch incomplete: {count} of {expected} artifacts present"),
            )?;
        }

        Ok(self.store.batch(batch.id)?.status)
    }

    /// Appends to the error log and moves an unfinished batch to Failed.
    fn fail_batch(&self, batch: &PreprocessingBatch, message: &str) -> Result<()> {
        self.store.append_batch_error(batch.id, message)?;
        if self
            .store
            .transition_batch(batch.id, &[Status::Pending, Status::Running], Status::Failed)?
        {
            self.mirror(batch, Status::Failed)?;
        }
        Ok(())
    }

    /// Mirrors the status onto the dataset when this is its current batch.
    fn mirror(&self, batch: &PreprocessingBatch, status: Status) -> Result<()> {
        let dataset = self.store.dataset(batch.dataset)?;
        match dataset.current_preprocessing_batch {
            Some(current) if current != batch.id => Ok(()),
            _ => Ok(self
                .store
                .set_dataset_preprocessing(dataset.id, batch.id, status)?),
        }
    }

    /// Persisted artifacts over `4 * image count`, in `[0, 1]`. An empty
    /// dataset reports 0.
    pub fn get_progress(&self, batch: BatchId) -> Result<f64> {
        let dataset = self.store.batch(batch)?.dataset;
        let image_count = self.store.image_count(dataset)?;
        if image_count == 0 {
            return Ok(0.0);
        }

        let count = self.store.artifact_count(batch)?;
        let expected = (ARTIFACTS_PER_IMAGE * image_count) as f64;
        Ok((count as f64 / expected).min(1.0))
    }

    /// First image, by name, still missing an artifact.
    pub fn get_current_image(&self, batch: BatchId) -> Result<Option<Image>> {
        let dataset = self.store.batch(batch)?.dataset;
        for image in self.store.images(dataset)? {
            if !self.store.artifact_kinds(batch, image.id)?.is_complete() {
                return Ok(Some(image));
            }
        }
        Ok(None)
    }
}

/// Error with its source chain, one cause per line.
pub(crate) fn error_text(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.ends_with(&cause_text) {
            text.push_str("\n  caused by: ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
