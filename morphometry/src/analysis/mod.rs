//! Statistical analysis over the feature images of a finished batch.
//!
//! The feature volumes and a covariate table are staged in a scratch
//! directory and handed to an external [`StatisticalProgram`]. On success
//! the whole output directory is archived, and each per-variable result
//! image is uploaded on its own so clients can fetch them individually.
//! Any failure leaves the analysis Failed with no archive and no data.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::blob::{BlobError, BlobRef, BlobStore};
use crate::error::{Error, Result};
use crate::model::{
    AnalysisData, AnalysisId, AnalysisResult, ArtifactKind, DatasetId, Metadata,
    PreprocessingBatch, Status,
};
use crate::orchestrator::error_text;
use crate::store::{Store, StoreError};

mod archive;
mod program;

pub use archive::{parse_result_name, zip_directory, ResultName, CORRELATION, PVALUE};
pub use program::{ProgramOutput, RscriptProgram, StatisticalProgram};

pub const VARIABLES_FILE: &str = "variables.csv";
pub const FILENAME_COLUMN: &str = "filename";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Batch has no feature images to analyze")]
    NoFeatureImages,
    #[error("Analysis program failed ({}): {stderr}", describe_exit(.code))]
    ProgramFailed { code: Option<i32>, stderr: String },
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write variables table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to archive analysis output: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl AnalysisError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AnalysisError::Io {
            path: path.into(),
            source,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Archive and per-variable result images of a successful run.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisOutput {
    pub zip_file: BlobRef,
    pub data: AnalysisData,
}

#[derive(Clone)]
pub struct AnalysisRunner {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    program: Arc<dyn StatisticalProgram>,
}

impl std::fmt::Debug for AnalysisRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisRunner").finish_non_exhaustive()
    }
}

impl AnalysisRunner {
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        program: Arc<dyn StatisticalProgram>,
    ) -> Self {
        Self {
            store,
            blobs,
            program,
        }
    }

    /// Runs a Pending analysis to completion and returns its final status.
    /// An analysis that already left Pending is not run again.
    #[instrument(level = "info", skip(self, analysis_id), fields(analysis = %analysis_id))]
    pub async fn run(&self, analysis_id: AnalysisId) -> Result<Status> {
        let analysis = self.store.analysis(analysis_id)?;
        let batch = self.store.batch(analysis.batch)?;

        if !self
            .store
            .transition_analysis(analysis_id, &[Status::Pending], Status::Running)?
        {
            let status = self.store.analysis(analysis_id)?.status;
            info!(%status, "Analysis not pending, skipping");
            return Ok(status);
        }
        let dataset = batch.dataset;
        self.mirror(dataset, analysis_id, Status::Running)?;

        let runner = self.clone();
        let result = tokio::task::spawn_blocking(move || runner.execute(&analysis, &batch))
            .await
            .map_err(Error::from)
            .and_then(|result| result.map_err(Error::from));

        let result = result.and_then(|output| {
            let results = output.data.len();
            let zip_file = output.zip_file.clone();
            match self
                .store
                .set_analysis_output(analysis_id, output.zip_file, output.data)
            {
                Ok(()) => {
                    info!(results, "Analysis finished");
                    Ok(())
                }
                Err(err) => {
                    self.discard_upload(&zip_file);
                    Err(Error::from(err))
                }
            }
        });

        match result {
            Ok(()) => self.finish(dataset, analysis_id, Status::Finished),
            Err(err) => {
                let message = error_text(&err);
                error!("Analysis failed: {message}");
                if let Err(store_err) = self.store.append_analysis_error(analysis_id, &message) {
                    error!("Failed to record analysis error: {store_err}");
                }
                self.finish(dataset, analysis_id, Status::Failed)
            }
        }
    }

    fn discard_upload(&self, blob: &BlobRef) {
        if let Err(err) = self.blobs.delete(blob) {
            warn!(%blob, "Failed to remove unrecorded analysis archive: {err}");
        }
    }

    fn finish(&self, dataset: DatasetId, analysis: AnalysisId, status: Status) -> Result<Status> {
        if self
            .store
            .transition_analysis(analysis, &[Status::Running], status)?
        {
            self.mirror(dataset, analysis, status)?;
        }
        Ok(self.store.analysis(analysis)?.status)
    }

    fn mirror(&self, dataset: DatasetId, analysis: AnalysisId, status: Status) -> Result<()> {
        match self.store.dataset(dataset)?.current_analysis_result {
            Some(current) if current != analysis => Ok(()),
            _ => Ok(self.store.set_dataset_analysis(dataset, analysis, status)?),
        }
    }

    fn execute(
        &self,
        analysis: &AnalysisResult,
        batch: &PreprocessingBatch,
    ) -> std::result::Result<AnalysisOutput, AnalysisError> {
        let features: Vec<_> = self
            .store
            .artifacts(batch.id)?
            .into_iter()
            .filter(|artifact| artifact.kind() == ArtifactKind::Feature)
            .collect();
        if features.is_empty() {
            return Err(AnalysisError::NoFeatureImages);
        }

        let scratch = TempDir::new().map_err(|e| AnalysisError::io(std::env::temp_dir(), e))?;
        let input_dir = scratch.path().join("input");
        let output_dir = scratch.path().join("output");
        for dir in [&input_dir, &output_dir] {
            std::fs::create_dir_all(dir).map_err(|e| AnalysisError::io(dir, e))?;
        }

        let mut rows = Vec::with_capacity(features.len());
        for feature in &features {
            let image = self.store.image(feature.source_image)?;
            let file_name = format!("{}.nii.gz", volume_stem(&image.name));
            let path = input_dir.join(&file_name);

            let mut reader = self.blobs.open(&feature.blob)?;
            let mut file = File::create(&path).map_err(|e| AnalysisError::io(&path, e))?;
            std::io::copy(&mut reader, &mut file).map_err(|e| AnalysisError::io(&path, e))?;

            rows.push((file_name, image.metadata));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(images = rows.len(), "Feature images staged");

        let variables_csv = scratch.path().join(VARIABLES_FILE);
        write_variables(&variables_csv, &rows)?;

        let output = self.program.run(&input_dir, &variables_csv, &output_dir)?;
        if !output.success() {
            return Err(AnalysisError::ProgramFailed {
                code: output.code,
                stderr: output.stderr,
            });
        }

        let zip_name = format!(
            "dataset_{}_utm_analysis_{}.zip",
            batch.dataset, analysis.id
        );
        let zip_path = scratch.path().join(&zip_name);
        let entries = zip_directory(&output_dir, &zip_path)?;
        debug!(entries, "Analysis output archived");

        let mut uploaded = Vec::new();
        match self.upload(&output_dir, &zip_path, &zip_name, &mut uploaded) {
            Ok(output) => Ok(output),
            Err(err) => {
                for blob in &uploaded {
                    if let Err(delete_err) = self.blobs.delete(blob) {
                        warn!(%blob, "Failed to remove partial analysis upload: {delete_err}");
                    }
                }
                Err(err)
            }
        }
    }

    fn upload(
        &self,
        output_dir: &Path,
        zip_path: &Path,
        zip_name: &str,
        uploaded: &mut Vec<BlobRef>,
    ) -> std::result::Result<AnalysisOutput, AnalysisError> {
        let mut file = File::open(zip_path).map_err(|e| AnalysisError::io(zip_path, e))?;
        let zip_file = self.blobs.write(&mut file, zip_name)?;
        uploaded.push(zip_file.clone());

        let mut data = AnalysisData::default();
        let mut entries = std::fs::read_dir(output_dir)
            .map_err(|e| AnalysisError::io(output_dir, e))?
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| AnalysisError::io(output_dir, e))?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(result) = parse_result_name(&file_name) else {
                continue;
            };
            if !path.is_file() {
                continue;
            }

            let mut file = File::open(&path).map_err(|e| AnalysisError::io(&path, e))?;
            let blob = self.blobs.write(&mut file, &file_name)?;
            uploaded.push(blob.clone());
            data.insert(
                result.variable,
                result.feature,
                result.kind,
                self.blobs.url(&blob),
            );
        }

        Ok(AnalysisOutput { zip_file, data })
    }
}

/// Image name without its NIfTI suffix.
fn volume_stem(name: &str) -> &str {
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(name)
}

/// One row per image: `filename` then the union of metadata keys, sorted.
/// Missing keys and nulls become empty cells.
fn write_variables(
    path: &Path,
    rows: &[(String, Metadata)],
) -> std::result::Result<(), AnalysisError> {
    let columns: BTreeSet<&str> = rows
        .iter()
        .flat_map(|(_, metadata)| metadata.keys().map(String::as_str))
        .filter(|key| *key != FILENAME_COLUMN)
        .collect();

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(std::iter::once(FILENAME_COLUMN).chain(columns.iter().copied()))?;

    for (file_name, metadata) in rows {
        let mut record = Vec::with_capacity(columns.len() + 1);
        record.push(file_name.clone());
        for column in &columns {
            record.push(metadata.get(*column).map(cell_text).unwrap_or_default());
        }
        writer.write_record(&record)?;
    }

    writer
        .flush()
        .map_err(|source| AnalysisError::io(path, source))?;
    Ok(())
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
