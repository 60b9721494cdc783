use std::path::PathBuf;

use thiserror::Error;

use crate::analysis::AnalysisError;
use crate::blob::BlobError;
use crate::imaging::ImagingError;
use crate::model::{BatchId, Status};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Imaging(#[from] ImagingError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Required atlas {0:?} is not registered")]
    MissingAtlas(String),

    #[error("Cannot run preprocessing on empty dataset.")]
    EmptyDataset,
    #[error("Preprocessing currently running.")]
    PreprocessingRunning,
    #[error("Preprocessing must be run first.")]
    PreprocessingNotFinished,
    #[error("Analysis currently running.")]
    AnalysisRunning,
    #[error("Batch {batch} cannot be dispatched while {status}")]
    InvalidTransition { batch: BatchId, status: Status },
    #[error("Image metadata must be a JSON object")]
    InvalidMetadata,

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Background task failed: {0}")]
    Task(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
