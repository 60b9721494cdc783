//! Commonly used types.
//!
//! ```rust,ignore
//! use morphometry::prelude::*;
//! ```

pub use crate::{Error, Morphometry, Result};

// Configuration
pub use crate::config::{AnalysisConfig, AtlasNames, ImagingConfig, PipelineConfig};

// Records
pub use crate::model::{
    AnalysisId, AnalysisResult, Artifact, ArtifactKind, Atlas, BatchId, Dataset, DatasetId,
    Image, ImageId, PreprocessingBatch, Status,
};

// Collaborators
pub use crate::analysis::{RscriptProgram, StatisticalProgram};
pub use crate::blob::{BlobRef, BlobStore, LocalBlobStore};
pub use crate::imaging::{Imaging, NativeImaging};
pub use crate::store::{MemoryStore, Store};
pub use crate::volume::Volume;

// Operations
pub use crate::orchestrator::{BatchOrchestrator, BatchReport};
pub use crate::service::{AnalysisStatus, BatchStatus, ImageArtifacts};
