//! Morphometry - preprocessing and analysis pipeline for brain MRI datasets.
//!
//! Each source volume of a dataset is bias corrected, registered to a
//! template atlas, segmented into tissue classes and reduced to a grey
//! matter volume-change feature map. Feature maps of a finished batch feed
//! an external statistical program.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use morphometry::prelude::*;
//!
//! let service = Morphometry::local(PipelineConfig::default(), workdir)?;
//! for (name, bytes) in atlases {
//!     service.register_atlas(name, &bytes)?;
//! }
//! let dataset = service.create_dataset("study", "owner@example.org")?;
//! service.upload_image(dataset.id, "sub01.nii.gz", &bytes, serde_json::json!({"age": 31}))?;
//!
//! let handle = service.dispatch_preprocessing(dataset.id, false)?;
//! let report = handle.join().await?;
//! println!("{:?}", service.get_batch_status(report.batch)?);
//! ```

pub mod analysis;
pub mod atlas_cache;
pub mod blob;
pub mod config;
mod error;
pub mod feature;
pub mod imaging;
pub mod mask;
pub mod model;
pub mod orchestrator;
pub mod prelude;
pub mod service;
pub mod stage;
pub mod store;
pub mod volume;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use service::Morphometry;
