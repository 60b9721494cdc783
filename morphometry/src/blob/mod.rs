//! Blob storage collaborator: opaque byte streams addressed by key.

use std::io::Read;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod local;

pub use local::LocalBlobStore;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),
    #[error("Invalid blob name {0:?}")]
    InvalidName(String),
    #[error("Blob I/O failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

pub type BlobResult<T> = std::result::Result<T, BlobError>;

/// Storage key of a blob. Keys are `{uuid}/{name}`; the name is kept so
/// downloads retain the original file suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn key(&self) -> &str {
        &self.0
    }

    /// File name component of the key.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait BlobStore: Send + Sync {
    fn open(&self, blob: &BlobRef) -> BlobResult<Box<dyn Read + Send>>;

    /// Stores the full contents of `reader` under a fresh key ending in
    /// `name`. The blob becomes visible only once completely written.
    fn write(&self, reader: &mut dyn Read, name: &str) -> BlobResult<BlobRef>;

    fn delete(&self, blob: &BlobRef) -> BlobResult<()>;

    fn size(&self, blob: &BlobRef) -> BlobResult<u64>;

    /// Location handed out to clients for downloading the blob.
    fn url(&self, blob: &BlobRef) -> String;

    /// Local path of the blob if the backend is filesystem based.
    fn local_path(&self, _blob: &BlobRef) -> Option<PathBuf> {
        None
    }

    fn write_bytes(&self, bytes: &[u8], name: &str) -> BlobResult<BlobRef> {
        let mut reader = bytes;
        self.write(&mut reader, name)
    }

    fn read_bytes(&self, blob: &BlobRef) -> BlobResult<Vec<u8>> {
        let mut reader = self.open(blob)?;
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|source| BlobError::Io {
                key: blob.key().to_string(),
                source,
            })?;
        Ok(bytes)
    }
}

pub(crate) fn validate_name(name: &str) -> BlobResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\');
    if invalid {
        return Err(BlobError::InvalidName(name.to_string()));
    }
    Ok(())
}
