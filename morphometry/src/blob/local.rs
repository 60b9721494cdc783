use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use common::file_utils::write_atomic;
use tracing::debug;
use uuid::Uuid;

use super::{validate_name, BlobError, BlobRef, BlobResult, BlobStore};

/// Blob store rooted at a local directory, one file per key.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> BlobResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| BlobError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, blob: &BlobRef) -> PathBuf {
        self.root.join(blob.key())
    }
}

fn io_error(blob: &BlobRef, source: std::io::Error) -> BlobError {
    if source.kind() == std::io::ErrorKind::NotFound {
        BlobError::NotFound(blob.key().to_string())
    } else {
        BlobError::Io {
            key: blob.key().to_string(),
            source,
        }
    }
}

impl BlobStore for LocalBlobStore {
    fn open(&self, blob: &BlobRef) -> BlobResult<Box<dyn Read + Send>> {
        let file = File::open(self.path_of(blob)).map_err(|e| io_error(blob, e))?;
        Ok(Box::new(file))
    }

    fn write(&self, reader: &mut dyn Read, name: &str) -> BlobResult<BlobRef> {
        validate_name(name)?;

        let blob = BlobRef::new(format!("{}/{}", Uuid::new_v4(), name));
        let written = write_atomic(&self.path_of(&blob), reader).map_err(|e| io_error(&blob, e))?;
        debug!(key = blob.key(), bytes = written, "Stored blob");

        Ok(blob)
    }

    fn delete(&self, blob: &BlobRef) -> BlobResult<()> {
        let path = self.path_of(blob);
        std::fs::remove_file(&path).map_err(|e| io_error(blob, e))?;
        if let Some(dir) = path.parent() {
            // per-key directory, empty once its single file is gone
            let _ = std::fs::remove_dir(dir);
        }
        Ok(())
    }

    fn size(&self, blob: &BlobRef) -> BlobResult<u64> {
        let meta = std::fs::metadata(self.path_of(blob)).map_err(|e| io_error(blob, e))?;
        Ok(meta.len())
    }

    fn url(&self, blob: &BlobRef) -> String {
        format!("file://{}", self.path_of(blob).display())
    }

    fn local_path(&self, blob: &BlobRef) -> Option<PathBuf> {
        Some(self.path_of(blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_open_delete() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalBlobStore::new(dir.path().join("blobs"))?;

        let blob = store.write_bytes(b"voxels", "T1.nii.gz")?;
        assert_eq!(blob.name(), "T1.nii.gz");
        assert_eq!(store.size(&blob)?, 6);
        assert_eq!(store.read_bytes(&blob)?, b"voxels");
        assert!(store.url(&blob).starts_with("file://"));

        let other = store.write_bytes(b"voxels", "T1.nii.gz")?;
        assert_ne!(blob, other, "keys are uuid prefixed");

        store.delete(&blob)?;
        assert!(matches!(store.open(&blob), Err(BlobError::NotFound(_))));
        assert!(matches!(store.delete(&blob), Err(BlobError::NotFound(_))));

        Ok(())
    }

    #[test]
    fn rejects_path_like_names() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalBlobStore::new(dir.path())?;

        for name in ["", "..", "a/b.nii", "a\\b.nii"] {
            assert!(matches!(
                store.write_bytes(b"x", name),
                Err(BlobError::InvalidName(_))
            ));
        }
        Ok(())
    }
}
