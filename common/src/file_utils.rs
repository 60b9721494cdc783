//! File utility functions for listing, filtering and atomically writing files.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Supported NIfTI volume file suffixes.
pub const NIFTI_EXTENSIONS: &[&str] = &["nii", "nii.gz"];

/// Returns true if the file name ends with one of `extensions`.
/// Matching is case-insensitive and supports compound suffixes such as `nii.gz`.
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
        return false;
    };
    let name = name.to_lowercase();
    extensions
        .iter()
        .any(|ext| name.ends_with(&format!(".{}", ext.to_lowercase())))
}

/// Returns paths to all files in a directory matching the given extensions,
/// sorted by file name.
pub fn files_with_extensions(dir: &Path, extensions: &[&str]) -> io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| path.is_file() && has_extension(path, extensions))
        .collect();
    files.sort();

    Ok(files)
}

/// Returns paths to all NIfTI volumes in the given directory.
pub fn nifti_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    files_with_extensions(dir, NIFTI_EXTENSIONS)
}

/// Streams `reader` into `path` through a temporary sibling file that is
/// renamed into place once fully written and synced. Readers of `path` never
/// observe a partially written file.
pub fn write_atomic(path: &Path, reader: &mut dyn Read) -> io::Result<u64> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    let written = io::copy(reader, &mut tmp)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(written)
}

/// Size of the file at `path`, or `None` if it does not exist.
pub fn file_len(path: &Path) -> io::Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
