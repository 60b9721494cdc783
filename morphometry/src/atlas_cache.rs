//! Local copies of the reference atlases.
//!
//! Every atlas lives at `cache_dir/<atlas name>`. Files are materialized
//! through a temp-file-then-rename, so concurrent `ensure` calls for the same
//! atlas are harmless and a reader never sees a partial file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::file_utils::{file_len, write_atomic};
use strum::IntoEnumIterator;
use tracing::{debug, info};

use crate::blob::{validate_name, BlobStore};
use crate::config::{AtlasNames, AtlasRole};
use crate::error::{Error, Result};
use crate::imaging::{Imaging, TissuePriors};
use crate::model::Atlas;
use crate::store::Store;
use crate::volume::Volume;

/// The four atlas records a batch is processed against.
#[derive(Clone, Debug)]
pub struct AtlasSet {
    pub template: Atlas,
    pub csf: Atlas,
    pub grey: Atlas,
    pub white: Atlas,
}

impl AtlasSet {
    /// Looks every role up by its configured name.
    pub fn resolve(store: &dyn Store, names: &AtlasNames) -> Result<Self> {
        let lookup = |role: AtlasRole| -> Result<Atlas> {
            let name = names.name(role);
            store
                .atlas_by_name(name)?
                .ok_or_else(|| Error::MissingAtlas(name.to_string()))
        };
        Ok(Self {
            template: lookup(AtlasRole::Template)?,
            csf: lookup(AtlasRole::Csf)?,
            grey: lookup(AtlasRole::Grey)?,
            white: lookup(AtlasRole::White)?,
        })
    }

    pub fn get(&self, role: AtlasRole) -> &Atlas {
        match role {
            AtlasRole::Template => &self.template,
            AtlasRole::Csf => &self.csf,
            AtlasRole::Grey => &self.grey,
            AtlasRole::White => &self.white,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (AtlasRole, &Atlas)> {
        AtlasRole::iter().map(move |role| (role, self.get(role)))
    }
}

/// Atlas volumes read from the cache.
#[derive(Clone, Debug)]
pub struct LoadedAtlases {
    pub template: Volume,
    pub priors: TissuePriors,
}

#[derive(Clone)]
pub struct AtlasCache {
    dir: PathBuf,
    blobs: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for AtlasCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtlasCache").field("dir", &self.dir).finish()
    }
}

impl AtlasCache {
    pub fn new(dir: impl Into<PathBuf>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            dir: dir.into(),
            blobs,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, atlas: &Atlas) -> PathBuf {
        self.dir.join(&atlas.name)
    }

    /// Makes sure a complete copy of `atlas` exists locally and returns its path.
    pub fn ensure(&self, atlas: &Atlas) -> Result<PathBuf> {
        validate_name(&atlas.name)?;
        let path = self.path(atlas);

        let existing = file_len(&path).map_err(|e| Error::io(&path, e))?;
        if existing.is_some_and(|len| len > 0) {
            debug!(atlas = %atlas.name, "Atlas already cached");
            return Ok(path);
        }

        info!(atlas = %atlas.name, path = %path.display(), "Caching atlas");
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let mut reader = self.blobs.open(&atlas.blob)?;
        write_atomic(&path, &mut reader).map_err(|e| Error::io(&path, e))?;

        Ok(path)
    }

    /// Ensures all four atlases and reads them.
    pub fn load(&self, atlases: &AtlasSet, imaging: &dyn Imaging) -> Result<LoadedAtlases> {
        let read = |atlas: &Atlas| -> Result<Volume> {
            let path = self.ensure(atlas)?;
            Ok(imaging.read(&path)?)
        };
        Ok(LoadedAtlases {
            template: read(&atlases.template)?,
            priors: TissuePriors {
                csf: read(&atlases.csf)?,
                grey: read(&atlases.grey)?,
                white: read(&atlases.white)?,
            },
        })
    }
}
