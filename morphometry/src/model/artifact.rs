use serde::{Deserialize, Serialize};
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{AsRefStr, Display, EnumCount as EnumCountMacro, EnumIter};

use super::{ArtifactId, AtlasId, BatchId, ImageId};
use crate::blob::BlobRef;

/// The derived volumes produced for every source image of a batch.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumIter,
    EnumCountMacro,
    Display,
    AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactKind {
    Registered,
    Jacobian,
    Segmented,
    Feature,
}

/// A batch expects this many artifacts per source image.
pub const ARTIFACTS_PER_IMAGE: usize = ArtifactKind::COUNT;

impl ArtifactKind {
    pub fn all() -> impl Iterator<Item = ArtifactKind> {
        Self::iter()
    }

    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Registered => "registered.nii.gz",
            ArtifactKind::Jacobian => "jacobian.nii.gz",
            ArtifactKind::Segmented => "segmented.nii.gz",
            ArtifactKind::Feature => "feature.nii.gz",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Kind-specific columns. The variant determines the artifact kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ArtifactFields {
    Registered { registration_type: String },
    Jacobian,
    Segmented,
    Feature { downsample_factor: f64 },
}

impl ArtifactFields {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactFields::Registered { .. } => ArtifactKind::Registered,
            ArtifactFields::Jacobian => ArtifactKind::Jacobian,
            ArtifactFields::Segmented => ArtifactKind::Segmented,
            ArtifactFields::Feature { .. } => ArtifactKind::Feature,
        }
    }
}

/// One persisted derived volume, created once and never updated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub batch: BatchId,
    pub source_image: ImageId,
    pub atlas: AtlasId,
    pub blob: BlobRef,
    pub fields: ArtifactFields,
}

impl Artifact {
    pub fn create(
        batch: BatchId,
        source_image: ImageId,
        atlas: AtlasId,
        blob: BlobRef,
        fields: ArtifactFields,
    ) -> Self {
        Self {
            id: ArtifactId::unique(),
            batch,
            source_image,
            atlas,
            blob,
            fields,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.fields.kind()
    }

    pub fn downsample_factor(&self) -> Option<f64> {
        match self.fields {
            ArtifactFields::Feature { downsample_factor } => Some(downsample_factor),
            _ => None,
        }
    }
}

/// Compact set of artifact kinds present for one (image, batch) pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ArtifactSet(u8);

impl ArtifactSet {
    pub fn complete() -> Self {
        ArtifactKind::all().collect()
    }

    pub fn insert(&mut self, kind: ArtifactKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(&self, kind: ArtifactKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_complete(&self) -> bool {
        self.len() == ARTIFACTS_PER_IMAGE
    }

    pub fn missing(&self) -> ArtifactSet {
        ArtifactSet(!self.0 & Self::complete().0)
    }

    pub fn iter(&self) -> impl Iterator<Item = ArtifactKind> + '_ {
        ArtifactKind::all().filter(|kind| self.contains(*kind))
    }
}

impl FromIterator<ArtifactKind> for ArtifactSet {
    fn from_iter<T: IntoIterator<Item = ArtifactKind>>(iter: T) -> Self {
        let mut set = ArtifactSet::default();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}
