//! Records persisted by the relational collaborator.
//!
//! Source data (atlases, datasets, images) is immutable once uploaded. Batches
//! and analysis results only ever change status and append to their error log.

use std::collections::BTreeMap;

use common::id_type;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::blob::BlobRef;

mod artifact;

pub use artifact::{Artifact, ArtifactFields, ArtifactKind, ArtifactSet, ARTIFACTS_PER_IMAGE};

id_type!(AtlasId);
id_type!(DatasetId);
id_type!(ImageId);
id_type!(BatchId);
id_type!(ArtifactId);
id_type!(AnalysisId);

/// Free-form per-image covariates, always a JSON object.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum Status {
    #[default]
    Pending,
    Running,
    Finished,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Failed)
    }

    /// Pending or Running: work has been requested and not concluded.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Reference volume looked up by its well-known name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Atlas {
    pub id: AtlasId,
    pub name: String,
    pub blob: BlobRef,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub preprocessing_status: Status,
    #[serde(default)]
    pub analysis_status: Status,
    #[serde(default)]
    pub current_preprocessing_batch: Option<BatchId>,
    #[serde(default)]
    pub current_analysis_result: Option<AnalysisId>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: DatasetId::unique(),
            name: name.into(),
            owner: owner.into(),
            description: String::new(),
            preprocessing_status: Status::Pending,
            analysis_status: Status::Pending,
            current_preprocessing_batch: None,
            current_analysis_result: None,
        }
    }
}

/// One subject's source volume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub dataset: DatasetId,
    pub name: String,
    pub blob: BlobRef,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingBatch {
    pub id: BatchId,
    pub dataset: DatasetId,
    pub status: Status,
    #[serde(default)]
    pub error_message: String,
}

impl PreprocessingBatch {
    pub fn new(dataset: DatasetId) -> Self {
        Self {
            id: BatchId::unique(),
            dataset,
            status: Status::Pending,
            error_message: String::new(),
        }
    }
}

/// `data[variable][feature][kind] = url`, where kind is `correlation` or `pvalue`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisData(BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>);

impl AnalysisData {
    pub fn insert(&mut self, variable: &str, feature: &str, kind: &str, url: String) {
        self.0
            .entry(variable.to_string())
            .or_default()
            .entry(feature.to_string())
            .or_default()
            .insert(kind.to_string(), url);
    }

    pub fn get(&self, variable: &str, feature: &str, kind: &str) -> Option<&str> {
        self.0
            .get(variable)?
            .get(feature)?
            .get(kind)
            .map(String::as_str)
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0
            .values()
            .flat_map(|features| features.values())
            .map(|kinds| kinds.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: AnalysisId,
    pub batch: BatchId,
    pub status: Status,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub zip_file: Option<BlobRef>,
    #[serde(default)]
    pub data: AnalysisData,
}

impl AnalysisResult {
    pub fn new(batch: BatchId) -> Self {
        Self {
            id: AnalysisId::unique(),
            batch,
            status: Status::Pending,
            error_message: String::new(),
            zip_file: None,
            data: AnalysisData::default(),
        }
    }
}

/// Appends one entry to an append-only error log.
pub(crate) fn append_log(log: &mut String, message: &str) {
    if !log.is_empty() && !log.ends_with('\n') {
        log.push('\n');
    }
    log.push_str(message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        assert_eq!(Status::Finished.to_string(), "Finished");
        assert_eq!("Running".parse::<Status>().unwrap(), Status::Running);
        assert!(Status::Failed.is_terminal());
        assert!(Status::Pending.is_active());
    }

    #[test]
    fn analysis_data_nests_by_variable_and_feature() {
        let mut data = AnalysisData::default();
        data.insert("age", "grey", "correlation", "file:///a".to_string());
        data.insert("age", "grey", "pvalue", "file:///b".to_string());
        data.insert("sex", "grey", "pvalue", "file:///c".to_string());

        assert_eq!(data.get("age", "grey", "pvalue"), Some("file:///b"));
        assert_eq!(data.get("age", "white", "pvalue"), None);
        assert_eq!(data.variables().collect::<Vec<_>>(), ["age", "sex"]);
        assert_eq!(data.len(), 3);

        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["age"]["grey"]["correlation"], "file:///a");
    }

    #[test]
    fn error_log_appends_lines() {
        let mut log = String::new();
        append_log(&mut log, "first");
        append_log(&mut log, "second");
        assert_eq!(log, "first\nsecond");
    }
}
