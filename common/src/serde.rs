use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::file_format::SerdeFormat;

pub type Result<T> = anyhow::Result<T>;

pub fn serialize<T: Serialize>(value: &T, format: SerdeFormat) -> Result<String> {
    let text = match format {
        SerdeFormat::Yaml => serde_yml::to_string(value)?,
        SerdeFormat::Json => serde_json::to_string_pretty(value)?,
        SerdeFormat::Toml => toml::to_string(value)?,
    };
    Ok(text)
}

pub fn deserialize<T: DeserializeOwned>(serialized: &str, format: SerdeFormat) -> Result<T> {
    match format {
        SerdeFormat::Yaml => Ok(serde_yml::from_str(serialized)?),
        SerdeFormat::Json => Ok(serde_json::from_str(serialized)?),
        SerdeFormat::Toml => Ok(toml::from_str(serialized)?),
    }
}

/// Reads `path` and decodes it with the format implied by its extension.
pub fn load_from_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file_name = path.to_string_lossy();
    let format = SerdeFormat::from_file_name(&file_name)?;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    deserialize(&text, format).with_context(|| format!("Failed to parse {}", path.display()))
}
