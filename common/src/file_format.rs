use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum FileExtensionError {
    #[error("Failed to get file extension")]
    MissingFileExtension,
    #[error("Unsupported file extension for file: {0}")]
    UnsupportedFileExtension(String),
}

pub type FileFormatResult<T> = Result<T, FileExtensionError>;

pub fn get_file_extension(filename: &str) -> Option<&str> {
    Path::new(filename)
        .extension()
        .and_then(|os_str| os_str.to_str())
}

/// Text formats accepted for configuration files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerdeFormat {
    Yaml,
    Json,
    Toml,
}

impl SerdeFormat {
    pub fn all_formats_for_testing() -> [Self; 3] {
        [Self::Yaml, Self::Json, Self::Toml]
    }

    pub fn from_file_name(file_name: &str) -> FileFormatResult<Self> {
        let ext = get_file_extension(file_name).ok_or(FileExtensionError::MissingFileExtension)?;

        if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") {
            Ok(Self::Yaml)
        } else if ext.eq_ignore_ascii_case("json") {
            Ok(Self::Json)
        } else if ext.eq_ignore_ascii_case("toml") {
            Ok(Self::Toml)
        } else {
            Err(FileExtensionError::UnsupportedFileExtension(
                file_name.to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_format_case_insensitively() {
        assert_eq!(
            SerdeFormat::from_file_name("pipeline.YML").unwrap(),
            SerdeFormat::Yaml
        );
        assert_eq!(
            SerdeFormat::from_file_name("pipeline.json").unwrap(),
            SerdeFormat::Json
        );
        assert_eq!(
            SerdeFormat::from_file_name("pipeline.toml").unwrap(),
            SerdeFormat::Toml
        );
    }

    #[test]
    fn rejects_missing_or_unknown_extension() {
        assert!(matches!(
            SerdeFormat::from_file_name("pipeline"),
            Err(FileExtensionError::MissingFileExtension)
        ));
        assert!(matches!(
            SerdeFormat::from_file_name("pipeline.ini"),
            Err(FileExtensionError::UnsupportedFileExtension(_))
        ));
    }
}
