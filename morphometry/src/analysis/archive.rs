use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::AnalysisError;

pub const CORRELATION: &str = "correlation";
pub const PVALUE: &str = "pvalue";

/// Parsed `{variable}.{feature}.{correlation|pvalue}.{ext}` result file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultName<'a> {
    pub variable: &'a str,
    pub feature: &'a str,
    pub kind: &'a str,
}

/// Returns `None` for files that are not per-variable result images.
pub fn parse_result_name(file_name: &str) -> Option<ResultName<'_>> {
    let mut parts = file_name.splitn(4, '.');
    let variable = parts.next()?;
    let feature = parts.next()?;
    let kind = parts.next()?;
    let ext = parts.next()?;

    if variable.is_empty() || feature.is_empty() || ext.is_empty() {
        return None;
    }
    if kind != CORRELATION && kind != PVALUE {
        return None;
    }

    Some(ResultName {
        variable,
        feature,
        kind,
    })
}

/// Zips every file below `src` into `dest`, paths relative to `src`.
/// Returns the number of files written.
pub fn zip_directory(src: &Path, dest: &Path) -> Result<usize, AnalysisError> {
    let file = File::create(dest).map_err(|source| AnalysisError::io(dest, source))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut count = 0;
    add_dir(&mut zip, src, "", options, &mut count)?;

    let mut writer = zip.finish()?;
    writer
        .flush()
        .map_err(|source| AnalysisError::io(dest, source))?;
    Ok(count)
}

fn add_dir<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    dir: &Path,
    prefix: &str,
    options: FileOptions,
    count: &mut usize,
) -> Result<(), AnalysisError> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|source| AnalysisError::io(dir, source))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|source| AnalysisError::io(dir, source))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = format!("{prefix}{}", entry.file_name().to_string_lossy());

        if path.is_dir() {
            zip.add_directory(format!("{name}/"), options)?;
            add_dir(zip, &path, &format!("{name}/"), options, count)?;
        } else {
            zip.start_file(name, options)?;
            let mut file = File::open(&path).map_err(|source| AnalysisError::io(&path, source))?;
            std::io::copy(&mut file, zip).map_err(|source| AnalysisError::io(&path, source))?;
            *count += 1;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn result_names() {
        assert_eq!(
            parse_result_name("age.grey.pvalue.nii.gz"),
            Some(ResultName {
                variable: "age",
                feature: "grey",
                kind: PVALUE
            })
        );
        assert_eq!(
            parse_result_name("sex.grey.correlation.png").map(|r| r.kind),
            Some(CORRELATION)
        );
        assert_eq!(parse_result_name("age.grey.tvalue.nii.gz"), None);
        assert_eq!(parse_result_name("summary.txt"), None);
        assert_eq!(parse_result_name("age.grey.pvalue"), None);
    }

    #[test]
    fn zips_nested_directories() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("out");
        std::fs::create_dir_all(src.join("plots"))?;
        std::fs::write(src.join("age.grey.pvalue.nii.gz"), b"p")?;
        std::fs::write(src.join("plots").join("age.png"), b"png")?;

        let dest = dir.path().join("result.zip");
        assert_eq!(zip_directory(&src, &dest)?, 2);

        let mut archive = zip::ZipArchive::new(File::open(&dest)?)?;
        let mut content = String::new();
        archive
            .by_name("plots/age.png")?
            .read_to_string(&mut content)?;
        assert_eq!(content, "png");
        assert!(archive.by_name("age.grey.pvalue.nii.gz").is_ok());
        Ok(())
    }
}
