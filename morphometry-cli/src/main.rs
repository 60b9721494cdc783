//! otm - runs the morphometry pipeline over local directories.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use common::file_utils::nifti_files;
use common::log_setup::setup_logging;
use common::SerdeFormat;
use morphometry::config::AtlasRole;
use morphometry::prelude::*;
use strum::IntoEnumIterator;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "otm")]
#[command(about = "Optimal transport morphometry preprocessing and analysis")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Preprocess a directory of NIfTI images and optionally analyze them.
    Run(RunArgs),

    /// Print the default pipeline configuration.
    DefaultConfig {
        #[arg(long, value_enum, default_value_t = FormatArg::Yaml)]
        format: FormatArg,
    },
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Directory holding the template and tissue prior atlases.
    #[arg(long)]
    atlas_dir: PathBuf,

    /// Directory of subject images (.nii / .nii.gz).
    #[arg(long)]
    images: PathBuf,

    /// JSON object mapping image file names to covariate objects.
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Pipeline configuration (yaml, json or toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for blobs, atlas cache and logs.
    #[arg(long, default_value = "otm-work")]
    workdir: PathBuf,

    /// Recreate artifacts that already exist.
    #[arg(long)]
    replace: bool,

    /// Run the statistical analysis after preprocessing.
    #[arg(long)]
    analyze: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Yaml,
    Json,
    Toml,
}

impl From<FormatArg> for SerdeFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Yaml => SerdeFormat::Yaml,
            FormatArg::Json => SerdeFormat::Json,
            FormatArg::Toml => SerdeFormat::Toml,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::DefaultConfig { format } => {
            println!("{}", PipelineConfig::default().to_text(format.into())?);
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.workdir)
        .with_context(|| format!("Failed to create {}", args.workdir.display()))?;
    setup_logging(&args.log_level, &args.workdir.join("logs"), "otm")?;

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig {
            cache_dir: args.workdir.join("atlas-cache"),
            ..PipelineConfig::default()
        },
    };

    let service = Morphometry::local(config.clone(), &args.workdir)?;

    for role in AtlasRole::iter() {
        let name = config.atlases.name(role);
        let path = args.atlas_dir.join(name);
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read {role} atlas {}", path.display()))?;
        service.register_atlas(name, &bytes)?;
    }

    let metadata = load_metadata(args.metadata.as_deref())?;
    let dataset_name = args
        .images
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    let dataset = service.create_dataset(&dataset_name, "local")?;

    let paths = nifti_files(&args.images)
        .with_context(|| format!("Failed to list {}", args.images.display()))?;
    for path in &paths {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let covariates = metadata
            .get(&name)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        service.upload_image(dataset.id, &name, &bytes, covariates)?;
    }
    info!(images = paths.len(), dataset = %dataset.name, "Images uploaded");

    let handle = service.dispatch_preprocessing(dataset.id, args.replace)?;
    let batch = handle.batch;
    let report = handle.join().await?;

    let status = service.get_batch_status(batch)?;
    println!(
        "batch {batch}: {} ({:.0}%), processed {}, skipped {}",
        status.status,
        status.progress * 100.0,
        report.processed,
        report.skipped
    );
    for entry in service.batch_images(batch)? {
        if let Some(feature) = &entry.feature {
            println!("  {} -> {}", entry.image.name, service.blobs().url(&feature.blob));
        }
    }
    if status.status != Status::Finished {
        bail!("Preprocessing failed:\n{}", status.error_message);
    }

    if args.analyze {
        let handle = service.dispatch_analysis(batch)?;
        let analysis = handle.analysis;
        handle.join().await?;

        let result = service.get_analysis_result(analysis)?;
        if result.status != Status::Finished {
            bail!("Analysis failed:\n{}", result.error_message);
        }
        if let Some(url) = &result.zip_url {
            println!("analysis archive: {url}");
        }
        println!("{}", serde_json::to_string_pretty(&result.data)?);
    }

    Ok(())
}

/// Reads `{ "<image file>": { covariates } }`; a missing file means no covariates.
fn load_metadata(
    path: Option<&Path>,
) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let Some(path) = path else {
        return Ok(Default::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match serde_json::from_str(&text)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => {
            warn!(path = %path.display(), "Metadata file is not a JSON object");
            bail!("{} must contain a JSON object", path.display())
        }
    }
}
