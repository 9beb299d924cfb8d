mod fetch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use partpix_core::config::LoggingConfig;
use partpix_core::{load_config, validate_config, AcquisitionSession, Config, HttpImageBackend};

/// Default configuration file, relative to the working directory.
const DEFAULT_CONFIG: &str = "partpix.toml";

#[derive(Parser)]
#[command(name = "partpix")]
#[command(about = "Find product images for part numbers and download them as an archive")]
#[command(version)]
struct Cli {
    /// Configuration file [env: PARTPIX_CONFIG] [default: partpix.toml]
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search images for part numbers and save the downloaded archive
    Fetch(fetch::FetchArgs),

    /// Print the part numbers the service extracts from a CSV file
    ParseCsv {
        /// CSV file to upload
        file: PathBuf,
    },

    /// Check that the image service is reachable
    Health,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| std::env::var_os("PARTPIX_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    init_logging(&config.logging);
    info!(config = ?config_path, backend = %config.backend.base_url, "Configuration loaded");

    match cli.command {
        Commands::Fetch(args) => fetch::run(&config, args).await,
        Commands::ParseCsv { file } => parse_csv(&config, &file).await,
        Commands::Health => health(&config).await,
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(logging.json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!logging.json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn open_session(config: &Config) -> Result<AcquisitionSession> {
    let backend = HttpImageBackend::new(config.backend.clone())
        .context("Failed to create image service client")?;
    Ok(AcquisitionSession::new(
        Arc::new(backend),
        config.session.clone(),
    ))
}

/// Read a CSV file from disk for upload.
async fn read_csv(path: &Path) -> Result<(String, Vec<u8>)> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{:?} is not a file path", path))?;
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    Ok((file_name, contents))
}

async fn parse_csv(config: &Config, path: &Path) -> Result<()> {
    let (file_name, contents) = read_csv(path).await?;
    let mut session = open_session(config)?;

    let result = session.import_csv(&file_name, contents).await;
    session.dispose().await;
    let added = result.context("CSV import failed")?;

    for part in session.registry().iter() {
        println!("{}", part);
    }
    info!(file_name = %file_name, parts = added, "CSV parsed");
    Ok(())
}

async fn health(config: &Config) -> Result<()> {
    let mut session = open_session(config)?;
    let result = session.health().await;
    session.dispose().await;

    let status = result.context("Image service is not reachable")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if !status.is_healthy() {
        anyhow::bail!("image service reports status {:?}", status.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch_arguments() {
        let cli = Cli::try_parse_from([
            "partpix",
            "--config",
            "custom.toml",
            "fetch",
            "--parts",
            "A1,B2",
            "--images-per-part",
            "5",
            "--reprocess",
            "B2",
            "--strategy",
            "broader",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        match cli.command {
            Commands::Fetch(args) => {
                assert_eq!(args.parts.as_deref(), Some("A1,B2"));
                assert_eq!(args.images_per_part, Some(5));
                assert_eq!(args.reprocess.as_deref(), Some("B2"));
                assert_eq!(args.strategy, "broader");
                assert!(args.only.is_none());
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_parse_csv_requires_file() {
        assert!(Cli::try_parse_from(["partpix", "parse-csv"]).is_err());
        let cli = Cli::try_parse_from(["partpix", "parse-csv", "parts.csv"]).unwrap();
        assert!(matches!(cli.command, Commands::ParseCsv { .. }));
    }

    #[tokio::test]
    async fn test_read_csv_keeps_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parts.csv");
        std::fs::write(&path, "part_number\nA1\n").unwrap();

        let (name, contents) = read_csv(&path).await.unwrap();
        assert_eq!(name, "parts.csv");
        assert_eq!(contents, b"part_number\nA1\n");
    }
}
