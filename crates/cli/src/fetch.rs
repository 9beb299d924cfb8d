//! `partpix fetch`: search, optionally reprocess, download and save.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use partpix_core::registry::split_delimited;
use partpix_core::{
    Config, DownloadPhase, DownloadView, SearchOptions, SearchResult, SessionHandle,
};

use crate::{open_session, read_csv};

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Part numbers separated by commas or newlines
    #[arg(short, long, value_name = "LIST")]
    pub parts: Option<String>,

    /// CSV file with part numbers, parsed by the service
    #[arg(long, value_name = "FILE")]
    pub csv: Option<PathBuf>,

    /// Restrict the search to one manufacturer
    #[arg(short, long)]
    pub manufacturer: Option<String>,

    /// Images to find per part [default: session.default_images_per_part]
    #[arg(short = 'n', long, value_name = "N")]
    pub images_per_part: Option<u32>,

    /// Parts to re-search after the first pass
    #[arg(long, value_name = "LIST")]
    pub reprocess: Option<String>,

    /// Strategy for --reprocess: alternative, broader or specific
    #[arg(long, default_value = "alternative")]
    pub strategy: String,

    /// Download only these parts instead of all of them
    #[arg(long, value_name = "LIST", conflicts_with = "all_parts")]
    pub only: Option<String>,

    /// Download every part of the search (the default)
    #[arg(long)]
    pub all_parts: bool,

    /// Directory for the archive [default: output.dir]
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
}

pub async fn run(config: &Config, args: FetchArgs) -> Result<()> {
    let handle = SessionHandle::spawn(open_session(config)?);

    let result = tokio::select! {
        result = fetch(&handle, config, &args) => result,
        _ = signal::ctrl_c() => {
            warn!("Interrupted; releasing server-side files");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    handle.dispose().await;
    result
}

async fn fetch(handle: &SessionHandle, config: &Config, args: &FetchArgs) -> Result<()> {
    if let Some(parts) = &args.parts {
        handle.add_delimited(parts.as_str()).await?;
    }
    if let Some(path) = &args.csv {
        let (file_name, contents) = read_csv(path).await?;
        let added = handle
            .import_csv(file_name, contents)
            .await
            .context("CSV import failed")?;
        info!(added, "Imported part numbers from {:?}", path);
    }
    if handle.snapshot().parts.is_empty() {
        bail!("no part numbers given; use --parts or --csv");
    }

    let options = SearchOptions {
        manufacturer: args.manufacturer.clone(),
        images_per_part: args.images_per_part,
    };
    let mut result = handle.search(options).await.context("Search failed")?;
    print_summary(&result);

    if let Some(reprocess) = &args.reprocess {
        let parts = list(reprocess);
        result = handle
            .reprocess(result.search_id.as_str(), parts, args.strategy.as_str())
            .await
            .context("Reprocess failed")?;
        println!();
        print_summary(&result);
    }

    if result.total_images_found() == 0 {
        bail!("no images found for any part");
    }

    let only = match &args.only {
        Some(only) if !args.all_parts => Some(list(only)),
        _ => None,
    };
    let status = handle
        .start_download(result.search_id.as_str(), only)
        .await
        .context("Failed to start download")?;
    info!(
        download_id = %status.download_id,
        total_images = status.total_images,
        "Download started"
    );

    let reporter = report_progress(handle);
    let view = handle.wait_for_download().await;
    reporter.abort();
    let view = view?;

    save_archive(handle, config, args, &view).await
}

async fn save_archive(
    handle: &SessionHandle,
    config: &Config,
    args: &FetchArgs,
    view: &DownloadView,
) -> Result<()> {
    let download_id = view.download_id.as_deref().unwrap_or_default();

    match view.phase {
        DownloadPhase::Completed if view.archive_available => {}
        DownloadPhase::Completed => bail!("download finished without any image"),
        DownloadPhase::Failed => bail!(
            "download failed: {}",
            view.last_error.as_deref().unwrap_or("unknown error")
        ),
        phase => bail!("download stopped in phase {:?}", phase),
    }

    let dir = args.output.clone().unwrap_or_else(|| config.output.dir.clone());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create {:?}", dir))?;

    let file_name = view
        .status
        .as_ref()
        .and_then(|s| s.zip_file.clone())
        .unwrap_or_else(|| format!("part_images_{}.zip", download_id));
    let dest = dir.join(file_name);

    let bytes = handle
        .fetch_archive(download_id, dest.clone())
        .await
        .context("Failed to download archive")?;

    let successful = view.status.as_ref().map(|s| s.successful_images()).unwrap_or(0);
    println!("Saved {} images ({} bytes) to {}", successful, bytes, dest.display());
    Ok(())
}

/// Log progress changes until the download reaches a terminal phase.
fn report_progress(handle: &SessionHandle) -> JoinHandle<()> {
    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        let mut last = None;
        while rx.changed().await.is_ok() {
            let Some(view) = rx.borrow_and_update().download.clone() else {
                continue;
            };
            let percent = (view.progress * 100.0).round() as u32;
            if last != Some(percent) {
                last = Some(percent);
                let (downloaded, total) = view
                    .status
                    .as_ref()
                    .map(|s| (s.downloaded_images, s.total_images))
                    .unwrap_or((0, 0));
                info!(downloaded, total, "Downloading images: {}%", percent);
            }
            if view.phase.is_terminal() {
                break;
            }
        }
    })
}

fn print_summary(result: &SearchResult) {
    for part in &result.results {
        let marker = if part.is_reprocessed() { " *" } else { "" };
        if part.images.is_empty() {
            println!(
                "{}{}: no images ({})",
                part.part_number,
                marker,
                part.error_message.as_deref().unwrap_or("nothing found")
            );
        } else {
            println!("{}{}: {} images", part.part_number, marker, part.image_count());
        }
    }
    println!(
        "{} images for {} parts (search {})",
        result.total_images_found(),
        result.total_parts(),
        result.search_id
    );
}

fn list(text: &str) -> Vec<String> {
    split_delimited(text).into_iter().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_splits_and_trims() {
        assert_eq!(list(" A1, B2\nC3,,"), vec!["A1", "B2", "C3"]);
        assert!(list(" , ").is_empty());
    }
}
