//! Testing utilities and a mock image service.
//!
//! Lets sessions be exercised end to end without a running service.
//!
//! # Example
//!
//! ```rust,ignore
//! use partpix_core::testing::MockImageBackend;
//!
//! let backend = Arc::new(MockImageBackend::new());
//! backend.set_images_for("6ES7214-1AG40-0XB0", 5).await;
//!
//! let mut session = AcquisitionSession::new(backend.clone(), SessionConfig::default());
//! ```

mod mock_backend;

pub use mock_backend::{MockImageBackend, MockOperation, RecordedCall};

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::backend::{
        DownloadResult, DownloadState, DownloadStatus, ImageCandidate, PartResult, SearchResult,
    };

    /// Create a test image candidate.
    pub fn image(part: &str, index: usize) -> ImageCandidate {
        ImageCandidate {
            title: format!("{} product photo {}", part, index),
            original_url: format!("https://images.example.com/{}/{}.jpg", part, index),
            thumbnail_url: format!("https://images.example.com/{}/{}_thumb.jpg", part, index),
            source: "example.com".to_string(),
            width: Some(800),
            height: Some(600),
        }
    }

    /// Create a successful part result with `images` candidates.
    pub fn part_result(part: &str, images: usize) -> PartResult {
        PartResult {
            part_number: part.to_string(),
            search_query: part.to_string(),
            search_success: true,
            error_message: None,
            images: (1..=images).map(|i| image(part, i)).collect(),
            strategy: None,
        }
    }

    /// Create a part result for a search that found nothing.
    pub fn failed_part_result(part: &str, error: &str) -> PartResult {
        PartResult {
            search_success: false,
            error_message: Some(error.to_string()),
            ..part_result(part, 0)
        }
    }

    /// Create a search result from `(part, image count)` pairs.
    pub fn search_result(search_id: &str, parts: &[(&str, usize)]) -> SearchResult {
        SearchResult {
            search_id: search_id.to_string(),
            processing_time: 0.5,
            results: parts.iter().map(|(p, n)| part_result(p, *n)).collect(),
        }
    }

    /// Create a download status without per-image results.
    pub fn download_status(
        download_id: &str,
        status: DownloadState,
        downloaded: u32,
        total: u32,
    ) -> DownloadStatus {
        DownloadStatus {
            download_id: download_id.to_string(),
            status,
            total_images: total,
            downloaded_images: downloaded,
            results: Vec::new(),
            zip_file: None,
            error_message: None,
        }
    }

    /// Create a completed download status with an archive, every image
    /// downloaded successfully.
    pub fn completed_status(download_id: &str, parts: &[(&str, usize)]) -> DownloadStatus {
        let results: Vec<DownloadResult> = parts
            .iter()
            .flat_map(|(part, n)| {
                (1..=*n).map(move |i| DownloadResult {
                    part_number: part.to_string(),
                    image_url: image(part, i).original_url,
                    filename: format!("{}_{}.jpg", part, i),
                    success: true,
                    error_message: None,
                    file_size: Some(48_000),
                })
            })
            .collect();
        let total = results.len() as u32;

        DownloadStatus {
            download_id: download_id.to_string(),
            status: DownloadState::Completed,
            total_images: total,
            downloaded_images: total,
            zip_file: Some(format!("part_images_{}.zip", download_id)),
            results,
            error_message: None,
        }
    }
}
