//! Types for the image search/download service.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Alternate search heuristic requested when reprocessing parts.
///
/// The meaning of each strategy is defined by the remote service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReprocessStrategy {
    Alternative,
    Broader,
    Specific,
}

impl ReprocessStrategy {
    pub const ALL: [ReprocessStrategy; 3] = [
        ReprocessStrategy::Alternative,
        ReprocessStrategy::Broader,
        ReprocessStrategy::Specific,
    ];

    /// Returns the string representation for API requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReprocessStrategy::Alternative => "alternative",
            ReprocessStrategy::Broader => "broader",
            ReprocessStrategy::Specific => "specific",
        }
    }
}

impl fmt::Display for ReprocessStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown reprocess strategy {0:?} (expected alternative, broader or specific)")]
pub struct UnknownStrategy(pub String);

impl FromStr for ReprocessStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s.trim())
            .ok_or_else(|| UnknownStrategy(s.to_string()))
    }
}

/// A candidate product photo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageCandidate {
    pub title: String,
    pub original_url: String,
    pub thumbnail_url: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Search outcome for one part number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartResult {
    pub part_number: String,
    /// Query string the service actually used.
    pub search_query: String,
    pub search_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageCandidate>,
    /// Set on the client when this entry was replaced by a reprocess pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ReprocessStrategy>,
}

impl PartResult {
    pub fn is_reprocessed(&self) -> bool {
        self.strategy.is_some()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// Held result of one search invocation.
///
/// Aggregates are computed from `results`, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub search_id: String,
    /// Seconds the service spent searching (informational).
    #[serde(default)]
    pub processing_time: f64,
    pub results: Vec<PartResult>,
}

impl SearchResult {
    pub fn total_parts(&self) -> usize {
        self.results.len()
    }

    pub fn total_images_found(&self) -> usize {
        self.results.iter().map(PartResult::image_count).sum()
    }

    pub fn part(&self, part_number: &str) -> Option<&PartResult> {
        self.results.iter().find(|r| r.part_number == part_number)
    }

    pub fn contains_part(&self, part_number: &str) -> bool {
        self.part(part_number).is_some()
    }

    pub fn part_numbers(&self) -> impl Iterator<Item = &str> {
        self.results.iter().map(|r| r.part_number.as_str())
    }
}

/// Request body for `search-images`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchRequest {
    pub part_numbers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    pub num_images_per_part: u32,
}

/// Response body of `search-images`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub search_id: String,
    pub results: Vec<PartResult>,
    #[serde(default)]
    pub total_parts: usize,
    #[serde(default)]
    pub total_images_found: usize,
    #[serde(default)]
    pub processing_time: f64,
}

impl SearchResponse {
    /// Drop the service-reported aggregates in favour of derived ones.
    pub fn into_result(self) -> SearchResult {
        let result = SearchResult {
            search_id: self.search_id,
            processing_time: self.processing_time,
            results: self.results,
        };
        if result.total_images_found() != self.total_images_found {
            debug!(
                search_id = %result.search_id,
                reported = self.total_images_found,
                derived = result.total_images_found(),
                "Service image total differs from per-part counts"
            );
        }
        result
    }
}

/// Request body for `reprocess-images`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReprocessRequest {
    pub search_id: String,
    pub part_numbers: Vec<String>,
    pub search_strategy: ReprocessStrategy,
}

/// Response body of `reprocess-images`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprocessResponse {
    pub results: Vec<PartResult>,
    #[serde(default)]
    pub total_images_found: usize,
    /// Some service versions file the fresh results under a new id; the
    /// session keeps addressing the original search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_id: Option<String>,
}

/// Request body for `download-images`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRequest {
    pub search_id: String,
    /// Restrict the job to these parts; all parts when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_numbers: Option<Vec<String>>,
}

/// Server-side state of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    #[serde(alias = "started")]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Processing => "processing",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
        }
    }
}

/// Per-image outcome of a download job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadResult {
    pub part_number: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub filename: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// Status document of a download job, as returned by start and poll calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadStatus {
    pub download_id: String,
    pub status: DownloadState,
    #[serde(default)]
    pub total_images: u32,
    #[serde(default)]
    pub downloaded_images: u32,
    #[serde(default)]
    pub results: Vec<DownloadResult>,
    /// Archive name; present once completed with at least one image.
    #[serde(default)]
    pub zip_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DownloadStatus {
    /// Fraction of images downloaded, in `[0, 1]`; 0 when nothing is expected.
    pub fn progress(&self) -> f64 {
        if self.total_images == 0 {
            return 0.0;
        }
        (self.downloaded_images as f64 / self.total_images as f64).clamp(0.0, 1.0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether an archive can be requested for this job.
    pub fn archive_available(&self) -> bool {
        self.status == DownloadState::Completed
            && !self.results.is_empty()
            && self.zip_file.is_some()
    }

    pub fn successful_images(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

/// Response body of `parse-csv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseCsvResponse {
    pub part_numbers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
}

/// Response body of `health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(flatten)]
    pub details: HashMap<String, serde_json::Value>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Archive body delivered chunk by chunk.
pub type ArchiveStream = BoxStream<'static, Result<Vec<u8>, BackendError>>;

/// Errors that can occur talking to the service.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP {status}: {}", .detail.as_deref().unwrap_or("no detail"))]
    Api { status: u16, detail: Option<String> },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Trait for image search/download services.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Extract part numbers from an uploaded CSV file.
    async fn parse_csv(&self, file_name: &str, contents: Vec<u8>)
        -> Result<Vec<String>, BackendError>;

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError>;

    async fn reprocess(&self, request: &ReprocessRequest)
        -> Result<ReprocessResponse, BackendError>;

    /// Start a background download job; returns its initial status.
    async fn start_download(&self, request: &DownloadRequest)
        -> Result<DownloadStatus, BackendError>;

    async fn download_status(&self, download_id: &str) -> Result<DownloadStatus, BackendError>;

    async fn fetch_archive(&self, download_id: &str) -> Result<ArchiveStream, BackendError>;

    /// Release server-side files and bookkeeping for a task.
    async fn cleanup(&self, task_id: &str) -> Result<(), BackendError>;

    async fn health(&self) -> Result<HealthStatus, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(downloaded: u32, total: u32) -> DownloadStatus {
        DownloadStatus {
            download_id: "dl-1".to_string(),
            status: DownloadState::Processing,
            total_images: total,
            downloaded_images: downloaded,
            results: vec![],
            zip_file: None,
            error_message: None,
        }
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "broader".parse::<ReprocessStrategy>(),
            Ok(ReprocessStrategy::Broader)
        );
        assert_eq!(
            " specific ".parse::<ReprocessStrategy>(),
            Ok(ReprocessStrategy::Specific)
        );
        assert_eq!(
            "Broader".parse::<ReprocessStrategy>(),
            Err(UnknownStrategy("Broader".to_string()))
        );
        assert!("fuzzy".parse::<ReprocessStrategy>().is_err());
    }

    #[test]
    fn test_strategy_serialization() {
        assert_eq!(
            serde_json::to_string(&ReprocessStrategy::Alternative).unwrap(),
            "\"alternative\""
        );
        for strategy in ReprocessStrategy::ALL {
            assert_eq!(strategy.to_string(), strategy.as_str());
        }
    }

    #[test]
    fn test_progress_zero_total() {
        assert_eq!(status(0, 0).progress(), 0.0);
    }

    #[test]
    fn test_progress_fraction_and_clamp() {
        assert!((status(3, 10).progress() - 0.3).abs() < f64::EPSILON);
        assert_eq!(status(12, 10).progress(), 1.0);
    }

    #[test]
    fn test_download_state_accepts_started() {
        let json = r#"{"download_id":"d","status":"started","total_images":4,"downloaded_images":0}"#;
        let parsed: DownloadStatus = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.status, DownloadState::Queued);
        assert!(parsed.results.is_empty());
        assert!(parsed.zip_file.is_none());
        assert!(!parsed.is_terminal());
    }

    #[test]
    fn test_archive_available_requires_zip_and_results() {
        let mut s = status(1, 1);
        s.status = DownloadState::Completed;
        assert!(!s.archive_available());

        s.results.push(DownloadResult {
            part_number: "P1".to_string(),
            image_url: "https://img.example.com/1.jpg".to_string(),
            filename: "P1_1.jpg".to_string(),
            success: true,
            error_message: None,
            file_size: Some(2048),
        });
        assert!(!s.archive_available());

        s.zip_file = Some("parts_images_dl-1.zip".to_string());
        assert!(s.archive_available());
        assert_eq!(s.successful_images(), 1);
    }

    #[test]
    fn test_search_response_totals_are_derived() {
        let json = r#"{
            "search_id": "s-1",
            "results": [
                {"part_number": "P1", "search_query": "P1 part", "search_success": true,
                 "images": [{"title": "t", "original_url": "o", "thumbnail_url": "th", "source": "s"}]},
                {"part_number": "P2", "search_query": "P2 part", "search_success": false,
                 "error_message": "no results", "images": []}
            ],
            "total_parts": 2,
            "total_images_found": 7,
            "processing_time": 1.5
        }"#;
        let response: SearchResponse = serde_json::from_str(json).unwrap();
        let result = response.into_result();

        assert_eq!(result.total_parts(), 2);
        assert_eq!(result.total_images_found(), 1);
        assert!(!result.results[0].is_reprocessed());
        assert_eq!(
            result.part("P2").unwrap().error_message.as_deref(),
            Some("no results")
        );
    }

    #[test]
    fn test_request_serialization_skips_absent_options() {
        let search = SearchRequest {
            part_numbers: vec!["P1".to_string()],
            manufacturer: None,
            num_images_per_part: 4,
        };
        let json = serde_json::to_string(&search).unwrap();
        assert!(!json.contains("manufacturer"));

        let download = DownloadRequest {
            search_id: "s-1".to_string(),
            part_numbers: None,
        };
        let json = serde_json::to_string(&download).unwrap();
        assert_eq!(json, r#"{"search_id":"s-1"}"#);
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::Api {
            status: 404,
            detail: Some("Search ID not found".to_string()),
        };
        assert_eq!(err.to_string(), "HTTP 404: Search ID not found");

        let err = BackendError::Api {
            status: 502,
            detail: None,
        };
        assert_eq!(err.to_string(), "HTTP 502: no detail");
    }
}
