//! Mock image service for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::RwLock;

use crate::backend::{
    ArchiveStream, BackendError, DownloadRequest, DownloadState, DownloadStatus,
    HealthStatus, ImageBackend, PartResult, ReprocessRequest, ReprocessResponse, SearchRequest,
    SearchResponse,
};
use crate::registry::split_delimited;

use super::fixtures;

/// Operations of the image service, for failure injection and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    ParseCsv,
    Search,
    Reprocess,
    StartDownload,
    DownloadStatus,
    FetchArchive,
    Cleanup,
    Health,
}

/// A recorded call for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    ParseCsv { file_name: String, size: usize },
    Search(SearchRequest),
    Reprocess(ReprocessRequest),
    StartDownload(DownloadRequest),
    DownloadStatus(String),
    FetchArchive(String),
    Cleanup(String),
    Health,
}

impl RecordedCall {
    pub fn operation(&self) -> MockOperation {
        match self {
            RecordedCall::ParseCsv { .. } => MockOperation::ParseCsv,
            RecordedCall::Search(_) => MockOperation::Search,
            RecordedCall::Reprocess(_) => MockOperation::Reprocess,
            RecordedCall::StartDownload(_) => MockOperation::StartDownload,
            RecordedCall::DownloadStatus(_) => MockOperation::DownloadStatus,
            RecordedCall::FetchArchive(_) => MockOperation::FetchArchive,
            RecordedCall::Cleanup(_) => MockOperation::Cleanup,
            RecordedCall::Health => MockOperation::Health,
        }
    }
}

#[derive(Debug, Clone)]
struct MockDownload {
    parts: Vec<(String, usize)>,
    polls: usize,
}

impl MockDownload {
    fn total(&self) -> usize {
        self.parts.iter().map(|(_, n)| n).sum()
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    failures: HashMap<MockOperation, BackendError>,
    delays: HashMap<MockOperation, Duration>,
    searches: HashMap<String, Vec<(String, usize)>>,
    downloads: HashMap<String, MockDownload>,
    images_for: HashMap<String, usize>,
    status_sequence: VecDeque<DownloadState>,
    reprocess_results: Option<Vec<PartResult>>,
    csv_parts: Option<Vec<String>>,
    archive: Option<Vec<u8>>,
    broken_archive: bool,
    empty_archive: bool,
    search_counter: u32,
    download_counter: u32,
}

/// Mock implementation of the `ImageBackend` trait.
///
/// Keeps searches and download jobs in memory and hands out deterministic
/// ids (`search-1`, `download-1`, ...). Unknown ids answer with HTTP 404 and
/// a detail message, like the real service.
///
/// Download jobs start `queued`. Each status poll consumes the next state of
/// the configured sequence; once the sequence runs dry the job reports
/// `completed`.
///
/// # Example
///
/// ```rust,ignore
/// let backend = MockImageBackend::new();
/// backend
///     .set_status_sequence(vec![DownloadState::Processing, DownloadState::Completed])
///     .await;
/// backend
///     .fail_next(MockOperation::Search, BackendError::Timeout)
///     .await;
/// ```
#[derive(Clone, Default)]
pub struct MockImageBackend {
    state: Arc<RwLock<MockState>>,
}

impl MockImageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `error`.
    pub async fn fail_next(&self, op: MockOperation, error: BackendError) {
        self.state.write().await.failures.insert(op, error);
    }

    /// Delay every call of `op` by `delay` before it is answered.
    pub async fn set_delay(&self, op: MockOperation, delay: Duration) {
        self.state.write().await.delays.insert(op, delay);
    }

    /// States reported by successive status polls.
    pub async fn set_status_sequence(&self, states: Vec<DownloadState>) {
        self.state.write().await.status_sequence = states.into();
    }

    /// Images returned for `part` by searches and reprocess passes.
    pub async fn set_images_for(&self, part: &str, count: usize) {
        self.state
            .write()
            .await
            .images_for
            .insert(part.to_string(), count);
    }

    /// Return exactly these results from the next reprocess calls.
    pub async fn set_reprocess_results(&self, results: Vec<PartResult>) {
        self.state.write().await.reprocess_results = Some(results);
    }

    /// Part numbers returned by `parse_csv` instead of tokenizing the upload.
    pub async fn set_csv_parts(&self, parts: Vec<String>) {
        self.state.write().await.csv_parts = Some(parts);
    }

    /// Archive body served by `fetch_archive`.
    pub async fn set_archive(&self, bytes: Vec<u8>) {
        self.state.write().await.archive = Some(bytes);
    }

    /// Serve the first archive chunk and then fail the stream.
    pub async fn set_broken_archive(&self) {
        self.state.write().await.broken_archive = true;
    }

    /// Complete download jobs without any downloaded image (no archive).
    pub async fn set_empty_archive(&self) {
        self.state.write().await.empty_archive = true;
    }

    /// All recorded calls, in order.
    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.read().await.calls.clone()
    }

    /// Number of calls made for `op`.
    pub async fn count(&self, op: MockOperation) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.operation() == op)
            .count()
    }

    /// Task ids passed to `cleanup`, in order (failed attempts included).
    pub async fn cleanups(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                RecordedCall::Cleanup(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of status polls made for `download_id`.
    pub async fn status_polls(&self, download_id: &str) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, RecordedCall::DownloadStatus(id) if id == download_id))
            .count()
    }

    /// Whether the service still holds the given download job.
    pub async fn has_download(&self, download_id: &str) -> bool {
        self.state.read().await.downloads.contains_key(download_id)
    }

    /// Record the call, apply the configured delay and take a pending failure.
    async fn enter(&self, call: RecordedCall) -> Result<(), BackendError> {
        let op = call.operation();
        let delay = {
            let mut state = self.state.write().await;
            state.calls.push(call);
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.state.write().await.failures.remove(&op) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn not_found(detail: &str) -> BackendError {
    BackendError::Api {
        status: 404,
        detail: Some(detail.to_string()),
    }
}

fn download_status(
    download_id: &str,
    job: &MockDownload,
    state: DownloadState,
    empty: bool,
) -> DownloadStatus {
    let total = job.total() as u32;
    match state {
        DownloadState::Completed if empty || total == 0 => {
            fixtures::download_status(download_id, DownloadState::Completed, 0, total)
        }
        DownloadState::Completed => {
            let parts: Vec<(&str, usize)> =
                job.parts.iter().map(|(p, n)| (p.as_str(), *n)).collect();
            fixtures::completed_status(download_id, &parts)
        }
        DownloadState::Processing => {
            let downloaded = (job.polls as u32).min(total.saturating_sub(1));
            fixtures::download_status(download_id, state, downloaded, total)
        }
        DownloadState::Failed => DownloadStatus {
            error_message: Some("Download failed".to_string()),
            ..fixtures::download_status(download_id, state, 0, total)
        },
        DownloadState::Queued => fixtures::download_status(download_id, state, 0, total),
    }
}

#[async_trait]
impl ImageBackend for MockImageBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn parse_csv(
        &self,
        file_name: &str,
        contents: Vec<u8>,
    ) -> Result<Vec<String>, BackendError> {
        self.enter(RecordedCall::ParseCsv {
            file_name: file_name.to_string(),
            size: contents.len(),
        })
        .await?;

        if let Some(parts) = self.state.read().await.csv_parts.clone() {
            return Ok(parts);
        }
        let text = String::from_utf8(contents).map_err(|_| BackendError::Api {
            status: 400,
            detail: Some("Error processing CSV file: invalid UTF-8".to_string()),
        })?;
        Ok(split_delimited(&text)
            .into_iter()
            .filter(|token| !token.eq_ignore_ascii_case("part_number"))
            .map(String::from)
            .collect())
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError> {
        self.enter(RecordedCall::Search(request.clone())).await?;

        let mut state = self.state.write().await;
        state.search_counter += 1;
        let search_id = format!("search-{}", state.search_counter);

        let counts: Vec<(String, usize)> = request
            .part_numbers
            .iter()
            .map(|part| {
                let count = state
                    .images_for
                    .get(part)
                    .copied()
                    .unwrap_or(request.num_images_per_part as usize);
                (part.clone(), count)
            })
            .collect();

        let results: Vec<PartResult> = counts
            .iter()
            .map(|(part, n)| {
                if *n == 0 {
                    fixtures::failed_part_result(part, "No images found")
                } else {
                    fixtures::part_result(part, *n)
                }
            })
            .collect();
        let total_images_found = results.iter().map(PartResult::image_count).sum();

        state.searches.insert(search_id.clone(), counts);
        Ok(SearchResponse {
            search_id,
            total_parts: results.len(),
            total_images_found,
            results,
            processing_time: 0.1,
        })
    }

    async fn reprocess(
        &self,
        request: &ReprocessRequest,
    ) -> Result<ReprocessResponse, BackendError> {
        self.enter(RecordedCall::Reprocess(request.clone())).await?;

        let mut state = self.state.write().await;
        if !state.searches.contains_key(&request.search_id) {
            return Err(not_found("Original search ID not found"));
        }

        let results: Vec<PartResult> = match state.reprocess_results.clone() {
            Some(results) => results,
            None => request
                .part_numbers
                .iter()
                .map(|part| {
                    let count = state.images_for.get(part).copied().unwrap_or(2);
                    let mut result = fixtures::part_result(part, count);
                    result.search_query = format!("{} {}", part, request.search_strategy);
                    result
                })
                .collect(),
        };

        if let Some(counts) = state.searches.get_mut(&request.search_id) {
            for fresh in &results {
                if let Some(slot) = counts.iter_mut().find(|(p, _)| *p == fresh.part_number) {
                    slot.1 = fresh.image_count();
                }
            }
        }

        Ok(ReprocessResponse {
            total_images_found: results.iter().map(PartResult::image_count).sum(),
            results,
            search_id: None,
        })
    }

    async fn start_download(
        &self,
        request: &DownloadRequest,
    ) -> Result<DownloadStatus, BackendError> {
        self.enter(RecordedCall::StartDownload(request.clone())).await?;

        let mut state = self.state.write().await;
        let Some(counts) = state.searches.get(&request.search_id) else {
            return Err(not_found("Search ID not found"));
        };
        let parts: Vec<(String, usize)> = counts
            .iter()
            .filter(|(p, _)| {
                request
                    .part_numbers
                    .as_ref()
                    .map_or(true, |wanted| wanted.contains(p))
            })
            .cloned()
            .collect();

        state.download_counter += 1;
        let download_id = format!("download-{}", state.download_counter);
        let job = MockDownload { parts, polls: 0 };
        let status = download_status(&download_id, &job, DownloadState::Queued, false);
        state.downloads.insert(download_id, job);
        Ok(status)
    }

    async fn download_status(&self, download_id: &str) -> Result<DownloadStatus, BackendError> {
        self.enter(RecordedCall::DownloadStatus(download_id.to_string()))
            .await?;

        let mut state = self.state.write().await;
        let next = state
            .status_sequence
            .pop_front()
            .unwrap_or(DownloadState::Completed);
        let empty = state.empty_archive;
        let Some(job) = state.downloads.get_mut(download_id) else {
            return Err(not_found("Download task not found"));
        };
        job.polls += 1;
        Ok(download_status(download_id, job, next, empty))
    }

    async fn fetch_archive(&self, download_id: &str) -> Result<ArchiveStream, BackendError> {
        self.enter(RecordedCall::FetchArchive(download_id.to_string()))
            .await?;

        let state = self.state.read().await;
        if !state.downloads.contains_key(download_id) {
            return Err(not_found("Download task not found"));
        }
        let body = state
            .archive
            .clone()
            .unwrap_or_else(|| format!("PK-mock-archive-{}", download_id).into_bytes());

        let mut chunks: Vec<Result<Vec<u8>, BackendError>> =
            body.chunks(8).map(|c| Ok(c.to_vec())).collect();
        if state.broken_archive {
            chunks.truncate(1);
            chunks.push(Err(BackendError::ConnectionFailed(
                "connection reset".to_string(),
            )));
        }
        Ok(stream::iter(chunks).boxed())
    }

    async fn cleanup(&self, task_id: &str) -> Result<(), BackendError> {
        self.enter(RecordedCall::Cleanup(task_id.to_string())).await?;

        let mut state = self.state.write().await;
        let removed_download = state.downloads.remove(task_id).is_some();
        let removed_search = state.searches.remove(task_id).is_some();
        if removed_download || removed_search {
            Ok(())
        } else {
            Err(not_found("Task not found"))
        }
    }

    async fn health(&self) -> Result<HealthStatus, BackendError> {
        self.enter(RecordedCall::Health).await?;
        Ok(HealthStatus {
            status: "healthy".to_string(),
            details: HashMap::from([(
                "active_downloads".to_string(),
                serde_json::json!(self.state.read().await.downloads.len()),
            )]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_request(parts: &[&str]) -> SearchRequest {
        SearchRequest {
            part_numbers: parts.iter().map(|p| p.to_string()).collect(),
            manufacturer: None,
            num_images_per_part: 3,
        }
    }

    #[tokio::test]
    async fn test_search_assigns_ids_and_counts() {
        let backend = MockImageBackend::new();
        backend.set_images_for("P2", 0).await;

        let response = backend.search(&search_request(&["P1", "P2"])).await.unwrap();
        assert_eq!(response.search_id, "search-1");
        assert_eq!(response.results[0].images.len(), 3);
        assert!(!response.results[1].search_success);
        assert_eq!(response.total_images_found, 3);

        let response = backend.search(&search_request(&["P1"])).await.unwrap();
        assert_eq!(response.search_id, "search-2");
    }

    #[tokio::test]
    async fn test_status_sequence_then_completed() {
        let backend = MockImageBackend::new();
        backend
            .set_status_sequence(vec![DownloadState::Processing])
            .await;
        backend.search(&search_request(&["P1"])).await.unwrap();
        let started = backend
            .start_download(&DownloadRequest {
                search_id: "search-1".to_string(),
                part_numbers: None,
            })
            .await
            .unwrap();
        assert_eq!(started.status, DownloadState::Queued);
        assert_eq!(started.total_images, 3);

        let polled = backend.download_status("download-1").await.unwrap();
        assert_eq!(polled.status, DownloadState::Processing);
        let polled = backend.download_status("download-1").await.unwrap();
        assert!(polled.archive_available());
        assert_eq!(backend.status_polls("download-1").await, 2);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let backend = MockImageBackend::new();
        let err = backend.download_status("nope").await.unwrap_err();
        assert!(matches!(err, BackendError::Api { status: 404, .. }));
        assert!(backend.cleanup("nope").await.is_err());
        assert_eq!(backend.cleanups().await, vec!["nope"]);
    }

    #[tokio::test]
    async fn test_fail_next_applies_once() {
        let backend = MockImageBackend::new();
        backend
            .fail_next(MockOperation::Health, BackendError::Timeout)
            .await;
        assert!(backend.health().await.is_err());
        assert!(backend.health().await.unwrap().is_healthy());
        assert_eq!(backend.count(MockOperation::Health).await, 2);
    }

    #[tokio::test]
    async fn test_parse_csv_skips_header() {
        let backend = MockImageBackend::new();
        let parts = backend
            .parse_csv("parts.csv", b"part_number\nA1\nB2,C3\n".to_vec())
            .await
            .unwrap();
        assert_eq!(parts, vec!["A1", "B2", "C3"]);
    }
}
