//! Acquisition session implementation.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{
    ArchiveStream, DownloadRequest, DownloadStatus, HealthStatus, ImageBackend, ReprocessRequest,
    ReprocessStrategy, SearchRequest, SearchResult,
};
use crate::config::SessionConfig;
use crate::registry::{AddOutcome, PartRegistry};

use super::cleanup::CleanupScheduler;
use super::download::{DownloadPhase, DownloadTracker};
use super::merge::merge_reprocessed;
use super::types::{Activity, PollOutcome, SearchOptions, SessionError, SessionSnapshot};

/// One user's acquisition session.
///
/// Every mutation goes through `&mut self`, so operations can never
/// interleave. Observers follow changes through [`subscribe`](Self::subscribe).
/// The owner must call [`dispose`](Self::dispose) once when done.
pub struct AcquisitionSession {
    id: Uuid,
    backend: Arc<dyn ImageBackend>,
    config: SessionConfig,
    registry: PartRegistry,
    search: Option<SearchResult>,
    selection: Vec<String>,
    download: Option<DownloadTracker>,
    activity: Option<Activity>,
    cleanup: CleanupScheduler,
    disposed: bool,
    state_tx: watch::Sender<SessionSnapshot>,
}

impl AcquisitionSession {
    /// Create a new session.
    pub fn new(backend: Arc<dyn ImageBackend>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionSnapshot::default());
        let id = Uuid::new_v4();
        debug!(session_id = %id, backend = backend.name(), "Session created");

        Self {
            id,
            cleanup: CleanupScheduler::new(Arc::clone(&backend)),
            backend,
            config,
            registry: PartRegistry::new(),
            search: None,
            selection: Vec::new(),
            download: None,
            activity: None,
            disposed: false,
            state_tx,
        }
    }

    /// Receive a snapshot on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            parts: self.registry.as_slice().to_vec(),
            search: self.search.clone(),
            selection: self.selection.clone(),
            download: self.download.as_ref().map(DownloadTracker::view),
            activity: self.activity,
            disposed: self.disposed,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &PartRegistry {
        &self.registry
    }

    pub fn search_result(&self) -> Option<&SearchResult> {
        self.search.as_ref()
    }

    pub fn selection(&self) -> &[String] {
        &self.selection
    }

    pub fn download(&self) -> Option<&DownloadTracker> {
        self.download.as_ref()
    }

    pub fn activity(&self) -> Option<Activity> {
        self.activity
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// When the tracked job's next status query is due.
    pub fn next_poll_at(&self) -> Option<Instant> {
        if self.disposed {
            return None;
        }
        self.download.as_ref().and_then(DownloadTracker::next_poll_at)
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    pub fn add_part(&mut self, raw: &str) -> Result<AddOutcome, SessionError> {
        self.ensure_open()?;
        let outcome = self.registry.add(raw);
        if outcome == AddOutcome::Added {
            self.publish();
        }
        Ok(outcome)
    }

    pub fn add_parts<I, S>(&mut self, raw: I) -> Result<usize, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ensure_open()?;
        let added = self.registry.add_many(raw);
        if added > 0 {
            self.publish();
        }
        Ok(added)
    }

    /// Add every value of comma/newline/tab separated text.
    pub fn add_delimited(&mut self, text: &str) -> Result<usize, SessionError> {
        self.ensure_open()?;
        let added = self.registry.parse_delimited(text);
        if added > 0 {
            self.publish();
        }
        Ok(added)
    }

    pub fn remove_part(&mut self, index: usize) -> Result<String, SessionError> {
        self.ensure_open()?;
        let removed = self.registry.remove(index)?;
        self.publish();
        Ok(removed)
    }

    pub fn clear_parts(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.registry.clear();
        self.publish();
        Ok(())
    }

    /// Upload a CSV file to the parsing service and add the part numbers it
    /// contains. Returns how many were new.
    pub async fn import_csv(
        &mut self,
        file_name: &str,
        contents: Vec<u8>,
    ) -> Result<usize, SessionError> {
        self.ensure_open()?;
        if !file_name.to_ascii_lowercase().ends_with(".csv") {
            return Err(SessionError::Validation(format!(
                "{} is not a .csv file",
                file_name
            )));
        }
        if contents.is_empty() {
            return Err(SessionError::Validation(format!("{} is empty", file_name)));
        }

        let backend = Arc::clone(&self.backend);
        self.begin(Activity::ImportingCsv);
        let parsed = backend.parse_csv(file_name, contents).await;
        self.finish();

        let parts = match parsed {
            Ok(parts) => parts,
            Err(e) => {
                warn!(file_name, error = %e, "CSV import failed");
                self.publish();
                return Err(e.into());
            }
        };

        let added = self.registry.add_many(&parts);
        info!(file_name, parsed = parts.len(), added, "Imported part numbers from CSV");
        self.publish();
        Ok(added)
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Search images for every registered part.
    ///
    /// On success the held result is replaced, the selection is cleared and
    /// any tracked download is abandoned (its cleanup runs in the
    /// background). On failure nothing changes.
    pub async fn search(&mut self, options: SearchOptions) -> Result<SearchResult, SessionError> {
        self.ensure_open()?;
        if self.registry.is_empty() {
            return Err(SessionError::Validation(
                "add at least one part number before searching".to_string(),
            ));
        }

        let images_per_part = options
            .images_per_part
            .unwrap_or(self.config.default_images_per_part);
        let range = self.config.min_images_per_part..=self.config.max_images_per_part;
        if !range.contains(&images_per_part) {
            return Err(SessionError::Validation(format!(
                "images per part must be between {} and {}, got {}",
                range.start(),
                range.end(),
                images_per_part
            )));
        }

        let request = SearchRequest {
            part_numbers: self.registry.as_slice().to_vec(),
            manufacturer: options
                .manufacturer
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
            num_images_per_part: images_per_part,
        };

        info!(
            parts = request.part_numbers.len(),
            manufacturer = ?request.manufacturer,
            images_per_part,
            "Searching part images"
        );

        let backend = Arc::clone(&self.backend);
        self.begin(Activity::Searching);
        let response = backend.search(&request).await;
        self.finish();

        let result = match response {
            Ok(response) => response.into_result(),
            Err(e) => {
                warn!(error = %e, "Search failed");
                self.publish();
                return Err(e.into());
            }
        };

        self.selection.clear();
        if let Some(previous) = self.download.take() {
            self.release(previous, "superseded by a new search");
        }

        info!(
            search_id = %result.search_id,
            parts = result.total_parts(),
            images = result.total_images_found(),
            "Search complete"
        );
        self.search = Some(result.clone());
        self.publish();
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Mark a part of the held result for reprocessing. Returns false if it
    /// was already selected.
    pub fn select(&mut self, part_number: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        let held = self.held_search()?;
        if !held.contains_part(part_number) {
            return Err(SessionError::Validation(format!(
                "{} is not part of search {}",
                part_number, held.search_id
            )));
        }
        if self.selection.iter().any(|p| p == part_number) {
            return Ok(false);
        }
        self.selection.push(part_number.to_string());
        self.publish();
        Ok(true)
    }

    pub fn deselect(&mut self, part_number: &str) -> bool {
        let before = self.selection.len();
        self.selection.retain(|p| p != part_number);
        let removed = self.selection.len() != before;
        if removed {
            self.publish();
        }
        removed
    }

    /// Flip the selection of a part; returns whether it is now selected.
    pub fn toggle_selection(&mut self, part_number: &str) -> Result<bool, SessionError> {
        if self.deselect(part_number) {
            return Ok(false);
        }
        self.select(part_number)
    }

    pub fn select_all(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let parts: Vec<String> = self.held_search()?.part_numbers().map(String::from).collect();
        self.selection = parts;
        self.publish();
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        if !self.selection.is_empty() {
            self.selection.clear();
            self.publish();
        }
    }

    // ------------------------------------------------------------------
    // Reprocess
    // ------------------------------------------------------------------

    /// Re-search `selected` parts of the held search with an alternate
    /// strategy and merge the fresh results in place.
    pub async fn reprocess(
        &mut self,
        search_id: &str,
        selected: &[String],
        strategy: &str,
    ) -> Result<SearchResult, SessionError> {
        self.ensure_open()?;
        let strategy: ReprocessStrategy = strategy
            .parse()
            .map_err(|e: crate::backend::UnknownStrategy| SessionError::Validation(e.to_string()))?;

        let request = {
            let held = self.held_search()?;
            if held.search_id != search_id {
                return Err(SessionError::InvalidState(format!(
                    "search {} is not the current search",
                    search_id
                )));
            }

            let mut parts: Vec<String> = Vec::with_capacity(selected.len());
            for part in selected {
                if !held.contains_part(part) {
                    return Err(SessionError::Validation(format!(
                        "{} is not part of search {}",
                        part, search_id
                    )));
                }
                if !parts.contains(part) {
                    parts.push(part.clone());
                }
            }
            if parts.is_empty() {
                return Err(SessionError::Validation(
                    "select at least one part to reprocess".to_string(),
                ));
            }

            ReprocessRequest {
                search_id: search_id.to_string(),
                part_numbers: parts,
                search_strategy: strategy,
            }
        };

        info!(
            search_id,
            parts = request.part_numbers.len(),
            strategy = %strategy,
            "Reprocessing parts"
        );

        let backend = Arc::clone(&self.backend);
        self.begin(Activity::Reprocessing);
        let response = backend.reprocess(&request).await;
        self.finish();

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(search_id, error = %e, "Reprocess failed");
                self.publish();
                return Err(e.into());
            }
        };

        let Some(held) = self.search.as_mut().filter(|r| r.search_id == search_id) else {
            warn!(search_id, "Dropping reprocess response for a superseded search");
            self.publish();
            return Err(SessionError::InvalidState(format!(
                "search {} was superseded",
                search_id
            )));
        };

        if let Some(new_id) = response.search_id.as_deref() {
            debug!(search_id, reprocess_id = new_id, "Service filed reprocess under its own id");
        }

        let report = merge_reprocessed(
            held,
            &request.part_numbers,
            response.results,
            strategy,
        );
        let merged = held.clone();
        self.selection.clear();

        info!(
            search_id,
            replaced = report.replaced.len(),
            unmatched = report.unmatched.len(),
            images = merged.total_images_found(),
            "Reprocess merged"
        );
        self.publish();
        Ok(merged)
    }

    /// Reprocess the current selection of the held search.
    pub async fn reprocess_selection(
        &mut self,
        strategy: &str,
    ) -> Result<SearchResult, SessionError> {
        let search_id = self.held_search()?.search_id.clone();
        let selected = self.selection.clone();
        self.reprocess(&search_id, &selected, strategy).await
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    /// Start a background download of the held search, optionally limited
    /// to `parts`. Polling is scheduled once the service acknowledges.
    pub async fn start_download(
        &mut self,
        search_id: &str,
        parts: Option<Vec<String>>,
    ) -> Result<DownloadStatus, SessionError> {
        self.ensure_open()?;

        {
            let held = self.held_search()?;
            if held.search_id != search_id {
                return Err(SessionError::InvalidState(format!(
                    "search {} is not the current search",
                    search_id
                )));
            }
            if let Some(parts) = &parts {
                if parts.is_empty() {
                    return Err(SessionError::Validation(
                        "select at least one part to download".to_string(),
                    ));
                }
                if let Some(unknown) = parts.iter().find(|p| !held.contains_part(p)) {
                    return Err(SessionError::Validation(format!(
                        "{} is not part of search {}",
                        unknown, search_id
                    )));
                }
            }
        }

        if self.download.as_ref().is_some_and(DownloadTracker::is_active) {
            return Err(SessionError::InvalidState(
                "a download is already in progress".to_string(),
            ));
        }

        let request = DownloadRequest {
            search_id: search_id.to_string(),
            part_numbers: parts.map(|mut parts| {
                let mut seen = Vec::with_capacity(parts.len());
                parts.retain(|p| {
                    let fresh = !seen.contains(p);
                    seen.push(p.clone());
                    fresh
                });
                parts
            }),
        };

        // Keep the previous job until the new one is acknowledged.
        let previous = self.download.replace(DownloadTracker::starting(search_id));

        let backend = Arc::clone(&self.backend);
        self.begin(Activity::StartingDownload);
        let response = backend.start_download(&request).await;
        self.finish();

        match response {
            Ok(status) => {
                if let Some(tracker) = self.download.as_mut() {
                    tracker.acknowledge(status.clone(), self.config.poll_interval(), Instant::now());
                }
                if let Some(previous) = previous {
                    self.release(previous, "replaced by a new download");
                }
                info!(
                    search_id,
                    download_id = %status.download_id,
                    total_images = status.total_images,
                    status = status.status.as_str(),
                    "Download started"
                );
                self.publish();
                Ok(status)
            }
            Err(e) => {
                warn!(search_id, error = %e, "Failed to start download");
                self.download = previous;
                self.publish();
                Err(e.into())
            }
        }
    }

    /// Query the tracked job once if it is polling.
    ///
    /// Returns `Idle` without a request otherwise. A failed query stops
    /// polling for good; it is not retried.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, SessionError> {
        if self.disposed {
            return Ok(PollOutcome::Idle);
        }
        let Some(download_id) = self
            .download
            .as_ref()
            .filter(|t| t.is_polling())
            .and_then(|t| t.download_id().map(String::from))
        else {
            return Ok(PollOutcome::Idle);
        };

        debug!(download_id = %download_id, "Polling download status");
        let response = self.backend.download_status(&download_id).await;

        let interval = self.config.poll_interval();
        let Some(tracker) = self
            .download
            .as_mut()
            .filter(|t| t.is_polling() && t.download_id() == Some(download_id.as_str()))
        else {
            return Ok(PollOutcome::Idle);
        };

        let result = match response {
            Ok(status) if status.download_id != download_id => {
                let err = SessionError::Network(format!(
                    "status response for {} while polling {}",
                    status.download_id, download_id
                ));
                tracker.poll_failed(err.user_message());
                Err(err)
            }
            Ok(status) => {
                let outcome = tracker.apply_poll(status, interval, Instant::now());
                match outcome {
                    PollOutcome::Completed => info!(
                        download_id = %download_id,
                        downloaded = tracker.status().map(|s| s.downloaded_images).unwrap_or(0),
                        archive = tracker.archive_available(),
                        "Download completed"
                    ),
                    PollOutcome::Failed => warn!(
                        download_id = %download_id,
                        error = ?tracker.last_error(),
                        "Download failed"
                    ),
                    _ => debug!(
                        download_id = %download_id,
                        progress = tracker.progress(),
                        "Download in progress"
                    ),
                }
                Ok(outcome)
            }
            Err(e) => {
                let err = SessionError::from(e);
                warn!(download_id = %download_id, error = %err, "Status poll failed; polling stopped");
                tracker.poll_failed(err.user_message());
                Err(err)
            }
        };

        self.publish();
        result
    }

    /// Poll the tracked job until it reaches a terminal state, waiting
    /// `poll_interval` after each completed query.
    ///
    /// Returns `Idle` immediately if nothing is polling.
    pub async fn run_poll_loop(&mut self) -> Result<PollOutcome, SessionError> {
        loop {
            let Some(deadline) = self.next_poll_at() else {
                return Ok(PollOutcome::Idle);
            };
            tokio::time::sleep_until(deadline).await;

            match self.poll_once().await? {
                PollOutcome::InProgress => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Server-side archive name of the tracked job, when one was produced.
    pub fn archive_file_name(&self) -> Option<&str> {
        self.download
            .as_ref()
            .and_then(DownloadTracker::status)
            .and_then(|s| s.zip_file.as_deref())
    }

    /// Stream the archive of a completed job into `dest`. Returns the number
    /// of bytes written; a partial file is removed on failure.
    pub async fn fetch_archive(
        &mut self,
        download_id: &str,
        dest: &Path,
    ) -> Result<u64, SessionError> {
        self.ensure_open()?;
        let Some(tracker) = self
            .download
            .as_ref()
            .filter(|t| t.download_id() == Some(download_id))
        else {
            return Err(SessionError::NotAvailable(format!(
                "download {} is not tracked by this session",
                download_id
            )));
        };
        if tracker.phase() != DownloadPhase::Completed {
            return Err(SessionError::NotAvailable(format!(
                "download {} has not completed",
                download_id
            )));
        }
        if !tracker.archive_available() {
            return Err(SessionError::NotAvailable(format!(
                "download {} produced no images",
                download_id
            )));
        }

        let backend = Arc::clone(&self.backend);
        self.begin(Activity::FetchingArchive);
        let result = match backend.fetch_archive(download_id).await {
            Ok(stream) => write_archive(stream, dest).await,
            Err(e) => Err(e.into()),
        };
        self.finish();
        self.publish();

        match &result {
            Ok(bytes) => info!(download_id, bytes, dest = %dest.display(), "Archive saved"),
            Err(e) => warn!(download_id, error = %e, "Archive fetch failed"),
        }
        result
    }

    /// Check that the image service is reachable.
    pub async fn health(&self) -> Result<HealthStatus, SessionError> {
        let status = self.backend.health().await?;
        if !status.is_healthy() {
            warn!(
                backend = self.backend.name(),
                status = %status.status,
                "Image service reports unhealthy"
            );
        }
        Ok(status)
    }

    /// Wait for background cleanups scheduled so far.
    pub async fn wait_for_cleanups(&mut self) {
        self.cleanup.drain().await;
    }

    /// Tear the session down: stop polling, release the tracked job and wait
    /// for pending cleanups. Later calls do nothing.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let Some(tracker) = self.download.as_mut() {
            if let Some(download_id) = tracker.abandon() {
                info!(download_id = %download_id, "Releasing download on session teardown");
                self.cleanup.schedule(download_id);
            }
        }
        self.cleanup.drain().await;
        self.publish();
        info!(session_id = %self.id, "Session disposed");
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.disposed {
            return Err(SessionError::InvalidState(
                "session has been disposed".to_string(),
            ));
        }
        Ok(())
    }

    fn held_search(&self) -> Result<&SearchResult, SessionError> {
        self.search
            .as_ref()
            .ok_or_else(|| SessionError::InvalidState("no search result is held".to_string()))
    }

    fn release(&mut self, mut tracker: DownloadTracker, reason: &str) {
        if let Some(download_id) = tracker.abandon() {
            info!(download_id = %download_id, reason, "Stopped tracking download");
            self.cleanup.schedule(download_id);
        }
    }

    fn begin(&mut self, activity: Activity) {
        self.activity = Some(activity);
        self.publish();
    }

    fn finish(&mut self) {
        self.activity = None;
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot());
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if let Some(download_id) = self.download.as_mut().and_then(DownloadTracker::abandon) {
            warn!(download_id = %download_id, "Session dropped without dispose; releasing download");
            self.cleanup.schedule(download_id);
        }
    }
}

async fn write_archive(mut stream: ArchiveStream, dest: &Path) -> Result<u64, SessionError> {
    let result = async {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok::<u64, SessionError>(written)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}
