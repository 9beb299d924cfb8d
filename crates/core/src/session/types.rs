//! Types for the acquisition session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendError, DownloadStatus, SearchResult};
use crate::registry::RegistryError;

use super::download::DownloadPhase;

/// Errors surfaced by session operations.
///
/// `Validation` and `InvalidState` are raised locally and never reach the
/// network. Failed operations leave the held state untouched.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Bad or missing input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation attempted without its preconditions.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Transport failure, timeout or unreadable response.
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with a failure status.
    #[error("service error (HTTP {status}): {reason}")]
    Remote { status: u16, reason: String },

    /// Archive requested before it is ready.
    #[error("archive not available: {0}")]
    NotAvailable(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to write archive: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Text to show the user: the service's own reason when it gave one,
    /// a generic transport message otherwise.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Remote { reason, .. } => reason.clone(),
            SessionError::Network(_) => {
                "Could not reach the image service. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(
            self,
            SessionError::Validation(_)
                | SessionError::InvalidState(_)
                | SessionError::NotAvailable(_)
                | SessionError::Registry(_)
        )
    }
}

impl From<BackendError> for SessionError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Api { status, detail } => SessionError::Remote {
                status,
                reason: detail
                    .unwrap_or_else(|| format!("The image service returned HTTP {}", status)),
            },
            BackendError::Timeout => SessionError::Network("request timed out".to_string()),
            BackendError::ConnectionFailed(msg)
            | BackendError::InvalidResponse(msg)
            | BackendError::Internal(msg) => SessionError::Network(msg),
        }
    }
}

/// What the session is currently waiting on (the busy flag).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    ImportingCsv,
    Searching,
    Reprocessing,
    StartingDownload,
    FetchingArchive,
}

/// Options for a search over the registry contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Manufacturer filter; blank means none.
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Falls back to `session.default_images_per_part`.
    #[serde(default)]
    pub images_per_part: Option<u32>,
}

impl SearchOptions {
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_images_per_part(mut self, images_per_part: u32) -> Self {
        self.images_per_part = Some(images_per_part);
        self
    }
}

/// Result of one poll step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    /// Nothing to poll; no request was made.
    Idle,
    /// Job still queued or processing; another poll is scheduled.
    InProgress,
    Completed,
    Failed,
}

/// Observable view of the tracked download job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadView {
    pub search_id: String,
    pub download_id: Option<String>,
    pub phase: DownloadPhase,
    pub status: Option<DownloadStatus>,
    pub progress: f64,
    pub archive_available: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Immutable copy of the observable session state, published on change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub parts: Vec<String>,
    pub search: Option<SearchResult>,
    pub selection: Vec<String>,
    pub download: Option<DownloadView>,
    pub activity: Option<Activity>,
    pub disposed: bool,
}

impl SessionSnapshot {
    pub fn is_busy(&self) -> bool {
        self.activity.is_some()
    }

    pub fn download_phase(&self) -> DownloadPhase {
        self.download
            .as_ref()
            .map(|d| d.phase)
            .unwrap_or(DownloadPhase::NotStarted)
    }

    pub fn total_images_found(&self) -> usize {
        self.search
            .as_ref()
            .map(SearchResult::total_images_found)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_uses_service_detail() {
        let err = SessionError::from(BackendError::Api {
            status: 404,
            detail: Some("Original search ID not found".to_string()),
        });
        assert!(matches!(err, SessionError::Remote { status: 404, .. }));
        assert_eq!(err.user_message(), "Original search ID not found");
    }

    #[test]
    fn test_remote_error_without_detail() {
        let err = SessionError::from(BackendError::Api {
            status: 500,
            detail: None,
        });
        assert_eq!(err.user_message(), "The image service returned HTTP 500");
    }

    #[test]
    fn test_transport_errors_map_to_network() {
        let err = SessionError::from(BackendError::Timeout);
        assert!(matches!(err, SessionError::Network(_)));
        assert!(err.user_message().contains("Could not reach"));

        let err = SessionError::from(BackendError::InvalidResponse("eof".to_string()));
        assert!(matches!(err, SessionError::Network(_)));
        assert!(!err.is_local());
    }

    #[test]
    fn test_local_errors() {
        assert!(SessionError::Validation("x".to_string()).is_local());
        assert!(SessionError::NotAvailable("x".to_string()).is_local());
        let err = SessionError::Registry(RegistryError::IndexOutOfRange { index: 2, len: 1 });
        assert_eq!(err.user_message(), "index 2 out of range for 1 part numbers");
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = SessionSnapshot::default();
        assert!(!snapshot.is_busy());
        assert_eq!(snapshot.download_phase(), DownloadPhase::NotStarted);
        assert_eq!(snapshot.total_images_found(), 0);
    }

    #[test]
    fn test_search_options_builder() {
        let options = SearchOptions::default()
            .with_manufacturer("Schneider")
            .with_images_per_part(5);
        assert_eq!(options.manufacturer.as_deref(), Some("Schneider"));
        assert_eq!(options.images_per_part, Some(5));
    }
}
