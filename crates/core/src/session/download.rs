//! Download job state machine.
//!
//! `NotStarted -> Starting -> Polling -> {Completed | Failed}`, plus
//! `Abandoned` when tracking stops before a terminal state (superseded or
//! torn down). Only `Polling` schedules status queries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use crate::backend::{DownloadState, DownloadStatus};

use super::types::{DownloadView, PollOutcome};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPhase {
    NotStarted,
    /// Start request sent, not yet acknowledged.
    Starting,
    Polling,
    Completed,
    Failed,
    /// Tracking stopped before the job finished.
    Abandoned,
}

impl DownloadPhase {
    /// Starting or polling.
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadPhase::Starting | DownloadPhase::Polling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadPhase::Completed | DownloadPhase::Failed | DownloadPhase::Abandoned
        )
    }
}

/// One tracked download job.
#[derive(Debug, Clone)]
pub struct DownloadTracker {
    search_id: String,
    download_id: Option<String>,
    phase: DownloadPhase,
    status: Option<DownloadStatus>,
    started_at: DateTime<Utc>,
    next_poll_at: Option<Instant>,
    last_error: Option<String>,
    released: bool,
}

impl DownloadTracker {
    /// A job whose start request is in flight.
    pub fn starting(search_id: impl Into<String>) -> Self {
        Self {
            search_id: search_id.into(),
            download_id: None,
            phase: DownloadPhase::Starting,
            status: None,
            started_at: Utc::now(),
            next_poll_at: None,
            last_error: None,
            released: false,
        }
    }

    pub fn search_id(&self) -> &str {
        &self.search_id
    }

    pub fn download_id(&self) -> Option<&str> {
        self.download_id.as_deref()
    }

    pub fn phase(&self) -> DownloadPhase {
        self.phase
    }

    pub fn status(&self) -> Option<&DownloadStatus> {
        self.status.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    pub fn is_polling(&self) -> bool {
        self.phase == DownloadPhase::Polling
    }

    /// When the next status query is due; `None` unless polling.
    pub fn next_poll_at(&self) -> Option<Instant> {
        self.next_poll_at.filter(|_| self.is_polling())
    }

    pub fn progress(&self) -> f64 {
        self.status.as_ref().map(DownloadStatus::progress).unwrap_or(0.0)
    }

    pub fn archive_available(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(DownloadStatus::archive_available)
    }

    /// Record the service's acknowledgement of the start request.
    pub fn acknowledge(&mut self, status: DownloadStatus, interval: Duration, now: Instant) {
        self.download_id = Some(status.download_id.clone());
        self.apply(status, interval, now);
    }

    /// Apply a polled status. The downloaded count never goes backwards
    /// while the job is still running.
    pub fn apply_poll(
        &mut self,
        mut status: DownloadStatus,
        interval: Duration,
        now: Instant,
    ) -> PollOutcome {
        if !self.is_polling() {
            return PollOutcome::Idle;
        }

        if let Some(previous) = &self.status {
            if !status.is_terminal() && status.downloaded_images < previous.downloaded_images {
                warn!(
                    download_id = %status.download_id,
                    previous = previous.downloaded_images,
                    reported = status.downloaded_images,
                    "Downloaded image count went backwards; keeping previous value"
                );
                status.downloaded_images = previous.downloaded_images;
            }
        }

        self.apply(status, interval, now)
    }

    /// Stop polling after a failed status query. The last status is kept.
    pub fn poll_failed(&mut self, reason: impl Into<String>) {
        if self.is_polling() {
            self.phase = DownloadPhase::Failed;
            self.next_poll_at = None;
            self.last_error = Some(reason.into());
        }
    }

    /// Stop tracking. Returns the download id exactly once if a server-side
    /// job exists and has not been released yet.
    pub fn abandon(&mut self) -> Option<String> {
        if self.phase.is_active() {
            self.phase = DownloadPhase::Abandoned;
        }
        self.next_poll_at = None;

        if self.released {
            return None;
        }
        let id = self.download_id.clone()?;
        self.released = true;
        Some(id)
    }

    pub fn view(&self) -> DownloadView {
        DownloadView {
            search_id: self.search_id.clone(),
            download_id: self.download_id.clone(),
            phase: self.phase,
            status: self.status.clone(),
            progress: self.progress(),
            archive_available: self.archive_available(),
            started_at: self.started_at,
            last_error: self.last_error.clone(),
        }
    }

    fn apply(&mut self, status: DownloadStatus, interval: Duration, now: Instant) -> PollOutcome {
        let outcome = match status.status {
            DownloadState::Queued | DownloadState::Processing => {
                self.phase = DownloadPhase::Polling;
                self.next_poll_at = Some(now + interval);
                PollOutcome::InProgress
            }
            DownloadState::Completed => {
                self.phase = DownloadPhase::Completed;
                self.next_poll_at = None;
                PollOutcome::Completed
            }
            DownloadState::Failed => {
                self.phase = DownloadPhase::Failed;
                self.next_poll_at = None;
                self.last_error = status.error_message.clone();
                PollOutcome::Failed
            }
        };
        self.status = Some(status);
        outcome
    }
}
