//! Cloneable handle driving an [`AcquisitionSession`] on a background task.
//!
//! The task owns the session, applies commands one at a time and issues
//! status polls whenever the tracked download's deadline passes. Dropping
//! every handle disposes the session.

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{DownloadStatus, HealthStatus, SearchResult};
use crate::registry::AddOutcome;

use super::runner::AcquisitionSession;
use super::types::{DownloadView, SearchOptions, SessionError, SessionSnapshot};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum SessionCommand {
    AddPart(String, Reply<AddOutcome>),
    AddParts(Vec<String>, Reply<usize>),
    AddDelimited(String, Reply<usize>),
    RemovePart(usize, Reply<String>),
    ClearParts(Reply<()>),
    ImportCsv {
        file_name: String,
        contents: Vec<u8>,
        reply: Reply<usize>,
    },
    Search(SearchOptions, Reply<SearchResult>),
    Select(String, Reply<bool>),
    Deselect(String, Reply<bool>),
    ToggleSelection(String, Reply<bool>),
    SelectAll(Reply<()>),
    ClearSelection(Reply<()>),
    Reprocess {
        search_id: String,
        parts: Vec<String>,
        strategy: String,
        reply: Reply<SearchResult>,
    },
    ReprocessSelection(String, Reply<SearchResult>),
    StartDownload {
        search_id: String,
        parts: Option<Vec<String>>,
        reply: Reply<DownloadStatus>,
    },
    FetchArchive {
        download_id: String,
        dest: PathBuf,
        reply: Reply<u64>,
    },
    Health(Reply<HealthStatus>),
    Dispose(oneshot::Sender<()>),
}

/// Handle to a session running on its own task.
///
/// Cheap to clone. Every method waits for the session to apply the command
/// and returns its result.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Move `session` onto a background task.
    pub fn spawn(session: AcquisitionSession) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let state_rx = session.subscribe();
        tokio::spawn(SessionActor { session, rx }.run());
        Self { tx, state_rx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }

    pub async fn add_part(&self, raw: impl Into<String>) -> Result<AddOutcome, SessionError> {
        let raw = raw.into();
        self.request(|reply| SessionCommand::AddPart(raw, reply)).await
    }

    pub async fn add_parts<I, S>(&self, raw: I) -> Result<usize, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let raw: Vec<String> = raw.into_iter().map(Into::into).collect();
        self.request(|reply| SessionCommand::AddParts(raw, reply)).await
    }

    pub async fn add_delimited(&self, text: impl Into<String>) -> Result<usize, SessionError> {
        let text = text.into();
        self.request(|reply| SessionCommand::AddDelimited(text, reply))
            .await
    }

    pub async fn remove_part(&self, index: usize) -> Result<String, SessionError> {
        self.request(|reply| SessionCommand::RemovePart(index, reply))
            .await
    }

    pub async fn clear_parts(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::ClearParts).await
    }

    pub async fn import_csv(
        &self,
        file_name: impl Into<String>,
        contents: Vec<u8>,
    ) -> Result<usize, SessionError> {
        let file_name = file_name.into();
        self.request(|reply| SessionCommand::ImportCsv {
            file_name,
            contents,
            reply,
        })
        .await
    }

    pub async fn search(&self, options: SearchOptions) -> Result<SearchResult, SessionError> {
        self.request(|reply| SessionCommand::Search(options, reply))
            .await
    }

    pub async fn select(&self, part: impl Into<String>) -> Result<bool, SessionError> {
        let part = part.into();
        self.request(|reply| SessionCommand::Select(part, reply)).await
    }

    pub async fn deselect(&self, part: impl Into<String>) -> Result<bool, SessionError> {
        let part = part.into();
        self.request(|reply| SessionCommand::Deselect(part, reply)).await
    }

    pub async fn toggle_selection(&self, part: impl Into<String>) -> Result<bool, SessionError> {
        let part = part.into();
        self.request(|reply| SessionCommand::ToggleSelection(part, reply))
            .await
    }

    pub async fn select_all(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::SelectAll).await
    }

    pub async fn clear_selection(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::ClearSelection).await
    }

    pub async fn reprocess(
        &self,
        search_id: impl Into<String>,
        parts: Vec<String>,
        strategy: impl Into<String>,
    ) -> Result<SearchResult, SessionError> {
        let search_id = search_id.into();
        let strategy = strategy.into();
        self.request(|reply| SessionCommand::Reprocess {
            search_id,
            parts,
            strategy,
            reply,
        })
        .await
    }

    pub async fn reprocess_selection(
        &self,
        strategy: impl Into<String>,
    ) -> Result<SearchResult, SessionError> {
        let strategy = strategy.into();
        self.request(|reply| SessionCommand::ReprocessSelection(strategy, reply))
            .await
    }

    /// Start a download; the background task polls it from then on.
    pub async fn start_download(
        &self,
        search_id: impl Into<String>,
        parts: Option<Vec<String>>,
    ) -> Result<DownloadStatus, SessionError> {
        let search_id = search_id.into();
        self.request(|reply| SessionCommand::StartDownload {
            search_id,
            parts,
            reply,
        })
        .await
    }

    /// Wait until the tracked download is completed, failed or abandoned.
    pub async fn wait_for_download(&self) -> Result<DownloadView, SessionError> {
        let mut rx = self.state_rx.clone();
        if rx.borrow().download.is_none() {
            return Err(SessionError::InvalidState(
                "no download is being tracked".to_string(),
            ));
        }

        let snapshot = rx
            .wait_for(|s| {
                s.disposed
                    || s.download
                        .as_ref()
                        .map_or(true, |d| d.phase.is_terminal())
            })
            .await
            .map_err(|_| closed())?;

        snapshot
            .download
            .clone()
            .ok_or_else(|| SessionError::InvalidState("download is no longer tracked".to_string()))
    }

    pub async fn fetch_archive(
        &self,
        download_id: impl Into<String>,
        dest: impl Into<PathBuf>,
    ) -> Result<u64, SessionError> {
        let download_id = download_id.into();
        let dest = dest.into();
        self.request(|reply| SessionCommand::FetchArchive {
            download_id,
            dest,
            reply,
        })
        .await
    }

    pub async fn health(&self) -> Result<HealthStatus, SessionError> {
        self.request(SessionCommand::Health).await
    }

    /// Dispose the session and wait for its cleanups. Later calls on any
    /// clone of this handle fail with `InvalidState`.
    pub async fn dispose(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(SessionCommand::Dispose(reply)).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| closed())?;
        response.await.map_err(|_| closed())?
    }
}

fn closed() -> SessionError {
    SessionError::InvalidState("session has been disposed".to_string())
}

struct SessionActor {
    session: AcquisitionSession,
    rx: mpsc::Receiver<SessionCommand>,
}

impl SessionActor {
    async fn run(mut self) {
        debug!(session_id = %self.session.id(), "Session task started");

        loop {
            let deadline = self.session.next_poll_at();

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(SessionCommand::Dispose(done)) => {
                        self.session.dispose().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.apply(command).await,
                    None => {
                        info!(session_id = %self.session.id(), "All handles dropped; disposing session");
                        self.session.dispose().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Err(e) = self.session.poll_once().await {
                        warn!(error = %e, "Download polling stopped");
                    }
                }
            }
        }

        debug!(session_id = %self.session.id(), "Session task stopped");
    }

    async fn apply(&mut self, command: SessionCommand) {
        let session = &mut self.session;
        // A caller that gave up waiting is not an error.
        match command {
            SessionCommand::AddPart(raw, reply) => {
                let _ = reply.send(session.add_part(&raw));
            }
            SessionCommand::AddParts(raw, reply) => {
                let _ = reply.send(session.add_parts(raw));
            }
            SessionCommand::AddDelimited(text, reply) => {
                let _ = reply.send(session.add_delimited(&text));
            }
            SessionCommand::RemovePart(index, reply) => {
                let _ = reply.send(session.remove_part(index));
            }
            SessionCommand::ClearParts(reply) => {
                let _ = reply.send(session.clear_parts());
            }
            SessionCommand::ImportCsv {
                file_name,
                contents,
                reply,
            } => {
                let _ = reply.send(session.import_csv(&file_name, contents).await);
            }
            SessionCommand::Search(options, reply) => {
                let _ = reply.send(session.search(options).await);
            }
            SessionCommand::Select(part, reply) => {
                let _ = reply.send(session.select(&part));
            }
            SessionCommand::Deselect(part, reply) => {
                let _ = reply.send(Ok(session.deselect(&part)));
            }
            SessionCommand::ToggleSelection(part, reply) => {
                let _ = reply.send(session.toggle_selection(&part));
            }
            SessionCommand::SelectAll(reply) => {
                let _ = reply.send(session.select_all());
            }
            SessionCommand::ClearSelection(reply) => {
                session.clear_selection();
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Reprocess {
                search_id,
                parts,
                strategy,
                reply,
            } => {
                let _ = reply.send(session.reprocess(&search_id, &parts, &strategy).await);
            }
            SessionCommand::ReprocessSelection(strategy, reply) => {
                let _ = reply.send(session.reprocess_selection(&strategy).await);
            }
            SessionCommand::StartDownload {
                search_id,
                parts,
                reply,
            } => {
                let _ = reply.send(session.start_download(&search_id, parts).await);
            }
            SessionCommand::FetchArchive {
                download_id,
                dest,
                reply,
            } => {
                let _ = reply.send(session.fetch_archive(&download_id, &dest).await);
            }
            SessionCommand::Health(reply) => {
                let _ = reply.send(session.health().await);
            }
            SessionCommand::Dispose(done) => {
                session.dispose().await;
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::backend::DownloadState;
    use crate::config::SessionConfig;
    use crate::session::{Activity, DownloadPhase};
    use crate::testing::{MockImageBackend, MockOperation};

    fn spawn(backend: &Arc<MockImageBackend>) -> SessionHandle {
        SessionHandle::spawn(AcquisitionSession::new(
            backend.clone(),
            SessionConfig::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_is_polled_in_background() {
        let backend = Arc::new(MockImageBackend::new());
        backend
            .set_status_sequence(vec![DownloadState::Processing, DownloadState::Completed])
            .await;
        let handle = spawn(&backend);

        handle.add_parts(["A1", "B2"]).await.unwrap();
        let result = handle.search(SearchOptions::default()).await.unwrap();
        handle.start_download(&result.search_id, None).await.unwrap();

        let view = handle.wait_for_download().await.unwrap();

        assert_eq!(view.phase, DownloadPhase::Completed);
        assert!(view.archive_available);
        assert_eq!(backend.status_polls("download-1").await, 2);

        // terminal: no further polls
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.status_polls("download-1").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_flag_visible_while_searching() {
        let backend = Arc::new(MockImageBackend::new());
        backend
            .set_delay(MockOperation::Search, Duration::from_secs(1))
            .await;
        let handle = spawn(&backend);
        handle.add_part("A1").await.unwrap();

        let mut rx = handle.subscribe();
        let searching = tokio::spawn({
            let handle = handle.clone();
            async move { handle.search(SearchOptions::default()).await }
        });

        rx.wait_for(|s| s.activity == Some(Activity::Searching))
            .await
            .unwrap();
        searching.await.unwrap().unwrap();
        assert!(!handle.snapshot().is_busy());
        assert!(handle.snapshot().search.is_some());
    }

    #[tokio::test]
    async fn test_wait_without_download_fails() {
        let backend = Arc::new(MockImageBackend::new());
        let handle = spawn(&backend);
        assert!(matches!(
            handle.wait_for_download().await,
            Err(SessionError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_polling_and_rejects_commands() {
        let backend = Arc::new(MockImageBackend::new());
        backend
            .set_status_sequence(vec![DownloadState::Processing; 10])
            .await;
        let handle = spawn(&backend);
        handle.add_part("A1").await.unwrap();
        handle.search(SearchOptions::default()).await.unwrap();
        handle.start_download("search-1", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(backend.status_polls("download-1").await, 1);

        handle.dispose().await;
        assert_eq!(backend.cleanups().await, vec!["download-1"]);
        assert!(handle.snapshot().disposed);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.status_polls("download-1").await, 1);
        assert!(matches!(
            handle.add_part("B2").await,
            Err(SessionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_dropping_handles_disposes_session() {
        let backend = Arc::new(MockImageBackend::new());
        let handle = spawn(&backend);
        handle.add_part("A1").await.unwrap();
        handle.search(SearchOptions::default()).await.unwrap();
        handle.start_download("search-1", None).await.unwrap();
        let mut rx = handle.subscribe();

        drop(handle);
        rx.wait_for(|s| s.disposed).await.unwrap();

        assert_eq!(backend.cleanups().await, vec!["download-1"]);
    }
}
