//! Best-effort release of server-side download artifacts.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::backend::ImageBackend;

/// Fire-and-forget cleanup calls.
///
/// Failures are logged and never retried. Pending calls can be awaited with
/// `drain`; calls still pending when the scheduler is dropped are detached
/// rather than aborted.
pub struct CleanupScheduler {
    backend: Arc<dyn ImageBackend>,
    tasks: JoinSet<()>,
    scheduled: usize,
}

impl CleanupScheduler {
    pub fn new(backend: Arc<dyn ImageBackend>) -> Self {
        Self {
            backend,
            tasks: JoinSet::new(),
            scheduled: 0,
        }
    }

    /// Spawn a cleanup call for `task_id` without waiting for it.
    pub fn schedule(&mut self, task_id: String) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(task_id = %task_id, "No async runtime available; cleanup skipped");
            return;
        };

        debug!(task_id = %task_id, "Scheduling cleanup");
        self.scheduled += 1;
        let backend = Arc::clone(&self.backend);
        self.tasks.spawn_on(release(backend, task_id), &runtime);
    }

    /// Wait for every scheduled cleanup to finish.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Cleanup task did not finish");
            }
        }
    }

    /// Cleanups scheduled over the scheduler's lifetime.
    pub fn scheduled(&self) -> usize {
        self.scheduled
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        self.tasks.detach_all();
    }
}

async fn release(backend: Arc<dyn ImageBackend>, task_id: String) {
    match backend.cleanup(&task_id).await {
        Ok(()) => debug!(task_id = %task_id, "Released server-side artifacts"),
        Err(e) => warn!(task_id = %task_id, error = %e, "Cleanup failed; not retrying"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::testing::{MockImageBackend, MockOperation};

    #[tokio::test]
    async fn test_schedule_and_drain() {
        let backend = Arc::new(MockImageBackend::new());
        let mut scheduler = CleanupScheduler::new(backend.clone());

        scheduler.schedule("dl-1".to_string());
        scheduler.schedule("dl-2".to_string());
        scheduler.drain().await;

        let mut cleaned = backend.cleanups().await;
        cleaned.sort();
        assert_eq!(cleaned, vec!["dl-1", "dl-2"]);
        assert_eq!(scheduler.scheduled(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let backend = Arc::new(MockImageBackend::new());
        backend
            .fail_next(
                MockOperation::Cleanup,
                BackendError::ConnectionFailed("refused".to_string()),
            )
            .await;
        let mut scheduler = CleanupScheduler::new(backend.clone());

        scheduler.schedule("dl-1".to_string());
        scheduler.drain().await;

        // attempted once, never retried
        assert_eq!(backend.cleanups().await, vec!["dl-1"]);
    }
}
