//! Client-side acquisition session.
//!
//! The session owns the part registry, the held search result and the
//! tracked download job, and drives the workflow:
//! - **Search**: replaces the held result and supersedes any tracked download
//! - **Reprocess**: re-searches selected parts and merges them in place
//! - **Download**: starts a server-side job and polls it to a terminal state
//! - **Cleanup**: releases server-side artifacts of superseded or torn down jobs
//!
//! `AcquisitionSession` is the state machine itself (`&mut self` methods);
//! `SessionHandle` runs one inside a spawned task and serializes commands
//! from any number of callers.

mod cleanup;
mod download;
mod handle;
mod merge;
mod runner;
mod types;

pub use cleanup::CleanupScheduler;
pub use download::{DownloadPhase, DownloadTracker};
pub use handle::SessionHandle;
pub use merge::{merge_reprocessed, MergeReport};
pub use runner::AcquisitionSession;
pub use types::{Activity, DownloadView, PollOutcome, SearchOptions, SessionError, SessionSnapshot};
