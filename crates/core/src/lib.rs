pub mod backend;
pub mod config;
pub mod registry;
pub mod session;
pub mod testing;

pub use backend::{
    BackendError, DownloadState, DownloadStatus, HttpImageBackend, ImageBackend, PartResult,
    ReprocessStrategy, SearchResult,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SessionConfig,
};
pub use registry::{AddOutcome, PartRegistry, RegistryError};
pub use session::{
    AcquisitionSession, Activity, DownloadPhase, DownloadView, PollOutcome, SearchOptions,
    SessionError, SessionHandle, SessionSnapshot,
};
