use thiserror::Error;

/// Unified error taxonomy for the core. Facade methods return
/// `Result<T, CoreError>`; the HTTP layer maps each variant to a status
/// code and a `{"error": "..."}` body.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("sing-box binary not located")]
    EngineUnavailable,

    #[error("failed to start sing-box: {0}")]
    EngineStartFailure(String),

    /// A resolved server's persisted state can't be connected to (e.g. an
    /// empty `uri`). The request that asked for it was well-formed, so this
    /// is a server-state failure, not a client input error.
    #[error("server state invalid: {0}")]
    InvalidServerState(String),

    #[error("readiness deadline exceeded after {0:?}")]
    ReadinessDeadline(std::time::Duration),

    #[error("engine exited before becoming ready: {0}")]
    ChildExitedEarly(String),

    #[error("archive entry escapes extraction root: {0}")]
    PathTraversalError(String),

    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("corrupt persisted state: {0}")]
    CorruptState(String),

    #[error("http status error: {0}")]
    HttpStatusError(u16),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("no servers available")]
    NoServersAvailable,
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::CorruptState(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            CoreError::HttpStatusError(status.as_u16())
        } else {
            CoreError::NetworkError(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
