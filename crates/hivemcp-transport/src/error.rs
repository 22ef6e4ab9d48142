use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

/// Errors a transport can raise. Maps onto the Startup/Runtime/Protocol
/// kinds of the fleet-wide error taxonomy; the caller (Lifecycle) attaches
/// the spec key and instance id.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("permission denied starting provider: {0}")]
    PermissionDenied(String),

    #[error("transport startup failed: {0}")]
    StartupFailed(String),

    #[error("transport closed")]
    Closed,

    #[error("transport timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed frame from provider: {0}")]
    ProtocolMalformed(String),

    #[error("provider process exited unexpectedly: {0}")]
    Crash(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    /// Whether retrying the same call against the same instance might
    /// succeed, as opposed to requiring the instance be torn down.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    /// Whether this error means the instance is no longer usable and must
    /// be moved to `failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Closed | TransportError::Crash(_) | TransportError::Io(_)
        )
    }
}
