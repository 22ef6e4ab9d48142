use crate::instance::FailureCause;
use hivemcp_transport::TransportError;
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;
pub type AcquireResult<T> = Result<T, AcquireError>;

/// Errors raised while starting or stopping an instance. Carries whether
/// retrying the *spec* (not this one instance) is worthwhile.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error("unknown spec key")]
    UnknownSpecKey,
    #[error("invalid command for spec")]
    InvalidCommand,
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(String),
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server rejected the handshake: {0}")]
    HandshakeRejected(String),
    #[error("initialize handshake timed out")]
    InitializeTimeout,
}

impl LifecycleError {
    /// Hard-fatal errors mark the spec's init status suspended without
    /// further retries; everything else is retryable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LifecycleError::UnknownSpecKey
                | LifecycleError::InvalidCommand
                | LifecycleError::UnsupportedProtocol(_)
                | LifecycleError::ExecutableNotFound(_)
                | LifecycleError::PermissionDenied(_)
        )
    }

    pub fn failure_cause(&self) -> FailureCause {
        match self {
            LifecycleError::HandshakeRejected(_) => FailureCause::HandshakeRejected,
            LifecycleError::UnsupportedProtocol(_) => FailureCause::ProtocolUnsupported,
            LifecycleError::InitializeTimeout => FailureCause::TransportStartup,
            LifecycleError::Transport(e) if e.is_fatal() => FailureCause::Crash,
            _ => FailureCause::TransportStartup,
        }
    }
}

/// Errors from `Pool::acquire` / `acquire_ready`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AcquireError {
    #[error("unknown spec key")]
    UnknownSpecKey,
    #[error("no ready instance available")]
    NoReadyInstance,
    #[error("pool has no spare capacity")]
    NoCapacity,
    #[error("acquire cancelled")]
    Cancelled,
    #[error("acquire timed out")]
    Timeout,
    #[error("instance start failed: {0}")]
    StartFailed(#[from] LifecycleError),
}
