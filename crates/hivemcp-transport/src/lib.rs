//! Transport layer for hivemcp provider subprocesses.
//!
//! A [`Transport`] is the single abstraction the rest of the fleet runtime
//! talks to: a provider is either a stdio child process or a streamable-HTTP
//! endpoint, and from the scheduler's point of view both look like
//! `Call` / `Notify` / `Notifications` / `Close`. The wire payload itself is
//! never interpreted here — frames are opaque bytes, correlation and replay
//! semantics belong to the provider's own protocol.

mod error;
mod frame;
mod http;
mod retry;
mod stdio;

pub use error::{TransportError, TransportResult};
pub use frame::Frame;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

pub use http::{StreamableHttpConfig, StreamableHttpTransport};
pub use stdio::{StdioConfig, StdioTransport};

/// Lifecycle state a transport reports about its underlying connection.
/// Distinct from the higher-level Instance state machine — this only
/// tracks whether bytes can currently flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    NotStarted,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Uniform handle over a provider's transport, regardless of kind.
///
/// Implementors own their own interior mutability; callers are expected to
/// hold an `Arc<dyn Transport>` and call through shared references.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Start the underlying connection (spawn the child process, or prepare
    /// the HTTP client). Idempotent only in the `NotStarted` state.
    async fn start(&self) -> TransportResult<()>;

    /// Send a request frame and await its paired response frame.
    ///
    /// `timeout` bounds only this call; a transport-level close while
    /// waiting surfaces as [`TransportError::Closed`].
    async fn call(&self, frame: Frame, timeout: Duration) -> TransportResult<Frame>;

    /// Send a frame with no response expected (fire-and-forget).
    async fn notify(&self, frame: Frame) -> TransportResult<()>;

    /// Subscribe to frames the provider pushes unprompted (server-initiated
    /// notifications). Each call returns an independent receiver; dropping
    /// it unsubscribes.
    async fn notifications(&self) -> TransportResult<tokio::sync::mpsc::Receiver<Frame>>;

    /// Current connection state.
    fn state(&self) -> ConnState;

    /// Close the transport, terminating the subprocess or connection.
    /// Safe to call more than once.
    async fn close(&self) -> TransportResult<()>;
}
