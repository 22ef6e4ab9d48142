use crate::error::{LifecycleError, LifecycleResult};
use crate::instance::{FailureCause, Instance};
use crate::spec::{ServerSpec, SpecKey, TransportKind};
use hivemcp_transport::{Frame, StdioConfig, StdioTransport, StreamableHttpConfig, StreamableHttpTransport, Transport};

use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Starts, handshakes, probes, and stops a single instance. Owns the
/// Transport for the duration of that instance's life; no other component
/// mutates an Instance's state field once Lifecycle hands it back.
#[derive(Clone)]
pub struct Lifecycle {
    bootstrap_timeout: Duration,
}

impl Lifecycle {
    pub fn new(bootstrap_timeout: Duration) -> Self {
        Self { bootstrap_timeout }
    }

    fn build_transport(spec: &ServerSpec) -> LifecycleResult<Arc<dyn Transport>> {
        match &spec.transport {
            TransportKind::Stdio { command, env, cwd } => {
                let (cmd, args) = command
                    .split_first()
                    .ok_or(LifecycleError::InvalidCommand)?;
                let config = StdioConfig {
                    command: cmd.clone(),
                    args: args.to_vec(),
                    working_directory: cwd.clone(),
                    environment: env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    startup_timeout: Duration::from_secs(30),
                    shutdown_timeout: Duration::from_secs(spec.drain_timeout_seconds.max(1)),
                    max_message_size: 10 * 1024 * 1024,
                };
                Ok(Arc::new(StdioTransport::new(config)))
            }
            TransportKind::StreamableHttp {
                endpoint,
                headers,
                retry_cap: _,
            } => {
                let url = Url::parse(endpoint)
                    .map_err(|_| LifecycleError::InvalidCommand)?;
                let mut config = StreamableHttpConfig::new(url);
                config.headers = headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                let transport = StreamableHttpTransport::new(config)?;
                Ok(Arc::new(transport))
            }
        }
    }

    /// Constructs Transport, runs the initialize handshake, and returns a
    /// ready instance. Hard-fatal errors are marked non-retryable by
    /// [`LifecycleError::is_fatal`].
    pub async fn start_instance(
        &self,
        spec_key: SpecKey,
        spec: Arc<ServerSpec>,
    ) -> LifecycleResult<Instance> {
        let transport = Self::build_transport(&spec).map_err(|e| {
            tracing::warn!(spec = %spec.name, error = %e, "rejecting spec before transport start");
            e
        })?;

        transport.start().await.map_err(|e| match &e {
            hivemcp_transport::TransportError::ExecutableNotFound(cmd) => {
                LifecycleError::ExecutableNotFound(cmd.clone())
            }
            hivemcp_transport::TransportError::PermissionDenied(cmd) => {
                LifecycleError::PermissionDenied(cmd.clone())
            }
            _ => LifecycleError::Transport(e),
        })?;

        let mut instance = Instance::new(spec_key, Arc::clone(&spec), transport);
        instance.advance_to_initializing();

        let handshake = tokio::time::timeout(
            self.bootstrap_timeout,
            self.run_handshake(&instance, &spec),
        )
        .await;

        match handshake {
            Ok(Ok(())) => {
                instance.advance_to_handshaking();
                instance.advance_to_ready();
                Ok(instance)
            }
            Ok(Err(e)) => {
                let cause = e.failure_cause();
                instance.mark_failed(cause);
                let _ = instance.transport.close().await;
                Err(e)
            }
            Err(_) => {
                instance.mark_failed(FailureCause::TransportStartup);
                let _ = instance.transport.close().await;
                Err(LifecycleError::InitializeTimeout)
            }
        }
    }

    /// The MCP `initialize` exchange. The only core-visible outputs are the
    /// protocol version and capability flags; the rest of the payload is
    /// opaque and never parsed here.
    async fn run_handshake(&self, instance: &Instance, spec: &ServerSpec) -> LifecycleResult<()> {
        let request = serde_json::json!({
            "method": "initialize",
            "params": { "protocolVersion": spec.protocol_version },
        });
        let frame = Frame::from(request.to_string());
        let response = instance
            .transport
            .call(frame, self.bootstrap_timeout)
            .await?;

        let parsed: serde_json::Value = serde_json::from_slice(response.as_bytes())
            .map_err(|e| LifecycleError::HandshakeRejected(e.to_string()))?;
        let server_version = parsed
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or(&spec.protocol_version);

        if server_version != spec.protocol_version {
            return Err(LifecycleError::UnsupportedProtocol(server_version.to_string()));
        }
        Ok(())
    }

    /// Sets state to draining, waits for in-flight work to complete up to
    /// the spec's drain budget, then forces transport close. Idempotent.
    pub async fn stop_instance(&self, instance: &mut Instance, reason: &str) {
        if instance.is_terminal() {
            return;
        }
        tracing::debug!(instance = %instance.id, reason, "stopping instance");
        instance.begin_drain();

        let drain_timeout = Duration::from_secs(instance.spec.drain_timeout_seconds);
        let deadline = tokio::time::Instant::now() + drain_timeout;
        while instance.is_busy() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let _ = instance.transport.close().await;
        instance.mark_stopped();
    }

    /// One ping: a bounded, best-effort liveness probe. Callers escalate a
    /// timeout or error by transitioning the instance to `failed`.
    pub async fn ping(&self, instance: &Instance, timeout: Duration) -> LifecycleResult<()> {
        let frame = Frame::from("{\"method\":\"ping\"}".to_string());
        instance.transport.call(frame, timeout).await?;
        Ok(())
    }
}
