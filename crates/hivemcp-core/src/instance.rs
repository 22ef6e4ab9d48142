use crate::spec::{ServerSpec, SpecKey};
use hivemcp_transport::Transport;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// One instance's position in the lifecycle. `Busy` is never stored
/// directly — it is derived from `busy_count > 0` while `Ready` is the
/// stored state; see [`Instance::observed_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Initializing,
    Handshaking,
    Ready,
    Draining,
    Stopped,
    Failed,
}

/// Why an instance landed in `failed`. Distinguishes an orderly stop from
/// a fault so operators and the reload transaction can tell them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    TransportStartup,
    HandshakeRejected,
    ProtocolUnsupported,
    PingTimeout,
    Crash,
}

/// One live subprocess or HTTP session implementing a spec. Owned
/// exclusively by one Pool; only its Lifecycle may mutate `state`.
pub struct Instance {
    pub id: Uuid,
    pub spec_key: SpecKey,
    pub spec: Arc<ServerSpec>,
    pub transport: Arc<dyn Transport>,
    state: InstanceState,
    busy_count: u32,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub last_error: Option<FailureCause>,
    /// Session key this instance is pinned to, for `stateful` specs.
    pub affinity: Option<String>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("spec_key", &self.spec_key)
            .field("state", &self.state)
            .field("busy_count", &self.busy_count)
            .finish()
    }
}

impl Instance {
    pub fn new(spec_key: SpecKey, spec: Arc<ServerSpec>, transport: Arc<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            spec_key,
            spec,
            transport,
            state: InstanceState::Starting,
            busy_count: 0,
            created_at: now,
            last_used_at: now,
            last_error: None,
            affinity: None,
        }
    }

    pub fn busy_count(&self) -> u32 {
        self.busy_count
    }

    pub fn is_busy(&self) -> bool {
        self.busy_count > 0
    }

    pub fn is_ready_for_work(&self) -> bool {
        self.state == InstanceState::Ready && self.busy_count < self.spec.max_concurrent
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, InstanceState::Stopped | InstanceState::Failed)
    }

    /// Transition helpers. Each enforces the legal-edge set from the
    /// documented state machine; an illegal transition is a programming
    /// error in the Lifecycle manager, so these panic rather than return
    /// an error — they are never reachable from external input.
    pub fn advance_to_initializing(&mut self) {
        assert_eq!(self.state, InstanceState::Starting);
        self.state = InstanceState::Initializing;
    }

    pub fn advance_to_handshaking(&mut self) {
        assert_eq!(self.state, InstanceState::Initializing);
        self.state = InstanceState::Handshaking;
    }

    pub fn advance_to_ready(&mut self) {
        assert!(matches!(
            self.state,
            InstanceState::Handshaking | InstanceState::Draining
        ));
        self.state = InstanceState::Ready;
    }

    pub fn begin_drain(&mut self) {
        if self.state != InstanceState::Stopped && self.state != InstanceState::Failed {
            self.state = InstanceState::Draining;
        }
    }

    pub fn mark_stopped(&mut self) {
        self.state = InstanceState::Stopped;
    }

    pub fn mark_failed(&mut self, cause: FailureCause) {
        self.last_error = Some(cause);
        self.state = InstanceState::Failed;
    }

    pub fn acquire_slot(&mut self) {
        assert!(self.busy_count < self.spec.max_concurrent);
        self.busy_count += 1;
        self.last_used_at = Instant::now();
    }

    pub fn release_slot(&mut self) {
        assert!(self.busy_count > 0);
        self.busy_count -= 1;
        self.last_used_at = Instant::now();
    }

    pub fn raw_state(&self) -> InstanceState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivemcp_transport::{ConnState, Frame, TransportResult};
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Debug)]
    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn start(&self) -> TransportResult<()> {
            Ok(())
        }
        async fn call(&self, frame: Frame, _timeout: Duration) -> TransportResult<Frame> {
            Ok(frame)
        }
        async fn notify(&self, _frame: Frame) -> TransportResult<()> {
            Ok(())
        }
        async fn notifications(&self) -> TransportResult<tokio::sync::mpsc::Receiver<Frame>> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }
        fn state(&self) -> ConnState {
            ConnState::Open
        }
        async fn close(&self) -> TransportResult<()> {
            Ok(())
        }
    }

    fn test_spec() -> Arc<ServerSpec> {
        use crate::spec::{ActivationMode, Strategy, TransportKind};
        use std::collections::BTreeMap;
        Arc::new(ServerSpec {
            name: "s".into(),
            transport: TransportKind::Stdio {
                command: vec!["echo".into()],
                env: BTreeMap::new(),
                cwd: None,
            },
            tags: Default::default(),
            strategy: Strategy::Stateless,
            max_concurrent: 2,
            min_ready: 0,
            idle_seconds: 60,
            drain_timeout_seconds: 5,
            session_ttl_seconds: 0,
            activation_mode: ActivationMode::OnDemand,
            protocol_version: "2025-06-18".into(),
            expose_tools: None,
        })
    }

    #[test]
    fn busy_count_tracks_slot_lifecycle() {
        let spec = test_spec();
        let key = spec.spec_key();
        let mut inst = Instance::new(key, spec, Arc::new(NoopTransport));
        inst.advance_to_initializing();
        inst.advance_to_handshaking();
        inst.advance_to_ready();
        assert!(!inst.is_busy());
        inst.acquire_slot();
        assert!(inst.is_busy());
        assert_eq!(inst.busy_count(), 1);
        inst.release_slot();
        assert!(!inst.is_busy());
    }

    #[test]
    fn failed_and_stopped_are_terminal() {
        let spec = test_spec();
        let key = spec.spec_key();
        let mut inst = Instance::new(key, spec, Arc::new(NoopTransport));
        inst.mark_failed(FailureCause::Crash);
        assert!(inst.is_terminal());
    }

    #[test]
    #[should_panic]
    fn illegal_transition_panics() {
        let spec = test_spec();
        let key = spec.spec_key();
        let mut inst = Instance::new(key, spec, Arc::new(NoopTransport));
        inst.advance_to_ready(); // skipping initializing/handshaking
    }
}
