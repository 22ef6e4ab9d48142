use crate::error::{AcquireError, AcquireResult, LifecycleError};
use crate::instance::{FailureCause, Instance, InstanceState};
use crate::lifecycle::Lifecycle;
use crate::spec::{ServerSpec, SpecKey, Strategy};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

/// Why a pool was asked to converge toward a minReady target. Recorded in
/// metrics, not behavior-affecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationCause {
    Bootstrap,
    AlwaysOn,
    ClientDemand,
}

/// An instance shared between the pool, its caller, and the background
/// workers. A `tokio::sync::Mutex` (not a sync one) because Lifecycle's
/// stop/ping calls need to hold the guard across an `.await`.
pub type SharedInstance = Arc<Mutex<Instance>>;

struct Waiter {
    session_key: Option<String>,
    responder: oneshot::Sender<AcquireResult<SharedInstance>>,
}

struct PoolState {
    instances: Vec<SharedInstance>,
    waiters: VecDeque<Waiter>,
}

/// Per-spec-key collection of instances: on-demand start, warm reuse under
/// a concurrency bound, idle reaping, liveness probing, minimum-warm
/// maintenance.
///
/// Guarded by one async mutex over `(instances, waiters)`; start/stop calls
/// drop the guard before awaiting Lifecycle so the pool stays responsive to
/// other callers while a subprocess boots or drains.
pub struct Pool {
    pub spec_key: SpecKey,
    pub spec: Arc<ServerSpec>,
    state: Mutex<PoolState>,
    lifecycle: Lifecycle,
    route_timeout: Duration,
    min_ready: AtomicU32,
    registered: AtomicBool,
}

impl Pool {
    pub fn new(
        spec_key: SpecKey,
        spec: Arc<ServerSpec>,
        lifecycle: Lifecycle,
        route_timeout: Duration,
    ) -> Self {
        let min_ready = spec.min_ready;
        Self {
            spec_key,
            spec,
            state: Mutex::new(PoolState {
                instances: Vec::new(),
                waiters: VecDeque::new(),
            }),
            lifecycle,
            route_timeout,
            min_ready: AtomicU32::new(min_ready),
            registered: AtomicBool::new(true),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn min_ready(&self) -> u32 {
        self.min_ready.load(Ordering::SeqCst)
    }

    /// Snapshot of instance counts by observed bucket, for `GetPoolStatus`.
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let mut ready = 0u32;
        let mut busy = 0u32;
        let mut draining = 0u32;
        for inst in &state.instances {
            let g = inst.lock().await;
            if g.is_busy() {
                busy += 1;
            } else {
                match g.raw_state() {
                    InstanceState::Ready => ready += 1,
                    InstanceState::Draining => draining += 1,
                    _ => {}
                }
            }
        }
        PoolStatus {
            spec_key: self.spec_key.clone(),
            ready,
            busy,
            draining,
            waiters: state.waiters.len() as u32,
            min_ready: self.min_ready(),
            max_concurrent: self.spec.max_concurrent,
        }
    }

    /// Full semantics per the documented resolution order: affinity, then
    /// least-recently-used ready instance, then start-new, then enqueue on
    /// the FIFO waiter list.
    pub async fn acquire(
        &self,
        session_key: Option<&str>,
        timeout: Duration,
    ) -> AcquireResult<SharedInstance> {
        if !self.is_registered() {
            return Err(AcquireError::UnknownSpecKey);
        }

        if let Some(found) = self.try_take_existing(session_key).await {
            return Ok(found);
        }

        match self.start_and_register(session_key).await {
            Ok(inst) => return Ok(inst),
            Err(e @ (LifecycleError::Transport(_) | LifecycleError::HandshakeRejected(_))) => {
                // transient/fatal start failures fall through to queuing
                // only when another instance might free up; on a cold pool
                // nothing else will ever satisfy this waiter, so surface
                // the start failure directly instead of blocking for the
                // full route timeout.
                if self.live_count().await == 0 {
                    return Err(AcquireError::StartFailed(e));
                }
            }
            Err(e) => return Err(AcquireError::StartFailed(e)),
        }

        self.enqueue_and_wait(session_key, timeout).await
    }

    /// Same resolution but never starts a new instance; used by the
    /// metadata bootstrap path.
    pub async fn acquire_ready(&self, session_key: Option<&str>) -> AcquireResult<SharedInstance> {
        if !self.is_registered() {
            return Err(AcquireError::UnknownSpecKey);
        }
        self.try_take_existing(session_key)
            .await
            .ok_or(AcquireError::NoReadyInstance)
    }

    async fn try_take_existing(&self, session_key: Option<&str>) -> Option<SharedInstance> {
        let state = self.state.lock().await;

        if self.spec.strategy == Strategy::Stateful {
            if let Some(key) = session_key.filter(|k| !k.is_empty()) {
                for inst in &state.instances {
                    let mut g = inst.lock().await;
                    if g.affinity.as_deref() == Some(key) && g.is_ready_for_work() {
                        g.acquire_slot();
                        return Some(Arc::clone(inst));
                    }
                }
                // affine instance exists but is saturated: per spec this
                // blocks rather than fanning out to another instance.
                if state
                    .instances
                    .iter()
                    .any(|i| matches!(i.try_lock(), Ok(g) if g.affinity.as_deref() == Some(key)))
                {
                    return None;
                }
            }
        }

        let mut best: Option<&SharedInstance> = None;
        let mut best_last_used = None;
        for inst in &state.instances {
            let g = inst.lock().await;
            if g.is_ready_for_work() {
                if best_last_used.is_none_or(|t| g.last_used_at < t) {
                    best_last_used = Some(g.last_used_at);
                    best = Some(inst);
                }
            }
        }

        if let Some(inst) = best {
            let mut g = inst.lock().await;
            g.acquire_slot();
            if self.spec.strategy == Strategy::Stateful {
                if let Some(key) = session_key.filter(|k| !k.is_empty()) {
                    if g.affinity.is_none() {
                        g.affinity = Some(key.to_string());
                    }
                }
            }
            drop(g);
            return Some(Arc::clone(inst));
        }
        None
    }

    async fn start_and_register(
        &self,
        session_key: Option<&str>,
    ) -> Result<SharedInstance, LifecycleError> {
        let spec = Arc::clone(&self.spec);
        let mut instance = self
            .lifecycle
            .start_instance(self.spec_key.clone(), spec)
            .await?;

        if self.spec.strategy == Strategy::Stateful {
            if let Some(key) = session_key.filter(|k| !k.is_empty()) {
                instance.affinity = Some(key.to_string());
            }
        }
        instance.acquire_slot();
        let shared = Arc::new(Mutex::new(instance));

        let mut state = self.state.lock().await;
        // Cancellation never leaks an instance: the caller driving this
        // start may have already given up by the time we get here, but the
        // instance still joins the ready pool for the next acquirer.
        state.instances.push(Arc::clone(&shared));
        Ok(shared)
    }

    async fn enqueue_and_wait(
        &self,
        session_key: Option<&str>,
        timeout: Duration,
    ) -> AcquireResult<SharedInstance> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.waiters.push_back(Waiter {
                session_key: session_key.map(str::to_string),
                responder: tx,
            });
        }

        let bounded = timeout.min(self.route_timeout);
        match tokio::time::timeout(bounded, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AcquireError::Cancelled),
            Err(_) => Err(AcquireError::Timeout),
        }
    }

    /// Decrement busyCount, update lastUsedAt, wake at most one waiter, in
    /// enqueue order.
    pub async fn release(&self, instance: &SharedInstance) {
        {
            let mut g = instance.lock().await;
            g.release_slot();
        }

        let mut state = self.state.lock().await;
        if let Some(waiter) = state.waiters.pop_front() {
            let mut g = instance.lock().await;
            if g.is_ready_for_work() {
                g.acquire_slot();
                if let Some(key) = waiter.session_key.as_deref().filter(|k| !k.is_empty()) {
                    if self.spec.strategy == Strategy::Stateful && g.affinity.is_none() {
                        g.affinity = Some(key.to_string());
                    }
                }
                drop(g);
                let _ = waiter.responder.send(Ok(Arc::clone(instance)));
            } else {
                state.waiters.push_front(waiter);
            }
        }
    }

    pub fn set_desired_min_ready(&self, n: u32) {
        self.min_ready.store(n, Ordering::SeqCst);
    }

    /// Converge toward `min_ready` by starting idle-held instances. Called
    /// from the scheduler's periodic tick or immediately after
    /// `SetDesiredMinReady`.
    pub async fn converge_min_ready(&self, _cause: ActivationCause) {
        loop {
            let target = self.min_ready();
            let ready_count = {
                let state = self.state.lock().await;
                let mut count = 0u32;
                for inst in &state.instances {
                    let g = inst.lock().await;
                    if !g.is_busy() && g.raw_state() == InstanceState::Ready {
                        count += 1;
                    }
                }
                count
            };
            if ready_count >= target {
                break;
            }
            match self.start_and_register(None).await {
                Ok(inst) => {
                    // converge_min_ready starts instances held idle, not
                    // handed to a caller, so release the slot claimed on
                    // start immediately.
                    self.release(&inst).await;
                }
                Err(e) => {
                    tracing::warn!(spec_key = %self.spec_key, error = %e, "failed to converge min_ready");
                    break;
                }
            }
        }
    }

    /// Drains every live instance; subsequent Acquire returns
    /// `UnknownSpecKey` until re-registered.
    pub async fn stop_spec(&self, reason: &str) {
        self.registered.store(false, Ordering::SeqCst);
        let instances: Vec<SharedInstance> = {
            let mut state = self.state.lock().await;
            while let Some(waiter) = state.waiters.pop_front() {
                let _ = waiter.responder.send(Err(AcquireError::UnknownSpecKey));
            }
            state.instances.drain(..).collect()
        };

        for inst in instances {
            let lifecycle = self.lifecycle.clone();
            let reason = reason.to_string();
            tokio::spawn(async move {
                let mut g = inst.lock().await;
                lifecycle.stop_instance(&mut g, &reason).await;
            });
        }
    }

    /// Idle reaper sweep: reap a `ready`, unused-past-`idleSeconds`
    /// instance unless doing so would drop `|ready|` below `minReady`.
    pub async fn reap_idle(&self) {
        let idle_after = Duration::from_secs(self.spec.idle_seconds);
        let min_ready = self.min_ready();

        let to_reap: Option<SharedInstance> = {
            let state = self.state.lock().await;
            let mut ready_count = 0u32;
            for inst in &state.instances {
                let g = inst.lock().await;
                if !g.is_busy() && g.raw_state() == InstanceState::Ready {
                    ready_count += 1;
                }
            }
            if ready_count <= min_ready {
                None
            } else {
                let mut found = None;
                for inst in &state.instances {
                    let g = inst.lock().await;
                    if !g.is_busy()
                        && g.raw_state() == InstanceState::Ready
                        && g.last_used_at.elapsed() > idle_after
                    {
                        found = Some(Arc::clone(inst));
                        break;
                    }
                }
                found
            }
        };

        if let Some(inst) = to_reap {
            {
                let mut state = self.state.lock().await;
                state.instances.retain(|i| !Arc::ptr_eq(i, &inst));
            }
            let mut g = inst.lock().await;
            self.lifecycle.stop_instance(&mut g, "idle").await;
        }
    }

    /// One ping sweep across every ready instance. A timeout escalates the
    /// instance to `failed` and removes it from the pool.
    pub async fn ping_sweep(&self, timeout: Duration) {
        let candidates: Vec<SharedInstance> = {
            let state = self.state.lock().await;
            let mut out = Vec::new();
            for inst in &state.instances {
                if inst.lock().await.raw_state() == InstanceState::Ready {
                    out.push(Arc::clone(inst));
                }
            }
            out
        };

        for inst in candidates {
            let result = {
                let g = inst.lock().await;
                self.lifecycle.ping(&g, timeout).await
            };
            if result.is_err() {
                {
                    let mut g = inst.lock().await;
                    g.mark_failed(FailureCause::PingTimeout);
                }
                let mut state = self.state.lock().await;
                state.instances.retain(|i| !Arc::ptr_eq(i, &inst));
            }
        }
    }

    pub async fn live_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub spec_key: SpecKey,
    pub ready: u32,
    pub busy: u32,
    pub draining: u32,
    pub waiters: u32,
    pub min_ready: u32,
    pub max_concurrent: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ActivationMode, TransportKind};
    use std::collections::BTreeMap;

    fn echo_spec(max_concurrent: u32) -> Arc<ServerSpec> {
        Arc::new(ServerSpec {
            name: "echo".into(),
            transport: TransportKind::Stdio {
                command: vec!["cat".into()],
                env: BTreeMap::new(),
                cwd: None,
            },
            tags: Default::default(),
            strategy: Strategy::Stateless,
            max_concurrent,
            min_ready: 0,
            idle_seconds: 1,
            drain_timeout_seconds: 2,
            session_ttl_seconds: 0,
            activation_mode: ActivationMode::OnDemand,
            protocol_version: "1".into(),
            expose_tools: None,
        })
    }

    fn test_pool(max_concurrent: u32) -> Pool {
        let spec = echo_spec(max_concurrent);
        let key = spec.spec_key();
        Pool::new(key, spec, Lifecycle::new(Duration::from_secs(2)), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn stop_spec_rejects_subsequent_acquire() {
        let pool = test_pool(1);
        pool.stop_spec("test").await;
        let err = pool.acquire(None, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, AcquireError::UnknownSpecKey));
    }

    #[tokio::test]
    async fn acquire_ready_without_instances_fails_fast() {
        let pool = test_pool(1);
        let err = pool.acquire_ready(None).await.unwrap_err();
        assert!(matches!(err, AcquireError::NoReadyInstance));
    }

    /// A cold pool (no live instances) whose only start attempt hits a
    /// handshake failure must surface `StartFailed` immediately rather than
    /// queuing the caller for the full route timeout — nothing will ever
    /// free up to satisfy the wait.
    #[tokio::test]
    async fn cold_start_handshake_failure_fails_fast_instead_of_queuing() {
        let spec = Arc::new(ServerSpec {
            name: "not-json".into(),
            transport: TransportKind::Stdio {
                command: vec!["echo".into(), "not-json".into()],
                env: BTreeMap::new(),
                cwd: None,
            },
            tags: Default::default(),
            strategy: Strategy::Stateless,
            max_concurrent: 1,
            min_ready: 0,
            idle_seconds: 1,
            drain_timeout_seconds: 2,
            session_ttl_seconds: 0,
            activation_mode: ActivationMode::OnDemand,
            protocol_version: "1".into(),
            expose_tools: None,
        });
        let key = spec.spec_key();
        let pool = Pool::new(key, spec, Lifecycle::new(Duration::from_secs(2)), Duration::from_secs(30));

        let start = tokio::time::Instant::now();
        let err = pool
            .acquire(None, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::StartFailed(LifecycleError::HandshakeRejected(_))));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
