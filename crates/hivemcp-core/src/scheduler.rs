use crate::config::RuntimeConfig;
use crate::error::AcquireResult;
use crate::lifecycle::Lifecycle;
use crate::pool::{ActivationCause, Pool, PoolStatus, SharedInstance};
use crate::spec::{CatalogDiff, ServerSpec, SpecKey};

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Thin dispatcher keyed by spec key; owns every [`Pool`] and the
/// background workers that sweep them. Holds the spec registry (the map a
/// pool's key resolves back to its declarative spec).
pub struct Scheduler {
    pools: DashMap<SpecKey, Arc<Pool>>,
    specs: DashMap<SpecKey, Arc<ServerSpec>>,
    lifecycle: Lifecycle,
    config: RuntimeConfig,
    idle_manager_running: Arc<AtomicBool>,
    ping_manager_running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        let lifecycle = Lifecycle::new(config.bootstrap_timeout);
        Self {
            pools: DashMap::new(),
            specs: DashMap::new(),
            lifecycle,
            config,
            idle_manager_running: Arc::new(AtomicBool::new(false)),
            ping_manager_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a spec without activating it (minReady stays at whatever
    /// the spec declares until a caller asks otherwise).
    pub fn register_spec(&self, key: SpecKey, spec: Arc<ServerSpec>) {
        self.specs.insert(key.clone(), Arc::clone(&spec));
        self.pools.entry(key.clone()).or_insert_with(|| {
            Arc::new(Pool::new(
                key,
                spec,
                self.lifecycle.clone(),
                self.config.route_timeout,
            ))
        });
    }

    pub fn pool(&self, key: &SpecKey) -> Option<Arc<Pool>> {
        self.pools.get(key).map(|p| Arc::clone(p.value()))
    }

    pub async fn acquire(
        &self,
        key: &SpecKey,
        session_key: Option<&str>,
        timeout: Duration,
    ) -> AcquireResult<SharedInstance> {
        match self.pool(key) {
            Some(pool) => pool.acquire(session_key, timeout).await,
            None => Err(crate::error::AcquireError::UnknownSpecKey),
        }
    }

    pub async fn acquire_ready(
        &self,
        key: &SpecKey,
        session_key: Option<&str>,
    ) -> AcquireResult<SharedInstance> {
        match self.pool(key) {
            Some(pool) => pool.acquire_ready(session_key).await,
            None => Err(crate::error::AcquireError::UnknownSpecKey),
        }
    }

    pub async fn release(&self, key: &SpecKey, instance: &SharedInstance) {
        if let Some(pool) = self.pool(key) {
            pool.release(instance).await;
        }
    }

    pub async fn set_desired_min_ready(&self, key: &SpecKey, n: u32, cause: ActivationCause) {
        if let Some(pool) = self.pool(key) {
            pool.set_desired_min_ready(n);
            pool.converge_min_ready(cause).await;
        }
    }

    /// Orderly drain of one spec's pool; subsequent acquires return
    /// `UnknownSpecKey` until re-registered.
    pub async fn stop_spec(&self, key: &SpecKey, reason: &str) {
        if let Some(pool) = self.pool(key) {
            pool.stop_spec(reason).await;
        }
        self.pools.remove(key);
        self.specs.remove(key);
    }

    /// For each removed key: stop it. For each updated key: drain the old
    /// pool, register the new one with minReady=0 (activation is recomputed
    /// separately by the client registry). Added keys are registered but
    /// not activated.
    pub async fn apply_catalog_diff(&self, diff: &CatalogDiff, next_specs: &DashMap<SpecKey, Arc<ServerSpec>>) {
        for key in &diff.removed {
            self.stop_spec(key, "reload-removed").await;
        }
        for (old_key, new_key) in &diff.updated {
            self.stop_spec(old_key, "reload-replaced").await;
            if let Some(spec) = next_specs.get(new_key) {
                self.register_spec(new_key.clone(), Arc::clone(spec.value()));
            }
        }
        for key in &diff.added {
            if let Some(spec) = next_specs.get(key) {
                self.register_spec(key.clone(), Arc::clone(spec.value()));
            }
        }
    }

    /// Snapshot of every pool: instance counts per state, minReady,
    /// maxConcurrent.
    pub async fn pool_status(&self) -> Vec<PoolStatus> {
        let mut out = Vec::with_capacity(self.pools.len());
        for entry in self.pools.iter() {
            out.push(entry.value().status().await);
        }
        out
    }

    /// Spawns the idle-reaper loop for every registered pool, running every
    /// `min(idleSeconds/4, 10s)` per spec. Idempotent: a second call while
    /// already running is a no-op.
    pub fn start_idle_manager(self: &Arc<Self>) {
        if self.idle_manager_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !scheduler.idle_manager_running.load(Ordering::SeqCst) {
                    break;
                }
                let pools: Vec<Arc<Pool>> =
                    scheduler.pools.iter().map(|e| Arc::clone(e.value())).collect();
                for pool in &pools {
                    let pool = Arc::clone(pool);
                    tokio::spawn(async move {
                        pool.reap_idle().await;
                    });
                }
                let tick = pools
                    .iter()
                    .map(|p| {
                        Duration::from_secs(p.spec.idle_seconds.max(1) / 4)
                            .max(Duration::from_millis(100))
                            .min(Duration::from_secs(10))
                    })
                    .min()
                    .unwrap_or(Duration::from_secs(10));
                tokio::time::sleep(tick).await;
            }
        });
    }

    pub fn stop_idle_manager(&self) {
        self.idle_manager_running.store(false, Ordering::SeqCst);
    }

    /// Spawns the per-instance ping loop (cadence = `runtime.pingIntervalSeconds`)
    /// for every registered pool.
    pub fn start_ping_manager(self: &Arc<Self>) {
        if self.ping_manager_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            loop {
                if !scheduler.ping_manager_running.load(Ordering::SeqCst) {
                    break;
                }
                for entry in scheduler.pools.iter() {
                    let pool = Arc::clone(entry.value());
                    let timeout = interval * 2;
                    tokio::spawn(async move {
                        pool.ping_sweep(timeout).await;
                    });
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    pub fn stop_ping_manager(&self) {
        self.ping_manager_running.store(false, Ordering::SeqCst);
    }

    /// Orderly shutdown: `StopSpec` on every registered spec in parallel,
    /// bounded by a grand-total timeout.
    pub async fn stop_all(&self, grand_total_timeout: Duration) {
        self.stop_idle_manager();
        self.stop_ping_manager();

        let keys: Vec<SpecKey> = self.pools.iter().map(|e| e.key().clone()).collect();
        let stops = keys.into_iter().map(|key| async move {
            self.stop_spec(&key, "shutdown").await;
        });
        let _ = tokio::time::timeout(grand_total_timeout, futures::future::join_all(stops)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ActivationMode, Strategy, TransportKind};
    use std::collections::BTreeMap;

    fn spec() -> Arc<ServerSpec> {
        Arc::new(ServerSpec {
            name: "s".into(),
            transport: TransportKind::Stdio {
                command: vec!["cat".into()],
                env: BTreeMap::new(),
                cwd: None,
            },
            tags: Default::default(),
            strategy: Strategy::Stateless,
            max_concurrent: 1,
            min_ready: 0,
            idle_seconds: 30,
            drain_timeout_seconds: 5,
            session_ttl_seconds: 0,
            activation_mode: ActivationMode::OnDemand,
            protocol_version: "1".into(),
            expose_tools: None,
        })
    }

    #[tokio::test]
    async fn unregistered_spec_key_is_rejected() {
        let scheduler = Scheduler::new(RuntimeConfig::default());
        let unknown = SpecKey("deadbeef".into());
        let err = scheduler
            .acquire(&unknown, None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::AcquireError::UnknownSpecKey));
    }

    #[tokio::test]
    async fn stop_spec_removes_the_pool() {
        let scheduler = Scheduler::new(RuntimeConfig::default());
        let s = spec();
        let key = s.spec_key();
        scheduler.register_spec(key.clone(), s);
        assert!(scheduler.pool(&key).is_some());
        scheduler.stop_spec(&key, "test").await;
        assert!(scheduler.pool(&key).is_none());
    }
}
