use hivemcp_core::{ActivationCause, ActivationMode, CatalogHandle, SpecKey};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("tags and server selector are mutually exclusive")]
    BadRequest,
    #[error("client {0} is already registered")]
    DuplicateName(String),
}

/// Either a tag set or a single named server — never both, per the
/// mutual-exclusivity rule.
#[derive(Debug, Clone)]
pub enum Scope {
    Tags(BTreeSet<String>),
    Server(String),
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub name: String,
    pub pid: u32,
    pub scope: Scope,
    pub visible_spec_keys: BTreeSet<SpecKey>,
    pub last_heartbeat: Instant,
}

#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub name: String,
    pub pid: u32,
    pub visible_server_count: usize,
}

#[derive(Debug, Clone)]
pub enum ClientChangeEvent {
    Registered(ClientSnapshot),
    Unregistered(String),
    VisibilityChanged(ClientSnapshot),
}

struct Inner {
    clients: HashMap<String, ClientRecord>,
    ref_counts: HashMap<SpecKey, u32>,
}

/// Maps clients to their visible spec-key set via tag/server selectors and
/// reference-counts per spec to drive activation. One mutex covers the
/// client map and refcounts together; scheduler calls are dispatched
/// outside the lock to avoid lock inversion with Pool mutexes.
pub struct ClientRegistry {
    inner: Mutex<Inner>,
    scheduler: Arc<hivemcp_core::Scheduler>,
    catalog: CatalogHandle,
    activation_mode_of: Arc<dyn Fn(&SpecKey) -> Option<(ActivationMode, u32)> + Send + Sync>,
    watch_active: watch::Sender<Vec<ClientSnapshot>>,
    watch_changes: broadcast::Sender<ClientChangeEvent>,
    client_inactive_timeout: Option<Duration>,
    client_check_interval: Duration,
}

impl ClientRegistry {
    pub fn new(
        scheduler: Arc<hivemcp_core::Scheduler>,
        catalog: CatalogHandle,
        activation_mode_of: Arc<dyn Fn(&SpecKey) -> Option<(ActivationMode, u32)> + Send + Sync>,
        client_check_interval: Duration,
        client_inactive_timeout: Option<Duration>,
    ) -> Self {
        let (watch_active, _) = watch::channel(Vec::new());
        let (watch_changes, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner {
                clients: HashMap::new(),
                ref_counts: HashMap::new(),
            }),
            scheduler,
            catalog,
            activation_mode_of,
            watch_active,
            watch_changes,
            client_inactive_timeout,
            client_check_interval,
        }
    }

    /// The same shared handle this registry resolves visibility against, so
    /// a reload transaction can commit into it directly instead of owning a
    /// second, disconnected slot.
    pub fn catalog_handle(&self) -> CatalogHandle {
        Arc::clone(&self.catalog)
    }

    fn resolve_visible_keys(&self, scope: &Scope) -> BTreeSet<SpecKey> {
        let state = self.catalog.load();
        let catalog = &state.catalog;
        match scope {
            Scope::Server(name) => catalog
                .spec_key_for(name)
                .into_iter()
                .collect(),
            Scope::Tags(client_tags) => catalog
                .specs_by_name
                .values()
                .filter(|spec| client_tags.is_subset(&spec.tags))
                .map(|spec| spec.spec_key())
                .collect(),
        }
    }

    pub async fn register_client(
        &self,
        name: String,
        pid: u32,
        tags: Option<BTreeSet<String>>,
        server: Option<String>,
    ) -> Result<ClientSnapshot, RegistryError> {
        if tags.is_some() && server.is_some() {
            return Err(RegistryError::BadRequest);
        }
        let scope = match (tags, server) {
            (Some(t), None) => Scope::Tags(t),
            (None, Some(s)) => Scope::Server(s),
            (None, None) => Scope::Tags(BTreeSet::new()),
            _ => unreachable!(),
        };

        let visible = self.resolve_visible_keys(&scope);
        let mut deltas: Vec<(SpecKey, i64)> = Vec::new();

        {
            let mut inner = self.inner.lock();
            if inner.clients.contains_key(&name) {
                return Err(RegistryError::DuplicateName(name));
            }
            for key in &visible {
                let count = inner.ref_counts.entry(key.clone()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    deltas.push((key.clone(), 1));
                }
            }
            inner.clients.insert(
                name.clone(),
                ClientRecord {
                    name: name.clone(),
                    pid,
                    scope,
                    visible_spec_keys: visible.clone(),
                    last_heartbeat: Instant::now(),
                },
            );
        }

        self.apply_activation_deltas(deltas).await;

        let snapshot = ClientSnapshot {
            name: name.clone(),
            pid,
            visible_server_count: visible.len(),
        };
        let _ = self
            .watch_changes
            .send(ClientChangeEvent::Registered(snapshot.clone()));
        self.publish_active_snapshot();
        Ok(snapshot)
    }

    /// Idempotent: unregistering an unknown client is a no-op.
    pub async fn unregister_client(&self, name: &str) {
        let removed_keys = {
            let mut inner = self.inner.lock();
            match inner.clients.remove(name) {
                Some(record) => record.visible_spec_keys,
                None => return,
            }
        };

        let mut deltas = Vec::new();
        {
            let mut inner = self.inner.lock();
            for key in removed_keys {
                if let Some(count) = inner.ref_counts.get_mut(&key) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        deltas.push((key.clone(), -1));
                    }
                }
            }
        }

        self.apply_activation_deltas(deltas).await;
        let _ = self
            .watch_changes
            .send(ClientChangeEvent::Unregistered(name.to_string()));
        self.publish_active_snapshot();
    }

    /// Step 5 of the reload transaction: recompute every client's visible
    /// spec-key set against the current catalog and return the resulting
    /// 0→1 / 1→0 refcount transitions without yet acting on them. Step 6
    /// (driving the scheduler) is a separate call to
    /// [`ClientRegistry::apply_catalog_activation`] so the two stages stay
    /// independently retriable.
    pub fn recompute_visibility(&self) -> Vec<(SpecKey, i64)> {
        let mut raw_deltas: HashMap<SpecKey, i64> = HashMap::new();
        let mut changed = Vec::new();

        {
            let mut inner = self.inner.lock();
            let names: Vec<String> = inner.clients.keys().cloned().collect();
            for name in names {
                let scope = inner.clients.get(&name).unwrap().scope.clone();
                let new_visible = self.resolve_visible_keys(&scope);
                let record = inner.clients.get_mut(&name).unwrap();
                let old_visible = std::mem::replace(&mut record.visible_spec_keys, new_visible.clone());
                if old_visible != new_visible {
                    for key in new_visible.difference(&old_visible) {
                        *raw_deltas.entry(key.clone()).or_insert(0) += 1;
                    }
                    for key in old_visible.difference(&new_visible) {
                        *raw_deltas.entry(key.clone()).or_insert(0) -= 1;
                    }
                    changed.push(ClientSnapshot {
                        name: record.name.clone(),
                        pid: record.pid,
                        visible_server_count: record.visible_spec_keys.len(),
                    });
                }
            }
        }

        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (key, delta) in raw_deltas {
                let count = inner.ref_counts.entry(key.clone()).or_insert(0);
                let before = *count;
                let after = (before as i64 + delta).max(0) as u32;
                *count = after;
                if before == 0 && after > 0 {
                    transitions.push((key.clone(), 1));
                } else if before > 0 && after == 0 {
                    transitions.push((key.clone(), -1));
                }
            }
        }

        for snapshot in changed {
            let _ = self
                .watch_changes
                .send(ClientChangeEvent::VisibilityChanged(snapshot));
        }
        self.publish_active_snapshot();
        transitions
    }

    /// Step 6: drive `SetDesiredMinReady` for the transitions `recompute_visibility`
    /// produced.
    pub async fn apply_catalog_activation(&self, transitions: Vec<(SpecKey, i64)>) {
        self.apply_activation_deltas(transitions).await;
    }

    /// Applies 0→1 / 1→0 refcount transitions by driving the scheduler's
    /// minReady target. `always-on` specs are pinned and never stopped by
    /// the registry, even on a 1→0 transition.
    async fn apply_activation_deltas(&self, deltas: Vec<(SpecKey, i64)>) {
        for (key, delta) in deltas {
            let Some((mode, min_ready)) = (self.activation_mode_of)(&key) else {
                continue;
            };
            if delta > 0 {
                let target = min_ready.max(1);
                self.scheduler
                    .set_desired_min_ready(&key, target, ActivationCause::ClientDemand)
                    .await;
            } else if mode != ActivationMode::AlwaysOn {
                self.scheduler
                    .set_desired_min_ready(&key, 0, ActivationCause::ClientDemand)
                    .await;
            }
        }
    }

    pub fn visible_keys(&self, name: &str) -> Option<BTreeSet<SpecKey>> {
        self.inner
            .lock()
            .clients
            .get(name)
            .map(|c| c.visible_spec_keys.clone())
    }

    pub fn is_visible(&self, name: &str, key: &SpecKey) -> bool {
        self.visible_keys(name)
            .map(|keys| keys.contains(key))
            .unwrap_or(false)
    }

    pub fn list_active_clients(&self) -> Vec<ClientSnapshot> {
        self.inner
            .lock()
            .clients
            .values()
            .map(|c| ClientSnapshot {
                name: c.name.clone(),
                pid: c.pid,
                visible_server_count: c.visible_spec_keys.len(),
            })
            .collect()
    }

    pub fn watch_active_clients(&self) -> watch::Receiver<Vec<ClientSnapshot>> {
        self.watch_active.subscribe()
    }

    pub fn watch_client_changes(&self) -> broadcast::Receiver<ClientChangeEvent> {
        self.watch_changes.subscribe()
    }

    fn publish_active_snapshot(&self) {
        let _ = self.watch_active.send(self.list_active_clients());
    }

    pub fn heartbeat(&self, name: &str) {
        if let Some(record) = self.inner.lock().clients.get_mut(name) {
            record.last_heartbeat = Instant::now();
        }
    }

    /// One heartbeat-monitor sweep: reaps clients whose PID is dead, whose
    /// heartbeat is stale past `2 * clientCheckSeconds`, or past
    /// `clientInactiveSeconds` when configured.
    pub async fn reap_stale_clients(&self, pid_alive: impl Fn(u32) -> bool) {
        let stale: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .clients
                .values()
                .filter(|c| {
                    !pid_alive(c.pid)
                        || c.last_heartbeat.elapsed() > self.client_check_interval * 2
                        || self
                            .client_inactive_timeout
                            .is_some_and(|t| c.last_heartbeat.elapsed() > t)
                })
                .map(|c| c.name.clone())
                .collect()
        };
        for name in stale {
            tracing::info!(client = %name, "reaping stale client");
            self.unregister_client(&name).await;
        }
    }

    pub fn client_check_interval(&self) -> Duration {
        self.client_check_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivemcp_core::{catalog_handle, ActivationMode as AM, CatalogState, RuntimeConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_registry() -> ClientRegistry {
        let scheduler = Arc::new(hivemcp_core::Scheduler::new(RuntimeConfig::default()));
        ClientRegistry::new(
            scheduler,
            catalog_handle(CatalogState::default()),
            Arc::new(|_: &SpecKey| None::<(AM, u32)>),
            Duration::from_secs(10),
            None,
        )
    }

    #[tokio::test]
    async fn tags_and_server_are_mutually_exclusive() {
        let registry = test_registry();
        let mut tags = BTreeSet::new();
        tags.insert("chat".to_string());
        let err = registry
            .register_client("c1".into(), 1, Some(tags), Some("srv".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let registry = test_registry();
        registry
            .register_client("c1".into(), 1, None, None)
            .await
            .unwrap();
        let err = registry
            .register_client("c1".into(), 2, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = test_registry();
        registry.unregister_client("ghost").await;
        registry.unregister_client("ghost").await;
    }

    #[tokio::test]
    async fn reap_removes_clients_with_dead_pid() {
        let registry = test_registry();
        registry
            .register_client("c1".into(), 999, None, None)
            .await
            .unwrap();
        let calls = AtomicU32::new(0);
        registry
            .reap_stale_clients(|_pid| {
                calls.fetch_add(1, Ordering::SeqCst);
                false
            })
            .await;
        assert!(registry.list_active_clients().is_empty());
    }
}
