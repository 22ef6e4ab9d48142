//! Public control-plane facade for the hivemcp fleet runtime.
//!
//! `ControlPlane` is the single entry point external collaborators (CLI,
//! GUI, gRPC glue) talk to: register/unregister clients, route a frame to
//! the right instance, and inspect or reload the running fleet.

use hivemcp_core::{AcquireError, Scheduler, SpecKey};
use hivemcp_reload::{CatalogUpdate, ReloadError, ReloadTransaction};
use hivemcp_registry::{ClientChangeEvent, ClientRegistry, ClientSnapshot, RegistryError};
use hivemcp_transport::{Frame, TransportError};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RouteError {
    #[error("client cannot see this spec")]
    NotVisible,
    #[error("unknown spec")]
    UnknownSpec,
    #[error("route timed out")]
    Timeout,
    #[error("could not acquire an instance: {0}")]
    AcquireFailed(#[from] AcquireError),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// Progress of the warm-up pass that brings always-on / bootstrap-pinned
/// specs up to their minReady target before the facade is considered
/// fully ready to serve traffic.
#[derive(Debug, Clone, Default)]
pub struct BootstrapProgress {
    pub total_specs: usize,
    pub converged_specs: usize,
}

pub struct ControlPlane {
    scheduler: Arc<Scheduler>,
    registry: Arc<ClientRegistry>,
    reload: Arc<ReloadTransaction>,
    route_timeout: Duration,
    bootstrap_progress: Arc<tokio::sync::RwLock<BootstrapProgress>>,
}

impl ControlPlane {
    pub fn new(
        scheduler: Arc<Scheduler>,
        registry: Arc<ClientRegistry>,
        reload: Arc<ReloadTransaction>,
        route_timeout: Duration,
    ) -> Self {
        Self {
            scheduler,
            registry,
            reload,
            route_timeout,
            bootstrap_progress: Arc::new(tokio::sync::RwLock::new(BootstrapProgress::default())),
        }
    }

    pub async fn register_client(
        &self,
        name: String,
        pid: u32,
        tags: Option<BTreeSet<String>>,
        server: Option<String>,
    ) -> Result<ClientSnapshot, RegistryError> {
        self.registry.register_client(name, pid, tags, server).await
    }

    pub async fn unregister_client(&self, name: &str) {
        self.registry.unregister_client(name).await;
    }

    /// Routes a frame to a suitable instance of `spec_key` on behalf of
    /// `client`, honoring visibility before ever touching a pool.
    pub async fn route(
        &self,
        client: &str,
        spec_key: &SpecKey,
        session_key: Option<&str>,
        frame: Frame,
    ) -> Result<Frame, RouteError> {
        if !self.registry.is_visible(client, spec_key) {
            return Err(RouteError::NotVisible);
        }

        let instance = self
            .scheduler
            .acquire(spec_key, session_key, self.route_timeout)
            .await
            .map_err(|e| match e {
                AcquireError::UnknownSpecKey => RouteError::UnknownSpec,
                AcquireError::Timeout => RouteError::Timeout,
                other => RouteError::AcquireFailed(other),
            })?;

        let result = {
            let guard = instance.lock().await;
            guard.transport.call(frame, self.route_timeout).await
        };

        self.scheduler.release(spec_key, &instance).await;

        result.map_err(RouteError::TransportError)
    }

    pub fn list_active_clients(&self) -> Vec<ClientSnapshot> {
        self.registry.list_active_clients()
    }

    pub fn watch_active_clients(&self) -> watch::Receiver<Vec<ClientSnapshot>> {
        self.registry.watch_active_clients()
    }

    pub fn watch_client_changes(&self) -> broadcast::Receiver<ClientChangeEvent> {
        self.registry.watch_client_changes()
    }

    pub async fn get_pool_status(&self) -> Vec<hivemcp_core::PoolStatus> {
        self.scheduler.pool_status().await
    }

    pub async fn get_bootstrap_progress(&self) -> BootstrapProgress {
        self.bootstrap_progress.read().await.clone()
    }

    pub(crate) async fn set_bootstrap_progress(&self, progress: BootstrapProgress) {
        *self.bootstrap_progress.write().await = progress;
    }

    pub async fn apply_catalog_update(&self, update: CatalogUpdate) -> Result<(), ReloadError> {
        self.reload.apply_update(update).await
    }
}
