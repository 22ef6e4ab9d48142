//! hivemcp — elastic control plane and runtime for a fleet of heterogeneous
//! MCP tool-provider subprocesses.
//!
//! This crate is a thin façade: it re-exports the building blocks from
//! `hivemcp-transport`, `hivemcp-core`, `hivemcp-registry`, `hivemcp-reload`
//! and `hivemcp-control` so a consumer only needs one dependency to stand up
//! a fleet, register clients against it, and route calls through it.

pub mod transport {
    pub use hivemcp_transport::*;
}

pub mod core {
    pub use hivemcp_core::*;
}

pub mod registry {
    pub use hivemcp_registry::*;
}

pub mod reload {
    pub use hivemcp_reload::*;
}

pub mod control {
    pub use hivemcp_control::*;
}

pub use hivemcp_control::{BootstrapProgress, ControlPlane, RouteError};
pub use hivemcp_core::{ActivationMode, Catalog, CatalogState, RuntimeConfig, Scheduler, ServerSpec, SpecKey, Strategy};
pub use hivemcp_registry::{ClientRegistry, ClientSnapshot};
pub use hivemcp_reload::{CatalogUpdate, ReloadTransaction, UpdateSource};
pub use hivemcp_transport::{Frame, Transport};

/// Initializes the process-wide `tracing` subscriber from `RUST_LOG`
/// (or `info` if unset). Call once, near the top of `main`.
///
/// Returns an error if a global subscriber is already installed.
#[cfg(feature = "tracing-init")]
pub fn init_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// A fleet consumer should be able to build the full stack from this
    /// crate's re-exports alone, without reaching into the inner crates
    /// directly.
    #[tokio::test]
    async fn facade_wires_a_minimal_fleet() {
        let scheduler = Arc::new(Scheduler::new(RuntimeConfig::default()));
        let registry = Arc::new(ClientRegistry::new(
            Arc::clone(&scheduler),
            core::catalog_handle(CatalogState::default()),
            Arc::new(|_: &SpecKey| None),
            Duration::from_secs(10),
            None,
        ));
        let aggregator = Arc::new(registry::AggregatorCache::new(
            Arc::new(registry::SchedulerCatalogSource {
                scheduler: Arc::clone(&scheduler),
            }),
            4,
        ));
        let reload = Arc::new(ReloadTransaction::new(
            Arc::clone(&scheduler),
            Arc::clone(&registry),
            aggregator,
            Arc::new(reload::NoopPluginHost),
            core::ReloadMode::Lenient,
        ));
        let plane = ControlPlane::new(scheduler, registry, reload, Duration::from_secs(5));
        assert!(plane.list_active_clients().is_empty());
    }
}
