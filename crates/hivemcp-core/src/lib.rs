//! Scheduler, instance pool, and lifecycle runtime for the hivemcp fleet.
//!
//! This is the hard-engineering core: a [`Scheduler`] multiplexes across
//! per-spec [`Pool`]s, each of which owns a set of [`Instance`]s started and
//! stopped by a [`Lifecycle`] over a pluggable `Transport`. Nothing here
//! parses the provider protocol itself — frames are opaque.

pub mod config;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod pool;
pub mod scheduler;
pub mod spec;

pub use config::{ReloadMode, RuntimeConfig};
pub use error::{AcquireError, LifecycleError};
pub use instance::{FailureCause, Instance, InstanceState};
pub use lifecycle::Lifecycle;
pub use pool::{ActivationCause, Pool, PoolStatus, SharedInstance};
pub use scheduler::Scheduler;
pub use spec::{
    catalog_handle, ActivationMode, Catalog, CatalogDiff, CatalogHandle, CatalogState, ServerSpec,
    SpecKey, Strategy, TransportKind,
};
