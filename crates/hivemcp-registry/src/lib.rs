//! Client registry and aggregator cache for the hivemcp fleet.
//!
//! The registry maps registered clients to the spec keys they may address
//! and reference-counts those keys to drive pool activation. The
//! aggregator keeps a per-spec cache of tools/resources/prompts so routing
//! and catalog listing never block on a live subprocess round trip.

pub mod aggregator;
pub mod client;

pub use aggregator::{AggregatorCache, AggregatorEntry, CatalogEntry, CatalogSource, SchedulerCatalogSource};
pub use client::{ClientChangeEvent, ClientRecord, ClientRegistry, ClientSnapshot, RegistryError, Scope};
