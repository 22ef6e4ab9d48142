//! End-to-end tests driving real `cat`-backed subprocess instances through
//! the full scheduler/registry/control stack. `cat` echoes each initialize
//! request line straight back, which carries no top-level `protocolVersion`
//! field, so the handshake falls back to the spec's own version and
//! trivially succeeds — a deterministic stand-in for a real MCP provider.

#![cfg(unix)]

use hivemcp::core::{ActivationMode, Catalog, CatalogState, ReloadMode, RuntimeConfig, Scheduler, ServerSpec, Strategy, TransportKind};
use hivemcp::registry::{AggregatorCache, ClientRegistry, SchedulerCatalogSource};
use hivemcp::reload::{CatalogUpdate, NoopPluginHost, ReloadTransaction, UpdateSource};
use hivemcp::core::CatalogDiff;
use hivemcp::{ControlPlane, Frame};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn cat_spec(name: &str, max_concurrent: u32, strategy: Strategy) -> ServerSpec {
    ServerSpec {
        name: name.to_string(),
        transport: TransportKind::Stdio {
            command: vec!["cat".to_string()],
            env: BTreeMap::new(),
            cwd: None,
        },
        tags: Default::default(),
        strategy,
        max_concurrent,
        min_ready: 0,
        idle_seconds: 60,
        drain_timeout_seconds: 2,
        session_ttl_seconds: 0,
        activation_mode: ActivationMode::OnDemand,
        protocol_version: "2025-06-18".into(),
        expose_tools: None,
    }
}

struct Harness {
    scheduler: Arc<Scheduler>,
    registry: Arc<ClientRegistry>,
    control: ControlPlane,
}

fn build_harness(catalog: Catalog) -> Harness {
    let scheduler = Arc::new(Scheduler::new(RuntimeConfig::default()));
    for spec in catalog.specs_by_name.values() {
        scheduler.register_spec(spec.spec_key(), Arc::new(spec.clone()));
    }

    let registry = Arc::new(ClientRegistry::new(
        Arc::clone(&scheduler),
        hivemcp::core::catalog_handle(CatalogState {
            catalog,
            revision: 0,
        }),
        Arc::new(|_| None),
        Duration::from_secs(10),
        None,
    ));

    let aggregator = Arc::new(AggregatorCache::new(
        Arc::new(SchedulerCatalogSource {
            scheduler: Arc::clone(&scheduler),
        }),
        4,
    ));
    let reload = Arc::new(ReloadTransaction::new(
        Arc::clone(&scheduler),
        Arc::clone(&registry),
        aggregator,
        Arc::new(NoopPluginHost),
        ReloadMode::Lenient,
    ));

    let control = ControlPlane::new(
        Arc::clone(&scheduler),
        Arc::clone(&registry),
        reload,
        Duration::from_secs(5),
    );

    Harness {
        scheduler,
        registry,
        control,
    }
}

#[tokio::test]
async fn cold_start_then_reuse_does_not_spawn_a_second_process() {
    let spec = cat_spec("echo", 1, Strategy::Stateless);
    let key = spec.spec_key();
    let mut catalog = Catalog::default();
    catalog.specs_by_name.insert(spec.name.clone(), spec);
    let h = build_harness(catalog);

    let first = h.scheduler.acquire(&key, None, Duration::from_secs(5)).await.unwrap();
    h.scheduler.release(&key, &first).await;
    let second = h.scheduler.acquire(&key, None, Duration::from_secs(5)).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.scheduler.pool(&key).unwrap().live_count().await, 1);
}

#[tokio::test]
async fn saturation_forces_a_second_caller_to_queue_then_succeed() {
    let spec = cat_spec("echo", 1, Strategy::Stateless);
    let key = spec.spec_key();
    let mut catalog = Catalog::default();
    catalog.specs_by_name.insert(spec.name.clone(), spec);
    let h = build_harness(catalog);

    let held = h.scheduler.acquire(&key, None, Duration::from_secs(5)).await.unwrap();

    let scheduler = Arc::clone(&h.scheduler);
    let key_clone = key.clone();
    let waiter = tokio::spawn(async move {
        scheduler.acquire(&key_clone, None, Duration::from_secs(5)).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.scheduler.release(&key, &held).await;

    let result = waiter.await.unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn startup_failure_propagates_as_acquire_error() {
    let mut spec = cat_spec("broken", 1, Strategy::Stateless);
    spec.transport = TransportKind::Stdio {
        command: vec!["definitely-not-a-real-binary-xyz".to_string()],
        env: BTreeMap::new(),
        cwd: None,
    };
    let key = spec.spec_key();
    let mut catalog = Catalog::default();
    catalog.specs_by_name.insert(spec.name.clone(), spec);
    let h = build_harness(catalog);

    let err = h.scheduler.acquire(&key, None, Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(
        err,
        hivemcp::core::AcquireError::StartFailed(hivemcp::core::LifecycleError::ExecutableNotFound(_))
    ));
}

#[tokio::test]
async fn tag_scoped_client_only_sees_matching_specs() {
    let mut tagged = cat_spec("chat", 1, Strategy::Stateless);
    tagged.tags.insert("chat".to_string());
    let plain = cat_spec("utility", 1, Strategy::Stateless);

    let chat_key = tagged.spec_key();
    let utility_key = plain.spec_key();

    let mut catalog = Catalog::default();
    catalog.specs_by_name.insert(tagged.name.clone(), tagged);
    catalog.specs_by_name.insert(plain.name.clone(), plain);
    let h = build_harness(catalog);

    let mut tags = std::collections::BTreeSet::new();
    tags.insert("chat".to_string());
    h.control
        .register_client("chatty".into(), 1, Some(tags), None)
        .await
        .unwrap();

    assert!(h.registry.is_visible("chatty", &chat_key));
    assert!(!h.registry.is_visible("chatty", &utility_key));
}

#[tokio::test]
async fn route_rejects_a_client_that_cannot_see_the_target_spec() {
    let spec = cat_spec("echo", 1, Strategy::Stateless);
    let key = spec.spec_key();
    let mut catalog = Catalog::default();
    catalog.specs_by_name.insert(spec.name.clone(), spec);
    let h = build_harness(catalog);

    h.control
        .register_client("solo".into(), 1, None, Some("someone-else".into()))
        .await
        .unwrap();

    let err = h
        .control
        .route("solo", &key, None, Frame::from("{}".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, hivemcp::RouteError::NotVisible));
}

#[tokio::test]
async fn reload_replaces_a_spec_and_old_instances_stop_serving() {
    let old_spec = cat_spec("echo", 1, Strategy::Stateless);
    let old_key = old_spec.spec_key();
    let mut before = Catalog::default();
    before.specs_by_name.insert(old_spec.name.clone(), old_spec.clone());
    let h = build_harness(before.clone());

    // Warm the old instance so we can observe it getting drained.
    let inst = h.scheduler.acquire(&old_key, None, Duration::from_secs(5)).await.unwrap();
    h.scheduler.release(&old_key, &inst).await;

    let mut new_spec = old_spec.clone();
    new_spec.max_concurrent = 2;
    let new_key = new_spec.spec_key();
    assert_ne!(old_key, new_key);

    let mut after = Catalog::default();
    after.specs_by_name.insert(new_spec.name.clone(), new_spec);

    let diff = CatalogDiff::compute(&before.clone(), &after);
    let update = CatalogUpdate {
        next_state: CatalogState {
            catalog: after,
            revision: 1,
        },
        diff,
        source: UpdateSource::Manual,
    };

    h.control.apply_catalog_update(update).await.unwrap();

    assert!(h.scheduler.pool(&old_key).is_none());
    assert!(h.scheduler.pool(&new_key).is_some());
}
