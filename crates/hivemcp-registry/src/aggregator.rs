use hivemcp_core::{Scheduler, SpecKey};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// One named tool/resource/prompt entry. hivemcp never needs a typed MCP
/// schema here — just enough structure to name it and hash it for an ETag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatorEntry {
    pub tools: Vec<CatalogEntry>,
    pub resources: Vec<CatalogEntry>,
    pub prompts: Vec<CatalogEntry>,
    pub etag: String,
}

impl AggregatorEntry {
    fn compute_etag(tools: &[CatalogEntry], resources: &[CatalogEntry], prompts: &[CatalogEntry]) -> String {
        let mut hasher = Sha256::new();
        for list in [tools, resources, prompts] {
            for entry in list {
                hasher.update(entry.name.as_bytes());
                hasher.update(entry.raw.to_string().as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A source of tools/resources/prompts for one spec key, abstracting over
/// how the aggregator actually reaches an instance. Kept as a trait so the
/// refresh loop is independently testable without a live subprocess.
#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_tools(&self, key: &SpecKey) -> Vec<CatalogEntry>;
    async fn list_resources(&self, key: &SpecKey) -> Vec<CatalogEntry>;
    async fn list_prompts(&self, key: &SpecKey) -> Vec<CatalogEntry>;
}

/// Default source: acquires a ready instance from the scheduler per list
/// call. `AcquireReady` is used deliberately — refresh never starts a cold
/// instance just to list its catalog.
pub struct SchedulerCatalogSource {
    pub scheduler: Arc<Scheduler>,
}

#[async_trait::async_trait]
impl CatalogSource for SchedulerCatalogSource {
    async fn list_tools(&self, key: &SpecKey) -> Vec<CatalogEntry> {
        self.list_via(key, "tools/list").await
    }
    async fn list_resources(&self, key: &SpecKey) -> Vec<CatalogEntry> {
        self.list_via(key, "resources/list").await
    }
    async fn list_prompts(&self, key: &SpecKey) -> Vec<CatalogEntry> {
        self.list_via(key, "prompts/list").await
    }
}

impl SchedulerCatalogSource {
    async fn list_via(&self, key: &SpecKey, method: &str) -> Vec<CatalogEntry> {
        let Ok(instance) = self.scheduler.acquire_ready(key, None).await else {
            return Vec::new();
        };
        let frame = hivemcp_transport::Frame::from(
            serde_json::json!({ "method": method }).to_string(),
        );
        let result = {
            let guard = instance.lock().await;
            guard.transport.call(frame, Duration::from_secs(10)).await
        };
        self.scheduler.release(key, &instance).await;

        match result {
            Ok(response) => serde_json::from_slice::<serde_json::Value>(response.as_bytes())
                .ok()
                .and_then(|v| v.get("items").cloned())
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default()
                .into_iter()
                .filter_map(|item| {
                    let name = item.get("name")?.as_str()?.to_string();
                    Some(CatalogEntry { name, raw: item })
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Per-specKey tools/resources/prompts cache with ETags, refreshed by a
/// single worker per key under a fleet-wide concurrency bound.
pub struct AggregatorCache {
    entries: DashMap<SpecKey, Arc<RwLock<AggregatorEntry>>>,
    in_flight: DashMap<SpecKey, ()>,
    refresh_permits: Arc<Semaphore>,
    source: Arc<dyn CatalogSource>,
}

impl AggregatorCache {
    pub fn new(source: Arc<dyn CatalogSource>, max_concurrent_refreshes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            refresh_permits: Arc::new(Semaphore::new(max_concurrent_refreshes.max(1))),
            source,
        }
    }

    pub fn get(&self, key: &SpecKey) -> Option<AggregatorEntry> {
        self.entries.get(key).map(|e| e.read().clone())
    }

    /// Clears cached entries for the given keys; used by the reload
    /// transaction's invalidate step.
    pub fn invalidate_keys(&self, keys: impl IntoIterator<Item = SpecKey>) {
        for key in keys {
            self.entries.remove(&key);
        }
    }

    /// Refreshes one spec's catalog. At-most-one refresh per key is ever in
    /// flight; a concurrent trigger for the same key is dropped rather than
    /// queued, since the in-flight refresh will observe current state.
    pub async fn refresh(&self, key: &SpecKey) {
        if self.in_flight.insert(key.clone(), ()).is_some() {
            return;
        }

        let _permit = self.refresh_permits.acquire().await.ok();
        let tools = self.source.list_tools(key).await;
        let resources = self.source.list_resources(key).await;
        let prompts = self.source.list_prompts(key).await;
        let etag = AggregatorEntry::compute_etag(&tools, &resources, &prompts);

        self.entries.insert(
            key.clone(),
            Arc::new(RwLock::new(AggregatorEntry {
                tools,
                resources,
                prompts,
                etag,
            })),
        );

        self.in_flight.remove(key);
    }

    /// Background loop: refreshes every key on `list_changed`-equivalent
    /// triggers plus a periodic tick. Callers push key-level triggers via
    /// `refresh`; this loop only drives the periodic component.
    pub async fn run_periodic(self: Arc<Self>, keys: impl Fn() -> Vec<SpecKey> + Send + 'static, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for key in keys() {
                let cache = Arc::clone(&self);
                tokio::spawn(async move {
                    cache.refresh(&key).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        tools: Vec<CatalogEntry>,
    }

    #[async_trait::async_trait]
    impl CatalogSource for FixedSource {
        async fn list_tools(&self, _key: &SpecKey) -> Vec<CatalogEntry> {
            self.tools.clone()
        }
        async fn list_resources(&self, _key: &SpecKey) -> Vec<CatalogEntry> {
            Vec::new()
        }
        async fn list_prompts(&self, _key: &SpecKey) -> Vec<CatalogEntry> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn refresh_populates_cache_with_etag() {
        let source = Arc::new(FixedSource {
            tools: vec![CatalogEntry {
                name: "echo".into(),
                raw: serde_json::json!({"name": "echo"}),
            }],
        });
        let cache = AggregatorCache::new(source, 2);
        let key = SpecKey("k1".into());
        cache.refresh(&key).await;
        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.tools.len(), 1);
        assert!(!entry.etag.is_empty());
    }

    #[tokio::test]
    async fn invalidate_clears_entry() {
        let source = Arc::new(FixedSource { tools: vec![] });
        let cache = AggregatorCache::new(source, 2);
        let key = SpecKey("k1".into());
        cache.refresh(&key).await;
        assert!(cache.get(&key).is_some());
        cache.invalidate_keys([key.clone()]);
        assert!(cache.get(&key).is_none());
    }
}
