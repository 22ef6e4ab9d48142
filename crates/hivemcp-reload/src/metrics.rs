use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters keyed by label tuple, the same shape as the
/// `apply_total{mode,result,stage}` / `rollback_total{mode,result}` series
/// the reload transaction must emit.
#[derive(Default)]
pub struct ReloadMetrics {
    apply_total: DashMap<(String, String, String), AtomicU64>,
    rollback_total: DashMap<(String, String), AtomicU64>,
    action_total: DashMap<(String, String), AtomicU64>,
}

impl ReloadMetrics {
    pub fn record_apply(&self, mode: &str, result: &str, stage: &str) {
        self.apply_total
            .entry((mode.to_string(), result.to_string(), stage.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self, mode: &str, result: &str) {
        self.rollback_total
            .entry((mode.to_string(), result.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Second series: every committed action outcome labeled `{source,
    /// action}`, `action` being one of `server_add` / `server_remove` /
    /// `server_update` / `server_replace`.
    pub fn record_action(&self, source: &str, action: &str) {
        self.action_total
            .entry((source.to_string(), action.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn apply_count(&self, mode: &str, result: &str, stage: &str) -> u64 {
        self.apply_total
            .get(&(mode.to_string(), result.to_string(), stage.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn rollback_count(&self, mode: &str, result: &str) -> u64 {
        self.rollback_total
            .get(&(mode.to_string(), result.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn action_count(&self, source: &str, action: &str) -> u64 {
        self.action_total
            .get(&(source.to_string(), action.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
