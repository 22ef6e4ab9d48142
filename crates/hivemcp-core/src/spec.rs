use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// How a spec's instances are transported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    Stdio {
        command: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<String>,
    },
    StreamableHttp {
        endpoint: String,
        headers: BTreeMap<String, String>,
        retry_cap: u32,
    },
}

/// Routing strategy for a spec's instances: whether a session sticks to one
/// instance for its lifetime, or any ready instance will do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Stateless,
    Stateful,
}

/// Policy controlling the minReady target in the absence of an active client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationMode {
    OnDemand,
    AlwaysOn,
    Disabled,
}

/// Declarative, content-addressed description of one backend server type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSpec {
    pub name: String,
    pub transport: TransportKind,
    pub tags: BTreeSet<String>,
    pub strategy: Strategy,
    pub max_concurrent: u32,
    pub min_ready: u32,
    pub idle_seconds: u64,
    pub drain_timeout_seconds: u64,
    pub session_ttl_seconds: u64,
    pub activation_mode: ActivationMode,
    pub protocol_version: String,
    pub expose_tools: Option<BTreeSet<String>>,
}

impl ServerSpec {
    /// Stable content hash: any field change yields a new key, so mutation
    /// is modeled as replacement rather than in-place update.
    pub fn spec_key(&self) -> SpecKey {
        // BTreeMap/BTreeSet serialize with sorted keys, and serde_json
        // otherwise preserves struct field order, giving a canonical
        // encoding without needing a dedicated canonicalizer.
        let canonical =
            serde_json::to_vec(self).expect("ServerSpec fields are all JSON-representable");
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(32);
        for byte in digest.iter().take(16) {
            hex.push_str(&format!("{byte:02x}"));
        }
        SpecKey(hex)
    }
}

/// Content hash identity of a [`ServerSpec`]. Stable across processes as
/// long as the spec's fields are unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpecKey(pub String);

impl std::fmt::Display for SpecKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The declarative catalog: every known spec by name, keyed by its current
/// content hash.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub specs_by_name: BTreeMap<String, ServerSpec>,
}

impl Catalog {
    pub fn spec_key_for(&self, name: &str) -> Option<SpecKey> {
        self.specs_by_name.get(name).map(ServerSpec::spec_key)
    }

    pub fn keys(&self) -> BTreeSet<SpecKey> {
        self.specs_by_name.values().map(ServerSpec::spec_key).collect()
    }
}

/// A catalog snapshot plus a monotonic revision counter. Snapshots are
/// immutable and shared by shallow clone; reload builds the next one in a
/// local value before the scheduler ever observes it.
#[derive(Debug, Clone, Default)]
pub struct CatalogState {
    pub catalog: Catalog,
    pub revision: u64,
}

/// The published catalog state behind a single atomic reference. Reload's
/// commit step and the registry's visibility resolution hold clones of the
/// same handle, so a `store` here is visible to the next `load` without a
/// separate notification path.
pub type CatalogHandle = Arc<ArcSwap<CatalogState>>;

pub fn catalog_handle(initial: CatalogState) -> CatalogHandle {
    Arc::new(ArcSwap::new(Arc::new(initial)))
}

/// The four disjoint outcomes of comparing two catalog states, always
/// derivable deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    pub added: BTreeSet<SpecKey>,
    pub removed: BTreeSet<SpecKey>,
    /// (old key, new key) pairs for specs whose name survived but whose
    /// content changed.
    pub updated: BTreeSet<(SpecKey, SpecKey)>,
    /// Same key, same spec — a no-op carrier used purely for step ordering.
    pub replaced: BTreeSet<SpecKey>,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.replaced.is_empty()
    }

    /// Diff(A, B): which keys were added, removed, or changed identity
    /// under the same name going from `before` to `after`.
    pub fn compute(before: &Catalog, after: &Catalog) -> Self {
        let mut diff = CatalogDiff::default();

        for (name, after_spec) in &after.specs_by_name {
            let after_key = after_spec.spec_key();
            match before.specs_by_name.get(name) {
                None => {
                    diff.added.insert(after_key);
                }
                Some(before_spec) => {
                    let before_key = before_spec.spec_key();
                    if before_key == after_key {
                        diff.replaced.insert(after_key);
                    } else {
                        diff.updated.insert((before_key, after_key));
                    }
                }
            }
        }

        for (name, before_spec) in &before.specs_by_name {
            if !after.specs_by_name.contains_key(name) {
                diff.removed.insert(before_spec.spec_key());
            }
        }

        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, cmd: &str) -> ServerSpec {
        ServerSpec {
            name: name.to_string(),
            transport: TransportKind::Stdio {
                command: vec![cmd.to_string()],
                env: BTreeMap::new(),
                cwd: None,
            },
            tags: BTreeSet::new(),
            strategy: Strategy::Stateless,
            max_concurrent: 1,
            min_ready: 0,
            idle_seconds: 60,
            drain_timeout_seconds: 10,
            session_ttl_seconds: 0,
            activation_mode: ActivationMode::OnDemand,
            protocol_version: "2025-06-18".to_string(),
            expose_tools: None,
        }
    }

    #[test]
    fn identical_specs_hash_identically() {
        assert_eq!(spec("a", "x").spec_key(), spec("a", "x").spec_key());
    }

    #[test]
    fn changed_field_changes_key() {
        assert_ne!(spec("a", "x").spec_key(), spec("a", "y").spec_key());
    }

    #[test]
    fn diff_of_identical_states_is_empty_modulo_replaced() {
        let mut catalog = Catalog::default();
        catalog.specs_by_name.insert("a".into(), spec("a", "x"));
        let diff = CatalogDiff::compute(&catalog, &catalog);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.updated.is_empty());
        assert_eq!(diff.replaced.len(), 1);
    }

    #[test]
    fn diff_detects_add_remove_update() {
        let mut before = Catalog::default();
        before.specs_by_name.insert("a".into(), spec("a", "x"));
        before.specs_by_name.insert("b".into(), spec("b", "x"));

        let mut after = Catalog::default();
        after.specs_by_name.insert("a".into(), spec("a", "z")); // updated
        after.specs_by_name.insert("c".into(), spec("c", "x")); // added
        // "b" removed

        let diff = CatalogDiff::compute(&before, &after);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.updated.len(), 1);
    }
}
