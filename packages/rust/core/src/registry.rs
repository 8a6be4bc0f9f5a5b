//! Status registry: the `(code, name)` stage catalogue, cached in memory.
//!
//! The registry is an explicit object rather than a global. It starts empty;
//! every lookup before [`StatusRegistry::load`] fails with
//! [`PipelineError::NotInitialized`]. Once loaded the snapshot is immutable
//! until [`StatusRegistry::reload`] swaps in a fresh one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, instrument};

use pipewright_shared::{PipelineError, Result, StatusCode, StatusEntry};
use pipewright_storage::Storage;

const COMPONENT: &str = "status registry";

#[derive(Debug, Default)]
struct Snapshot {
    by_name: HashMap<String, StatusCode>,
    by_code: BTreeMap<StatusCode, String>,
}

impl Snapshot {
    fn from_entries(entries: Vec<StatusEntry>) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            snapshot.by_name.insert(entry.name.clone(), entry.code);
            snapshot.by_code.insert(entry.code, entry.name);
        }
        snapshot
    }
}

/// Name ↔ code lookup for pipeline stages.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    inner: RwLock<Option<Arc<Snapshot>>>,
}

impl StatusRegistry {
    /// An empty, not-yet-loaded registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with `entries`.
    pub fn from_entries(entries: Vec<StatusEntry>) -> Self {
        Self {
            inner: RwLock::new(Some(Arc::new(Snapshot::from_entries(entries)))),
        }
    }

    /// Load the catalogue if it is not loaded yet.
    pub async fn load(&self, storage: &Storage) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        self.reload(storage).await
    }

    /// Re-read the catalogue from the store, replacing the cached snapshot.
    #[instrument(skip_all)]
    pub async fn reload(&self, storage: &Storage) -> Result<()> {
        let entries = storage.list_statuses().await?;
        debug!(count = entries.len(), "status registry loaded");
        let snapshot = Arc::new(Snapshot::from_entries(entries));
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PipelineError::NotInitialized {
                component: COMPONENT,
            })
    }

    /// Code of the stage called `name`.
    pub fn code(&self, name: &str) -> Result<StatusCode> {
        self.snapshot()?
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::UnknownStatus(name.to_string()))
    }

    /// Name of the stage with `code`, if known.
    pub fn name(&self, code: StatusCode) -> Result<Option<String>> {
        Ok(self.snapshot()?.by_code.get(&code).cloned())
    }

    /// `name (code)` for messages; unknown codes render as the bare code.
    pub fn label(&self, code: StatusCode) -> Result<String> {
        Ok(match self.name(code)? {
            Some(name) => format!("{name} ({code})"),
            None => code.to_string(),
        })
    }

    pub fn contains(&self, code: StatusCode) -> Result<bool> {
        Ok(self.snapshot()?.by_code.contains_key(&code))
    }

    /// All stages ordered by code.
    pub fn entries(&self) -> Result<Vec<StatusEntry>> {
        Ok(self
            .snapshot()?
            .by_code
            .iter()
            .map(|(code, name)| StatusEntry {
                code: *code,
                name: name.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_shared::new_id;

    fn entries() -> Vec<StatusEntry> {
        vec![
            StatusEntry {
                code: 220,
                name: "to_tag".into(),
            },
            StatusEntry {
                code: 221,
                name: "tagging".into(),
            },
        ]
    }

    #[test]
    fn queries_before_load_fail() {
        let registry = StatusRegistry::new();
        let err = registry.code("to_tag").unwrap_err();
        assert!(matches!(err, PipelineError::NotInitialized { .. }));
        assert!(registry.entries().is_err());
    }

    #[test]
    fn lookups() {
        let registry = StatusRegistry::from_entries(entries());
        assert_eq!(registry.code("tagging").unwrap(), 221);
        assert_eq!(registry.name(220).unwrap().as_deref(), Some("to_tag"));
        assert_eq!(registry.label(220).unwrap(), "to_tag (220)");
        assert_eq!(registry.label(999).unwrap(), "999");
        assert!(matches!(
            registry.code("nope"),
            Err(PipelineError::UnknownStatus(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn reload_picks_up_new_stages() {
        let tmp = std::env::temp_dir().join(format!("pw_test_{}.db", new_id()));
        let storage = Storage::open(&tmp).await.unwrap();

        let registry = StatusRegistry::new();
        registry.load(&storage).await.unwrap();
        assert_eq!(registry.code("dead_letter").unwrap(), 599);

        storage.upsert_status(250, "to_translate").await.unwrap();
        registry.load(&storage).await.unwrap();
        assert!(registry.code("to_translate").is_err());

        registry.reload(&storage).await.unwrap();
        assert_eq!(registry.code("to_translate").unwrap(), 250);
    }
}
