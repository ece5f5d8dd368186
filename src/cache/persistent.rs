//! Session-surviving cache entries.
//!
//! Each entry is stored under `repsync:entry:<cache key>` as a JSON envelope
//! carrying its groups. A manifest under [`MANIFEST_KEY`] maps every stored
//! key to its groups so a group can be invalidated without scanning the
//! store. Persisted entries have no TTL; they live until invalidated.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::Result;
use crate::traits::PersistentStore;
use crate::types::CacheKey;

/// Store key of the group manifest.
pub const MANIFEST_KEY: &str = "repsync:manifest";

const ENTRY_PREFIX: &str = "repsync:entry:";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    groups: BTreeSet<String>,
    value: Value,
}

type Manifest = BTreeMap<String, BTreeSet<String>>;

/// Cache entries backed by a [`PersistentStore`].
pub struct PersistentLayer {
    store: Arc<dyn PersistentStore>,
    // Serializes manifest read-modify-write cycles.
    manifest_lock: Mutex<()>,
}

impl PersistentLayer {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            store,
            manifest_lock: Mutex::new(()),
        }
    }

    /// Load a persisted value and its groups.
    ///
    /// A corrupt envelope is logged and treated as absent.
    pub fn load(&self, key: &CacheKey) -> Option<(Value, BTreeSet<String>)> {
        let raw = self.store.get(&entry_key(key))?;
        match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => Some((envelope.value, envelope.groups)),
            Err(e) => {
                warn!(%key, error = %e, "corrupt persisted entry");
                None
            }
        }
    }

    pub fn save(&self, key: &CacheKey, value: &Value, groups: &BTreeSet<String>) -> Result<()> {
        let envelope = Envelope {
            groups: groups.clone(),
            value: value.clone(),
        };
        let _guard = self
            .manifest_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.store
            .set(&entry_key(key), &serde_json::to_string(&envelope)?)?;
        let mut manifest = self.manifest();
        manifest.insert(key.as_str().to_string(), groups.clone());
        self.write_manifest(&manifest)
    }

    pub fn remove(&self, key: &CacheKey) -> Result<()> {
        let _guard = self
            .manifest_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.store.remove(&entry_key(key))?;
        let mut manifest = self.manifest();
        if manifest.remove(key.as_str()).is_some() {
            self.write_manifest(&manifest)?;
        }
        Ok(())
    }

    /// Remove every persisted entry tagged with `group`.
    pub fn invalidate_group(&self, group: &str) -> Result<usize> {
        let _guard = self
            .manifest_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut manifest = self.manifest();
        let doomed: Vec<String> = manifest
            .iter()
            .filter(|(_, groups)| groups.contains(group))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.store.remove(&format!("{ENTRY_PREFIX}{key}"))?;
            manifest.remove(key);
        }
        if !doomed.is_empty() {
            self.write_manifest(&manifest)?;
        }
        Ok(doomed.len())
    }

    /// Remove every persisted entry.
    pub fn purge(&self) -> Result<()> {
        let _guard = self
            .manifest_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for key in self.manifest().keys() {
            self.store.remove(&format!("{ENTRY_PREFIX}{key}"))?;
        }
        self.store.remove(MANIFEST_KEY)
    }

    fn manifest(&self) -> Manifest {
        let Some(raw) = self.store.get(MANIFEST_KEY) else {
            return Manifest::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(error = %e, "corrupt persistence manifest, starting fresh");
            Manifest::new()
        })
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        self.store
            .set(MANIFEST_KEY, &serde_json::to_string(manifest)?)
    }
}

fn entry_key(key: &CacheKey) -> String {
    format!("{ENTRY_PREFIX}{key}")
}
