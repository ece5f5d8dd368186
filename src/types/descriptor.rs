//! Cache keys, entity references, and read descriptors

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Deterministic cache key derived from a resource type and its parameters.
///
/// Parameters are serialized with object keys sorted at every nesting
/// level, so two logically equal requests always produce the same key
/// regardless of the order their parameters were added in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from a resource type and its query parameters.
    pub fn derive(resource: &str, params: &BTreeMap<String, Value>) -> Self {
        let mut key = String::with_capacity(resource.len() + 16);
        key.push_str(resource);
        key.push('?');
        let mut first = true;
        for (name, value) in params {
            if !first {
                key.push('&');
            }
            first = false;
            key.push_str(name);
            key.push('=');
            write_canonical(value, &mut key);
        }
        Self(key)
    }

    /// Key of the single-entity resource `(kind, {"id": id})`.
    pub fn entity(entity: &EntityRef) -> Self {
        ResourceDescriptor::entity(entity).key()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            let mut first = true;
            for (k, v) in sorted {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Reference to a single server-side entity, e.g. `workout/42`.
///
/// `kind` doubles as the cache group the entity belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Shape of a UI read: what resource, with which filters, cached how.
///
/// ```rust
/// # use repsync::ResourceDescriptor;
/// # use std::time::Duration;
/// let recent = ResourceDescriptor::new("workouts")
///     .param("page", 1)
///     .param("status", "completed")
///     .group("workout")
///     .ttl(Duration::from_secs(60));
/// assert_eq!(recent.key(), ResourceDescriptor::new("workouts")
///     .param("status", "completed")
///     .param("page", 1)
///     .key());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub resource: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Overrides the configured default TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    /// Also keep the value in the [`PersistentStore`](crate::PersistentStore).
    #[serde(default)]
    pub persist: bool,
}

impl ResourceDescriptor {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: BTreeMap::new(),
            groups: BTreeSet::new(),
            ttl: None,
            persist: false,
        }
    }

    /// Descriptor for a single entity, tagged with the entity's kind as group.
    pub fn entity(entity: &EntityRef) -> Self {
        Self::new(entity.kind.clone())
            .param("id", entity.id.clone())
            .group(entity.kind.clone())
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn persist(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Cache key of this read. Groups, TTL, and persistence do not take part.
    pub fn key(&self) -> CacheKey {
        CacheKey::derive(&self.resource, &self.params)
    }
}
