//! Caching subsystem.
//!
//! Two layers:
//!
//! - [`ResourceCache`]: in-memory TTL cache keyed by [`CacheKey`], with
//!   group tags for bulk invalidation. Backed by a bounded moka cache.
//!   Expiry is judged against the injected [`Clock`], not moka's own timer;
//!   expired entries are evicted lazily on lookup. Fills of values fetched
//!   elsewhere go through a [`FillTicket`] so an invalidation that happens
//!   while the value is in flight wins.
//!
//! - [`persistent::PersistentLayer`]: the rare entries that must survive the
//!   session (favorites and the like), kept in a
//!   [`PersistentStore`](crate::PersistentStore).
//!
//! The cache has no error path. Values handed out are clones; callers can
//! never mutate an entry in place.

pub mod persistent;

pub use persistent::PersistentLayer;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use moka::notification::RemovalCause;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::traits::Clock;
use crate::types::CacheKey;

/// Configuration for the resource cache.
///
/// ```rust
/// # use repsync::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(5_000)
///     .default_ttl(Duration::from_secs(120));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached entries. Default: 10,000.
    pub max_entries: u64,
    /// TTL for reads whose descriptor sets none. Default: 5 minutes.
    #[serde(rename = "default_ttl_ms", with = "crate::config::millis")]
    pub default_ttl: Duration,
    /// TTL for entity state written by the mutation coordinator. Default: 30 minutes.
    #[serde(rename = "entity_ttl_ms", with = "crate::config::millis")]
    pub entity_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl: Duration::from_secs(5 * 60),
            entity_ttl: Duration::from_secs(30 * 60),
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of cached entries.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the TTL used when a read does not specify one.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the TTL for optimistic and confirmed entity state.
    pub fn entity_ttl(mut self, ttl: Duration) -> Self {
        self.entity_ttl = ttl;
        self
    }
}

/// A cached value and its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
    pub groups: BTreeSet<String>,
}

impl<V> CacheEntry<V> {
    /// Valid iff `now - inserted_at < ttl`.
    pub fn is_valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

/// Invalidation generations observed before a fill started.
///
/// Obtained from [`ResourceCache::fill_ticket()`] before a value is fetched
/// and handed to [`ResourceCache::put_if_current()`] once it arrives. The
/// fill is refused when any of its groups was invalidated (or the cache
/// cleared) in between, so a slow read cannot restore what an invalidation
/// removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillTicket {
    epoch: u64,
    groups: Vec<(String, u64)>,
}

#[derive(Default)]
struct GroupIndex {
    /// group -> keys tagged with it.
    members: HashMap<String, HashSet<CacheKey>>,
    /// group -> number of invalidations seen.
    generations: HashMap<String, u64>,
    /// Bumped by `clear()`.
    epoch: u64,
}

impl GroupIndex {
    fn bump(&mut self, group: &str) {
        *self.generations.entry(group.to_string()).or_default() += 1;
    }

    fn generation(&self, group: &str) -> u64 {
        self.generations.get(group).copied().unwrap_or(0)
    }

    fn unindex(&mut self, key: &CacheKey, groups: &BTreeSet<String>) {
        for group in groups {
            if let Some(keys) = self.members.get_mut(group) {
                keys.remove(key);
                if keys.is_empty() {
                    self.members.remove(group);
                }
            }
        }
    }
}

type Evicted = Vec<(CacheKey, BTreeSet<String>)>;

/// Time-bounded cache keyed by request shape.
pub struct ResourceCache<V> {
    entries: moka::sync::Cache<CacheKey, Arc<CacheEntry<V>>>,
    index: Mutex<GroupIndex>,
    /// Capacity evictions reported by moka, unindexed on the next index lock.
    /// The listener runs inside moka calls, some made with `index` held, so
    /// it only ever touches this queue.
    evicted: Arc<Mutex<Evicted>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone + Send + Sync + 'static> ResourceCache<V> {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let evicted: Arc<Mutex<Evicted>> = Arc::default();
        let queue = Arc::clone(&evicted);
        let entries = moka::sync::Cache::builder()
            .max_capacity(config.max_entries)
            .eviction_listener(
                move |key: Arc<CacheKey>, entry: Arc<CacheEntry<V>>, cause: RemovalCause| {
                    if cause.was_evicted() {
                        queue
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(((*key).clone(), entry.groups.clone()));
                    }
                },
            )
            .build();
        Self {
            entries,
            index: Mutex::new(GroupIndex::default()),
            evicted,
            clock,
        }
    }

    fn lock_index(&self) -> MutexGuard<'_, GroupIndex> {
        let evicted = std::mem::take(
            &mut *self.evicted.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, groups) in evicted {
            // Re-inserted since the eviction: still indexed legitimately.
            if !self.entries.contains_key(&key) {
                trace!(%key, "unindexing entry evicted by capacity");
                index.unindex(&key, &groups);
            }
        }
        index
    }

    /// Look up a value.
    ///
    /// Returns `None` on a miss or when the entry has expired; an expired
    /// entry is evicted on the spot.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.is_valid(self.clock.now()) {
            return Some(entry.value.clone());
        }
        trace!(%key, "evicting expired entry");
        let mut index = self.lock_index();
        if let Some(removed) = self.entries.remove(key) {
            index.unindex(key, &removed.groups);
        }
        None
    }

    /// Store or replace an entry, resetting its insertion time.
    pub fn put(&self, key: CacheKey, value: V, ttl: Duration, groups: BTreeSet<String>) {
        let mut index = self.lock_index();
        self.insert_locked(&mut index, key, value, ttl, groups);
    }

    /// Snapshot the invalidation generations of `groups` before a fill.
    pub fn fill_ticket(&self, groups: &BTreeSet<String>) -> FillTicket {
        let index = self.lock_index();
        FillTicket {
            epoch: index.epoch,
            groups: groups
                .iter()
                .map(|g| (g.clone(), index.generation(g)))
                .collect(),
        }
    }

    /// Whether nothing `ticket` covers has been invalidated since it was taken.
    pub fn is_current(&self, ticket: &FillTicket) -> bool {
        ticket_matches(&self.lock_index(), ticket)
    }

    /// [`put()`](Self::put) unless a group of the ticket was invalidated or
    /// the cache cleared since the ticket was taken.
    ///
    /// Returns whether the value was stored.
    pub fn put_if_current(
        &self,
        ticket: &FillTicket,
        key: CacheKey,
        value: V,
        ttl: Duration,
        groups: BTreeSet<String>,
    ) -> bool {
        let mut index = self.lock_index();
        if !ticket_matches(&index, ticket) {
            trace!(%key, "refusing fill invalidated in flight");
            return false;
        }
        self.insert_locked(&mut index, key, value, ttl, groups);
        true
    }

    fn insert_locked(
        &self,
        index: &mut GroupIndex,
        key: CacheKey,
        value: V,
        ttl: Duration,
        groups: BTreeSet<String>,
    ) {
        if let Some(previous) = self.entries.get(&key) {
            index.unindex(&key, &previous.groups);
        }
        for group in &groups {
            index
                .members
                .entry(group.clone())
                .or_default()
                .insert(key.clone());
        }
        let entry = CacheEntry {
            value,
            inserted_at: self.clock.now(),
            ttl,
            groups,
        };
        self.entries.insert(key, Arc::new(entry));
    }

    /// Remove a single entry, returning its value if it was present.
    ///
    /// Expired values are returned too; the caller asked for removal, not a
    /// read. Fills in flight for the entry's groups are refused afterwards.
    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        let mut index = self.lock_index();
        let removed = self.entries.remove(key)?;
        index.unindex(key, &removed.groups);
        for group in &removed.groups {
            index.bump(group);
        }
        Some(removed.value.clone())
    }

    /// Drop every entry tagged with `group`, regardless of TTL.
    ///
    /// Fills for the group that are still in flight are refused when they
    /// land. Returns the number of entries removed.
    pub fn invalidate_group(&self, group: &str) -> usize {
        let mut index = self.lock_index();
        index.bump(group);
        let Some(keys) = index.members.remove(group) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                index.unindex(&key, &entry.groups);
                removed += 1;
            }
        }
        trace!(group, removed, "invalidated group");
        removed
    }

    /// Whether an unexpired entry exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.is_valid(self.clock.now()))
    }

    /// Evict all entries.
    pub fn clear(&self) {
        let mut index = self.lock_index();
        self.entries.invalidate_all();
        index.members.clear();
        index.epoch += 1;
        drop(index);
        self.entries.run_pending_tasks();
    }

    /// Number of groups currently indexed.
    pub fn group_count(&self) -> usize {
        self.lock_index().members.len()
    }

    /// Number of stored entries, expired ones included until looked up.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ticket_matches(index: &GroupIndex, ticket: &FillTicket) -> bool {
    index.epoch == ticket.epoch
        && ticket
            .groups
            .iter()
            .all(|(group, generation)| index.generation(group) == *generation)
}

impl<V> std::fmt::Debug for ResourceCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}
