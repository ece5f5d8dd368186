//! The client facade UI code talks to.
//!
//! [`SyncClient`] wires one transport, store, clock and timer into the
//! cache, the mutation coordinator, the resilient fetcher and the hub. It is
//! cheap to share behind an `Arc`; every method takes `&self`.

mod builder;

pub use builder::SyncClientBuilder;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cache::{PersistentLayer, ResourceCache};
use crate::config::SyncConfig;
use crate::fetch::{FetchConfig, FetchSession, ResilientFetcher};
use crate::hub::{BroadcastHub, Subscription, topic};
use crate::mutation::MutationCoordinator;
use crate::telemetry;
use crate::traits::{PersistentStore, Transport};
use crate::types::{EntityRef, FetchCandidate, Request, ResourceDescriptor, SyncEvent};
use crate::Result;

/// Client-side sync layer: cached reads, optimistic writes, resilient loads.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use repsync::{SyncClient, ResourceDescriptor, EntityRef, Result};
/// # use repsync::traits::Transport;
/// # async fn example(transport: Arc<dyn Transport>) -> Result<()> {
/// let client = SyncClient::builder().transport(transport).build()?;
///
/// let goals = client
///     .read(&ResourceDescriptor::new("goals").group("goal"))
///     .await?;
///
/// let _sub = client.subscribe("group:goal", |event| println!("{event:?}"));
/// client.mutate(EntityRef::new("goal", "7"), &serde_json::json!({"target": 12}));
/// # Ok(())
/// # }
/// ```
pub struct SyncClient {
    transport: Arc<dyn Transport>,
    hub: BroadcastHub<SyncEvent>,
    cache: Arc<ResourceCache<Value>>,
    persistent: Arc<PersistentLayer>,
    store: Arc<dyn PersistentStore>,
    mutations: MutationCoordinator,
    fetcher: ResilientFetcher,
    config: SyncConfig,
}

impl SyncClient {
    /// Create a new builder.
    pub fn builder() -> SyncClientBuilder {
        SyncClientBuilder::new()
    }

    /// Cache-aside read.
    ///
    /// Served from the optimistic overlay, then memory, then (for
    /// `persist` descriptors) the persistent store; only a miss everywhere
    /// reaches the transport. Transport errors are returned as-is and
    /// nothing is cached. A response whose groups were invalidated while it
    /// was in flight is returned but not cached.
    #[instrument(skip(self, descriptor), fields(key = %descriptor.key()))]
    pub async fn read(&self, descriptor: &ResourceDescriptor) -> Result<Value> {
        let key = descriptor.key();
        let resource = descriptor.resource.clone();

        if let Some(value) = self.mutations.overlay(&key) {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "resource" => resource, "layer" => "overlay")
                .increment(1);
            return Ok(value);
        }
        if let Some(value) = self.cache.get(&key) {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "resource" => resource, "layer" => "memory")
                .increment(1);
            return Ok(value);
        }

        let ttl = descriptor.ttl.unwrap_or(self.config.cache.default_ttl);
        if descriptor.persist
            && let Some((value, groups)) = self.persistent.load(&key)
        {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "resource" => resource, "layer" => "persistent")
                .increment(1);
            self.cache.put(key, value.clone(), ttl, groups);
            return Ok(value);
        }

        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "resource" => resource).increment(1);
        debug!(transport = self.transport.name(), "cache miss, fetching");
        let ticket = self.cache.fill_ticket(&descriptor.groups);
        let request = Request::Read(descriptor.clone());
        let result = self.transport.perform(&request).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::TRANSPORT_REQUESTS_TOTAL,
            "request" => request.label(),
            "status" => status,
        )
        .increment(1);
        let value = result?;

        // A confirmation or removal that landed meanwhile invalidated what
        // this response describes; hand it back but keep it out of the cache.
        if !self.cache.put_if_current(
            &ticket,
            key.clone(),
            value.clone(),
            ttl,
            descriptor.groups.clone(),
        ) {
            debug!("group invalidated while reading, result not cached");
            return Ok(value);
        }
        if descriptor.persist
            && let Err(e) = self.persistent.save(&key, &value, &descriptor.groups)
        {
            warn!(error = %e, "failed to persist read result");
        }
        Ok(value)
    }

    /// Apply a JSON merge patch optimistically and reconcile in the background.
    ///
    /// Outcomes arrive on `entity:<kind>/<id>` and `group:<kind>`.
    /// Returns the attempt token carried by those events.
    pub fn mutate(&self, entity: EntityRef, patch: &Value) -> u64 {
        self.mutations.mutate(entity, patch)
    }

    /// Local view of an entity, optimistic state included.
    pub fn local(&self, entity: &EntityRef) -> Option<Value> {
        self.mutations.local(entity)
    }

    /// Whether the entity has an unresolved mutation.
    pub fn is_pending(&self, entity: &EntityRef) -> bool {
        self.mutations.is_pending(entity)
    }

    /// Start a resilient load over ordered candidates.
    ///
    /// `options` overrides the configured [`FetchConfig`] for this session.
    pub fn load_resilient(
        &self,
        candidates: Vec<FetchCandidate>,
        options: Option<FetchConfig>,
    ) -> FetchSession {
        self.fetcher.start(candidates, options)
    }

    /// Like [`load_resilient()`](Self::load_resilient), with `observer`
    /// receiving every lifecycle event of the session.
    pub fn load_resilient_observed<F>(
        &self,
        candidates: Vec<FetchCandidate>,
        options: Option<FetchConfig>,
        observer: F,
    ) -> FetchSession
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.fetcher.start_observed(candidates, options, observer)
    }

    /// Subscribe to a topic; see [`hub::topic`](crate::hub::topic) for names.
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(topic, callback)
    }

    /// Drop every cached and persisted entry tagged with `group`, then
    /// announce it on `group:<name>`.
    #[instrument(skip(self))]
    pub fn invalidate_group(&self, group: &str) -> usize {
        let removed = self.cache.invalidate_group(group);
        let persisted = self.persistent.invalidate_group(group).unwrap_or_else(|e| {
            warn!(error = %e, "failed to invalidate persisted entries");
            0
        });
        metrics::counter!(telemetry::CACHE_INVALIDATIONS_TOTAL, "group" => group.to_owned())
            .increment(1);
        debug!(removed, persisted, "group invalidated");
        self.hub.publish(
            &topic::group(group),
            &SyncEvent::Invalidated {
                group: group.to_string(),
            },
        );
        removed
    }

    /// Reset the session: pending mutations are dropped, the memory cache
    /// and persisted entries are cleared.
    pub fn clear(&self) -> Result<()> {
        self.mutations.clear();
        self.cache.clear();
        self.persistent.purge()
    }

    pub fn hub(&self) -> &BroadcastHub<SyncEvent> {
        &self.hub
    }

    pub fn cache(&self) -> &ResourceCache<Value> {
        &self.cache
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("transport", &self.transport.name())
            .field("cache", &self.cache)
            .field("mutations", &self.mutations)
            .finish_non_exhaustive()
    }
}
