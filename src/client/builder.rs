//! Builder for configuring sync clients

use std::sync::Arc;

use super::SyncClient;
use crate::cache::{PersistentLayer, ResourceCache};
use crate::config::SyncConfig;
use crate::fetch::ResilientFetcher;
use crate::hub::BroadcastHub;
use crate::mutation::{CoordinatorParts, MutationCoordinator};
use crate::runtime::TokioClock;
use crate::store::MemoryStore;
use crate::traits::{Clock, PersistentStore, Timer, Transport};
use crate::{Result, SyncError};

/// Builder for [`SyncClient`].
///
/// Only the transport is required. The store defaults to an in-memory map,
/// the clock and timer to the current tokio runtime.
#[derive(Default)]
pub struct SyncClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn PersistentStore>>,
    clock: Option<Arc<dyn Clock>>,
    timer: Option<Arc<dyn Timer>>,
    config: SyncConfig,
}

impl SyncClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport that performs network calls.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the store for session-surviving values.
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the clock used for TTL checks.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the timer used for debounce and backoff scheduling.
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Replace every tunable at once.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the cache tunables.
    pub fn cache_config(mut self, config: crate::CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    /// Set the debounce tunables.
    pub fn mutation_config(mut self, config: crate::MutationConfig) -> Self {
        self.config.mutation = config;
        self
    }

    /// Set the default retry/backoff tunables for resilient loads.
    pub fn fetch_config(mut self, config: crate::FetchConfig) -> Self {
        self.config.fetch = config;
        self
    }

    /// Build the client.
    ///
    /// Fails without a transport, or without a clock/timer when called
    /// outside a tokio runtime.
    pub fn build(self) -> Result<SyncClient> {
        let transport = self
            .transport
            .ok_or_else(|| SyncError::Configuration("no transport configured".to_string()))?;

        let (clock, timer) = match (self.clock, self.timer) {
            (Some(clock), Some(timer)) => (clock, timer),
            (clock, timer) => {
                let tokio_clock = Arc::new(TokioClock::try_current()?);
                (
                    clock.unwrap_or_else(|| Arc::clone(&tokio_clock) as Arc<dyn Clock>),
                    timer.unwrap_or(tokio_clock as Arc<dyn Timer>),
                )
            }
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let hub = BroadcastHub::new();
        let cache = Arc::new(ResourceCache::new(&self.config.cache, Arc::clone(&clock)));
        let persistent = Arc::new(PersistentLayer::new(Arc::clone(&store)));

        let mutations = MutationCoordinator::new(
            CoordinatorParts {
                cache: Arc::clone(&cache),
                persistent: Some(Arc::clone(&persistent)),
                transport: Arc::clone(&transport),
                hub: hub.clone(),
                timer: Arc::clone(&timer),
                clock,
            },
            self.config.mutation.clone(),
            self.config.cache.entity_ttl,
        );
        let fetcher = ResilientFetcher::new(
            Arc::clone(&transport),
            hub.clone(),
            timer,
            self.config.fetch.clone(),
        );

        Ok(SyncClient {
            transport,
            hub,
            cache,
            persistent,
            store,
            mutations,
            fetcher,
            config: self.config,
        })
    }
}
