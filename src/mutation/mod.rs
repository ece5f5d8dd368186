//! Optimistic mutations with debounced reconciliation.
//!
//! [`MutationCoordinator::mutate()`] applies a JSON merge patch to the local
//! state of an entity immediately and broadcasts the optimistic value. The
//! network call is deferred by a debounce window; further patches to the same
//! entity inside the window compose onto the pending desired state and restart
//! the window, so exactly one call carrying the latest desired state is made.
//!
//! # Lifecycle per entity
//!
//! ```text
//!  mutate ──► pending (timer armed) ──timer──► in flight ──ok──────► Confirmed
//!    ▲            │                               │      ──404─────► Removed
//!    └─ mutate ───┘ (cancel timer, bump token)    │      ──error───► RolledBack
//!                                                 └─ mutate ──► new pending,
//!                                                    sent after this resolves
//! ```
//!
//! # Tokens and ordering
//!
//! Every `mutate` bumps the entity's attempt token. A send resolves against
//! the token it was issued with; if a newer intent exists by then the result
//! is stale and only informs the newer intent (a stale success becomes its
//! rollback baseline, a stale 404 removes the entity). A per-entity async
//! gate makes a resolution happen-before the next window's send for the same
//! entity. Distinct entities never wait on each other.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cache::{PersistentLayer, ResourceCache};
use crate::hub::{BroadcastHub, topic};
use crate::telemetry;
use crate::traits::{Clock, Timer, TimerToken, Transport};
use crate::types::{
    CacheKey, EntityRef, MutationEvent, MutationResolution, Request, SyncEvent, merge_patch,
};
use crate::{Result, SyncError};

/// Debounce tunables for optimistic mutations.
///
/// ```rust
/// # use repsync::MutationConfig;
/// # use std::time::Duration;
/// let config = MutationConfig::new().debounce(Duration::from_millis(300));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// Quiet period after the last `mutate` before the send. Default: 400ms.
    #[serde(rename = "debounce_ms", with = "crate::config::millis")]
    pub debounce: Duration,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(400),
        }
    }
}

impl MutationConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// A desired state change that has not been sent yet.
#[derive(Debug, Clone)]
struct MutationIntent {
    /// Last state known to match the server; the rollback target.
    previous_snapshot: Option<Value>,
    desired: Value,
    attempt_token: u64,
    debounce_deadline: Instant,
}

#[derive(Debug)]
struct InFlight {
    desired: Value,
    previous_snapshot: Option<Value>,
}

#[derive(Debug, Default)]
struct EntitySlot {
    generation: u64,
    pending: Option<MutationIntent>,
    pending_timer: Option<TimerToken>,
    in_flight: Option<InFlight>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl EntitySlot {
    fn is_idle(&self) -> bool {
        self.pending.is_none() && self.in_flight.is_none()
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    /// Bumped by `clear()`; results from an older epoch are dropped.
    epoch: u64,
    slots: HashMap<EntityRef, EntitySlot>,
}

struct Shared {
    cache: Arc<ResourceCache<Value>>,
    persistent: Option<Arc<PersistentLayer>>,
    transport: Arc<dyn Transport>,
    hub: BroadcastHub<SyncEvent>,
    timer: Arc<dyn Timer>,
    clock: Arc<dyn Clock>,
    config: MutationConfig,
    entity_ttl: Duration,
    state: Mutex<CoordinatorState>,
}

/// Applies, coalesces, sends, and reconciles optimistic entity mutations.
#[derive(Clone)]
pub struct MutationCoordinator {
    shared: Arc<Shared>,
}

/// Collaborators of a [`MutationCoordinator`].
pub struct CoordinatorParts {
    pub cache: Arc<ResourceCache<Value>>,
    pub persistent: Option<Arc<PersistentLayer>>,
    pub transport: Arc<dyn Transport>,
    pub hub: BroadcastHub<SyncEvent>,
    pub timer: Arc<dyn Timer>,
    pub clock: Arc<dyn Clock>,
}

impl MutationCoordinator {
    /// `entity_ttl` is the TTL given to optimistic and confirmed entity state.
    pub fn new(parts: CoordinatorParts, config: MutationConfig, entity_ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache: parts.cache,
                persistent: parts.persistent,
                transport: parts.transport,
                hub: parts.hub,
                timer: parts.timer,
                clock: parts.clock,
                config,
                entity_ttl,
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    pub fn config(&self) -> &MutationConfig {
        &self.shared.config
    }

    /// Apply `patch` locally now and schedule reconciliation with the server.
    ///
    /// Never fails: the outcome is delivered on the entity and group topics.
    /// Returns the attempt token the optimistic event carries.
    pub fn mutate(&self, entity: EntityRef, patch: &Value) -> u64 {
        let shared = &self.shared;
        let key = CacheKey::entity(&entity);

        let (token, value) = {
            let mut state = shared.lock_state();
            let epoch = state.epoch;
            let slot = state.slots.entry(entity.clone()).or_default();

            let (base, previous_snapshot) = if let Some(pending) = &slot.pending {
                (pending.desired.clone(), pending.previous_snapshot.clone())
            } else if let Some(in_flight) = &slot.in_flight {
                (in_flight.desired.clone(), in_flight.previous_snapshot.clone())
            } else {
                let current = shared.cache.get(&key);
                (current.clone().unwrap_or(Value::Null), current)
            };

            let mut desired = base;
            merge_patch(&mut desired, patch);

            slot.generation += 1;
            let token = slot.generation;
            if let Some(timer) = slot.pending_timer.take() {
                shared.timer.cancel(timer);
            }
            slot.pending = Some(MutationIntent {
                previous_snapshot,
                desired: desired.clone(),
                attempt_token: token,
                debounce_deadline: shared.clock.now() + shared.config.debounce,
            });

            shared
                .cache
                .put(key, desired.clone(), shared.entity_ttl, entity_groups(&entity));

            let task = flush(Arc::clone(shared), entity.clone(), token, epoch);
            slot.pending_timer = Some(
                shared
                    .timer
                    .schedule(shared.config.debounce, Box::pin(task)),
            );
            (token, desired)
        };

        metrics::counter!(telemetry::MUTATIONS_SUBMITTED_TOTAL, "kind" => entity.kind.clone())
            .increment(1);
        debug!(%entity, token, "optimistic mutation applied");
        shared.publish_mutation(&entity, token, MutationResolution::Optimistic { value });
        token
    }

    /// Local view of an entity: the pending or in-flight desired state, or
    /// the cached value.
    pub fn local(&self, entity: &EntityRef) -> Option<Value> {
        let state = self.shared.lock_state();
        if let Some(slot) = state.slots.get(entity) {
            if let Some(pending) = &slot.pending {
                return Some(pending.desired.clone());
            }
            if let Some(in_flight) = &slot.in_flight {
                return Some(in_flight.desired.clone());
            }
        }
        drop(state);
        self.shared.cache.get(&CacheKey::entity(entity))
    }

    /// Optimistic overlay for a cache key, if it names an entity with a
    /// pending or in-flight mutation.
    pub(crate) fn overlay(&self, key: &CacheKey) -> Option<Value> {
        let state = self.shared.lock_state();
        state
            .slots
            .iter()
            .find(|(entity, _)| CacheKey::entity(entity) == *key)
            .and_then(|(_, slot)| {
                slot.pending
                    .as_ref()
                    .map(|p| p.desired.clone())
                    .or_else(|| slot.in_flight.as_ref().map(|f| f.desired.clone()))
            })
    }

    /// Whether the entity has a mutation that is pending or in flight.
    pub fn is_pending(&self, entity: &EntityRef) -> bool {
        self.shared
            .lock_state()
            .slots
            .get(entity)
            .is_some_and(|slot| !slot.is_idle())
    }

    /// Number of entities with unresolved mutations.
    pub fn pending_count(&self) -> usize {
        self.shared
            .lock_state()
            .slots
            .values()
            .filter(|slot| !slot.is_idle())
            .count()
    }

    /// When the pending send for `entity` is due, if one is armed.
    pub fn debounce_deadline(&self, entity: &EntityRef) -> Option<Instant> {
        self.shared
            .lock_state()
            .slots
            .get(entity)
            .and_then(|slot| slot.pending.as_ref())
            .map(|p| p.debounce_deadline)
    }

    /// Drop every unresolved mutation.
    ///
    /// Pending timers are cancelled and results of sends already in flight
    /// are discarded on arrival. Local state is left as-is; callers that
    /// reset the session clear the cache as well.
    pub fn clear(&self) {
        let mut state = self.shared.lock_state();
        state.epoch += 1;
        for (entity, slot) in state.slots.drain() {
            if let Some(timer) = slot.pending_timer {
                self.shared.timer.cancel(timer);
                debug!(%entity, "discarded pending mutation");
            }
        }
    }
}

impl std::fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("config", &self.shared.config)
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn entity_groups(entity: &EntityRef) -> BTreeSet<String> {
    BTreeSet::from([entity.kind.clone()])
}

/// Debounce timer body: send the latest desired state once.
#[instrument(skip(shared), fields(entity = %entity))]
async fn flush(shared: Arc<Shared>, entity: EntityRef, token: u64, epoch: u64) {
    let gate = {
        let state = shared.lock_state();
        match state.slots.get(&entity) {
            Some(slot) if state.epoch == epoch && slot.generation == token => {
                Arc::clone(&slot.gate)
            }
            _ => return,
        }
    };

    // Waits for a previous send of this entity to resolve.
    let _permit = gate.lock().await;

    let desired = {
        let mut state = shared.lock_state();
        if state.epoch != epoch {
            return;
        }
        let Some(slot) = state.slots.get_mut(&entity) else {
            return;
        };
        if slot.generation != token {
            return;
        }
        let Some(intent) = slot.pending.take() else {
            return;
        };
        debug_assert_eq!(intent.attempt_token, token);
        slot.pending_timer = None;
        slot.in_flight = Some(InFlight {
            desired: intent.desired.clone(),
            previous_snapshot: intent.previous_snapshot,
        });
        intent.desired
    };

    debug!(token, "sending desired state");
    let request = Request::Write {
        entity: entity.clone(),
        body: desired,
    };
    let result = shared.transport.perform(&request).await;
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(telemetry::TRANSPORT_REQUESTS_TOTAL,
        "request" => "write",
        "status" => status,
    )
    .increment(1);

    shared.resolve(&entity, token, epoch, result);
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply the server's answer for the send issued with `token`.
    fn resolve(&self, entity: &EntityRef, token: u64, epoch: u64, result: Result<Value>) {
        let key = CacheKey::entity(entity);
        let mut resolution = None;
        let mut invalidated = false;

        {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                debug!(%entity, token, "dropping result from a cleared session");
                return;
            }
            let Some(slot) = state.slots.get_mut(entity) else {
                return;
            };
            let Some(in_flight) = slot.in_flight.take() else {
                return;
            };
            let current = slot.generation == token;

            match result {
                Ok(canonical) if current => {
                    let canonical = if canonical.is_null() {
                        in_flight.desired
                    } else {
                        canonical
                    };
                    self.invalidate(&entity.kind);
                    invalidated = true;
                    self.cache.put(
                        key,
                        canonical.clone(),
                        self.entity_ttl,
                        entity_groups(entity),
                    );
                    resolution = Some((token, MutationResolution::Confirmed { value: canonical }));
                }
                Ok(canonical) => {
                    // A newer intent is pending; the server now holds this
                    // send's state, which becomes the newer rollback target.
                    if let Some(pending) = slot.pending.as_mut() {
                        pending.previous_snapshot = Some(if canonical.is_null() {
                            in_flight.desired
                        } else {
                            canonical
                        });
                    }
                    debug!(%entity, token, latest = slot.generation, "superseded send confirmed");
                }
                Err(error @ SyncError::NotFound(_)) => {
                    if let Some(timer) = slot.pending_timer.take() {
                        self.timer.cancel(timer);
                    }
                    slot.pending = None;
                    let latest = slot.generation;
                    self.cache.remove(&key);
                    self.invalidate(&entity.kind);
                    invalidated = true;
                    resolution = Some((latest, MutationResolution::Removed { error }));
                }
                Err(error) if current => {
                    let restored = in_flight.previous_snapshot;
                    match &restored {
                        Some(previous) => self.cache.put(
                            key,
                            previous.clone(),
                            self.entity_ttl,
                            entity_groups(entity),
                        ),
                        None => {
                            self.cache.remove(&key);
                        }
                    }
                    warn!(%entity, token, error = %error, "mutation rolled back");
                    resolution = Some((token, MutationResolution::RolledBack { restored, error }));
                }
                Err(error) => {
                    debug!(%entity, token, error = %error, "superseded send failed, newer intent pending");
                }
            }

            if slot.is_idle() {
                state.slots.remove(entity);
            }
        }

        if let Some((token, resolution)) = resolution {
            let outcome = match &resolution {
                MutationResolution::Confirmed { .. } => "confirmed",
                MutationResolution::Removed { .. } => "removed",
                _ => "rolled_back",
            };
            metrics::counter!(telemetry::MUTATIONS_RESOLVED_TOTAL,
                "kind" => entity.kind.clone(),
                "outcome" => outcome,
            )
            .increment(1);
            self.publish_mutation(entity, token, resolution);
        }
        if invalidated {
            self.hub.publish(
                &topic::group(&entity.kind),
                &SyncEvent::Invalidated {
                    group: entity.kind.clone(),
                },
            );
        }
    }

    fn invalidate(&self, group: &str) {
        self.cache.invalidate_group(group);
        metrics::counter!(telemetry::CACHE_INVALIDATIONS_TOTAL, "group" => group.to_owned())
            .increment(1);
        if let Some(persistent) = &self.persistent
            && let Err(e) = persistent.invalidate_group(group)
        {
            warn!(group, error = %e, "failed to invalidate persisted entries");
        }
    }

    /// Publish on the entity topic, then on the entity's group topic.
    fn publish_mutation(&self, entity: &EntityRef, token: u64, resolution: MutationResolution) {
        let event = SyncEvent::Mutation(MutationEvent {
            entity: entity.clone(),
            token,
            resolution,
        });
        self.hub.publish(&topic::entity(entity), &event);
        self.hub.publish(&topic::group(&entity.kind), &event);
    }
}
