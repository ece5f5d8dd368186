//! Broadcast payloads

use serde_json::Value;

use super::{AttemptRecord, EntityRef, FetchCandidate};
use crate::SyncError;

/// Everything the sync core publishes on the [`BroadcastHub`](crate::BroadcastHub).
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Every cache entry tagged with `group` was dropped.
    Invalidated { group: String },
    Mutation(MutationEvent),
    Fetch(FetchEvent),
}

/// Progress of an optimistic mutation for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent {
    pub entity: EntityRef,
    /// Attempt token of the intent this event belongs to.
    pub token: u64,
    pub resolution: MutationResolution,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationResolution {
    /// Applied locally, not yet confirmed by the server.
    Optimistic { value: Value },
    /// Server accepted the change; `value` is its canonical state.
    Confirmed { value: Value },
    /// Server rejected the change; local state went back to `restored`.
    RolledBack {
        restored: Option<Value>,
        error: SyncError,
    },
    /// The entity no longer exists on the server.
    Removed { error: SyncError },
}

impl MutationResolution {
    /// Whether this event ends the mutation's lifecycle.
    pub fn is_final(&self) -> bool {
        !matches!(self, MutationResolution::Optimistic { .. })
    }
}

/// Lifecycle of a resilient fetch session.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Attempting {
        session: u64,
        candidate: FetchCandidate,
        retry: u32,
    },
    Ready {
        session: u64,
        candidate: FetchCandidate,
        value: Value,
    },
    Exhausted {
        session: u64,
        history: Vec<AttemptRecord>,
    },
}

impl FetchEvent {
    pub fn session(&self) -> u64 {
        match self {
            FetchEvent::Attempting { session, .. }
            | FetchEvent::Ready { session, .. }
            | FetchEvent::Exhausted { session, .. } => *session,
        }
    }
}
