//! Collaborator traits supplied by the host application.
//!
//! The sync core is transport-agnostic and owns no I/O. A host plugs in:
//!
//! - a [`Transport`] that performs network calls and classifies failures,
//! - a [`PersistentStore`] for the few values that must outlive a session,
//! - a [`Clock`] and [`Timer`] for TTL bookkeeping and delayed work.
//!
//! [`TokioClock`](crate::runtime::TokioClock), [`MemoryStore`](crate::store::MemoryStore),
//! [`JsonFileStore`](crate::store::JsonFileStore) and (with the `http` feature)
//! [`HttpTransport`](crate::transport::HttpTransport) cover the common cases.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::Result;
use crate::types::Request;

/// Performs one network call.
///
/// Implementations must map every failure onto the
/// [`SyncError`](crate::SyncError) taxonomy; retry and rollback decisions
/// are made from the error kind alone.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "transport"
    }

    async fn perform(&self, request: &Request) -> Result<Value>;
}

/// Synchronous string key/value storage that survives the session.
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Source of monotonic time for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Opaque handle to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub(crate) u64);

/// Schedules delayed work that can be cancelled before it completes.
pub trait Timer: Send + Sync {
    /// Run `task` after `delay`.
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerToken;

    /// Cancel a scheduled task. Cancelling a finished or unknown token is a no-op.
    fn cancel(&self, token: TimerToken);
}
