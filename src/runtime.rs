//! Clock and timer implementations.
//!
//! [`TokioClock`] is the production pairing: `now()` reads
//! `tokio::time::Instant` (so paused test time applies) and scheduled tasks
//! are spawned on the captured runtime handle and aborted on cancel.
//! [`ManualClock`] is a hand-driven clock for synchronous cache tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::traits::{Clock, Timer, TimerToken};
use crate::{Result, SyncError};

/// Tokio-backed [`Clock`] and [`Timer`].
#[derive(Clone)]
pub struct TokioClock {
    handle: Handle,
    next_token: Arc<AtomicU64>,
    tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TokioClock {
    /// Bind to the runtime the caller is running in.
    ///
    /// Fails outside of a tokio runtime context.
    pub fn try_current() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            SyncError::Configuration(format!("no tokio runtime available: {e}"))
        })?;
        Ok(Self::from_handle(handle))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            next_token: Arc::new(AtomicU64::new(1)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of scheduled tasks that have neither finished nor been cancelled.
    pub fn scheduled(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

impl Timer for TokioClock {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerToken {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);

        // Hold the lock across spawn so the task cannot deregister itself
        // before it has been registered.
        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let join = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
            tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });
        guard.insert(id, join.abort_handle());
        trace!(token = id, delay_ms = delay.as_millis() as u64, "scheduled task");
        TimerToken(id)
    }

    fn cancel(&self, token: TimerToken) {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token.0);
        if let Some(handle) = removed {
            handle.abort();
            trace!(token = token.0, "cancelled task");
        }
    }
}

impl std::fmt::Debug for TokioClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioClock")
            .field("scheduled", &self.scheduled())
            .finish()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset_micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_micros: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let micros = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        self.offset_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + Duration::from_micros(self.offset_micros.load(Ordering::Relaxed))
    }
}
