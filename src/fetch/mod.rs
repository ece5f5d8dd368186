//! Resilient resource loading across ordered candidate sources.
//!
//! A [`FetchSession`] walks an ordered list of [`FetchCandidate`]s. Each
//! candidate gets a bounded retry budget with exponential backoff; when the
//! budget runs out the session fails over to the next candidate at once.
//! Worst-case latency is therefore bounded by `candidates × retries`
//! backoff sums (see [`FetchConfig::worst_case_backoff()`]).
//!
//! # State machine
//!
//! ```text
//!  Idle ──start──► Attempting ──ok──────────────► Ready
//!                    │  ▲
//!          transient │  │ backoff elapsed (same candidate)
//!                    ▼  │
//!                  (waiting) ──budget spent──► Attempting (next candidate)
//!                    │
//!                    └──last candidate spent──► Exhausted
//!
//!  any state ──cancel()──► Cancelled (inert, no further events)
//! ```
//!
//! Every transition that matters to the UI is broadcast on
//! [`topic::fetch(session)`](crate::hub::topic::fetch): one
//! [`FetchEvent::Attempting`] per attempt, then exactly one terminal
//! [`FetchEvent::Ready`] or [`FetchEvent::Exhausted`] unless the session was
//! cancelled first.

mod policy;

pub use policy::FetchConfig;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::{Either, select};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, instrument, warn};

use self::policy::{Next, next_step};
use crate::hub::{BroadcastHub, Subscription, topic};
use crate::telemetry;
use crate::traits::{Timer, TimerToken, Transport};
use crate::types::{AttemptRecord, FetchCandidate, FetchEvent, FetchState, Request, SyncEvent};
use crate::{Result, SyncError};

/// Terminal result of a fetch session.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ready {
        candidate: FetchCandidate,
        value: Value,
    },
    Exhausted {
        history: Vec<AttemptRecord>,
    },
    Cancelled,
}

/// Starts resilient loads. One fetcher serves any number of sessions.
pub struct ResilientFetcher {
    transport: Arc<dyn Transport>,
    hub: BroadcastHub<SyncEvent>,
    timer: Arc<dyn Timer>,
    config: FetchConfig,
    next_session: AtomicU64,
}

impl ResilientFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        hub: BroadcastHub<SyncEvent>,
        timer: Arc<dyn Timer>,
        config: FetchConfig,
    ) -> Self {
        Self {
            transport,
            hub,
            timer,
            config,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Start a session with the fetcher's default config unless `options` is given.
    pub fn start(
        &self,
        candidates: Vec<FetchCandidate>,
        options: Option<FetchConfig>,
    ) -> FetchSession {
        self.launch(candidates, options, None::<fn(&SyncEvent)>)
    }

    /// Like [`start()`](Self::start), with `observer` subscribed to the
    /// session topic before the first attempt so no event can be missed.
    ///
    /// The observer stays subscribed for as long as the returned session
    /// handle lives.
    pub fn start_observed<F>(
        &self,
        candidates: Vec<FetchCandidate>,
        options: Option<FetchConfig>,
        observer: F,
    ) -> FetchSession
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.launch(candidates, options, Some(observer))
    }

    fn launch<F>(
        &self,
        mut candidates: Vec<FetchCandidate>,
        options: Option<FetchConfig>,
        observer: Option<F>,
    ) -> FetchSession
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        candidates.sort_by_key(|c| c.order);
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let topic = topic::fetch(id);
        let subscription = observer.map(|f| self.hub.subscribe(topic.clone(), f));

        let (state_tx, state_rx) = watch::channel(FetchState::Idle);
        let shared = Arc::new(SessionShared {
            id,
            topic,
            state: state_tx,
            inner: Mutex::new(SessionInner::default()),
            timer: Arc::clone(&self.timer),
        });

        let driver = SessionDriver {
            shared: Arc::clone(&shared),
            transport: Arc::clone(&self.transport),
            hub: self.hub.clone(),
            config: options.unwrap_or_else(|| self.config.clone()),
            candidates,
            generation: 0,
        };
        let token = self
            .timer
            .schedule(Duration::ZERO, Box::pin(driver.run()));
        shared.lock().token = Some(token);

        FetchSession {
            shared,
            state: state_rx,
            _subscription: subscription,
        }
    }
}

#[derive(Default)]
struct SessionInner {
    generation: u64,
    current_index: usize,
    retry_count_at_current: u32,
    history: Vec<AttemptRecord>,
    outcome: Option<FetchOutcome>,
    /// The driver task.
    token: Option<TimerToken>,
    /// Armed backoff delay, if the driver is waiting out one.
    backoff: Option<TimerToken>,
}

struct SessionShared {
    id: u64,
    topic: String,
    state: watch::Sender<FetchState>,
    inner: Mutex<SessionInner>,
    timer: Arc<dyn Timer>,
}

impl SessionShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the terminal outcome if `generation` is still current.
    fn finish(&self, generation: u64, state: FetchState, outcome: FetchOutcome) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || inner.outcome.is_some() {
            return false;
        }
        inner.outcome = Some(outcome);
        inner.token = None;
        inner.backoff = None;
        drop(inner);
        self.state.send_replace(state);
        true
    }
}

/// Handle to a running (or finished) resilient load.
pub struct FetchSession {
    shared: Arc<SessionShared>,
    state: watch::Receiver<FetchState>,
    _subscription: Option<Subscription>,
}

impl FetchSession {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Topic the session's lifecycle events are published on.
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn state(&self) -> FetchState {
        *self.state.borrow()
    }

    /// Index of the candidate currently (or last) attempted.
    pub fn current_index(&self) -> usize {
        self.shared.lock().current_index
    }

    pub fn retry_count_at_current(&self) -> u32 {
        self.shared.lock().retry_count_at_current
    }

    /// Per-candidate failure records so far.
    pub fn history(&self) -> Vec<AttemptRecord> {
        self.shared.lock().history.clone()
    }

    pub fn outcome(&self) -> Option<FetchOutcome> {
        self.shared.lock().outcome.clone()
    }

    /// Stop the session. Pending backoff timers are cancelled and any
    /// response still in flight is discarded when it arrives.
    pub fn cancel(&self) {
        let tokens = {
            let mut inner = self.shared.lock();
            if inner.outcome.is_some() {
                return;
            }
            inner.generation += 1;
            inner.outcome = Some(FetchOutcome::Cancelled);
            [inner.backoff.take(), inner.token.take()]
        };
        for token in tokens.into_iter().flatten() {
            self.shared.timer.cancel(token);
        }
        self.shared.state.send_replace(FetchState::Cancelled);
        debug!(session = self.shared.id, "fetch session cancelled");
    }

    /// Wait for the session to reach a terminal state.
    pub async fn wait(&self) -> FetchOutcome {
        let mut state = self.state.clone();
        // The sender lives in `shared`, which `self` keeps alive.
        let _ = state.wait_for(|s| s.is_terminal()).await;
        self.outcome().unwrap_or(FetchOutcome::Cancelled)
    }
}

impl std::fmt::Debug for FetchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchSession")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

struct SessionDriver {
    shared: Arc<SessionShared>,
    transport: Arc<dyn Transport>,
    hub: BroadcastHub<SyncEvent>,
    config: FetchConfig,
    candidates: Vec<FetchCandidate>,
    generation: u64,
}

impl SessionDriver {
    fn is_current(&self) -> bool {
        let inner = self.shared.lock();
        inner.generation == self.generation && inner.outcome.is_none()
    }

    #[instrument(skip(self), fields(session = self.shared.id, candidates = self.candidates.len()))]
    async fn run(self) {
        if !self.is_current() {
            return;
        }
        self.shared.state.send_replace(FetchState::Attempting);

        let mut history = Vec::new();
        for (index, candidate) in self.candidates.iter().enumerate() {
            if index > 0 {
                metrics::counter!(telemetry::FETCH_FAILOVERS_TOTAL).increment(1);
                debug!(source = %candidate.source_ref, "failing over to next candidate");
            }

            let mut retry = 0;
            let step = loop {
                if !self.is_current() {
                    return;
                }
                {
                    let mut inner = self.shared.lock();
                    inner.current_index = index;
                    inner.retry_count_at_current = retry;
                }
                self.publish(FetchEvent::Attempting {
                    session: self.shared.id,
                    candidate: candidate.clone(),
                    retry,
                });
                metrics::counter!(telemetry::FETCH_ATTEMPTS_TOTAL).increment(1);

                let result = self.attempt(candidate).await;
                if !self.is_current() {
                    debug!(source = %candidate.source_ref, "discarding stale fetch result");
                    return;
                }

                let error = match result {
                    Ok(value) => {
                        self.resolve_ready(candidate, value);
                        return;
                    }
                    Err(e) => e,
                };

                match next_step(&self.config, &error, retry) {
                    Next::Retry(delay) => {
                        metrics::counter!(telemetry::FETCH_RETRIES_TOTAL, "error" => error.kind())
                            .increment(1);
                        warn!(
                            source = %candidate.source_ref,
                            retry = retry + 1,
                            max_retries = self.config.max_retries_per_candidate,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retrying fetch candidate after transient error"
                        );
                        self.backoff(delay).await;
                        retry += 1;
                    }
                    step => {
                        history.push(AttemptRecord {
                            candidate: candidate.clone(),
                            retries: retry,
                            last_error: error,
                        });
                        self.shared.lock().history.clone_from(&history);
                        break step;
                    }
                }
            };

            if step == Next::Abort {
                warn!(source = %candidate.source_ref, "fetch aborted on non-retryable error");
                break;
            }
        }

        self.resolve_exhausted(history);
    }

    /// Wait out a retry delay on the session timer. Returns early if the
    /// delay is cancelled; the caller re-checks the generation either way.
    async fn backoff(&self, delay: Duration) {
        let (token, elapsed) = arm(self.shared.timer.as_ref(), delay);
        self.shared.lock().backoff = Some(token);
        let _ = elapsed.await;
        self.shared.lock().backoff = None;
    }

    async fn attempt(&self, candidate: &FetchCandidate) -> Result<Value> {
        let request = Request::Fetch {
            source: candidate.source_ref.clone(),
        };
        let perform = self.transport.perform(&request);
        let result = match self.config.attempt_timeout {
            Some(limit) => {
                let timer = self.shared.timer.as_ref();
                let (token, expired) = arm(timer, limit);
                match select(perform, expired).await {
                    Either::Left((result, _)) => {
                        timer.cancel(token);
                        result
                    }
                    Either::Right((Ok(()), _)) => Err(SyncError::Timeout),
                    // Timer dropped the task without firing: no limit to enforce.
                    Either::Right((Err(_), perform)) => perform.await,
                }
            }
            None => perform.await,
        };
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::TRANSPORT_REQUESTS_TOTAL,
            "request" => "fetch",
            "status" => status,
        )
        .increment(1);
        result
    }

    fn resolve_ready(&self, candidate: &FetchCandidate, value: Value) {
        let outcome = FetchOutcome::Ready {
            candidate: candidate.clone(),
            value: value.clone(),
        };
        if self
            .shared
            .finish(self.generation, FetchState::Ready, outcome)
        {
            debug!(source = %candidate.source_ref, "fetch ready");
            self.publish(FetchEvent::Ready {
                session: self.shared.id,
                candidate: candidate.clone(),
                value,
            });
        }
    }

    fn resolve_exhausted(&self, history: Vec<AttemptRecord>) {
        let outcome = FetchOutcome::Exhausted {
            history: history.clone(),
        };
        if self
            .shared
            .finish(self.generation, FetchState::Exhausted, outcome)
        {
            warn!(candidates = self.candidates.len(), "all fetch candidates exhausted");
            self.publish(FetchEvent::Exhausted {
                session: self.shared.id,
                history,
            });
        }
    }

    fn publish(&self, event: FetchEvent) {
        self.hub.publish(&self.shared.topic, &SyncEvent::Fetch(event));
    }
}

/// Schedule a one-shot signal on `timer` after `delay`.
fn arm(timer: &dyn Timer, delay: Duration) -> (TimerToken, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let token = timer.schedule(
        delay,
        Box::pin(async move {
            let _ = tx.send(());
        }),
    );
    (token, rx)
}
