//! Topic-based change broadcast.
//!
//! [`BroadcastHub`] fans a payload out to every subscriber of a topic,
//! synchronously and in subscription order. It is an owned value, not a
//! global bus: each [`SyncClient`](crate::SyncClient) carries its own hub and
//! hands out clones of it.
//!
//! # Delivery guarantees
//!
//! - A panicking subscriber is isolated; the remaining subscribers still run.
//! - [`Subscription::unsubscribe()`] is idempotent. Once it has returned, the
//!   callback is never invoked again, including by a `publish` that was
//!   already walking the subscriber list (deliver-then-remove, never
//!   deliver-after-remove).
//! - Callbacks run without any hub lock held, so they may publish, subscribe
//!   or unsubscribe re-entrantly.
//!
//! # Async consumers
//!
//! [`BroadcastHub::subscribe_stream()`] bridges a topic into a bounded
//! channel and returns a `Stream`. Publishing never blocks: when the buffer
//! is full the event is dropped for that stream and a warning is logged.

pub mod topic;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{trace, warn};

/// Default buffer size for [`BroadcastHub::subscribe_stream()`].
pub const DEFAULT_STREAM_BUFFER: usize = 64;

type Callback<E> = dyn Fn(&E) + Send + Sync;

struct Subscriber<E> {
    id: u64,
    active: AtomicBool,
    callback: Box<Callback<E>>,
}

struct HubInner<E> {
    channels: Mutex<HashMap<String, Vec<Arc<Subscriber<E>>>>>,
    next_id: AtomicU64,
}

/// Topic-based publish/subscribe fan-out.
///
/// Cloning is cheap and every clone shares the same channels.
pub struct BroadcastHub<E> {
    inner: Arc<HubInner<E>>,
}

impl<E> Clone for BroadcastHub<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: 'static> Default for BroadcastHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> BroadcastHub<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for `topic`.
    ///
    /// The channel is created on first subscribe. Keep the returned
    /// [`Subscription`]: dropping it unsubscribes.
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });

        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.clone())
            .or_default()
            .push(Arc::clone(&subscriber));
        trace!(%topic, subscriber = id, "subscribed");

        let weak_inner = Arc::downgrade(&self.inner);
        let weak_sub = Arc::downgrade(&subscriber);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(sub) = weak_sub.upgrade() {
                    sub.active.store(false, Ordering::SeqCst);
                }
                if let Some(inner) = weak_inner.upgrade() {
                    remove_subscriber(&inner, &topic, id);
                }
            })),
        }
    }

    /// Deliver `payload` to every current subscriber of `topic`.
    ///
    /// Returns the number of callbacks that were invoked.
    pub fn publish(&self, topic: &str, payload: &E) -> usize {
        let snapshot: Vec<Arc<Subscriber<E>>> = {
            let channels = self
                .inner
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match channels.get(topic) {
                Some(subs) => subs.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for sub in snapshot {
            if !sub.active.load(Ordering::SeqCst) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (sub.callback)(payload)));
            delivered += 1;
            if outcome.is_err() {
                warn!(topic, subscriber = sub.id, "subscriber panicked during delivery");
            }
        }
        delivered
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }
}

impl<E: Clone + Send + 'static> BroadcastHub<E> {
    /// Subscribe to `topic` as an async `Stream`.
    ///
    /// The stream ends when the returned [`Subscription`] is dropped.
    pub fn subscribe_stream(
        &self,
        topic: impl Into<String>,
        buffer: usize,
    ) -> (Subscription, Pin<Box<dyn Stream<Item = E> + Send>>) {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let label = topic.clone();
        let subscription = self.subscribe(topic, move |event: &E| {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                warn!(topic = %label, "stream subscriber lagging, event dropped");
            }
        });
        (subscription, Box::pin(ReceiverStream::new(rx)))
    }
}

fn remove_subscriber<E>(inner: &HubInner<E>, topic: &str, id: u64) {
    let mut channels = inner
        .channels
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(subs) = channels.get_mut(topic) {
        subs.retain(|s| s.id != id);
        if subs.is_empty() {
            channels.remove(topic);
        }
    }
    trace!(topic, subscriber = id, "unsubscribed");
}

/// Handle returned by [`BroadcastHub::subscribe()`].
///
/// Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Stop delivery to this subscriber. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }

    pub fn is_active(&self) -> bool {
        self.detach.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn channel_removed_with_last_subscriber() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        let mut a = hub.subscribe("t", |_| {});
        let b = hub.subscribe("t", |_| {});
        assert_eq!(hub.subscriber_count("t"), 2);
        a.unsubscribe();
        assert_eq!(hub.topic_count(), 1);
        drop(b);
        assert_eq!(hub.topic_count(), 0);
    }

    #[test]
    fn subscription_outliving_hub_is_harmless() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        let mut sub = hub.subscribe("t", |_| {});
        drop(hub);
        sub.unsubscribe();
        assert!(!sub.is_active());
    }

    #[test]
    fn reentrant_publish_from_callback() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner_hub = hub.clone();
        let _outer = hub.subscribe("outer", move |v: &u32| {
            inner_hub.publish("inner", &(v + 1));
        });
        let sink = Arc::clone(&seen);
        let _inner = hub.subscribe("inner", move |v: &u32| sink.lock().unwrap().push(*v));

        hub.publish("outer", &1);
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }
}
