//! # Event Subscriptions
//!
//! A small synchronous publish/subscribe channel. Subscribing returns a
//! [`Subscription`] handle; dropping the handle (or calling
//! [`Subscription::unsubscribe`]) removes the callback, so tests and
//! consumers can detach deterministically.
//!
//! Callbacks run on the publishing thread. A panicking subscriber is
//! logged and skipped; it never reaches the publisher.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::RwLock;
use tracing::warn;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct BusInner<E> {
    name: &'static str,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(u64, Callback<E>)>>,
}

/// A broadcast channel for events of type `E`
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E: 'static> EventBus<E> {
    /// Creates a bus; the name shows up in logs when a subscriber panics
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name,
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Registers a callback and returns the handle that keeps it alive
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((id, Arc::new(callback)));

        let weak: Weak<BusInner<E>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            bus: self.inner.name,
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribers.write().retain(|(sub_id, _)| *sub_id != id);
                }
            })),
        }
    }

    /// Delivers an event to every current subscriber, returns how many were called
    pub fn publish(&self, event: &E) -> usize {
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking
        let callbacks: Vec<Callback<E>> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(bus = %self.inner.name, "Event subscriber panicked; event skipped for it");
            }
        }

        callbacks.len()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.inner.name)
            .field("subscribers", &self.inner.subscribers.read().len())
            .finish()
    }
}

/// Disposable handle for a registered callback
pub struct Subscription {
    id: u64,
    bus: &'static str,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the callback from its bus
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("bus", &self.bus)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_reaches_subscribers() {
        let bus: EventBus<u32> = EventBus::new("test");
        let total = Arc::new(AtomicUsize::new(0));

        let total_clone = total.clone();
        let _sub = bus.subscribe(move |value| {
            total_clone.fetch_add(*value as usize, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&3), 1);
        assert_eq!(bus.publish(&4), 1);
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_unsubscribe_and_drop() {
        let bus: EventBus<()> = EventBus::new("test");
        let first = bus.subscribe(|_| {});
        let second = bus.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 2);

        first.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(second);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(&()), 0);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus: EventBus<&'static str> = EventBus::new("test");
        let calls = Arc::new(AtomicUsize::new(0));

        let _bad = bus.subscribe(|_| panic!("subscriber failure"));
        let calls_clone = calls.clone();
        let _good = bus.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&"event"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus: EventBus<u8> = EventBus::new("test");
        let sub = bus.subscribe(|_| {});
        drop(bus);
        sub.unsubscribe();
    }
}
