//! Observer infrastructure shared by the dispatcher and the store.
//!
//! `EventBus<E>` delivers events synchronously to every subscriber. A
//! subscriber that panics is logged and skipped; the remaining subscribers
//! still receive the event and the publisher's own state is untouched.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::warn;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription<E: 'static> {
    bus: Weak<EventBus<E>>,
    id: usize,
}

impl<E: 'static> Subscription<E> {
    /// Whether the bus still delivers to this subscription.
    pub fn is_active(&self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.contains(self.id))
    }
}

impl<E: 'static> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E: 'static> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        let removed = {
            let mut guard = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
            guard
                .iter()
                .position(|(i, _)| *i == id)
                .map(|index| guard.remove(index))
        };
        // Dropped outside the lock: a callback may own a Subscription of its own.
        drop(removed);
    }

    fn contains(&self, id: usize) -> bool {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|(i, _)| *i == id)
    }

    /// Drop every subscriber. Outstanding `Subscription`s become inert.
    pub fn unsubscribe_all(&self) {
        let removed = std::mem::take(
            &mut *self.callbacks.write().unwrap_or_else(|e| e.into_inner()),
        );
        drop(removed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns the number of subscribers that panicked.
    pub fn emit(&self, event: &E) -> usize {
        // Clone the callback list so a callback may subscribe or unsubscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        let mut failures = 0;
        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!("Subscriber {} panicked while handling an event", id);
                failures += 1;
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Ping(u32);

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::<Ping>::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |ping| {
            count_clone.fetch_add(ping.0 as usize, Ordering::Relaxed);
        });

        bus.emit(&Ping(3));

        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::<Ping>::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(&Ping(1));
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(&Ping(2));

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = Arc::new(EventBus::<Ping>::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _bad = bus.subscribe(|_| panic!("subscriber failure"));
        let _good = bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(bus.emit(&Ping(1)), 1);
        assert_eq!(bus.emit(&Ping(2)), 1);

        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unsubscribe_all() {
        let bus = Arc::new(EventBus::<Ping>::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let sub = bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        assert!(sub.is_active());

        bus.unsubscribe_all();
        bus.emit(&Ping(1));

        assert!(!sub.is_active());
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_drop_while_other_thread_emits() {
        let bus = Arc::new(EventBus::<Ping>::new());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let emitter = {
            let bus = Arc::clone(&bus);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    bus.emit(&Ping(0));
                    let _ = bus.subscriber_count();
                }
            })
        };

        for _ in 0..20_000 {
            let sub = bus.subscribe(|_| {});
            drop(sub);
        }

        stop.store(true, Ordering::Relaxed);
        emitter.join().unwrap();

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_owning_subscription_can_be_cleared() {
        let bus = Arc::new(EventBus::<Ping>::new());
        let inner = bus.subscribe(|_| {});
        let _outer = bus.subscribe(move |_| {
            let _ = inner.is_active();
        });
        assert_eq!(bus.subscriber_count(), 2);

        bus.unsubscribe_all();

        assert_eq!(bus.subscriber_count(), 0);
    }
}
