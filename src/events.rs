//! Ordered observer lists for session and viewer events
//!
//! Subscribers are invoked synchronously, in registration order, on the
//! thread that raised the event. For hosts that prefer polling, `channel()`
//! registers a subscriber that forwards clones into a flume channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// Returns `false` once it no longer wants events
type Subscriber<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

struct Entry<E> {
    subscriber: Subscriber<E>,
    live: AtomicBool,
}

pub struct Observers<E> {
    subscribers: RwLock<Vec<Entry<E>>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> std::fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<E> Observers<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: impl Fn(&E) + Send + Sync + 'static) {
        self.subscribe_while(move |event| {
            subscriber(event);
            true
        });
    }

    /// Subscriber that is dropped the first time it returns `false`
    pub fn subscribe_while(&self, subscriber: impl Fn(&E) -> bool + Send + Sync + 'static) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry {
                subscriber: Box::new(subscriber),
                live: AtomicBool::new(true),
            });
    }

    /// Subscribers must not subscribe from inside a callback: the list is
    /// read-locked for the duration of delivery.
    pub fn emit(&self, event: &E) {
        let mut expired = false;
        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for entry in subscribers.iter() {
                if entry.live.load(Ordering::Acquire) && !(entry.subscriber)(event) {
                    entry.live.store(false, Ordering::Release);
                    expired = true;
                }
            }
        }
        if expired {
            self.subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|entry| entry.live.load(Ordering::Acquire));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone + Send + 'static> Observers<E> {
    /// Receiver that sees every event raised after this call
    pub fn channel(&self) -> flume::Receiver<E> {
        let (tx, rx) = flume::unbounded();
        self.subscribe_while(move |event: &E| tx.send(event.clone()).is_ok());
        rx
    }
}
