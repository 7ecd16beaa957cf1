//! Latest-value fan-out of session snapshots to subscribers.
//!
//! Each subscriber owns a one-slot mailbox.  Publishing overwrites the slot,
//! so a slow subscriber skips intermediate values but always ends up at the
//! newest one, and never sees an older value after a newer one.  A new
//! subscriber receives the most recent value immediately.
//!
//! The subscriber registry lock is held only long enough to copy the list of
//! mailboxes.  Delivery happens outside it, which makes it safe for a
//! callback subscriber to unsubscribe itself (or subscribe someone else)
//! from inside its own callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::stream::{self, Stream};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Identifies one subscription.
pub type SubscriberId = Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Mailbox<T> {
    slot: Mutex<Option<Arc<T>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> Mailbox<T> {
    fn new(initial: Option<Arc<T>>) -> Self {
        Self {
            slot: Mutex::new(initial),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn put(&self, value: Arc<T>) {
        *lock(&self.slot) = Some(value);
        self.notify.notify_one();
    }

    fn take(&self) -> Option<Arc<T>> {
        lock(&self.slot).take()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn recv(&self) -> Option<Arc<T>> {
        loop {
            if let Some(value) = self.take() {
                return Some(value);
            }
            if self.is_closed() {
                return None;
            }
            // `notify_one` stores a permit when nobody is waiting, so a value
            // published between `take` and here still wakes us.
            self.notify.notified().await;
        }
    }
}

struct Registry<T> {
    subscribers: Mutex<HashMap<SubscriberId, Arc<Mailbox<T>>>>,
    latest: Mutex<Option<Arc<T>>>,
}

impl<T> Registry<T> {
    fn remove(&self, id: &SubscriberId) -> bool {
        let removed = lock(&self.subscribers).remove(id);
        match removed {
            Some(mailbox) => {
                mailbox.close();
                true
            }
            None => false,
        }
    }
}

/// Broadcasts values of `T` to any number of subscribers.
///
/// Cloning yields another handle to the same registry.
pub struct EventBroadcaster<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for EventBroadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: Send + Sync + 'static> Default for EventBroadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> EventBroadcaster<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: Mutex::new(HashMap::new()),
                latest: Mutex::new(None),
            }),
        }
    }

    /// Registers a pull-based subscriber.  The most recent value, if any, is
    /// waiting in its mailbox already.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = Uuid::new_v4();
        let mailbox = {
            // Take `latest` under the registry lock so a concurrent publish
            // cannot slip between the snapshot and the registration.
            let mut subscribers = lock(&self.registry.subscribers);
            let latest = lock(&self.registry.latest).clone();
            let mailbox = Arc::new(Mailbox::new(latest));
            subscribers.insert(id, Arc::clone(&mailbox));
            mailbox
        };
        debug!(subscriber = %id, "subscriber registered");
        Subscription {
            id,
            mailbox,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Registers a callback subscriber.
    ///
    /// The callback runs on its own task, one value at a time, and receives
    /// its subscription id so it can unsubscribe itself.
    pub fn subscribe_with<F>(&self, mut callback: F) -> SubscriberId
    where
        F: FnMut(SubscriberId, Arc<T>) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let id = subscription.id();
        tokio::spawn(async move {
            while let Some(value) = subscription.recv().await {
                callback(id, value);
            }
        });
        id
    }

    /// Publishes `value` to every current subscriber.
    pub fn publish(&self, value: Arc<T>) {
        let mailboxes: Vec<Arc<Mailbox<T>>> = {
            let subscribers = lock(&self.registry.subscribers);
            *lock(&self.registry.latest) = Some(Arc::clone(&value));
            subscribers.values().cloned().collect()
        };
        for mailbox in mailboxes {
            mailbox.put(Arc::clone(&value));
        }
    }

    /// Removes a subscriber.  Its pending `recv` returns `None`.
    /// Returns `false` if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.registry.remove(&id);
        if removed {
            debug!(subscriber = %id, "subscriber removed");
        }
        removed
    }

    /// Removes every subscriber.  Used at daemon shutdown.
    pub fn close(&self) {
        let drained: Vec<Arc<Mailbox<T>>> = lock(&self.registry.subscribers)
            .drain()
            .map(|(_, mailbox)| mailbox)
            .collect();
        debug!(count = drained.len(), "closing all subscriptions");
        for mailbox in drained {
            mailbox.close();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry.subscribers).len()
    }

    /// The most recently published value.
    pub fn latest(&self) -> Option<Arc<T>> {
        lock(&self.registry.latest).clone()
    }
}

/// Pull side of a subscription.  Dropping it unsubscribes.
pub struct Subscription<T> {
    id: SubscriberId,
    mailbox: Arc<Mailbox<T>>,
    registry: Weak<Registry<T>>,
}

impl<T: Send + Sync + 'static> Subscription<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next value.  Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        self.mailbox.recv().await
    }

    /// Returns a value if one is waiting, without blocking.
    pub fn try_recv(&mut self) -> Option<Arc<T>> {
        self.mailbox.take()
    }

    /// Turns the subscription into a `Stream` of values.
    pub fn into_stream(self) -> impl Stream<Item = Arc<T>> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|value| (value, subscription))
        })
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_new_subscriber_receives_latest_value_immediately() {
        // Arrange
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish(Arc::new(1u32));
        broadcaster.publish(Arc::new(2u32));

        // Act
        let mut sub = broadcaster.subscribe();

        // Assert
        assert_eq!(sub.try_recv().as_deref(), Some(&2));
    }

    #[tokio::test]
    async fn test_subscriber_before_first_publish_waits() {
        let broadcaster = EventBroadcaster::<u32>::new();
        let mut sub = broadcaster.subscribe();
        assert!(sub.try_recv().is_none());

        broadcaster.publish(Arc::new(5));

        assert_eq!(sub.recv().await.as_deref(), Some(&5));
    }

    #[tokio::test]
    async fn test_slow_subscriber_skips_to_newest_value() {
        // Arrange
        let broadcaster = EventBroadcaster::new();
        let mut sub = broadcaster.subscribe();

        // Act
        for i in 1..=10u32 {
            broadcaster.publish(Arc::new(i));
        }

        // Assert
        assert_eq!(sub.recv().await.as_deref(), Some(&10));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_values_never_go_backwards() {
        let broadcaster = EventBroadcaster::new();
        let mut sub = broadcaster.subscribe();
        let publisher = broadcaster.clone();

        let producer = tokio::spawn(async move {
            for i in 1..=200u32 {
                publisher.publish(Arc::new(i));
                tokio::task::yield_now().await;
            }
        });

        let mut last = 0;
        while last < 200 {
            let value = *sub.recv().await.unwrap();
            assert!(value > last, "received {value} after {last}");
            last = value;
        }
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_recv() {
        let broadcaster = EventBroadcaster::<u32>::new();
        let mut sub = broadcaster.subscribe();

        assert!(broadcaster.unsubscribe(sub.id()));

        assert_eq!(sub.recv().await, None);
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert!(!broadcaster.unsubscribe(sub.id()));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broadcaster = EventBroadcaster::<u32>::new();
        let sub = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        drop(sub);

        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_may_unsubscribe_itself_during_delivery() {
        // Arrange
        let broadcaster = EventBroadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let inner = broadcaster.clone();

        // Act
        broadcaster.subscribe_with(move |id, value: Arc<u32>| {
            inner.unsubscribe(id);
            let _ = tx.send(*value);
        });
        broadcaster.publish(Arc::new(1));

        // Assert
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(broadcaster.subscriber_count(), 0);
        broadcaster.publish(Arc::new(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rx.recv().await, None, "no delivery after unsubscribe");
    }

    #[tokio::test]
    async fn test_close_ends_every_subscription() {
        let broadcaster = EventBroadcaster::<u32>::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.close();

        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish(Arc::new("first"));
        let mut stream = Box::pin(broadcaster.subscribe().into_stream());

        assert_eq!(stream.next().await.as_deref(), Some(&"first"));
        broadcaster.close();
        assert_eq!(stream.next().await, None);
    }
}
