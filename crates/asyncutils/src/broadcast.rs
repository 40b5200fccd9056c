use futures::Stream;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use pin_project_lite::pin_project;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

struct Shared<T> {
    value: T,
    subscribers: Vec<UnboundedSender<T>>,
}

/// Last-value cell with an explicit list of subscribers.
///
/// Cloning a `Broadcast` yields another handle to the same cell. Reading
/// ([`get`](Self::get)) never waits on subscribers, and publishing never
/// waits either: each subscriber has its own unbounded queue, so values
/// are delivered to every subscriber in the exact order they were
/// published, without coalescing.
///
/// ```
/// use futures::StreamExt;
/// use melo_asyncutils::Broadcast;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cell = Broadcast::new(1);
/// let mut subscription = cell.subscribe();
/// cell.publish(2);
/// assert_eq!(subscription.next().await, Some(1));
/// assert_eq!(subscription.next().await, Some(2));
/// assert_eq!(cell.get(), 2);
/// # }
/// ```
pub struct Broadcast<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Debug> Debug for Broadcast<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let shared = self.lock();
        f.debug_struct("Broadcast")
            .field("value", &shared.value)
            .field("subscribers", &shared.subscribers.len())
            .finish()
    }
}

impl<T> Broadcast<T> {
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared { value, subscribers: Vec::new() })),
        }
    }

    // A panicking subscriber must not wedge every other reader of the cell.
    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live subscriptions. Subscriptions that were dropped are
    /// only noticed on the next publish.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.iter().filter(|s| !s.is_closed()).count()
    }

    /// Weak handle that does not keep the cell alive.
    pub fn downgrade(&self) -> WeakBroadcast<T> {
        WeakBroadcast { shared: Arc::downgrade(&self.shared) }
    }

    /// Whether both handles point at the same cell.
    pub fn same_cell(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T: Clone> Broadcast<T> {
    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// Replace the current value and deliver it to every subscriber.
    pub fn publish(&self, value: T) {
        let mut shared = self.lock();
        Self::publish_locked(&mut shared, value);
    }

    /// Atomically inspect the current value and optionally replace it.
    ///
    /// The closure runs under the cell's lock; returning `Some` publishes
    /// the new value. Returns whether a value was published.
    pub fn update(&self, f: impl FnOnce(&T) -> Option<T>) -> bool {
        let mut shared = self.lock();
        match f(&shared.value) {
            Some(value) => {
                Self::publish_locked(&mut shared, value);
                true
            },
            None => false,
        }
    }

    fn publish_locked(shared: &mut Shared<T>, value: T) {
        shared.subscribers.retain(|s| s.unbounded_send(value.clone()).is_ok());
        shared.value = value;
    }

    /// Subscribe to the cell. The current value is queued first.
    pub fn subscribe(&self) -> Subscription<T> {
        let (sender, receiver) = unbounded();
        let mut shared = self.lock();
        // Cannot fail: the receiver is still in scope.
        let _ = sender.unbounded_send(shared.value.clone());
        shared.subscribers.push(sender);
        Subscription { receiver, _cell: self.clone() }
    }
}

/// Non-owning handle to a [`Broadcast`] cell.
pub struct WeakBroadcast<T> {
    shared: Weak<Mutex<Shared<T>>>,
}

impl<T> Clone for WeakBroadcast<T> {
    fn clone(&self) -> Self {
        Self { shared: Weak::clone(&self.shared) }
    }
}

impl<T> WeakBroadcast<T> {
    pub fn upgrade(&self) -> Option<Broadcast<T>> {
        self.shared.upgrade().map(|shared| Broadcast { shared })
    }

    pub fn is_dropped(&self) -> bool {
        self.shared.strong_count() == 0
    }
}

pin_project! {
    /// Ordered stream of the values published to a [`Broadcast`].
    ///
    /// Holds the cell alive for as long as the subscription exists. The
    /// stream only ends if the cell is dropped, which cannot happen while a
    /// subscription exists, so in practice it never ends.
    #[must_use = "streams do nothing unless polled"]
    pub struct Subscription<T> {
        #[pin]
        receiver: UnboundedReceiver<T>,
        _cell: Broadcast<T>,
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().receiver.poll_next(cx)
    }
}

impl<T> Subscription<T> {
    /// Wait until a value matching `predicate` arrives, skipping the rest.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        use futures::StreamExt;
        while let Some(value) = self.next().await {
            if predicate(&value) {
                return Some(value);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_new_subscriber_receives_latest_value_first() {
        let cell = Broadcast::new("a");
        cell.publish("b");
        let mut subscription = cell.subscribe();
        assert_eq!(subscription.next().await, Some("b"));
    }

    #[tokio::test]
    async fn test_values_are_delivered_in_order_without_coalescing() {
        let cell = Broadcast::new(0);
        let mut first = cell.subscribe();
        let mut second = cell.subscribe();
        for value in 1..=3 {
            cell.publish(value);
        }
        let first: Vec<_> = (&mut first).take(4).collect().await;
        let second: Vec<_> = (&mut second).take(4).collect().await;
        assert_eq!(first, vec![0, 1, 2, 3]);
        assert_eq!(second, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let cell = Broadcast::new(0);
        let subscription = cell.subscribe();
        let _kept = cell.subscribe();
        assert_eq!(cell.subscriber_count(), 2);
        drop(subscription);
        cell.publish(1);
        assert_eq!(cell.subscriber_count(), 1);
    }

    #[test]
    fn test_update_is_conditional() {
        let cell = Broadcast::new(1);
        assert!(!cell.update(|v| (*v == 2).then_some(3)));
        assert_eq!(cell.get(), 1);
        assert!(cell.update(|v| (*v == 1).then_some(3)));
        assert_eq!(cell.get(), 3);
    }

    #[test]
    fn test_weak_handle_does_not_keep_cell_alive() {
        let cell = Broadcast::new(());
        let weak = cell.downgrade();
        assert!(weak.upgrade().is_some_and(|c| c.same_cell(&cell)));
        drop(cell);
        assert!(weak.upgrade().is_none());
        assert!(weak.is_dropped());
    }

    #[test]
    fn test_subscription_keeps_cell_alive() {
        let cell = Broadcast::new(());
        let weak = cell.downgrade();
        let subscription = cell.subscribe();
        drop(cell);
        assert!(weak.upgrade().is_some());
        drop(subscription);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_skips_non_matching_values() {
        let cell = Broadcast::new(0);
        let mut subscription = cell.subscribe();
        cell.publish(1);
        cell.publish(2);
        assert_eq!(subscription.wait_for(|v| *v >= 2).await, Some(2));
    }
}
