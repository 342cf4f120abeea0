//! # pubsub
//!
//! A small publish/subscribe broadcaster. Every subscriber owns a bounded
//! `mpsc` channel and a filter; [`PubSub::publish`] never blocks: if a
//! subscriber's channel is full the item is dropped for that subscriber.
//! The next publish supersedes whatever was missed.
use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
    filter: Filter<T>,
}

struct Inner<T> {
    subs: RwLock<Vec<Subscriber<T>>>,
    num_subscribers: AtomicUsize,
    next_id: AtomicU64,
}

/// Cheaply cloneable handle to a broadcaster of `T`
pub struct PubSub<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PubSub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for PubSub<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                subs: RwLock::new(Vec::new()),
                num_subscribers: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<T> fmt::Debug for PubSub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSub")
            .field("num_subscribers", &self.num_subscribers())
            .finish()
    }
}

impl<T> PubSub<T> {
    /// Current number of subscribers, read without taking the lock
    pub fn num_subscribers(&self) -> usize {
        self.inner.num_subscribers.load(Ordering::Acquire)
    }
}

impl<T> PubSub<T>
where
    T: Clone + Send + 'static,
{
    /// Create a broadcaster with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `item` to every subscriber whose filter accepts it. Returns the
    /// number of subscribers the item was handed to.
    pub fn publish(&self, item: T) -> usize {
        let subs = self.inner.subs.read();
        let mut delivered = 0;
        for sub in subs.iter().filter(|sub| (sub.filter)(&item)) {
            match sub.tx.try_send(item.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    trace!(subscriber = sub.id, "subscriber channel full, dropping item")
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(subscriber = sub.id, "subscriber channel closed")
                }
            }
        }
        delivered
    }

    /// Register `tx` to receive published items accepted by `filter`. The
    /// subscriber is removed once `done` resolves. Items published before this
    /// call returns are never delivered to `tx`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<D, F>(&self, tx: mpsc::Sender<T>, done: D, filter: F)
    where
        D: Future<Output = ()> + Send + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subs = self.inner.subs.write();
            subs.push(Subscriber {
                id,
                tx,
                filter: Box::new(filter),
            });
            self.inner.num_subscribers.fetch_add(1, Ordering::AcqRel);
        }
        debug!(subscriber = id, "subscribed");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            done.await;
            let mut subs = inner.subs.write();
            if let Some(pos) = subs.iter().position(|sub| sub.id == id) {
                subs.remove(pos);
                inner.num_subscribers.fetch_sub(1, Ordering::AcqRel);
                debug!(subscriber = id, "unsubscribed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;

    async fn wait_for_subscribers<T: Clone + Send + 'static>(bus: &PubSub<T>, n: usize) {
        for _ in 0..100 {
            if bus.num_subscribers() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} subscribers, have {}", bus.num_subscribers());
    }

    #[tokio::test]
    async fn publish_without_subscribers() {
        let bus = PubSub::<u32>::new();
        assert_eq!(bus.publish(1), 0);
        assert_eq!(bus.num_subscribers(), 0);
    }

    #[tokio::test]
    async fn filter_applies() {
        let bus = PubSub::<u32>::new();
        let (tx, mut rx) = mpsc::channel(10);
        let token = CancellationToken::new();
        bus.subscribe(tx, token.clone().cancelled_owned(), |n| n % 2 == 0);
        assert_eq!(bus.num_subscribers(), 1);

        bus.publish(1);
        bus.publish(2);
        bus.publish(3);
        bus.publish(4);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(4));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking() {
        let bus = PubSub::<u32>::new();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(10);
        let token = CancellationToken::new();
        bus.subscribe(slow_tx, token.clone().cancelled_owned(), |_| true);
        bus.subscribe(fast_tx, token.clone().cancelled_owned(), |_| true);

        assert_eq!(bus.publish(1), 2);
        // slow subscriber's buffer is full now
        assert_eq!(bus.publish(2), 1);
        assert_eq!(bus.publish(3), 1);

        assert_eq!(slow_rx.recv().await, Some(1));
        assert!(slow_rx.try_recv().is_err());
        for expected in 1..=3 {
            assert_eq!(fast_rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn done_removes_subscriber() {
        let bus = PubSub::<u32>::new();
        let (tx, mut rx) = mpsc::channel(10);
        let (other_tx, mut other_rx) = mpsc::channel(10);
        let token = CancellationToken::new();
        let other = CancellationToken::new();
        bus.subscribe(tx, token.clone().cancelled_owned(), |_| true);
        bus.subscribe(other_tx, other.clone().cancelled_owned(), |_| true);
        bus.publish(1);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(other_rx.recv().await, Some(1));

        token.cancel();
        wait_for_subscribers(&bus, 1).await;

        assert_eq!(bus.publish(2), 1);
        assert_eq!(other_rx.recv().await, Some(2));
        // the removed subscriber's sender was dropped with it
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn only_sees_items_after_subscribe() {
        let bus = PubSub::<u32>::new();
        bus.publish(1);
        let (tx, mut rx) = mpsc::channel(10);
        let token = CancellationToken::new();
        bus.subscribe(tx, token.clone().cancelled_owned(), |_| true);
        bus.publish(2);
        assert_eq!(rx.recv().await, Some(2));
    }
}
