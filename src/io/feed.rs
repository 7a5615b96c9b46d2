// src/io/feed.rs
//
// Single-producer, multi-consumer fan-out.
// Every subscriber present at publish time receives every item exactly once,
// in publish order. Each subscriber has its own bounded queue: `publish` waits
// while any subscriber's queue is full, so a slow consumer stalls the producer
// instead of losing items. Close and fault events never wait.

use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};

/// Items a subscriber may have queued before `publish` waits for it
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Event delivered to a subscriber
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedEvent<T> {
    Item(T),
    /// The producer was closed. Pending one-shot readers should give up;
    /// durable subscribers keep listening (the producer may reopen).
    Closed,
    /// The producer failed for good. Always the last event a subscriber sees.
    Faulted(String),
}

struct Subscriber<T> {
    tx: mpsc::UnboundedSender<FeedEvent<T>>,
    /// One permit per free queue slot
    credit: Arc<Semaphore>,
}

struct FeedState<T> {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber<T>>,
    faulted: Option<String>,
}

/// Broadcast list of subscribers
pub struct MessageFeed<T> {
    state: Mutex<FeedState<T>>,
    capacity: usize,
}

impl<T> MessageFeed<T> {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIBER_QUEUE_CAPACITY)
    }

    /// Feed whose subscribers each queue at most `capacity` items (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(FeedState {
                next_id: 0,
                subscribers: HashMap::new(),
                faulted: None,
            }),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of currently registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Fault reason, once `fault` has been called
    pub fn fault_reason(&self) -> Option<String> {
        self.lock().faulted.clone()
    }

    fn remove(&self, id: u64) {
        if let Some(subscriber) = self.lock().subscribers.remove(&id) {
            // Wakes a publisher waiting on this subscriber's queue
            subscriber.credit.close();
        }
    }
}

impl<T> Default for MessageFeed<T> {
    fn default() -> Self {
        Self::new()
    }
}

type Target<T> = (u64, mpsc::UnboundedSender<FeedEvent<T>>, Arc<Semaphore>);

impl<T: Clone> MessageFeed<T> {
    /// Register a new subscriber. It sees items published from now on.
    /// On a faulted feed the subscription yields the fault and then ends.
    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(self.capacity));
        let mut state = self.lock();

        if let Some(reason) = &state.faulted {
            let _ = tx.send(FeedEvent::Faulted(reason.clone()));
            return Subscription {
                id: None,
                feed: Weak::new(),
                rx,
                credit,
            };
        }

        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(
            id,
            Subscriber {
                tx,
                credit: credit.clone(),
            },
        );

        Subscription {
            id: Some(id),
            feed: Arc::downgrade(self),
            rx,
            credit,
        }
    }

    /// Deliver `item` to every subscriber, waiting for room in each queue.
    /// Returns how many received it.
    pub async fn publish(&self, item: T) -> usize {
        let mut delivered = 0;
        for (id, tx, credit) in self.targets() {
            match credit.acquire().await {
                Ok(permit) => permit.forget(),
                // Unsubscribed while we waited
                Err(_) => continue,
            }
            if tx.send(FeedEvent::Item(item.clone())).is_ok() {
                delivered += 1;
            } else {
                self.remove(id);
            }
        }
        delivered
    }

    /// Tell every subscriber the producer closed
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        if state.faulted.is_some() {
            return 0;
        }
        // Receivers that went away without unsubscribing are pruned here
        state
            .subscribers
            .retain(|_, subscriber| subscriber.tx.send(FeedEvent::Closed).is_ok());
        state.subscribers.len()
    }

    /// Deliver the fault to every current subscriber exactly once, then
    /// release them all. Returns false if the feed had already faulted.
    pub fn fault(&self, reason: &str) -> bool {
        let mut state = self.lock();
        if state.faulted.is_some() {
            return false;
        }
        state.faulted = Some(reason.to_string());
        for (_, subscriber) in state.subscribers.drain() {
            let _ = subscriber.tx.send(FeedEvent::Faulted(reason.to_string()));
            subscriber.credit.close();
        }
        true
    }

    fn targets(&self) -> Vec<Target<T>> {
        let state = self.lock();
        if state.faulted.is_some() {
            return Vec::new();
        }
        state
            .subscribers
            .iter()
            .map(|(id, subscriber)| (*id, subscriber.tx.clone(), subscriber.credit.clone()))
            .collect()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Receiving end of a feed. Dropping it unregisters the subscriber.
pub struct Subscription<T> {
    id: Option<u64>,
    feed: Weak<MessageFeed<T>>,
    rx: mpsc::UnboundedReceiver<FeedEvent<T>>,
    credit: Arc<Semaphore>,
}

impl<T> Subscription<T> {
    /// Next event, or None once the feed has released this subscriber
    pub async fn recv(&mut self) -> Option<FeedEvent<T>> {
        let event = self.rx.recv().await;
        self.release_slot(&event);
        event
    }

    /// Non-blocking receive of an already-delivered event
    pub fn try_recv(&mut self) -> Option<FeedEvent<T>> {
        let event = self.rx.try_recv().ok();
        self.release_slot(&event);
        event
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<FeedEvent<T>>> {
        let poll = self.rx.poll_recv(cx);
        if let Poll::Ready(event) = &poll {
            self.release_slot(event);
        }
        poll
    }

    /// Explicitly unregister (same as dropping)
    pub fn unsubscribe(self) {}

    fn release_slot(&self, event: &Option<FeedEvent<T>>) {
        if let Some(FeedEvent::Item(_)) = event {
            self.credit.add_permits(1);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.credit.close();
        if let (Some(id), Some(feed)) = (self.id, self.feed.upgrade()) {
            feed.remove(id);
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = FeedEvent<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_recv(cx)
    }
}
