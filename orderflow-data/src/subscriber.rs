use fnv::FnvHashMap;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Default per subscriber queue capacity, sized for bursty high frequency delivery.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1000;

/// Symbol filtered, bounded delivery queue owned by one consumer.
///
/// Dropping the paired [`SubscriberHub`] entry (via [`SubscriberHub::unsubscribe`]) closes the
/// queue, after which [`Subscription::recv`] yields any buffered items and then `None`.
#[derive(Debug)]
pub struct Subscription<T> {
    pub id: u64,
    pub symbol: SmolStr,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn into_stream(self) -> ReceiverStream<T> {
        ReceiverStream::new(self.rx)
    }
}

#[derive(Debug)]
struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
    /// Set while the queue is full, cleared by the next successful delivery
    lagging: AtomicBool,
    dropped: AtomicU64,
}

/// Outcome of a single [`SubscriberHub::broadcast`].
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
    /// Subscribers whose queue filled up on this broadcast after previously keeping up
    pub newly_lagging: usize,
    pub pruned: usize,
}

/// Per symbol registry of bounded subscriber queues with drop-on-full fan-out.
///
/// Broadcasting never awaits: a full queue loses the item for that subscriber only, and a
/// queue whose receiver has gone away is pruned from the registry.
#[derive(Debug)]
pub struct SubscriberHub<T> {
    capacity: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
    subscribers: RwLock<FnvHashMap<SmolStr, Vec<Subscriber<T>>>>,
}

impl<T> SubscriberHub<T>
where
    T: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            subscribers: RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a new bounded queue for `symbol`.
    pub fn subscribe(&self, symbol: impl Into<SmolStr>) -> Subscription<T> {
        let symbol = symbol.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);

        self.subscribers
            .write()
            .entry(symbol.clone())
            .or_default()
            .push(Subscriber {
                id,
                tx,
                lagging: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            });

        debug!(%symbol, subscription_id = id, "registered subscriber");
        Subscription { id, symbol, rx }
    }

    /// Remove the queue paired with `subscription`, closing it. Returns false if it was already
    /// removed.
    pub fn unsubscribe(&self, subscription: &Subscription<T>) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(queues) = subscribers.get_mut(&subscription.symbol) else {
            return false;
        };

        let before = queues.len();
        queues.retain(|subscriber| subscriber.id != subscription.id);
        let removed = queues.len() != before;

        if queues.is_empty() {
            subscribers.remove(&subscription.symbol);
        }

        if removed {
            debug!(
                symbol = %subscription.symbol,
                subscription_id = subscription.id,
                "removed subscriber"
            );
        }
        removed
    }

    /// Deliver `item` to every queue registered for `symbol` without blocking.
    ///
    /// A full queue is logged once when it starts dropping and once when it drains, with
    /// per message losses only counted.
    pub fn broadcast(&self, symbol: &str, item: &T) -> Delivery {
        let mut delivery = Delivery::default();
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.read();
            let Some(queues) = subscribers.get(symbol) else {
                return delivery;
            };

            for subscriber in queues {
                match subscriber.tx.try_send(item.clone()) {
                    Ok(()) => {
                        delivery.delivered += 1;
                        if subscriber.lagging.swap(false, Ordering::Relaxed) {
                            info!(
                                %symbol,
                                subscription_id = subscriber.id,
                                dropped = subscriber.dropped.swap(0, Ordering::Relaxed),
                                "subscriber queue drained, delivery resumed"
                            );
                        }
                    }
                    Err(TrySendError::Full(_)) => {
                        delivery.dropped += 1;
                        subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                        if !subscriber.lagging.swap(true, Ordering::Relaxed) {
                            delivery.newly_lagging += 1;
                            warn!(
                                %symbol,
                                subscription_id = subscriber.id,
                                capacity = self.capacity,
                                "subscriber queue full, dropping messages until it drains"
                            );
                        }
                    }
                    Err(TrySendError::Closed(_)) => closed.push(subscriber.id),
                }
            }
        }

        if !closed.is_empty() {
            delivery.pruned = self.prune(symbol, &closed);
        }

        self.dropped
            .fetch_add(delivery.dropped as u64, Ordering::Relaxed);
        delivery
    }

    fn prune(&self, symbol: &str, ids: &[u64]) -> usize {
        let mut subscribers = self.subscribers.write();
        let Some(queues) = subscribers.get_mut(symbol) else {
            return 0;
        };

        let before = queues.len();
        queues.retain(|subscriber| !ids.contains(&subscriber.id));
        let pruned = before - queues.len();

        if queues.is_empty() {
            subscribers.remove(symbol);
        }

        debug!(%symbol, pruned, "pruned closed subscribers");
        pruned
    }

    /// Number of queues registered for `symbol`.
    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.subscribers.read().get(symbol).map_or(0, Vec::len)
    }

    /// Symbols with at least one registered queue.
    pub fn symbols(&self) -> Vec<SmolStr> {
        self.subscribers.read().keys().cloned().collect()
    }

    /// Total messages dropped across all subscribers since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close every registered queue.
    pub fn clear(&self) {
        self.subscribers.write().clear();
    }
}
