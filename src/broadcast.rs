use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cache::PlaybackCache;
use crate::types::SnapshotView;

/// Write half of a subscriber connection; `deliver` must not block
pub trait SnapshotSink: Send + Sync {
    fn deliver(&self, snapshot: &SnapshotView) -> Result<(), String>;
}

impl SnapshotSink for tokio::sync::mpsc::UnboundedSender<SnapshotView> {
    fn deliver(&self, snapshot: &SnapshotView) -> Result<(), String> {
        self.send(snapshot.clone())
            .map_err(|_| "channel closed".to_string())
    }
}

struct Subscriber {
    sink: Box<dyn SnapshotSink>,
    last_delivered: u64,
    registration: u64,
}

type SubscriberMap = Arc<Mutex<HashMap<String, Subscriber>>>;

pub struct BroadcastHub {
    cache: Arc<PlaybackCache>,
    subscribers: SubscriberMap,
    next_registration: AtomicU64,
}

impl BroadcastHub {
    pub fn new(cache: Arc<PlaybackCache>) -> Self {
        Self {
            cache,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_registration: AtomicU64::new(1),
        }
    }

    /// Registers `id` and pushes the current snapshot right away.
    ///
    /// Re-subscribing an id replaces its connection. A sink that fails its
    /// first delivery is not registered and leaves any earlier one in place.
    pub async fn subscribe(&self, id: &str, sink: Box<dyn SnapshotSink>) -> Result<u64, String> {
        let mut subscribers = self.subscribers.lock().await;
        let snapshot = self.cache.snapshot();
        if let Err(e) = sink.deliver(&snapshot) {
            warn!("Initial delivery to subscriber {} failed: {}", id, e);
            return Err(e);
        }
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        subscribers.insert(
            id.to_string(),
            Subscriber {
                sink,
                last_delivered: snapshot.version,
                registration,
            },
        );
        info!(
            "Subscriber {} registered at version {}. Total subscribers: {}",
            id,
            snapshot.version,
            subscribers.len()
        );
        Ok(registration)
    }

    pub async fn unsubscribe(&self, id: &str) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.remove(id).is_some() {
            info!(
                "Subscriber {} removed. Total subscribers: {}",
                id,
                subscribers.len()
            );
        }
    }

    /// Removes `id` only if it still belongs to `registration`, so a closing
    /// connection cannot drop the newer one that took over its id.
    pub async fn unsubscribe_registration(&self, id: &str, registration: u64) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.get(id).map(|s| s.registration) == Some(registration) {
            subscribers.remove(id);
            info!(
                "Subscriber {} removed. Total subscribers: {}",
                id,
                subscribers.len()
            );
        } else {
            debug!("Subscriber {} already re-registered; keeping it", id);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    pub async fn subscriber_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscribers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pushes the current snapshot to everyone behind; returns how many got it
    pub async fn notify(&self) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.is_empty() {
            return 0;
        }

        let snapshot = self.cache.snapshot();
        let mut disconnected = Vec::new();
        let mut delivered = 0;

        for (id, subscriber) in subscribers.iter_mut() {
            if subscriber.last_delivered == snapshot.version {
                continue;
            }
            match subscriber.sink.deliver(&snapshot) {
                Ok(()) => {
                    subscriber.last_delivered = snapshot.version;
                    delivered += 1;
                }
                Err(e) => {
                    warn!("Failed to deliver to subscriber {}: {}", id, e);
                    disconnected.push(id.clone());
                }
            }
        }

        for id in disconnected {
            subscribers.remove(&id);
            warn!("Removed disconnected subscriber: {}", id);
        }

        if delivered > 0 {
            debug!(
                "Version {} delivered to {} of {} subscribers",
                snapshot.version,
                delivered,
                subscribers.len()
            );
        }
        delivered
    }
}
