//! Debounced fan-out from pub/sub topics to subscribers.
//!
//! A [`FanOutService`] keeps one feed per topic: a single hub subscription
//! whose events are decoded into key/value pairs and pushed through a
//! [`DebounceBatcher`]. Each [`Subscription`] receives the batches on its
//! own bounded channel. The feed is torn down when its last subscriber
//! leaves.

use crate::actors::{Balance, CheckboxEvent, MinesweeperEvent, MinesweeperView, WarView};
use crate::debounce::{ChannelListener, DebounceBatcher, ListenerId};
use crate::pubsub::{PubSubHub, Topic, TopicKind};
use crate::stats::{GLOBAL_STATS_KEY, GlobalStats};
use crate::EngineError;
use boxworld_bits::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Batches a slow subscriber may fall behind before batches are dropped.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Turns one published payload into batcher entries.
pub type Decoder<K, V> = fn(&serde_json::Value) -> Result<Vec<(K, V)>, serde_json::Error>;

struct Feed<K, V> {
    batcher: DebounceBatcher<K, V>,
    pump: JoinHandle<()>,
}

/// Per-topic debounced fan-out for one event family.
pub struct FanOutService<K, V> {
    name: &'static str,
    kind: TopicKind,
    delay: Duration,
    hub: Arc<PubSubHub>,
    decode: Decoder<K, V>,
    feeds: Mutex<HashMap<String, Feed<K, V>>>,
}

impl<K, V> Debug for FanOutService<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutService")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

/// A subscriber's end of a feed.
///
/// Dropping it unsubscribes in the background; call
/// [`unsubscribe`](Self::unsubscribe) to wait for the teardown.
pub struct Subscription<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    topic: Topic,
    id: ListenerId,
    receiver: mpsc::Receiver<HashMap<K, V>>,
    service: Option<Arc<FanOutService<K, V>>>,
}

impl<K, V> Debug for Subscription<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<K, V> Subscription<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Subscribed topic.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next batch, or `None` once the feed has shut down.
    pub async fn recv(&mut self) -> Option<HashMap<K, V>> {
        self.receiver.recv().await
    }

    /// Leaves the feed, tearing it down if this was the last subscriber.
    pub async fn unsubscribe(mut self) -> bool {
        match self.service.take() {
            Some(service) => service.remove(&self.topic, self.id).await,
            None => false,
        }
    }
}

impl<K, V> Drop for Subscription<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let Some(service) = self.service.take() else {
            return;
        };
        let topic = self.topic.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    service.remove(&topic, id).await;
                });
            }
            Err(_) => debug!(%topic, "Subscription dropped outside a runtime"),
        }
    }
}

impl<K, V> FanOutService<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a fan-out over `kind` topics.
    pub fn new(
        name: &'static str,
        kind: TopicKind,
        delay: Duration,
        hub: Arc<PubSubHub>,
        decode: Decoder<K, V>,
    ) -> Arc<Self> {
        debug!(name, %kind, ?delay, "Creating fan-out service");
        Arc::new(Self {
            name,
            kind,
            delay,
            hub,
            decode,
            feeds: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribes to batches for topic `<kind>:<key>`.
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the hub is shut down.
    #[instrument(skip(self, key), fields(name = self.name, key = %key))]
    pub fn subscribe(
        self: &Arc<Self>,
        key: impl std::fmt::Display,
    ) -> Result<Subscription<K, V>, EngineError> {
        let topic = Topic::new(self.kind, key);
        let mut feeds = self.lock_feeds();
        let feed = match feeds.entry(topic.key().to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let events = self.hub.subscribe(&topic)?;
                let batcher = DebounceBatcher::new(topic.to_string(), self.delay);
                let pump = tokio::spawn(pump(events, batcher.clone(), self.decode, topic.clone()));
                info!(%topic, "Feed opened");
                entry.insert(Feed { batcher, pump })
            }
        };

        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = feed.batcher.add_listener(Arc::new(ChannelListener::new(sender)));
        debug!(?id, subscribers = feed.batcher.listener_count(), "Subscribed");
        Ok(Subscription {
            topic,
            id,
            receiver,
            service: Some(Arc::clone(self)),
        })
    }

    /// Subscribers on `<kind>:<key>`.
    pub fn subscriber_count(&self, key: impl ToString) -> usize {
        self.lock_feeds()
            .get(&key.to_string())
            .map(|feed| feed.batcher.listener_count())
            .unwrap_or(0)
    }

    /// Number of open feeds.
    pub fn feed_count(&self) -> usize {
        self.lock_feeds().len()
    }

    /// Closes every feed.
    #[instrument(skip(self), fields(name = self.name))]
    pub async fn stop_all(&self) {
        let feeds: Vec<Feed<K, V>> = self.lock_feeds().drain().map(|(_, feed)| feed).collect();
        let closed = feeds.len();
        for feed in feeds {
            feed.pump.abort();
            feed.batcher.stop().await;
        }
        info!(closed, "Fan-out stopped");
    }

    #[instrument(skip(self), fields(name = self.name))]
    async fn remove(&self, topic: &Topic, id: ListenerId) -> bool {
        let closing = {
            let mut feeds = self.lock_feeds();
            let Some(feed) = feeds.get(topic.key()) else {
                return false;
            };
            if !feed.batcher.remove_listener(id) {
                return false;
            }
            if feed.batcher.listener_count() > 0 {
                None
            } else {
                feeds.remove(topic.key())
            }
        };
        if let Some(feed) = closing {
            feed.pump.abort();
            feed.batcher.stop().await;
            info!(%topic, "Feed closed");
        }
        true
    }

    fn lock_feeds(&self) -> std::sync::MutexGuard<'_, HashMap<String, Feed<K, V>>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn pump<K, V>(
    mut events: broadcast::Receiver<crate::pubsub::Payload>,
    batcher: DebounceBatcher<K, V>,
    decode: Decoder<K, V>,
    topic: Topic,
) where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        match events.recv().await {
            Ok(payload) => match decode(&payload) {
                Ok(entries) => {
                    for (key, value) in entries {
                        batcher.put(key, value);
                    }
                }
                Err(e) => warn!(%topic, error = %e, "Undecodable event skipped"),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(%topic, missed, "Feed lagged behind publisher");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(%topic, "Topic closed");
                break;
            }
        }
    }
}

/// Checkbox flips: index → value.
pub fn decode_checkbox(
    value: &serde_json::Value,
) -> Result<Vec<(usize, bool)>, serde_json::Error> {
    let event = CheckboxEvent::deserialize(value)?;
    Ok(vec![(event.index, event.value)])
}

/// Minesweeper adjacency counts: index → count.
pub fn decode_minesweeper_counts(
    value: &serde_json::Value,
) -> Result<Vec<(usize, u8)>, serde_json::Error> {
    Ok(match MinesweeperEvent::deserialize(value)? {
        MinesweeperEvent::Counts { counts } => {
            counts.into_iter().map(|c| (c.index, c.count)).collect()
        }
        MinesweeperEvent::State { .. } => Vec::new(),
    })
}

/// Minesweeper full state: address → view.
pub fn decode_minesweeper_state(
    value: &serde_json::Value,
) -> Result<Vec<(Address, MinesweeperView)>, serde_json::Error> {
    Ok(match MinesweeperEvent::deserialize(value)? {
        MinesweeperEvent::State { game } => vec![(*game.address(), game)],
        MinesweeperEvent::Counts { .. } => Vec::new(),
    })
}

/// War state: id → view.
pub fn decode_war(value: &serde_json::Value) -> Result<Vec<(u64, WarView)>, serde_json::Error> {
    let view = WarView::deserialize(value)?;
    Ok(vec![(*view.id(), view)])
}

/// Balances: user id → balance.
pub fn decode_balance(
    value: &serde_json::Value,
) -> Result<Vec<(String, Balance)>, serde_json::Error> {
    let balance = Balance::deserialize(value)?;
    Ok(vec![(balance.user_id().clone(), balance)])
}

/// Global totals under the single `"global"` key.
pub fn decode_stats(
    value: &serde_json::Value,
) -> Result<Vec<(String, GlobalStats)>, serde_json::Error> {
    Ok(vec![(GLOBAL_STATS_KEY.to_string(), GlobalStats::deserialize(value)?)])
}
