//! Topic-per-address publish/subscribe hub.
//!
//! The hub is an explicit object with an open/shutdown lifecycle that the
//! runtime owns and hands to whoever needs it. Delivery is at-most-once:
//! publishing to a topic nobody listens on is not an error, and a slow
//! receiver that falls behind the buffer loses the oldest messages.

use crate::EngineError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use strum::{Display, EnumString};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Kind prefix of a topic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum TopicKind {
    /// Checkbox flips on one page.
    Checkbox,
    /// Minesweeper counts and state for one game.
    Minesweeper,
    /// War state for one round.
    War,
    /// Gold found on one gold-digger page.
    GoldDigger,
    /// Balance changes for one user.
    User,
    /// Global check/uncheck totals.
    Stats,
}

/// A topic named `"<Kind>:<key>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{}:{}", kind, key)]
pub struct Topic {
    kind: TopicKind,
    key: String,
}

impl Topic {
    /// Creates a topic.
    pub fn new(kind: TopicKind, key: impl ToString) -> Self {
        Self {
            kind,
            key: key.to_string(),
        }
    }

    /// Topic kind.
    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    /// Key part of the name.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A published message as seen by subscribers.
pub type Payload = Arc<serde_json::Value>;

/// In-process pub/sub connection.
#[derive(Debug)]
pub struct PubSubHub {
    capacity: usize,
    open: AtomicBool,
    topics: Mutex<HashMap<Topic, broadcast::Sender<Payload>>>,
}

impl PubSubHub {
    /// Opens a hub whose topics each buffer `capacity` messages.
    #[instrument]
    pub fn open(capacity: usize) -> Arc<Self> {
        info!("Opening pub/sub hub");
        Arc::new(Self {
            capacity: capacity.max(1),
            open: AtomicBool::new(true),
            topics: Mutex::new(HashMap::new()),
        })
    }

    /// Whether [`shutdown`](Self::shutdown) has not been called.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Fails once the hub has been shut down.
    ///
    /// # Errors
    ///
    /// Returns a dependency [`EngineError`] after shutdown.
    pub fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(EngineError::dependency("pub/sub hub is shut down"))
        }
    }

    /// Publishes `payload` as JSON on `topic`; returns how many receivers got it.
    ///
    /// # Errors
    ///
    /// Returns a dependency [`EngineError`] if the hub is shut down or the
    /// payload does not serialize.
    #[instrument(skip(self, payload), fields(topic = %topic))]
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &Topic,
        payload: &T,
    ) -> Result<usize, EngineError> {
        self.ensure_open()?;
        let value = serde_json::to_value(payload)
            .map_err(|e| EngineError::dependency(format!("payload for {} failed to encode: {}", topic, e)))?;

        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = topics.get(topic) else {
            debug!("No subscribers");
            return Ok(0);
        };
        match sender.send(Arc::new(value)) {
            Ok(receivers) => {
                debug!(receivers, "Published");
                Ok(receivers)
            }
            Err(_) => {
                debug!("Last subscriber gone, dropping topic");
                topics.remove(topic);
                Ok(0)
            }
        }
    }

    /// Subscribes to `topic`.
    ///
    /// # Errors
    ///
    /// Returns a dependency [`EngineError`] if the hub is shut down.
    #[instrument(skip(self), fields(topic = %topic))]
    pub fn subscribe(&self, topic: &Topic) -> Result<broadcast::Receiver<Payload>, EngineError> {
        self.ensure_open()?;
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = match topics.get(topic) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                topics.insert(topic.clone(), sender);
                receiver
            }
        };
        debug!("Subscribed");
        Ok(receiver)
    }

    /// Number of topics with a live sender.
    pub fn topic_count(&self) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Closes every topic; receivers observe the channel closing.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            warn!("Pub/sub hub already shut down");
            return;
        }
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let closed = topics.len();
        topics.clear();
        info!(closed, "Pub/sub hub shut down");
    }
}
