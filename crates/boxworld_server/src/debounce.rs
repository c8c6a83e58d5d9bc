//! Debounced key/value batching.
//!
//! [`DebounceBatcher::put`] records the latest value per key. The first put
//! into an empty window starts a timer; when it fires, the whole buffer is
//! swapped out and handed to every listener as one batch. Later puts to the
//! same key inside the window overwrite earlier ones.
//!
//! Emission is serialized per batcher, so listeners see successive batches
//! in order and never an older value for a key after a newer one.

use async_trait::async_trait;
use derive_more::{Display, Error};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Receives emitted batches.
#[async_trait]
pub trait BatchListener<K, V>: Send + Sync {
    /// Handles one batch. Errors are logged by the batcher and otherwise ignored.
    async fn on_batch(&self, batch: &HashMap<K, V>) -> Result<(), ListenerError>;
}

#[async_trait]
impl<K, V, F> BatchListener<K, V> for F
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(&HashMap<K, V>) -> Result<(), ListenerError> + Send + Sync,
{
    async fn on_batch(&self, batch: &HashMap<K, V>) -> Result<(), ListenerError> {
        self(batch)
    }
}

/// Forwards batches into a bounded channel without waiting.
///
/// A full or closed channel is reported as a listener failure, so one slow
/// subscriber cannot hold up delivery to the rest.
#[derive(Debug)]
pub struct ChannelListener<K, V> {
    sender: mpsc::Sender<HashMap<K, V>>,
}

impl<K, V> ChannelListener<K, V> {
    /// Wraps a channel sender.
    pub fn new(sender: mpsc::Sender<HashMap<K, V>>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<K, V> BatchListener<K, V> for ChannelListener<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn on_batch(&self, batch: &HashMap<K, V>) -> Result<(), ListenerError> {
        self.sender
            .try_send(batch.clone())
            .map_err(|e| ListenerError::new(format!("subscriber channel rejected batch: {}", e)))
    }
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type SharedListener<K, V> = Arc<dyn BatchListener<K, V>>;

struct Pending<K, V> {
    buffer: HashMap<K, V>,
    timer: Option<JoinHandle<()>>,
    stopped: bool,
}

struct Inner<K, V> {
    name: String,
    delay: Duration,
    pending: Mutex<Pending<K, V>>,
    listeners: RwLock<Vec<(ListenerId, SharedListener<K, V>)>>,
    next_listener: AtomicU64,
    emit: tokio::sync::Mutex<()>,
    stop: watch::Sender<bool>,
}

/// Coalesces rapid per-key updates into periodic batches.
pub struct DebounceBatcher<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for DebounceBatcher<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> std::fmt::Debug for DebounceBatcher<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceBatcher")
            .field("name", &self.inner.name)
            .field("delay", &self.inner.delay)
            .finish_non_exhaustive()
    }
}

impl<K, V> DebounceBatcher<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a batcher that emits `delay` after the first put of a window.
    #[instrument(skip(name), fields(name = %name.as_ref()))]
    pub fn new(name: impl AsRef<str>, delay: Duration) -> Self {
        debug!(?delay, "Creating debounce batcher");
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.as_ref().to_string(),
                delay,
                pending: Mutex::new(Pending {
                    buffer: HashMap::new(),
                    timer: None,
                    stopped: false,
                }),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                emit: tokio::sync::Mutex::new(()),
                stop,
            }),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registers a listener for future batches.
    pub fn add_listener(&self, listener: SharedListener<K, V>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        debug!(batcher = %self.inner.name, ?id, "Listener added");
        id
    }

    /// Removes a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of keys waiting for the next emission.
    pub fn pending_len(&self) -> usize {
        self.lock_pending().buffer.len()
    }

    /// Records `value` as the latest for `key`, starting the timer if idle.
    ///
    /// Must be called from within a tokio runtime. Puts after
    /// [`stop`](Self::stop) are dropped.
    pub fn put(&self, key: K, value: V) {
        let mut pending = self.lock_pending();
        if pending.stopped {
            debug!(batcher = %self.inner.name, ?key, "Put after stop ignored");
            return;
        }
        pending.buffer.insert(key, value);
        if pending.timer.is_none() {
            let inner = Arc::clone(&self.inner);
            pending.timer = Some(tokio::spawn(Self::run_timer(inner)));
        }
    }

    /// Cancels the pending timer and waits for any delivery in progress.
    ///
    /// A timer still sleeping is aborted and its buffer discarded.
    #[instrument(skip(self), fields(batcher = %self.inner.name))]
    pub async fn stop(&self) {
        let timer = {
            let mut pending = self.lock_pending();
            pending.stopped = true;
            pending.timer.take()
        };
        self.inner.stop.send_replace(true);

        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                warn!(error = %e, "Debounce timer task failed");
            }
        }
        // A timer that already detached itself may still be delivering.
        let _emit = self.inner.emit.lock().await;
        let dropped = {
            let mut pending = self.lock_pending();
            let dropped = pending.buffer.len();
            pending.buffer.clear();
            dropped
        };
        info!(dropped, "Debounce batcher stopped");
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending<K, V>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_timer(inner: Arc<Inner<K, V>>) {
        let mut stop = inner.stop.subscribe();
        if *stop.borrow_and_update() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(inner.delay) => {}
            _ = stop.changed() => {
                debug!(batcher = %inner.name, "Debounce timer cancelled");
                return;
            }
        }

        let _emit = inner.emit.lock().await;
        let batch = {
            let mut pending = inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.stopped {
                return;
            }
            pending.timer = None;
            std::mem::take(&mut pending.buffer)
        };
        if batch.is_empty() {
            return;
        }

        let listeners: Vec<SharedListener<K, V>> = inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        debug!(
            batcher = %inner.name,
            keys = batch.len(),
            listeners = listeners.len(),
            "Emitting batch"
        );

        for listener in listeners {
            match AssertUnwindSafe(listener.on_batch(&batch)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(batcher = %inner.name, error = %e, "Batch listener failed"),
                Err(_) => warn!(batcher = %inner.name, "Batch listener panicked"),
            }
        }
    }
}

/// Failure reported by a [`BatchListener`].
#[derive(Debug, Clone, Display, Error)]
#[display("Listener error: {} at {}:{}", message, file, line)]
pub struct ListenerError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl ListenerError {
    /// Creates a new listener error with caller location tracking.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Batches = Arc<Mutex<Vec<HashMap<String, u32>>>>;

    fn recording(batcher: &DebounceBatcher<String, u32>) -> Batches {
        let batches: Batches = Arc::default();
        let sink = Arc::clone(&batches);
        batcher.add_listener(Arc::new(move |batch: &HashMap<String, u32>| -> Result<(), ListenerError> {
            sink.lock().unwrap().push(batch.clone());
            Ok(())
        }));
        batches
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_puts_collapse_to_last_value() {
        let batcher = DebounceBatcher::new("test", Duration::from_millis(250));
        let batches = recording(&batcher);

        for v in 1..=10 {
            batcher.put("k".to_string(), v);
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0]["k"], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_puts_emit_separately() {
        let batcher = DebounceBatcher::new("test", Duration::from_millis(250));
        let batches = recording(&batcher);

        for v in 1..=4 {
            batcher.put("k".to_string(), v);
            tokio::time::sleep(Duration::from_millis(400)).await;
        }

        let batches = batches.lock().unwrap();
        let values: Vec<u32> = batches.iter().map(|b| b["k"]).collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_share_a_batch() {
        let batcher = DebounceBatcher::new("test", Duration::from_millis(100));
        let batches = recording(&batcher);

        batcher.put("a".to_string(), 1);
        batcher.put("b".to_string(), 2);
        batcher.put("a".to_string(), 3);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0]["a"], 3);
        assert_eq!(batches[0]["b"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_listener_does_not_block_others() {
        let batcher = DebounceBatcher::new("test", Duration::from_millis(100));
        batcher.add_listener(Arc::new(|_: &HashMap<String, u32>| -> Result<(), ListenerError> {
            Err(ListenerError::new("boom"))
        }));
        batcher.add_listener(Arc::new(|_: &HashMap<String, u32>| -> Result<(), ListenerError> {
            panic!("listener panic")
        }));
        let batches = recording(&batcher);

        batcher.put("k".to_string(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        batcher.put("k".to_string(), 2);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1]["k"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_pending_and_ignores_later_puts() {
        let batcher = DebounceBatcher::new("test", Duration::from_millis(250));
        let batches = recording(&batcher);

        batcher.put("k".to_string(), 1);
        batcher.stop().await;
        batcher.put("k".to_string(), 2);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(batches.lock().unwrap().is_empty());
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_listener_gets_nothing() {
        let batcher = DebounceBatcher::new("test", Duration::from_millis(100));
        let batches = recording(&batcher);
        let (tx, mut rx) = mpsc::channel(4);
        let id = batcher.add_listener(Arc::new(ChannelListener::new(tx)));
        assert_eq!(batcher.listener_count(), 2);
        assert!(batcher.remove_listener(id));

        batcher.put("k".to_string(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(batches.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_listener_receives_batch() {
        let batcher = DebounceBatcher::new("test", Duration::from_millis(100));
        let (tx, mut rx) = mpsc::channel(4);
        batcher.add_listener(Arc::new(ChannelListener::new(tx)));

        batcher.put("k".to_string(), 7);
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch["k"], 7);
    }
}
