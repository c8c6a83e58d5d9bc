//! Global check/uncheck statistics.
//!
//! Hot-path writers bump lock-free local deltas in a [`StatsAccumulator`].
//! A flush task moves those deltas into the single [`StatsAggregator`]
//! every interval, so totals lag by at most one interval and `SetBit`
//! never waits on the aggregate.

use crate::host::state_key;
use crate::pubsub::{PubSubHub, Topic, TopicKind};
use crate::store::{PersistentState, StateStore};
use crate::EngineError;
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Key of the single aggregate.
pub const GLOBAL_STATS_KEY: &str = "global";

/// Per-process deltas waiting to be flushed.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    checks: AtomicU64,
    unchecks: AtomicU64,
}

/// Deltas taken from an accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    /// Boxes checked since the last flush.
    pub checks: u64,
    /// Boxes unchecked since the last flush.
    pub unchecks: u64,
}

impl StatsDelta {
    /// Whether there is nothing to flush.
    pub fn is_empty(&self) -> bool {
        self.checks == 0 && self.unchecks == 0
    }
}

impl StatsAccumulator {
    /// Counts one real flip to `value`.
    pub fn record(&self, value: bool) {
        let counter = if value { &self.checks } else { &self.unchecks };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes the current deltas and resets them to zero.
    pub fn take(&self) -> StatsDelta {
        StatsDelta {
            checks: self.checks.swap(0, Ordering::AcqRel),
            unchecks: self.unchecks.swap(0, Ordering::AcqRel),
        }
    }

    /// Puts deltas back after a failed flush.
    pub fn restore(&self, delta: StatsDelta) {
        self.checks.fetch_add(delta.checks, Ordering::Relaxed);
        self.unchecks.fetch_add(delta.unchecks, Ordering::Relaxed);
    }
}

/// Global totals, persisted and published on `Stats:global`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Getters)]
pub struct GlobalStats {
    total_checks: u64,
    total_unchecks: u64,
}

/// The canonical aggregate; absorbs deltas additively.
#[derive(Debug)]
pub struct StatsAggregator {
    state: Mutex<PersistentState<GlobalStats>>,
    hub: Arc<PubSubHub>,
}

impl StatsAggregator {
    /// Loads the persisted totals.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the totals cannot be read.
    #[instrument(skip_all)]
    pub async fn load(store: Arc<dyn StateStore>, hub: Arc<PubSubHub>) -> Result<Self, EngineError> {
        let state = PersistentState::load(store, state_key("Stats", &GLOBAL_STATS_KEY)).await?;
        info!(totals = ?state.get(), "Stats aggregator loaded");
        Ok(Self {
            state: Mutex::new(state),
            hub,
        })
    }

    /// Current totals.
    pub async fn current(&self) -> GlobalStats {
        *self.state.lock().await.get()
    }

    /// Adds `delta`, persists and publishes the new totals.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the totals cannot be persisted; they
    /// are left unchanged in that case.
    #[instrument(skip(self))]
    pub async fn absorb(&self, delta: StatsDelta) -> Result<GlobalStats, EngineError> {
        let mut state = self.state.lock().await;
        let current = *state.get();
        let next = GlobalStats {
            total_checks: current.total_checks + delta.checks,
            total_unchecks: current.total_unchecks + delta.unchecks,
        };
        state.write(next).await?;
        drop(state);

        let topic = Topic::new(TopicKind::Stats, GLOBAL_STATS_KEY);
        if let Err(e) = self.hub.publish(&topic, &next) {
            warn!(error = %e, "Failed to publish global stats");
        }
        debug!(?next, "Absorbed stats delta");
        Ok(next)
    }
}

/// Background task moving accumulator deltas into the aggregator.
#[derive(Debug)]
pub struct StatsFlusher {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatsFlusher {
    /// Starts flushing every `period`.
    #[instrument(skip(accumulator, aggregator))]
    pub fn spawn(
        accumulator: Arc<StatsAccumulator>,
        aggregator: Arc<StatsAggregator>,
        period: Duration,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => flush(&accumulator, &aggregator).await,
                    _ = stopped.changed() => break,
                }
            }
            // Last deltas out before shutdown.
            flush(&accumulator, &aggregator).await;
            debug!("Stats flusher exited");
        });
        info!("Stats flusher started");
        Self { stop, task }
    }

    /// Stops the task after a final flush.
    #[instrument(skip(self))]
    pub async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Stats flusher task failed");
        }
        info!("Stats flusher stopped");
    }
}

async fn flush(accumulator: &StatsAccumulator, aggregator: &StatsAggregator) {
    let delta = accumulator.take();
    if delta.is_empty() {
        return;
    }
    if let Err(e) = aggregator.absorb(delta).await {
        warn!(error = %e, ?delta, "Stats flush failed, keeping deltas for next tick");
        accumulator.restore(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_take_resets_and_restore_adds_back() {
        let acc = StatsAccumulator::default();
        acc.record(true);
        acc.record(true);
        acc.record(false);
        let delta = acc.take();
        assert_eq!(delta, StatsDelta { checks: 2, unchecks: 1 });
        assert!(acc.take().is_empty());
        acc.restore(delta);
        assert_eq!(acc.take(), delta);
    }

    #[tokio::test]
    async fn test_absorb_is_additive_and_persisted() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let hub = PubSubHub::open(4);
        let agg = StatsAggregator::load(Arc::clone(&store), Arc::clone(&hub)).await.unwrap();
        agg.absorb(StatsDelta { checks: 3, unchecks: 1 }).await.unwrap();
        agg.absorb(StatsDelta { checks: 2, unchecks: 0 }).await.unwrap();

        let reloaded = StatsAggregator::load(store, hub).await.unwrap();
        let totals = reloaded.current().await;
        assert_eq!(*totals.total_checks(), 5);
        assert_eq!(*totals.total_unchecks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_moves_deltas_each_period() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let hub = PubSubHub::open(4);
        let agg = Arc::new(StatsAggregator::load(store, hub).await.unwrap());
        let acc = Arc::new(StatsAccumulator::default());
        let flusher = StatsFlusher::spawn(Arc::clone(&acc), Arc::clone(&agg), Duration::from_secs(1));

        acc.record(true);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*agg.current().await.total_checks(), 1);

        acc.record(false);
        flusher.stop().await;
        assert_eq!(*agg.current().await.total_unchecks(), 1);
    }
}
