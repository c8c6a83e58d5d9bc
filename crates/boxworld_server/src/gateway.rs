//! The RPC surface a transport would expose, without the transport.

use crate::actors::{Balance, GoldSpotsView, MinesweeperView, SetBitOutcome, WarView};
use crate::cluster::{Cluster, DigOutcome};
use crate::config::EngineConfig;
use crate::fanout::{
    FanOutService, Subscription, decode_balance, decode_checkbox, decode_minesweeper_counts,
    decode_minesweeper_state, decode_stats, decode_war,
};
use crate::host::Services;
use crate::ledger::UserLedger;
use crate::pubsub::{PubSubHub, TopicKind};
use crate::stats::{GLOBAL_STATS_KEY, GlobalStats, StatsAggregator, StatsFlusher};
use crate::store::StateStore;
use crate::EngineError;
use boxworld_bits::Address;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Both minesweeper feeds for one game.
#[derive(Debug)]
pub struct MinesweeperSubscription {
    /// Adjacency counts as cells are exposed.
    pub counts: Subscription<usize, u8>,
    /// Full state when the game ends.
    pub state: Subscription<Address, MinesweeperView>,
}

#[derive(Debug)]
struct Background {
    flusher: StatsFlusher,
    sweeper_stop: watch::Sender<bool>,
    sweeper: JoinHandle<()>,
}

/// Entry point for every client operation.
#[derive(Debug)]
pub struct Gateway {
    cluster: Arc<Cluster>,
    aggregator: Arc<StatsAggregator>,
    checkbox: Arc<FanOutService<usize, bool>>,
    minesweeper_counts: Arc<FanOutService<usize, u8>>,
    minesweeper_state: Arc<FanOutService<Address, MinesweeperView>>,
    wars: Arc<FanOutService<u64, WarView>>,
    balances: Arc<FanOutService<String, Balance>>,
    stats: Arc<FanOutService<String, GlobalStats>>,
    background: Mutex<Option<Background>>,
}

impl Gateway {
    /// Opens the hub, builds the cluster and starts the stats flusher and
    /// idle sweeper.
    ///
    /// # Errors
    ///
    /// Validation error for a bad configuration, dependency errors if
    /// stored state cannot be read.
    #[instrument(skip_all)]
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::validation(e.message))?;

        let hub = PubSubHub::open(*config.pubsub_capacity());
        let services = Arc::new(Services::new(config, Arc::clone(&store), Arc::clone(&hub))?);
        let config = services.config();
        let cluster = Arc::new(Cluster::new(Arc::clone(&services)).await?);
        let aggregator = Arc::new(StatsAggregator::load(store, Arc::clone(&hub)).await?);

        let flusher = StatsFlusher::spawn(
            Arc::clone(services.stats()),
            Arc::clone(&aggregator),
            config.stats_flush_period(),
        );
        let (sweeper_stop, stopped) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_idle(
            Arc::clone(&cluster),
            config.actor_sweep_period(),
            config.actor_idle(),
            stopped,
        ));

        let default = config.default_delay();
        let gateway = Self {
            checkbox: FanOutService::new(
                "checkbox",
                TopicKind::Checkbox,
                config.checkbox_delay(),
                Arc::clone(&hub),
                decode_checkbox,
            ),
            minesweeper_counts: FanOutService::new(
                "minesweeper-counts",
                TopicKind::Minesweeper,
                default,
                Arc::clone(&hub),
                decode_minesweeper_counts,
            ),
            minesweeper_state: FanOutService::new(
                "minesweeper-state",
                TopicKind::Minesweeper,
                default,
                Arc::clone(&hub),
                decode_minesweeper_state,
            ),
            wars: FanOutService::new("war", TopicKind::War, default, Arc::clone(&hub), decode_war),
            balances: FanOutService::new(
                "balance",
                TopicKind::User,
                default,
                Arc::clone(&hub),
                decode_balance,
            ),
            stats: FanOutService::new(
                "stats",
                TopicKind::Stats,
                config.stats_delay(),
                hub,
                decode_stats,
            ),
            cluster,
            aggregator,
            background: Mutex::new(Some(Background {
                flusher,
                sweeper_stop,
                sweeper,
            })),
        };
        info!("Gateway started");
        Ok(gateway)
    }

    /// The actor cluster behind this gateway.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Subscribes to debounced flips on a page.
    ///
    /// # Errors
    ///
    /// Validation error for a malformed address, dependency error after shutdown.
    pub fn subscribe(&self, address: &str) -> Result<Subscription<usize, bool>, EngineError> {
        let address: Address = address.parse()?;
        self.checkbox.subscribe(address)
    }

    /// Leaves any feed. Returns whether the subscription was still live.
    pub async fn unsubscribe<K, V>(&self, subscription: Subscription<K, V>) -> bool
    where
        K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        subscription.unsubscribe().await
    }

    /// Sets one checkbox.
    ///
    /// # Errors
    ///
    /// Validation errors for a bad address or index, state conflicts from an
    /// ended game behind the page, dependency errors from storage.
    #[instrument(skip(self))]
    pub async fn set_bit(
        &self,
        address: &str,
        index: usize,
        value: bool,
        user_id: &str,
    ) -> Result<SetBitOutcome, EngineError> {
        self.cluster.set_bit(address.parse()?, index, value, user_id).await
    }

    /// Compressed page contents.
    ///
    /// # Errors
    ///
    /// Validation error for a malformed address.
    #[instrument(skip(self))]
    pub async fn get_bits(&self, address: &str) -> Result<Option<Vec<u8>>, EngineError> {
        self.cluster.get_bits(address.parse()?).await
    }

    /// Creates a minesweeper game.
    ///
    /// # Errors
    ///
    /// Validation errors for a bad width or mine count.
    #[instrument(skip(self))]
    pub async fn create_minesweeper_game(
        &self,
        width: usize,
        number_of_mines: usize,
        user_id: &str,
    ) -> Result<MinesweeperView, EngineError> {
        self.cluster.create_minesweeper(width, number_of_mines, user_id).await
    }

    /// Current minesweeper view.
    ///
    /// # Errors
    ///
    /// Not-found for an unknown game.
    #[instrument(skip(self))]
    pub async fn get_minesweeper_state(
        &self,
        address: &str,
    ) -> Result<MinesweeperView, EngineError> {
        self.cluster.get_minesweeper(address.parse()?).await
    }

    /// Starts a war.
    ///
    /// # Errors
    ///
    /// Validation error for a bad width.
    #[instrument(skip(self))]
    pub async fn create_war(&self, width: usize) -> Result<WarView, EngineError> {
        self.cluster.create_war(width).await
    }

    /// Current war view.
    ///
    /// # Errors
    ///
    /// Not-found for an unknown war.
    #[instrument(skip(self))]
    pub async fn get_war(&self, id: u64) -> Result<WarView, EngineError> {
        self.cluster.get_war(id).await
    }

    /// Found gold on a page.
    ///
    /// # Errors
    ///
    /// Validation error for a malformed address.
    #[instrument(skip(self))]
    pub async fn get_gold_spots(&self, address: &str) -> Result<GoldSpotsView, EngineError> {
        self.cluster.gold_spots(address.parse()?).await
    }

    /// Checks a box on a gold-digger page.
    ///
    /// # Errors
    ///
    /// Same as [`set_bit`](Self::set_bit).
    #[instrument(skip(self))]
    pub async fn dig(
        &self,
        address: &str,
        index: usize,
        user_id: &str,
    ) -> Result<DigOutcome, EngineError> {
        self.cluster.dig(address.parse()?, index, user_id).await
    }

    /// A user's balance.
    ///
    /// # Errors
    ///
    /// Validation error for an empty user id.
    pub async fn balance(&self, user_id: &str) -> Result<Balance, EngineError> {
        self.cluster.ledger().get_balance(user_id).await
    }

    /// Renames a user.
    ///
    /// # Errors
    ///
    /// Validation error for an empty or overlong name.
    pub async fn set_display_name(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Balance, EngineError> {
        self.cluster.ledger().set_display_name(user_id, name).await
    }

    /// Global totals as of the last flush.
    pub async fn global_stats(&self) -> GlobalStats {
        self.aggregator.current().await
    }

    /// Subscribes to a minesweeper game's counts and final state.
    ///
    /// # Errors
    ///
    /// Validation error for a malformed address, dependency error after shutdown.
    pub fn subscribe_minesweeper(
        &self,
        address: &str,
    ) -> Result<MinesweeperSubscription, EngineError> {
        let address: Address = address.parse()?;
        Ok(MinesweeperSubscription {
            counts: self.minesweeper_counts.subscribe(address)?,
            state: self.minesweeper_state.subscribe(address)?,
        })
    }

    /// Subscribes to a war's state.
    ///
    /// # Errors
    ///
    /// Dependency error after shutdown.
    pub fn subscribe_war(&self, id: u64) -> Result<Subscription<u64, WarView>, EngineError> {
        self.wars.subscribe(id)
    }

    /// Subscribes to a user's balance.
    ///
    /// # Errors
    ///
    /// Dependency error after shutdown.
    pub fn subscribe_balance(
        &self,
        user_id: &str,
    ) -> Result<Subscription<String, Balance>, EngineError> {
        self.balances.subscribe(user_id)
    }

    /// Subscribes to global totals.
    ///
    /// # Errors
    ///
    /// Dependency error after shutdown.
    pub fn subscribe_stats(&self) -> Result<Subscription<String, GlobalStats>, EngineError> {
        self.stats.subscribe(GLOBAL_STATS_KEY)
    }

    /// Stops every feed and background task, then closes the hub.
    ///
    /// Pending stat deltas are flushed first. Safe to call twice.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let Some(background) = self.background.lock().await.take() else {
            warn!("Gateway already shut down");
            return;
        };
        self.checkbox.stop_all().await;
        self.minesweeper_counts.stop_all().await;
        self.minesweeper_state.stop_all().await;
        self.wars.stop_all().await;
        self.balances.stop_all().await;
        self.stats.stop_all().await;

        background.sweeper_stop.send_replace(true);
        if let Err(e) = background.sweeper.await {
            warn!(error = %e, "Idle sweeper task failed");
        }
        background.flusher.stop().await;
        self.cluster.services().hub().shutdown();
        info!("Gateway shut down");
    }
}

async fn sweep_idle(
    cluster: Arc<Cluster>,
    period: Duration,
    idle: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cluster.deactivate_idle(idle);
            }
            _ = stopped.changed() => break,
        }
    }
    debug!("Idle sweeper exited");
}
