//! Every actor host in one process, wired together.

use crate::actors::{
    AutoRevealed, CallbackDispatch, CallbackTarget, CheckboxObserver, CheckboxPage, CheckboxUpdate,
    GoldDiggerGame, GoldSpotsView, MinesweeperGame, MinesweeperView, SetBitOutcome, UserAccount,
    WarGame, WarView,
};
use crate::host::{ActorHost, Services, state_key};
use crate::ledger::AccountLedger;
use crate::pubsub::{Topic, TopicKind};
use crate::store::PersistentState;
use crate::EngineError;
use async_trait::async_trait;
use boxworld_bits::{Address, decompress};
use boxworld_minesweeper::Grid;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Result of [`Cluster::dig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigOutcome {
    /// Whether the box flipped to checked.
    pub changed: bool,
    /// Whether it uncovered gold.
    pub found: bool,
}

/// Single-process home of every actor.
///
/// Lock order is page before game: a page calls into its game while
/// locked, so no method here holds a game while taking a page.
#[derive(Debug)]
pub struct Cluster {
    services: Arc<Services>,
    pages: ActorHost<CheckboxPage>,
    minesweepers: ActorHost<MinesweeperGame>,
    wars: ActorHost<WarGame>,
    gold: ActorHost<GoldDiggerGame>,
    ledger: AccountLedger,
    war_sequence: Mutex<PersistentState<u64>>,
}

impl Cluster {
    /// Creates the hosts and loads the war id sequence.
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the sequence cannot be read.
    #[instrument(skip_all)]
    pub async fn new(services: Arc<Services>) -> Result<Self, EngineError> {
        let key = state_key("WarSequence", &"global");
        let war_sequence = PersistentState::load(Arc::clone(services.store()), key).await?;
        let ledger = AccountLedger::new(
            ActorHost::<UserAccount>::new(Arc::clone(&services)),
            Arc::clone(services.hub()),
        );
        info!("Cluster ready");
        Ok(Self {
            pages: ActorHost::new(Arc::clone(&services)),
            minesweepers: ActorHost::new(Arc::clone(&services)),
            wars: ActorHost::new(Arc::clone(&services)),
            gold: ActorHost::new(Arc::clone(&services)),
            ledger,
            war_sequence: Mutex::new(war_sequence),
            services,
        })
    }

    /// Shared collaborators.
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// The user ledger.
    pub fn ledger(&self) -> &AccountLedger {
        &self.ledger
    }

    /// Sets one bit on a page.
    ///
    /// # Errors
    ///
    /// See [`CheckboxPage::set_bit`].
    pub async fn set_bit(
        &self,
        address: Address,
        index: usize,
        value: bool,
        user_id: &str,
    ) -> Result<SetBitOutcome, EngineError> {
        self.pages
            .get(&address)
            .await?
            .set_bit(&self.services, self, index, value, user_id)
            .await
    }

    /// Compressed page bits, `None` for a page never written.
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the page cannot be loaded.
    pub async fn get_bits(&self, address: Address) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.pages.get(&address).await?.get_bits())
    }

    /// Creates a minesweeper game and hooks it to its two pages.
    ///
    /// The game address is derived from the creator and the current time.
    ///
    /// # Errors
    ///
    /// See [`MinesweeperGame::create_game`].
    #[instrument(skip(self))]
    pub async fn create_minesweeper(
        &self,
        width: usize,
        number_of_mines: usize,
        user_id: &str,
    ) -> Result<MinesweeperView, EngineError> {
        let now = Utc::now().timestamp_micros().to_be_bytes();
        let address = Address::digest(&[user_id.as_bytes(), &now]);

        let view = self
            .minesweepers
            .get(&address)
            .await?
            .create_game(&self.services, width, number_of_mines, user_id)
            .await?;

        let target = CallbackTarget::Minesweeper(address);
        for page in [*view.sweep_address(), *view.flag_address()] {
            self.pages.get(&page).await?.register_callback(target).await?;
        }
        info!(game = %address, "Minesweeper game ready");
        Ok(view)
    }

    /// Game view with counts for every exposed cell.
    ///
    /// # Errors
    ///
    /// Not-found if no game exists at `address`.
    #[instrument(skip(self))]
    pub async fn get_minesweeper(&self, address: Address) -> Result<MinesweeperView, EngineError> {
        let pages = self.minesweepers.get(&address).await?.pages();
        let Some((sweep_page, _)) = pages else {
            return Err(EngineError::not_found(format!(
                "no minesweeper game at {}",
                address
            )));
        };
        let compressed = self.pages.get(&sweep_page).await?.get_bits();
        let bits = match compressed {
            Some(bytes) => decompress(&bytes)?.unwrap_or_default(),
            None => Vec::new(),
        };
        self.minesweepers.get(&address).await?.view(Some(&bits))
    }

    /// Starts a war on a fresh, half-checked page.
    ///
    /// # Errors
    ///
    /// Validation errors for a bad width, dependency errors from storage.
    #[instrument(skip(self))]
    pub async fn create_war(&self, width: usize) -> Result<WarView, EngineError> {
        Grid::new(width)?;
        let id = self.next_war_id().await?;
        let new = self.wars.get(&id).await?.create_war(width).await?;

        let mut page = self.pages.get(new.view.war_page_address()).await?;
        page.set_bits(&new.battlefield).await?;
        page.register_callback(CallbackTarget::War(id)).await?;
        drop(page);

        if let Err(e) = self
            .services
            .hub()
            .publish(&Topic::new(TopicKind::War, id), &new.view)
        {
            warn!(error = %e, "Failed to publish new war");
        }
        info!(war = id, "War ready");
        Ok(new.view)
    }

    /// War view.
    ///
    /// # Errors
    ///
    /// Not-found if no war has this id.
    pub async fn get_war(&self, id: u64) -> Result<WarView, EngineError> {
        self.wars.get(&id).await?.view()
    }

    /// Found gold spots on a page and how many remain.
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the game cannot be loaded.
    pub async fn gold_spots(&self, address: Address) -> Result<GoldSpotsView, EngineError> {
        Ok(self.gold.get(&address).await?.view())
    }

    /// Checks a box on a gold-digger page and credits any gold under it.
    ///
    /// # Errors
    ///
    /// See [`CheckboxPage::set_bit`] and [`GoldDiggerGame::index_checked`].
    #[instrument(skip(self))]
    pub async fn dig(
        &self,
        address: Address,
        index: usize,
        user_id: &str,
    ) -> Result<DigOutcome, EngineError> {
        let outcome = self.set_bit(address, index, true, user_id).await?;
        if !outcome.changed {
            return Ok(DigOutcome::default());
        }
        let found = self
            .gold
            .get(&address)
            .await?
            .index_checked(&self.services, &self.ledger, index, user_id)
            .await?;
        Ok(DigOutcome { changed: true, found })
    }

    /// Drops every activation idle for at least `idle`.
    pub fn deactivate_idle(&self, idle: Duration) -> usize {
        let dropped = self.pages.deactivate_idle(idle)
            + self.minesweepers.deactivate_idle(idle)
            + self.wars.deactivate_idle(idle)
            + self.gold.deactivate_idle(idle)
            + self.ledger.accounts().deactivate_idle(idle);
        debug!(dropped, "Idle sweep finished");
        dropped
    }

    async fn next_war_id(&self) -> Result<u64, EngineError> {
        let mut sequence = self.war_sequence.lock().await;
        let next = sequence.get() + 1;
        sequence.write(next).await?;
        Ok(next)
    }
}

#[async_trait]
impl CallbackDispatch for Cluster {
    async fn dispatch(
        &self,
        target: CallbackTarget,
        update: &CheckboxUpdate<'_>,
    ) -> Result<Option<AutoRevealed>, EngineError> {
        match target {
            CallbackTarget::Minesweeper(address) => {
                self.minesweepers
                    .get(&address)
                    .await?
                    .when_checkboxes_updated(&self.services, update)
                    .await
            }
            CallbackTarget::War(id) => {
                self.wars
                    .get(&id)
                    .await?
                    .when_checkboxes_updated(&self.services, update)
                    .await
            }
        }
    }
}
