//! The minesweeper game actor.
//!
//! A game owns two checkbox pages: sweeping a cell is checking it on the
//! sweep page, flagging is checking it on the flag page. Both pages call
//! back into the game on every flip.

use super::callback::{AutoRevealed, CheckboxObserver, CheckboxUpdate};
use crate::host::{Actor, Services, state_key};
use crate::pubsub::{Topic, TopicKind};
use crate::store::PersistentState;
use crate::EngineError;
use async_trait::async_trait;
use boxworld_bits::Address;
use boxworld_minesweeper::{Grid, MineField};
use chrono::{DateTime, Utc};
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// RNG stream for mine layouts.
pub const MINE_STREAM: &str = "minesweeper";

/// Persisted game record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinesweeperState {
    width: usize,
    number_of_mines: usize,
    mines: BTreeMap<usize, bool>,
    revealed: BTreeSet<usize>,
    sweep_address: Option<Address>,
    flag_address: Option<Address>,
    created_by: Option<String>,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    won: Option<bool>,
}

/// Adjacency count of one exposed cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellCount {
    /// Cell index.
    pub index: usize,
    /// Mines around it.
    pub count: u8,
}

/// Public view of a game. Mines stay hidden until it ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
pub struct MinesweeperView {
    address: Address,
    width: usize,
    number_of_mines: usize,
    sweep_address: Address,
    flag_address: Address,
    created_by: Option<String>,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    won: Option<bool>,
    counts: Vec<CellCount>,
    mines: Option<Vec<usize>>,
}

/// Published on `Minesweeper:<address>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MinesweeperEvent {
    /// Newly exposed adjacency counts.
    Counts {
        /// Counts by cell.
        counts: Vec<CellCount>,
    },
    /// Full game state after it ended.
    State {
        /// The game.
        game: MinesweeperView,
    },
}

/// One minesweeper game.
#[derive(Debug)]
pub struct MinesweeperGame {
    address: Address,
    state: PersistentState<MinesweeperState>,
}

#[async_trait]
impl Actor for MinesweeperGame {
    type Key = Address;
    const KIND: &'static str = "Minesweeper";

    #[instrument(skip(services))]
    async fn activate(key: &Address, services: &Services) -> Result<Self, EngineError> {
        let state =
            PersistentState::load(Arc::clone(services.store()), state_key(Self::KIND, key)).await?;
        let mut game = Self {
            address: *key,
            state,
        };
        game.top_up_mines(services).await?;
        Ok(game)
    }
}

impl MinesweeperGame {
    /// Game address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether `create_game` has run.
    pub fn is_created(&self) -> bool {
        self.state.get().created_at.is_some()
    }

    /// Whether the game has ended.
    pub fn is_ended(&self) -> bool {
        self.state.get().ended_at.is_some()
    }

    /// `Some(true)` after a win, `Some(false)` after a loss.
    pub fn won(&self) -> Option<bool> {
        self.state.get().won
    }

    /// Sweep and flag page addresses, once created.
    pub fn pages(&self) -> Option<(Address, Address)> {
        let state = self.state.get();
        state.sweep_address.zip(state.flag_address)
    }

    /// Mine index → detonated.
    pub fn mines(&self) -> &BTreeMap<usize, bool> {
        &self.state.get().mines
    }

    /// Cells exposed so far, manually or by flood fill.
    pub fn revealed(&self) -> &BTreeSet<usize> {
        &self.state.get().revealed
    }

    /// Lays out a new game at this address.
    ///
    /// Mines come from the addressed RNG for this game's address, so the
    /// layout can be regenerated from the address alone. The caller
    /// registers the game on its two pages afterwards.
    ///
    /// # Errors
    ///
    /// Validation errors for a bad width or mine count, a state conflict if
    /// a game already exists here, dependency errors from storage.
    #[instrument(skip(self, services), fields(game = %self.address))]
    pub async fn create_game(
        &mut self,
        services: &Services,
        width: usize,
        number_of_mines: usize,
        user_id: &str,
    ) -> Result<MinesweeperView, EngineError> {
        if self.is_created() {
            return Err(EngineError::state_conflict(format!(
                "minesweeper game {} already exists",
                self.address
            )));
        }
        let grid = Grid::new(width)?;
        let mut rng = services.rng(MINE_STREAM)?.for_address(&self.address);
        let field = MineField::generate(grid, number_of_mines, &mut rng)?;

        let record = MinesweeperState {
            width,
            number_of_mines,
            mines: field.mines().clone(),
            revealed: BTreeSet::new(),
            sweep_address: Some(Address::random()),
            flag_address: Some(Address::random()),
            created_by: Some(user_id.to_string()),
            created_at: Some(Utc::now()),
            started_at: None,
            ended_at: None,
            won: None,
        };
        self.state.write(record).await?;
        info!(width, number_of_mines, "Minesweeper game created");
        self.view(None)
    }

    /// Public view, with counts for every exposed cell.
    ///
    /// Cells checked on `sweep_bits` count as exposed alongside the game's
    /// own revealed set. Counts are recomputed on every call.
    ///
    /// # Errors
    ///
    /// Returns not-found if no game was created at this address.
    pub fn view(&self, sweep_bits: Option<&[bool]>) -> Result<MinesweeperView, EngineError> {
        let state = self.state.get();
        let (Some(sweep_address), Some(flag_address)) = (state.sweep_address, state.flag_address)
        else {
            return Err(EngineError::not_found(format!(
                "no minesweeper game at {}",
                self.address
            )));
        };
        let field = self.field()?;
        let checked = sweep_bits
            .unwrap_or_default()
            .iter()
            .take(field.grid().cells())
            .enumerate()
            .filter(|(_, b)| **b)
            .map(|(i, _)| i);
        let exposed: BTreeSet<usize> = state.revealed.iter().copied().chain(checked).collect();
        let counts = exposed
            .into_iter()
            .filter(|i| !field.is_mine(*i))
            .map(|index| CellCount {
                index,
                count: field.count_surrounding(index),
            })
            .collect();

        Ok(MinesweeperView {
            address: self.address,
            width: state.width,
            number_of_mines: state.number_of_mines,
            sweep_address,
            flag_address,
            created_by: state.created_by.clone(),
            created_at: state.created_at,
            started_at: state.started_at,
            ended_at: state.ended_at,
            won: state.won,
            counts,
            mines: state
                .ended_at
                .map(|_| state.mines.keys().copied().collect()),
        })
    }

    fn field(&self) -> Result<MineField, EngineError> {
        let state = self.state.get();
        Ok(MineField::from_parts(Grid::new(state.width)?, state.mines.clone()))
    }

    async fn top_up_mines(&mut self, services: &Services) -> Result<(), EngineError> {
        let state = self.state.get();
        if !self.is_created() || state.mines.len() >= state.number_of_mines {
            return Ok(());
        }
        let mut field = self.field()?;
        let mut rng = services.rng(MINE_STREAM)?.for_address(&self.address);
        let added = field.top_up(state.number_of_mines, &mut rng);

        let mut next = self.state.get().clone();
        next.mines = field.mines().clone();
        self.state.write(next).await?;
        info!(added, "Mine layout completed on activation");
        Ok(())
    }

    fn publish(&self, services: &Services, event: &MinesweeperEvent) {
        let topic = Topic::new(TopicKind::Minesweeper, self.address);
        if let Err(e) = services.hub().publish(&topic, event) {
            warn!(error = %e, "Failed to publish minesweeper event");
        }
    }

    fn publish_state(&self, services: &Services) {
        match self.view(None) {
            Ok(game) => self.publish(services, &MinesweeperEvent::State { game }),
            Err(e) => warn!(error = %e, "Cannot build game view"),
        }
    }
}

fn counts(counts: &BTreeMap<usize, u8>) -> Vec<CellCount> {
    counts
        .iter()
        .map(|(&index, &count)| CellCount { index, count })
        .collect()
}

#[async_trait]
impl CheckboxObserver for MinesweeperGame {
    #[instrument(
        skip(self, services, update),
        fields(game = %self.address, page = %update.page, index = update.index, value = update.value)
    )]
    async fn when_checkboxes_updated(
        &mut self,
        services: &Services,
        update: &CheckboxUpdate<'_>,
    ) -> Result<Option<AutoRevealed>, EngineError> {
        if !self.is_created() {
            return Err(EngineError::state_conflict(format!(
                "no minesweeper game at {}",
                self.address
            )));
        }
        if self.is_ended() {
            return Err(EngineError::state_conflict(format!(
                "minesweeper game {} has ended",
                self.address
            )));
        }
        let mut field = self.field()?;
        let index = update.index;
        field.grid().check(index)?;
        let Some((sweep_page, flag_page)) = self.pages() else {
            return Err(EngineError::not_found("game has no pages"));
        };
        if update.page != sweep_page && update.page != flag_page {
            return Err(EngineError::validation(format!(
                "page {} does not belong to game {}",
                update.page, self.address
            )));
        }

        let mut next = self.state.get().clone();
        let now = Utc::now();
        next.started_at.get_or_insert(now);

        if update.page == flag_page || !update.value {
            self.state.write(next).await?;
            debug!("Flag or unreveal, no game effect");
            return Ok(None);
        }

        if next.revealed.is_empty() && field.is_mine(index) {
            field.relocate(index);
            next.mines = field.mines().clone();
            next.revealed.insert(index);
            self.state.write(next).await?;
            let opening = BTreeMap::from([(index, field.count_surrounding(index))]);
            self.publish(
                services,
                &MinesweeperEvent::Counts {
                    counts: counts(&opening),
                },
            );
            info!("Opening click was a mine, relocated");
            return Ok(None);
        }

        if field.is_mine(index) {
            field.detonate(index);
            next.mines = field.mines().clone();
            next.ended_at = Some(now);
            next.won = Some(false);
            self.state.write(next).await?;
            self.publish_state(services);
            info!("Mine hit, game lost");
            return Ok(None);
        }

        let reveal = field.reveal(index, &next.revealed);
        next.revealed.insert(index);
        next.revealed.extend(reveal.auto_revealed());
        let safe_cells = field.grid().cells() - field.mine_count();
        let won = next.revealed.len() >= safe_cells;
        if won {
            next.ended_at = Some(now);
            next.won = Some(true);
        }
        self.state.write(next).await?;
        self.publish(
            services,
            &MinesweeperEvent::Counts {
                counts: counts(reveal.counts()),
            },
        );

        if won {
            self.publish_state(services);
            info!("Board cleared, game won");
            return Ok(None);
        }
        let auto: AutoRevealed = reveal.auto_revealed().map(|i| (i, true)).collect();
        debug!(auto_revealed = auto.len(), "Safe reveal");
        Ok(Some(auto))
    }
}
