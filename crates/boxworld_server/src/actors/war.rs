//! The war game actor: two teams fight over one checkbox page.

use super::callback::{AutoRevealed, CheckboxObserver, CheckboxUpdate};
use crate::host::{Actor, Services, state_key};
use crate::pubsub::{Topic, TopicKind};
use crate::store::PersistentState;
use crate::EngineError;
use async_trait::async_trait;
use boxworld_bits::{Address, pack_be, unpack_be};
use boxworld_minesweeper::Grid;
use chrono::{DateTime, Utc};
use derive_getters::Getters;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, info, instrument, warn};

/// Which side won a war.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum Team {
    /// Still being fought.
    #[default]
    None,
    /// Every box checked.
    Checkers,
    /// Every box unchecked.
    Uncheckers,
}

/// Persisted war record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarState {
    width: usize,
    war_page_address: Option<Address>,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    checked_count: usize,
    unchecked_count: usize,
    winning_team: Team,
}

/// Public view of a war, published on `War:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
pub struct WarView {
    id: u64,
    war_page_address: Address,
    width: usize,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    checked_count: usize,
    unchecked_count: usize,
    winning_team: Team,
}

/// A freshly created war and the bytes its page must be seeded with.
#[derive(Debug, Clone)]
pub struct NewWar {
    /// The war.
    pub view: WarView,
    /// Big-endian packed battlefield, exactly half checked.
    pub battlefield: Vec<u8>,
}

/// Random battlefield of `cells` bits with exactly `cells / 2` set.
///
/// Starts from random bytes and flips random bits toward the target
/// instead of redrawing.
pub fn balanced_battlefield<R: Rng + ?Sized>(cells: usize, rng: &mut R) -> Vec<u8> {
    let mut bytes = vec![0u8; cells.div_ceil(8)];
    rng.fill(bytes.as_mut_slice());
    let mut bits = unpack_be(&bytes, cells);

    let target = cells / 2;
    let mut set = bits.iter().filter(|b| **b).count();
    let mut flips = 0usize;
    while set != target {
        let i = rng.gen_range(0..cells);
        if set > target && bits[i] {
            bits[i] = false;
            set -= 1;
            flips += 1;
        } else if set < target && !bits[i] {
            bits[i] = true;
            set += 1;
            flips += 1;
        }
    }
    debug!(cells, flips, "Battlefield balanced");
    pack_be(&bits)
}

/// One war round.
#[derive(Debug)]
pub struct WarGame {
    id: u64,
    state: PersistentState<WarState>,
}

#[async_trait]
impl Actor for WarGame {
    type Key = u64;
    const KIND: &'static str = "War";

    async fn activate(key: &u64, services: &Services) -> Result<Self, EngineError> {
        let state =
            PersistentState::load(Arc::clone(services.store()), state_key(Self::KIND, key)).await?;
        Ok(Self { id: *key, state })
    }
}

impl WarGame {
    /// War id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether one side has won.
    pub fn is_ended(&self) -> bool {
        self.state.get().ended_at.is_some()
    }

    /// Creates the war with a fresh battlefield page.
    ///
    /// The caller seeds the page with [`NewWar::battlefield`] and registers
    /// this war as its callback target.
    ///
    /// # Errors
    ///
    /// Validation errors for a bad width, a state conflict if this id is
    /// taken, dependency errors from storage.
    #[instrument(skip(self), fields(war = self.id))]
    pub async fn create_war(&mut self, width: usize) -> Result<NewWar, EngineError> {
        if self.state.get().created_at.is_some() {
            return Err(EngineError::state_conflict(format!("war {} already exists", self.id)));
        }
        let cells = Grid::new(width)?.cells();
        let battlefield = balanced_battlefield(cells, &mut rand::rngs::OsRng);

        let checked = cells / 2;
        let record = WarState {
            width,
            war_page_address: Some(Address::random()),
            created_at: Some(Utc::now()),
            started_at: None,
            ended_at: None,
            checked_count: checked,
            unchecked_count: cells - checked,
            winning_team: Team::None,
        };
        self.state.write(record).await?;
        info!(width, "War created");
        Ok(NewWar {
            view: self.view()?,
            battlefield,
        })
    }

    /// Public view.
    ///
    /// # Errors
    ///
    /// Returns not-found if no war was created under this id.
    pub fn view(&self) -> Result<WarView, EngineError> {
        let state = self.state.get();
        let Some(war_page_address) = state.war_page_address else {
            return Err(EngineError::not_found(format!("no war {}", self.id)));
        };
        Ok(WarView {
            id: self.id,
            war_page_address,
            width: state.width,
            created_at: state.created_at,
            started_at: state.started_at,
            ended_at: state.ended_at,
            checked_count: state.checked_count,
            unchecked_count: state.unchecked_count,
            winning_team: state.winning_team,
        })
    }
}

#[async_trait]
impl CheckboxObserver for WarGame {
    #[instrument(
        skip(self, services, update),
        fields(war = self.id, index = update.index, value = update.value)
    )]
    async fn when_checkboxes_updated(
        &mut self,
        services: &Services,
        update: &CheckboxUpdate<'_>,
    ) -> Result<Option<AutoRevealed>, EngineError> {
        let view = self.view().map_err(|e| EngineError::state_conflict(e.message))?;
        if self.is_ended() {
            return Err(EngineError::state_conflict(format!("war {} has ended", self.id)));
        }
        let cells = view.width * view.width;
        if update.index >= cells {
            return Err(EngineError::validation(format!(
                "index {} outside battlefield of {} cells",
                update.index, cells
            )));
        }

        let checked = update.bits.iter().take(cells).filter(|b| **b).count();
        let mut next = self.state.get().clone();
        let now = Utc::now();
        next.started_at.get_or_insert(now);
        next.checked_count = checked;
        next.unchecked_count = cells - checked;
        next.winning_team = if checked == cells {
            Team::Checkers
        } else if checked == 0 {
            Team::Uncheckers
        } else {
            Team::None
        };
        if next.winning_team != Team::None {
            next.ended_at = Some(now);
            info!(winner = %next.winning_team, "War won");
        }
        self.state.write(next).await?;

        let view = self.view()?;
        if let Err(e) = services.hub().publish(&Topic::new(TopicKind::War, self.id), &view) {
            warn!(error = %e, "Failed to publish war state");
        }
        debug!(checked, "War tallied");
        Ok(None)
    }
}
