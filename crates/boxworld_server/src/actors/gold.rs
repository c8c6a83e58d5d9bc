//! The gold digger game: sixteen hidden spots on a page.
//!
//! Unlike minesweeper and war this game is not a page callback target.
//! Whoever performed the check calls [`GoldDiggerGame::index_checked`].

use crate::host::{Actor, Services, state_key};
use crate::ledger::UserLedger;
use crate::pubsub::{Topic, TopicKind};
use crate::store::PersistentState;
use crate::EngineError;
use async_trait::async_trait;
use boxworld_bits::{Address, PAGE_BITS};
use derive_getters::Getters;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// RNG stream for gold spots.
pub const GOLD_STREAM: &str = "golddigger";
/// Spots per page.
pub const GOLD_SPOTS: usize = 16;
/// Currency credited per find.
pub const GOLD_REWARD: i64 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GoldDiggerState {
    spots: BTreeMap<usize, bool>,
}

/// What players may see: found spots and how many remain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
pub struct GoldSpotsView {
    address: Address,
    found: Vec<usize>,
    remaining: usize,
}

/// Published on `GoldDigger:<address>` when a spot is found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoldFound {
    /// Spot index.
    pub index: usize,
    /// Finder.
    pub user_id: String,
    /// Spots still hidden.
    pub remaining: usize,
}

/// Gold spots over one page.
#[derive(Debug)]
pub struct GoldDiggerGame {
    address: Address,
    state: PersistentState<GoldDiggerState>,
}

#[async_trait]
impl Actor for GoldDiggerGame {
    type Key = Address;
    const KIND: &'static str = "GoldDigger";

    #[instrument(skip(services))]
    async fn activate(key: &Address, services: &Services) -> Result<Self, EngineError> {
        let mut state: PersistentState<GoldDiggerState> =
            PersistentState::load(Arc::clone(services.store()), state_key(Self::KIND, key)).await?;
        if state.get().spots.len() < GOLD_SPOTS {
            let mut next = state.get().clone();
            let mut rng = services.rng(GOLD_STREAM)?.for_address(key);
            while next.spots.len() < GOLD_SPOTS {
                next.spots.entry(rng.gen_range(0..PAGE_BITS)).or_insert(false);
            }
            state.write(next).await?;
            debug!("Gold spots generated");
        }
        Ok(Self {
            address: *key,
            state,
        })
    }
}

impl GoldDiggerGame {
    /// Found spots and the remaining count.
    pub fn view(&self) -> GoldSpotsView {
        let spots = &self.state.get().spots;
        let found: Vec<usize> = spots.iter().filter(|(_, f)| **f).map(|(i, _)| *i).collect();
        GoldSpotsView {
            address: self.address,
            remaining: spots.len() - found.len(),
            found,
        }
    }

    /// Records that `user_id` checked `index`.
    ///
    /// A hidden spot becomes found and its finder is credited; anything
    /// else is a no-op. Returns whether gold was found.
    ///
    /// # Errors
    ///
    /// Dependency errors from storage or the ledger.
    #[instrument(skip(self, services, ledger), fields(page = %self.address))]
    pub async fn index_checked(
        &mut self,
        services: &Services,
        ledger: &dyn UserLedger,
        index: usize,
        user_id: &str,
    ) -> Result<bool, EngineError> {
        if self.state.get().spots.get(&index) != Some(&false) {
            return Ok(false);
        }
        let mut next = self.state.get().clone();
        next.spots.insert(index, true);
        self.state.write(next).await?;
        ledger.add_currency(user_id, GOLD_REWARD).await?;

        let event = GoldFound {
            index,
            user_id: user_id.to_string(),
            remaining: self.view().remaining,
        };
        info!(index, remaining = event.remaining, "Gold found");
        let topic = Topic::new(TopicKind::GoldDigger, self.address);
        if let Err(e) = services.hub().publish(&topic, &event) {
            warn!(error = %e, "Failed to publish gold find");
        }
        Ok(true)
    }

    #[cfg(test)]
    fn hidden(&self) -> Vec<usize> {
        self.state
            .get()
            .spots
            .iter()
            .filter(|(_, f)| !**f)
            .map(|(i, _)| *i)
            .collect()
    }
}
