//! The page → game callback contract.
//!
//! A checkbox page holds at most one [`CallbackTarget`]. On every real flip
//! it hands a [`CheckboxUpdate`] to that target through a
//! [`CallbackDispatch`] before committing anything, and a failure aborts
//! the flip.

use crate::host::Services;
use crate::EngineError;
use async_trait::async_trait;
use boxworld_bits::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The game a page notifies about flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(tag = "kind", content = "key")]
pub enum CallbackTarget {
    /// A minesweeper game, notified from its sweep and flag pages.
    #[display("Minesweeper:{}", _0)]
    Minesweeper(Address),
    /// A war round, notified from its battlefield page.
    #[display("War:{}", _0)]
    War(u64),
}

/// One real flip, as seen by the callback target.
#[derive(Debug, Clone, Copy)]
pub struct CheckboxUpdate<'a> {
    /// Page that flipped.
    pub page: Address,
    /// Full page contents including this flip.
    pub bits: &'a [bool],
    /// Flipped index.
    pub index: usize,
    /// New value at `index`.
    pub value: bool,
    /// User who flipped it.
    pub user_id: &'a str,
}

/// Extra indices a game wants shown as revealed, all mapped to `true`.
pub type AutoRevealed = BTreeMap<usize, bool>;

/// Implemented by games that react to page flips.
#[async_trait]
pub trait CheckboxObserver {
    /// Handles a flip on one of this game's pages.
    ///
    /// Runs while the page is locked and before the flip is committed. An
    /// error vetoes the flip.
    async fn when_checkboxes_updated(
        &mut self,
        services: &Services,
        update: &CheckboxUpdate<'_>,
    ) -> Result<Option<AutoRevealed>, EngineError>;
}

/// Routes an update to whichever game a [`CallbackTarget`] names.
#[async_trait]
pub trait CallbackDispatch: Send + Sync {
    /// Delivers `update` to `target` and returns its answer.
    async fn dispatch(
        &self,
        target: CallbackTarget,
        update: &CheckboxUpdate<'_>,
    ) -> Result<Option<AutoRevealed>, EngineError>;
}
