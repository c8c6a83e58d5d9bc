//! Actor kinds hosted by the engine.

mod callback;
mod gold;
mod minesweeper;
mod page;
mod user;
mod war;

pub use callback::{
    AutoRevealed, CallbackDispatch, CallbackTarget, CheckboxObserver, CheckboxUpdate,
};
pub use gold::{GOLD_REWARD, GOLD_SPOTS, GOLD_STREAM, GoldDiggerGame, GoldFound, GoldSpotsView};
pub use minesweeper::{
    CellCount, MINE_STREAM, MinesweeperEvent, MinesweeperGame, MinesweeperState, MinesweeperView,
};
pub use page::{CheckboxEvent, CheckboxPage, CheckboxPageState, SetBitOutcome};
pub use user::{Balance, MAX_DISPLAY_NAME, UserAccount};
pub use war::{NewWar, Team, WarGame, WarState, WarView, balanced_battlefield};
