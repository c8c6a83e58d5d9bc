//! Pure minesweeper board logic for boxworld.
//!
//! The game actor in `boxworld_server` owns persistence and publishing;
//! this crate only answers board questions: where the mines are, how many
//! surround a cell, which cells a reveal exposes.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod field;
mod grid;

pub use error::BoardError;
pub use field::{MineField, Reveal};
pub use grid::{Grid, MAX_WIDTH, MIN_WIDTH};
