//! Square grid geometry.

use crate::BoardError;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Smallest allowed board width.
pub const MIN_WIDTH: usize = 8;
/// Largest allowed board width (64² = one full page).
pub const MAX_WIDTH: usize = 64;

/// A `width × width` board addressed by linear index `row * width + col`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grid {
    width: usize,
}

impl Grid {
    /// Creates a grid, validating `MIN_WIDTH <= width <= MAX_WIDTH`.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError`] if the width is out of range.
    #[instrument]
    pub fn new(width: usize) -> Result<Self, BoardError> {
        if !(MIN_WIDTH..=MAX_WIDTH).contains(&width) {
            return Err(BoardError::new(format!(
                "width {} outside {}..={}",
                width, MIN_WIDTH, MAX_WIDTH
            )));
        }
        Ok(Self { width })
    }

    /// Side length.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of cells.
    pub fn cells(&self) -> usize {
        self.width * self.width
    }

    /// Whether `index` lies on the board.
    pub fn contains(&self, index: usize) -> bool {
        index < self.cells()
    }

    /// Fails unless `index` lies on the board.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError`] if the index is out of range.
    pub fn check(&self, index: usize) -> Result<(), BoardError> {
        if self.contains(index) {
            Ok(())
        } else {
            Err(BoardError::new(format!(
                "index {} outside board of {} cells",
                index,
                self.cells()
            )))
        }
    }

    /// The up-to-eight neighbors of `index`, clipped at the edges.
    pub fn neighbors(&self, index: usize) -> impl Iterator<Item = usize> + use<> {
        let width = self.width as isize;
        let row = (index / self.width) as isize;
        let col = (index % self.width) as isize;

        (-1isize..=1)
            .flat_map(|dr| (-1isize..=1).map(move |dc| (dr, dc)))
            .filter(|&(dr, dc)| dr != 0 || dc != 0)
            .filter_map(move |(dr, dc)| {
                let (r, c) = (row + dr, col + dc);
                if (0..width).contains(&r) && (0..width).contains(&c) {
                    Some((r * width + c) as usize)
                } else {
                    None
                }
            })
    }
}
