//! Mine layout, adjacency counts and flood-fill reveal.

use crate::{BoardError, Grid};
use derive_getters::Getters;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, instrument};

/// Mines on a grid, each with a "detonated" flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MineField {
    grid: Grid,
    mines: BTreeMap<usize, bool>,
}

/// Cells exposed by one safe reveal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Getters)]
pub struct Reveal {
    /// Zero-count cells reached by the flood fill, excluding the start cell.
    zero_region: BTreeSet<usize>,
    /// Non-zero cells bordering the zero region.
    border: BTreeSet<usize>,
    /// Adjacency counts for the start cell and every newly exposed cell.
    counts: BTreeMap<usize, u8>,
}

impl Reveal {
    /// Every cell the flood fill exposed besides the start cell.
    pub fn auto_revealed(&self) -> impl Iterator<Item = usize> + '_ {
        self.zero_region.union(&self.border).copied()
    }
}

impl MineField {
    /// Draws `count` distinct mines from `rng`.
    ///
    /// Duplicate draws are discarded and drawn again until the count is
    /// reached. `count` is capped at half the board, which keeps the loop
    /// short in practice.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError`] unless `1 <= count <= cells / 2`.
    #[instrument(skip(rng), fields(width = grid.width()))]
    pub fn generate<R: Rng + ?Sized>(
        grid: Grid,
        count: usize,
        rng: &mut R,
    ) -> Result<Self, BoardError> {
        let max = grid.cells() / 2;
        if !(1..=max).contains(&count) {
            return Err(BoardError::new(format!(
                "mine count {} outside 1..={}",
                count, max
            )));
        }

        let mut field = Self {
            grid,
            mines: BTreeMap::new(),
        };
        field.top_up(count, rng);
        Ok(field)
    }

    /// Draws mines from `rng` until the field holds `count`; returns how
    /// many were added.
    ///
    /// Existing mines are kept, so replaying the same generator over a
    /// partially generated field finishes the same layout.
    pub fn top_up<R: Rng + ?Sized>(&mut self, count: usize, rng: &mut R) -> usize {
        let count = count.min(self.grid.cells());
        let before = self.mines.len();
        let mut draws = 0usize;
        while self.mines.len() < count {
            self.mines.entry(rng.gen_range(0..self.grid.cells())).or_insert(false);
            draws += 1;
        }
        let added = self.mines.len() - before;
        debug!(count, draws, added, "Mine layout topped up");
        added
    }

    /// Rebuilds a field from stored parts.
    pub fn from_parts(grid: Grid, mines: BTreeMap<usize, bool>) -> Self {
        Self { grid, mines }
    }

    /// The grid this field lives on.
    pub fn grid(&self) -> Grid {
        self.grid
    }

    /// Mine index → detonated.
    pub fn mines(&self) -> &BTreeMap<usize, bool> {
        &self.mines
    }

    /// Number of mines.
    pub fn mine_count(&self) -> usize {
        self.mines.len()
    }

    /// Whether `index` holds a mine.
    pub fn is_mine(&self, index: usize) -> bool {
        self.mines.contains_key(&index)
    }

    /// Marks the mine at `index` as detonated. Returns `false` if there is none.
    pub fn detonate(&mut self, index: usize) -> bool {
        match self.mines.get_mut(&index) {
            Some(detonated) => {
                *detonated = true;
                true
            }
            None => false,
        }
    }

    /// Mines among the neighbors of `index`.
    pub fn count_surrounding(&self, index: usize) -> u8 {
        self.grid.neighbors(index).filter(|n| self.is_mine(*n)).count() as u8
    }

    /// Moves the mine at `index` to the first free cell scanning from 0.
    ///
    /// Returns the new position, or `None` if `index` held no mine or the
    /// board has no free cell.
    #[instrument(skip(self))]
    pub fn relocate(&mut self, index: usize) -> Option<usize> {
        if !self.is_mine(index) {
            return None;
        }
        let target = (0..self.grid.cells()).find(|&i| i != index && !self.is_mine(i))?;
        let detonated = self.mines.remove(&index).unwrap_or(false);
        self.mines.insert(target, detonated);
        debug!(from = index, to = target, "Relocated mine");
        Some(target)
    }

    /// Exposes `start` and, when it has no adjacent mines, flood-fills
    /// outward through zero-count cells.
    ///
    /// Cells in `already_revealed` are walked through but not reported.
    #[instrument(skip(self, already_revealed))]
    pub fn reveal(&self, start: usize, already_revealed: &BTreeSet<usize>) -> Reveal {
        let mut reveal = Reveal::default();
        let start_count = self.count_surrounding(start);
        reveal.counts.insert(start, start_count);
        if start_count != 0 {
            return reveal;
        }

        let mut visited = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(cell) = queue.pop_front() {
            for neighbor in self.grid.neighbors(cell) {
                if !visited.insert(neighbor) || self.is_mine(neighbor) {
                    continue;
                }
                let count = self.count_surrounding(neighbor);
                if count == 0 {
                    queue.push_back(neighbor);
                }
                if already_revealed.contains(&neighbor) {
                    continue;
                }
                reveal.counts.insert(neighbor, count);
                if count == 0 {
                    reveal.zero_region.insert(neighbor);
                } else {
                    reveal.border.insert(neighbor);
                }
            }
        }

        debug!(
            zero = reveal.zero_region.len(),
            border = reveal.border.len(),
            "Flood fill complete"
        );
        reveal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg32;

    fn field(mines: &[usize]) -> MineField {
        let grid = Grid::new(8).unwrap();
        MineField::from_parts(grid, mines.iter().map(|&m| (m, false)).collect())
    }

    #[test]
    fn test_generate_exact_count() {
        let grid = Grid::new(8).unwrap();
        let mut rng = Pcg32::seed_from_u64(1);
        let f = MineField::generate(grid, 32, &mut rng).unwrap();
        assert_eq!(f.mine_count(), 32);
        assert!(f.mines().keys().all(|&m| grid.contains(m)));
    }

    #[test]
    fn test_generate_is_deterministic() {
        let grid = Grid::new(16).unwrap();
        let a = MineField::generate(grid, 40, &mut Pcg32::new(7, 9)).unwrap();
        let b = MineField::generate(grid, 40, &mut Pcg32::new(7, 9)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_generate_rejects_bad_counts() {
        let grid = Grid::new(8).unwrap();
        let mut rng = Pcg32::seed_from_u64(1);
        assert!(MineField::generate(grid, 0, &mut rng).is_err());
        assert!(MineField::generate(grid, 33, &mut rng).is_err());
    }

    #[test]
    fn test_top_up_finishes_partial_layout() {
        let grid = Grid::new(8).unwrap();
        let full = MineField::generate(grid, 10, &mut Pcg32::new(3, 4)).unwrap();
        let first: BTreeMap<usize, bool> =
            full.mines().iter().take(4).map(|(k, v)| (*k, *v)).collect();
        let mut partial = MineField::from_parts(grid, first);
        let added = partial.top_up(10, &mut Pcg32::new(3, 4));
        assert_eq!(added, 6);
        assert_eq!(partial, full);
        assert_eq!(partial.top_up(10, &mut Pcg32::new(3, 4)), 0);
    }

    #[test]
    fn test_count_surrounding() {
        let f = field(&[0, 1, 8]);
        assert_eq!(f.count_surrounding(9), 3);
        assert_eq!(f.count_surrounding(2), 1);
        assert_eq!(f.count_surrounding(63), 0);
    }

    #[test]
    fn test_relocate_scans_from_zero() {
        let mut f = field(&[0, 1, 5]);
        assert_eq!(f.relocate(5), Some(2));
        assert!(!f.is_mine(5));
        assert_eq!(f.mine_count(), 3);

        let mut g = field(&[3]);
        assert_eq!(g.relocate(3), Some(0));
        assert_eq!(g.relocate(9), None);
    }

    #[test]
    fn test_relocate_never_targets_own_cell() {
        let mut f = field(&[0]);
        assert_eq!(f.relocate(0), Some(1));
    }

    #[test]
    fn test_reveal_nonzero_cell_stops() {
        let f = field(&[0]);
        let r = f.reveal(9, &BTreeSet::new());
        assert_eq!(r.counts().get(&9), Some(&1));
        assert_eq!(r.auto_revealed().count(), 0);
    }

    #[test]
    fn test_flood_fill_exposes_region_and_border() {
        // A single mine in the corner: every other cell is reachable.
        let f = field(&[0]);
        let r = f.reveal(63, &BTreeSet::new());
        let exposed: BTreeSet<usize> = r.auto_revealed().chain([63]).collect();
        assert_eq!(exposed.len(), 63);
        assert!(!exposed.contains(&0));
        assert_eq!(r.border(), &BTreeSet::from([1, 8, 9]));
        assert_eq!(r.counts().get(&9), Some(&1));
    }

    #[test]
    fn test_flood_fill_is_walled_off_by_mines() {
        // Column 2 is all mines; revealing on the left cannot cross it.
        let wall: Vec<usize> = (0..8).map(|row| row * 8 + 2).collect();
        let f = field(&wall);
        let r = f.reveal(0, &BTreeSet::new());
        let exposed: BTreeSet<usize> = r.auto_revealed().chain([0]).collect();
        assert!(exposed.iter().all(|&i| i % 8 < 2));
        assert_eq!(exposed.len(), 16);
    }

    #[test]
    fn test_flood_fill_skips_already_revealed() {
        let f = field(&[0]);
        let already = BTreeSet::from([62, 55]);
        let r = f.reveal(63, &already);
        assert!(!r.counts().contains_key(&62));
        assert!(r.auto_revealed().all(|i| !already.contains(&i)));
        // Cells past the already-revealed ones are still reached.
        assert!(r.zero_region().contains(&61));
    }
}
