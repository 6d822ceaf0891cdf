//! Tile grid and active palette.
//!
//! The grid is a fixed `width x height` matrix of colors stored row-major. Player
//! positions live in a continuous space whose origin is offset by one block: the
//! cell `(x, y)` covers `[x + 1, x + 2) x [y + 1, y + 2)`.

use protocol::{Position, WoolColor};
use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};

/// Offset between continuous coordinates and cell indices.
pub const ORIGIN: f64 = 1.0;

/// The game map.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    width: usize,
    height: usize,
    cells: Vec<WoolColor>,
}

impl Grid {
    /// Create an empty grid (every cell `Air`).
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![WoolColor::Air; width * height],
        }
    }

    pub fn get(&self, x: usize, y: usize) -> Option<WoolColor> {
        if x < self.width && y < self.height {
            Some(self.cells[y * self.width + x])
        } else {
            None
        }
    }

    pub fn set(&mut self, x: usize, y: usize, color: WoolColor) {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x] = color;
        }
    }

    /// Re-color every cell so each palette color appears `n / k` or `n / k + 1` times.
    /// Which colors receive the remainder is random, as is the layout.
    pub fn randomize_balanced<R: Rng + ?Sized>(&mut self, palette: &[WoolColor], rng: &mut R) {
        if palette.is_empty() {
            return;
        }
        let total = self.cells.len();
        let base = total / palette.len();
        let remainder = total % palette.len();

        let mut order = palette.to_vec();
        order.shuffle(rng);

        self.cells.clear();
        for (i, &color) in order.iter().enumerate() {
            let count = base + usize::from(i < remainder);
            self.cells.extend(std::iter::repeat_n(color, count));
        }
        self.cells.shuffle(rng);
    }

    /// Remove every tile that is not `target`. Returns how many tiles were removed.
    pub fn collapse_to(&mut self, target: WoolColor) -> usize {
        let mut removed = 0;
        for cell in &mut self.cells {
            if *cell != target && !cell.is_empty() {
                *cell = WoolColor::Air;
                removed += 1;
            }
        }
        removed
    }

    /// Map a continuous position to the cell it stands on, if inside the grid.
    pub fn cell_of(&self, position: Position) -> Option<(usize, usize)> {
        if !self.contains(position) {
            return None;
        }
        let x = (position.x - ORIGIN).floor() as usize;
        let y = (position.y - ORIGIN).floor() as usize;
        Some((x, y))
    }

    /// Color under a position; `None` when out of bounds.
    pub fn color_at(&self, position: Position) -> Option<WoolColor> {
        self.cell_of(position).and_then(|(x, y)| self.get(x, y))
    }

    /// Whether a position lies inside `[1, width + 1) x [1, height + 1)`.
    pub fn contains(&self, position: Position) -> bool {
        position.x.is_finite()
            && position.y.is_finite()
            && position.x >= ORIGIN
            && position.y >= ORIGIN
            && position.x < ORIGIN + self.width as f64
            && position.y < ORIGIN + self.height as f64
    }

    /// Center of a cell in continuous coordinates.
    pub fn cell_center(x: usize, y: usize) -> Position {
        Position::new(x as f64 + ORIGIN + 0.5, y as f64 + ORIGIN + 0.5)
    }

    /// Coordinates of every non-empty cell, row-major.
    pub fn non_empty_cells(&self) -> Vec<(usize, usize)> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, color)| !color.is_empty())
            .map(|(i, _)| (i % self.width, i / self.width))
            .collect()
    }

    /// Distinct colors currently on the grid, in id order.
    pub fn colors_present(&self) -> Vec<WoolColor> {
        let mut seen = [false; WoolColor::PALETTE.len()];
        for cell in &self.cells {
            if !cell.is_empty() {
                seen[cell.id() as usize] = true;
            }
        }
        WoolColor::PALETTE
            .iter()
            .copied()
            .filter(|color| seen[color.id() as usize])
            .collect()
    }

    pub fn count(&self, color: WoolColor) -> usize {
        self.cells.iter().filter(|&&cell| cell == color).count()
    }

    /// Row-major color ids, `rows[y][x]`.
    pub fn rows(&self) -> Vec<Vec<u8>> {
        self.cells
            .chunks(self.width.max(1))
            .map(|row| row.iter().map(|color| color.id()).collect())
            .collect()
    }
}

/// Colors still in play.
#[derive(Debug, Clone, PartialEq)]
pub struct Palette {
    active: Vec<WoolColor>,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            active: WoolColor::PALETTE.to_vec(),
        }
    }
}

impl Palette {
    pub fn colors(&self) -> &[WoolColor] {
        &self.active
    }

    /// Uniform pick from the active colors.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<WoolColor> {
        self.active.choose(rng).copied()
    }

    /// Drop up to `count` random colors, never going below `floor`. Returns what was removed.
    pub fn shrink<R: Rng + ?Sized>(&mut self, count: usize, floor: usize, rng: &mut R) -> Vec<WoolColor> {
        let removable = self.active.len().saturating_sub(floor).min(count);
        self.active.shuffle(rng);
        let removed = self.active.split_off(self.active.len() - removable);
        self.active.sort();
        removed
    }
}
