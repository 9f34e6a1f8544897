//! Flat per-map tile table.

use atlas_core::{Cell, CellCheck, TileCoord};

/// Row-major table of tile states for one map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CellTable {
    width: i16,
    height: i16,
    cells: Vec<Cell>,
}

impl CellTable {
    pub(crate) fn new(width: i16, height: i16, cells: Vec<Cell>) -> Self {
        Self {
            width,
            height,
            cells,
        }
    }

    pub(crate) const fn width(&self) -> i16 {
        self.width
    }

    pub(crate) const fn height(&self) -> i16 {
        self.height
    }

    /// Copy of the table with every occupancy counter reset, used to seed
    /// instances that start without entities.
    pub(crate) fn vacated(&self) -> Self {
        Self {
            width: self.width,
            height: self.height,
            cells: self.cells.iter().map(Cell::vacated).collect(),
        }
    }

    pub(crate) fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < i32::from(self.width) && y < i32::from(self.height)
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if !self.contains(x, y) {
            return None;
        }
        let column = usize::try_from(x).ok()?;
        let row = usize::try_from(y).ok()?;
        let width = usize::try_from(self.width).ok()?;
        Some(row * width + column)
    }

    pub(crate) fn get(&self, x: i32, y: i32) -> Option<&Cell> {
        self.index(x, y).and_then(|index| self.cells.get(index))
    }

    pub(crate) fn get_mut(&mut self, x: i32, y: i32) -> Option<&mut Cell> {
        self.index(x, y).and_then(|index| self.cells.get_mut(index))
    }

    pub(crate) fn tile_mut(&mut self, tile: TileCoord) -> Option<&mut Cell> {
        self.get_mut(i32::from(tile.x()), i32::from(tile.y()))
    }

    /// Answers a tile question, treating tiles beyond the border as solid.
    pub(crate) fn check(&self, x: i32, y: i32, check: CellCheck, stack_limit: Option<u16>) -> bool {
        match self.get(x, y) {
            Some(cell) => cell.check(check, stack_limit),
            None => check.outside_answer(),
        }
    }

    /// Walks the integer line between two tiles and reports whether no wall
    /// lies on it, both endpoints included.
    pub(crate) fn line_of_sight(&self, from: TileCoord, to: TileCoord) -> bool {
        let (mut x0, mut y0) = (i32::from(from.x()), i32::from(from.y()));
        let (mut x1, mut y1) = (i32::from(to.x()), i32::from(to.y()));

        let mut dx = x1 - x0;
        if dx < 0 {
            std::mem::swap(&mut x0, &mut x1);
            std::mem::swap(&mut y0, &mut y1);
            dx = -dx;
        }
        let dy = y1 - y0;
        let weight = dx.max(dy.abs());

        let (mut wx, mut wy) = (0, 0);
        while x0 != x1 || y0 != y1 {
            if self.check(x0, y0, CellCheck::Wall, None) {
                return false;
            }
            wx += dx;
            wy += dy;
            if wx >= weight {
                wx -= weight;
                x0 += 1;
            }
            if wy >= weight {
                wy -= weight;
                y0 += 1;
            } else if wy < 0 {
                wy += weight;
                y0 -= 1;
            }
        }

        !self.check(x1, y1, CellCheck::Wall, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::{CellFlag, TERRAIN_PRESETS};

    fn open(width: i16, height: i16) -> CellTable {
        let count = usize::try_from(i32::from(width) * i32::from(height)).expect("positive");
        CellTable::new(width, height, vec![TERRAIN_PRESETS[0]; count])
    }

    #[test]
    fn border_is_solid() {
        let table = open(4, 4);
        assert!(table.check(-1, 0, CellCheck::NoPass, None));
        assert!(table.check(4, 0, CellCheck::Wall, None));
        assert!(!table.check(0, 4, CellCheck::Walkable, None));
        assert!(table.check(3, 3, CellCheck::Walkable, None));
    }

    #[test]
    fn walls_block_sight_but_cliffs_do_not() {
        let mut table = open(10, 10);
        assert!(table.line_of_sight(TileCoord::new(0, 0), TileCoord::new(9, 3)));

        table
            .get_mut(5, 0)
            .expect("inside")
            .set(CellFlag::Walkable, false);
        assert!(
            table.line_of_sight(TileCoord::new(0, 0), TileCoord::new(9, 0)),
            "a cliff is still shootable"
        );

        table
            .get_mut(5, 0)
            .expect("inside")
            .set(CellFlag::Shootable, false);
        assert!(!table.line_of_sight(TileCoord::new(0, 0), TileCoord::new(9, 0)));
        assert!(
            !table.line_of_sight(TileCoord::new(9, 0), TileCoord::new(0, 0)),
            "sight is symmetric"
        );
        assert!(!table.line_of_sight(TileCoord::new(5, 0), TileCoord::new(5, 0)));
    }

    #[test]
    fn vacated_copy_keeps_flags() {
        let mut table = open(2, 2);
        let cell = table.get_mut(1, 1).expect("inside");
        cell.set(CellFlag::NoChat, true);
        cell.enter();

        let copy = table.vacated();
        let copied = copy.get(1, 1).expect("inside");
        assert!(copied.is(CellFlag::NoChat));
        assert_eq!(copied.occupancy(), 0);
    }
}
