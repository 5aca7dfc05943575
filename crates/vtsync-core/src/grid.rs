//! Grid - 2D array of terminal cells
//!
//! Row-major storage of the visible terminal area. Rows are individually
//! allocated so scrolling moves row handles instead of copying cells.

use crate::cell::Cell;
use serde::{Deserialize, Serialize};

/// A row of cells in the terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    cells: Vec<Cell>,
}

impl Row {
    /// Create a new blank row with the given width
    pub fn new(width: usize) -> Self {
        Self::filled(width, Cell::default())
    }

    /// Create a row with every cell set to `fill`
    pub fn filled(width: usize, fill: Cell) -> Self {
        Self {
            cells: vec![fill; width],
        }
    }

    /// Build a row from existing cells
    pub fn from_cells(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    /// Get the width of this row
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the row is empty (no width)
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Resize the row, filling new cells with `fill`
    pub fn resize(&mut self, width: usize, fill: Cell) {
        self.cells.resize(width, fill);
    }

    /// Set every cell to `fill`
    pub fn fill(&mut self, fill: Cell) {
        self.cells.fill(fill);
    }

    /// Set cells in `start..end` to `fill`, returning whether anything changed
    pub fn fill_range(&mut self, start: usize, end: usize, fill: Cell) -> bool {
        let end = end.min(self.cells.len());
        let mut changed = false;
        for cell in self.cells.iter_mut().take(end).skip(start) {
            if *cell != fill {
                *cell = fill;
                changed = true;
            }
        }
        changed
    }

    /// Get a reference to a cell at the given column
    pub fn get(&self, col: usize) -> Option<&Cell> {
        self.cells.get(col)
    }

    /// Get a mutable reference to a cell at the given column
    pub fn get_mut(&mut self, col: usize) -> Option<&mut Cell> {
        self.cells.get_mut(col)
    }

    /// All cells of the row
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Iterator over cells
    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }

    /// Get the text content of this row (trimmed)
    pub fn text(&self) -> String {
        let s: String = self.cells.iter().map(|c| c.c).collect();
        s.trim_end().to_string()
    }

    /// Check if this row contains only empty cells
    pub fn is_all_empty(&self) -> bool {
        self.cells.iter().all(|c| c.is_empty())
    }
}

impl std::ops::Index<usize> for Row {
    type Output = Cell;

    fn index(&self, col: usize) -> &Self::Output {
        &self.cells[col]
    }
}

impl std::ops::IndexMut<usize> for Row {
    fn index_mut(&mut self, col: usize) -> &mut Self::Output {
        &mut self.cells[col]
    }
}

/// 2D grid of terminal cells
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    rows: Vec<Row>,
    width: usize,
    height: usize,
}

impl Grid {
    /// Create a new grid with the given dimensions
    pub fn new(width: usize, height: usize) -> Self {
        let rows = (0..height).map(|_| Row::new(width)).collect();
        Self {
            rows,
            width,
            height,
        }
    }

    /// Get the grid width (columns)
    pub fn width(&self) -> usize {
        self.width
    }

    /// Get the grid height (rows)
    pub fn height(&self) -> usize {
        self.height
    }

    /// Resize the grid, keeping the top-left overlap
    ///
    /// Cells outside the old bounds are set to `fill`.
    pub fn resize(&mut self, width: usize, height: usize, fill: Cell) {
        self.rows.truncate(height);
        for row in &mut self.rows {
            row.resize(width, fill);
        }
        while self.rows.len() < height {
            self.rows.push(Row::filled(width, fill));
        }

        self.width = width;
        self.height = height;
    }

    /// Get a reference to a row
    pub fn row(&self, row: usize) -> Option<&Row> {
        self.rows.get(row)
    }

    /// Get a mutable reference to a row
    pub fn row_mut(&mut self, row: usize) -> Option<&mut Row> {
        self.rows.get_mut(row)
    }

    /// Get a reference to a cell at (row, col)
    pub fn get(&self, row: usize, col: usize) -> Option<&Cell> {
        self.rows.get(row)?.get(col)
    }

    /// Get a mutable reference to a cell at (row, col)
    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut Cell> {
        self.rows.get_mut(row)?.get_mut(col)
    }

    /// Scroll the whole grid up by `count` lines
    ///
    /// Vacated top rows are cleared with `fill` and reused as the new bottom
    /// rows. Returns one flag per row telling whether its content differs
    /// from what was displayed there before the scroll.
    pub fn scroll_up(&mut self, count: usize, fill: Cell) -> Vec<bool> {
        let height = self.height;
        let count = count.min(height);
        if count == 0 {
            return vec![false; height];
        }

        let blank = Row::filled(self.width, fill);
        let changed = (0..height)
            .map(|i| {
                let incoming = self.rows.get(i + count).unwrap_or(&blank);
                self.rows[i] != *incoming
            })
            .collect();

        self.rows.rotate_left(count);
        for row in &mut self.rows[height - count..] {
            row.fill(fill);
        }

        changed
    }

    /// Iterator over rows
    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }
}

impl std::ops::Index<usize> for Grid {
    type Output = Row;

    fn index(&self, row: usize) -> &Self::Output {
        &self.rows[row]
    }
}

impl std::ops::IndexMut<usize> for Grid {
    fn index_mut(&mut self, row: usize) -> &mut Self::Output {
        &mut self.rows[row]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;

    #[test]
    fn test_grid_new() {
        let grid = Grid::new(80, 24);
        assert_eq!(grid.width(), 80);
        assert_eq!(grid.height(), 24);
    }

    #[test]
    fn test_grid_access() {
        let mut grid = Grid::new(80, 24);

        grid[0][0].c = 'A';
        assert_eq!(grid[0][0].c, 'A');

        assert_eq!(grid.get(0, 0).unwrap().c, 'A');
        grid.get_mut(0, 0).unwrap().c = 'B';
        assert_eq!(grid[0][0].c, 'B');
        assert!(grid.get(24, 0).is_none());
    }

    #[test]
    fn test_grid_resize() {
        let mut grid = Grid::new(80, 24);
        grid[0][0].c = 'A';
        grid[23][79].c = 'Z';

        let fill = Cell {
            bg: Color::Indexed(100),
            ..Cell::default()
        };
        grid.resize(100, 30, fill);
        assert_eq!(grid.width(), 100);
        assert_eq!(grid.height(), 30);
        assert_eq!(grid[0][0].c, 'A');
        assert_eq!(grid[23][79].c, 'Z');
        assert_eq!(grid[0][99], fill);
        assert_eq!(grid[29][0], fill);

        grid.resize(40, 10, Cell::default());
        assert_eq!(grid.width(), 40);
        assert_eq!(grid.height(), 10);
        assert_eq!(grid[0].len(), 40);
        assert_eq!(grid[0][0].c, 'A');
    }

    #[test]
    fn test_grid_scroll_up() {
        let mut grid = Grid::new(80, 5);

        for i in 0..5 {
            grid[i][0].c = char::from_digit(i as u32, 10).unwrap();
        }

        let changed = grid.scroll_up(2, Cell::default());
        assert_eq!(changed, vec![true; 5]);

        assert_eq!(grid[0][0].c, '2');
        assert_eq!(grid[1][0].c, '3');
        assert_eq!(grid[2][0].c, '4');
        assert_eq!(grid[3][0].c, ' ');
        assert_eq!(grid[4][0].c, ' ');
    }

    #[test]
    fn test_scroll_blank_grid_changes_nothing() {
        let mut grid = Grid::new(10, 4);
        let changed = grid.scroll_up(1, Cell::default());
        assert_eq!(changed, vec![false; 4]);
    }

    #[test]
    fn test_row_text() {
        let mut row = Row::new(10);
        row[0].c = 'H';
        row[1].c = 'i';

        assert_eq!(row.text(), "Hi");
    }

    #[test]
    fn test_row_fill_range_reports_change() {
        let mut row = Row::new(5);
        assert!(!row.fill_range(0, 5, Cell::default()));
        row[2].c = 'x';
        assert!(row.fill_range(1, 10, Cell::default()));
        assert!(row.is_all_empty());
    }
}
