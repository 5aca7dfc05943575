//! Screen - emulated terminal state with dirty tracking
//!
//! Holds the grid, cursor and SGR style, and records which rows and which
//! categories of state changed since the last snapshot. Every mutation goes
//! through a method here so the dirty set stays complete.

use crate::cell::{Cell, CellStyle};
use crate::grid::{Grid, Row};
use crate::snapshot::ChangeFlags;
use serde::{Deserialize, Serialize};
use unicode_width::UnicodeWidthChar;

/// Tab stops are fixed every 8 columns
const TAB_WIDTH: usize = 8;

/// Cursor position, always inside the grid
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Column position (0-indexed)
    pub col: usize,
    /// Row position (0-indexed)
    pub row: usize,
}

/// Screen clear mode (ED)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    /// Clear from cursor to end of screen
    Below,
    /// Clear from start of screen to cursor
    Above,
    /// Clear entire screen
    All,
}

/// Line clear mode (EL)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClearMode {
    /// Clear from cursor to end of line
    Right,
    /// Clear from start of line to cursor
    Left,
    /// Clear entire line
    All,
}

/// Rows and change categories touched since the last snapshot
#[derive(Debug, Clone)]
pub struct DirtySet {
    rows: Vec<bool>,
    any: bool,
    flags: ChangeFlags,
}

impl DirtySet {
    fn new(height: usize) -> Self {
        Self {
            rows: vec![false; height],
            any: false,
            flags: ChangeFlags::empty(),
        }
    }

    fn mark_row(&mut self, row: usize) {
        if let Some(slot) = self.rows.get_mut(row) {
            *slot = true;
            self.any = true;
            self.flags |= ChangeFlags::SCREEN;
        }
    }

    fn mark(&mut self, flags: ChangeFlags) {
        self.flags |= flags;
        self.any = true;
    }

    fn mark_all(&mut self, height: usize) {
        self.rows = vec![true; height];
        self.mark(ChangeFlags::SCREEN);
    }

    /// Whether anything changed since the last snapshot
    pub fn is_dirty(&self) -> bool {
        self.any || !self.flags.is_empty()
    }

    /// Change categories recorded so far
    pub fn flags(&self) -> ChangeFlags {
        self.flags
    }

    /// Whether the given row is dirty
    pub fn is_row_dirty(&self, row: usize) -> bool {
        self.rows.get(row).copied().unwrap_or(false)
    }

    /// Indices of dirty rows in ascending order
    pub fn dirty_rows(&self) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(i, &dirty)| dirty.then_some(i))
            .collect()
    }

    /// Take the dirty rows and flags, leaving the set clean
    fn take(&mut self) -> (Vec<usize>, ChangeFlags) {
        let rows = self.dirty_rows();
        let flags = self.flags;
        self.rows.fill(false);
        self.any = false;
        self.flags = ChangeFlags::empty();
        (rows, flags)
    }
}

/// Terminal screen state
#[derive(Debug)]
pub struct Screen {
    grid: Grid,
    cursor: Cursor,
    saved_cursor: Option<Cursor>,
    /// Current cell styling
    pub style: CellStyle,
    title: String,
    dirty: DirtySet,
}

impl Screen {
    /// Create a new screen with the given dimensions (each at least 1)
    pub fn new(width: usize, height: usize) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            grid: Grid::new(width, height),
            cursor: Cursor::default(),
            saved_cursor: None,
            style: CellStyle::default(),
            title: String::new(),
            dirty: DirtySet::new(height),
        }
    }

    /// Get screen width
    pub fn width(&self) -> usize {
        self.grid.width()
    }

    /// Get screen height
    pub fn height(&self) -> usize {
        self.grid.height()
    }

    /// Get the grid
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Get the cursor position
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Get the title set by OSC 0/2
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Get the dirty set
    pub fn dirty(&self) -> &DirtySet {
        &self.dirty
    }

    /// Take and clear the dirty state
    pub fn take_dirty(&mut self) -> (Vec<usize>, ChangeFlags) {
        self.dirty.take()
    }

    /// Get a cell at the given position
    pub fn get_cell(&self, row: usize, col: usize) -> Option<&Cell> {
        self.grid.get(row, col)
    }

    /// Get a row
    pub fn row(&self, row: usize) -> Option<&Row> {
        self.grid.row(row)
    }

    fn set_cursor(&mut self, row: usize, col: usize) {
        let row = row.min(self.height() - 1);
        let col = col.min(self.width() - 1);
        if row != self.cursor.row || col != self.cursor.col {
            self.cursor = Cursor { col, row };
            self.dirty.mark(ChangeFlags::CURSOR);
        }
    }

    /// Put a character at the current cursor position and advance
    pub fn put_char(&mut self, c: char) {
        match c.width() {
            Some(0) | None => {
                log::trace!("Dropping zero-width character {:?}", c);
                return;
            }
            Some(_) => {}
        }

        let cell = self.style.create_cell(c);
        let Cursor { row, col } = self.cursor;
        if let Some(slot) = self.grid.get_mut(row, col) {
            if *slot != cell {
                *slot = cell;
                self.dirty.mark_row(row);
            }
        }

        if col + 1 >= self.width() {
            self.set_cursor(row, 0);
            self.line_feed();
        } else {
            self.set_cursor(row, col + 1);
        }
    }

    /// Move cursor to start of line
    pub fn carriage_return(&mut self) {
        self.set_cursor(self.cursor.row, 0);
    }

    /// Move cursor down, scrolling if at the bottom row
    pub fn line_feed(&mut self) {
        if self.cursor.row + 1 >= self.height() {
            self.scroll_up(1);
        } else {
            self.set_cursor(self.cursor.row + 1, self.cursor.col);
        }
    }

    /// Move cursor one column left
    pub fn backspace(&mut self) {
        self.set_cursor(self.cursor.row, self.cursor.col.saturating_sub(1));
    }

    /// Move cursor to the next tab stop
    pub fn tab(&mut self) {
        let next = (self.cursor.col / TAB_WIDTH + 1) * TAB_WIDTH;
        self.set_cursor(self.cursor.row, next);
    }

    /// Scroll the screen up, discarding the top rows
    pub fn scroll_up(&mut self, count: usize) {
        let changed = self.grid.scroll_up(count, self.style.erase_cell());
        for (row, _) in changed.iter().enumerate().filter(|(_, &c)| c) {
            self.dirty.mark_row(row);
        }
    }

    /// Move cursor to an absolute position (0-indexed, clamped)
    pub fn move_cursor(&mut self, row: usize, col: usize) {
        self.set_cursor(row, col);
    }

    /// Move cursor relative to current position (clamped)
    pub fn move_cursor_relative(&mut self, row_delta: isize, col_delta: isize) {
        let row = self.cursor.row.saturating_add_signed(row_delta);
        let col = self.cursor.col.saturating_add_signed(col_delta);
        self.set_cursor(row, col);
    }

    /// Move cursor to a column on the current row
    pub fn set_column(&mut self, col: usize) {
        self.set_cursor(self.cursor.row, col);
    }

    /// Move cursor to a row keeping the column
    pub fn set_row(&mut self, row: usize) {
        self.set_cursor(row, self.cursor.col);
    }

    /// Save cursor position
    pub fn save_cursor(&mut self) {
        self.saved_cursor = Some(self.cursor);
    }

    /// Restore a saved cursor position
    pub fn restore_cursor(&mut self) {
        if let Some(saved) = self.saved_cursor {
            self.set_cursor(saved.row, saved.col);
        }
    }

    fn fill_row(&mut self, row: usize, start: usize, end: usize) {
        let fill = self.style.erase_cell();
        let changed = self
            .grid
            .row_mut(row)
            .map(|r| r.fill_range(start, end, fill))
            .unwrap_or(false);
        if changed {
            self.dirty.mark_row(row);
        }
    }

    /// Clear screen (or parts of it)
    pub fn clear(&mut self, mode: ClearMode) {
        let Cursor { row, col } = self.cursor;
        let width = self.width();
        let height = self.height();

        match mode {
            ClearMode::Below => {
                self.fill_row(row, col, width);
                for r in row + 1..height {
                    self.fill_row(r, 0, width);
                }
            }
            ClearMode::Above => {
                for r in 0..row {
                    self.fill_row(r, 0, width);
                }
                self.fill_row(row, 0, col + 1);
            }
            ClearMode::All => {
                for r in 0..height {
                    self.fill_row(r, 0, width);
                }
            }
        }
    }

    /// Clear line (or parts of it)
    pub fn clear_line(&mut self, mode: LineClearMode) {
        let Cursor { row, col } = self.cursor;
        let width = self.width();

        let (start, end) = match mode {
            LineClearMode::Right => (col, width),
            LineClearMode::Left => (0, col + 1),
            LineClearMode::All => (0, width),
        };
        self.fill_row(row, start, end);
    }

    /// Update the title
    pub fn set_title(&mut self, title: &str) {
        if self.title != title {
            self.title = title.to_string();
            self.dirty.mark(ChangeFlags::TITLE);
        }
    }

    /// Resize the screen, keeping the top-left overlap
    pub fn resize(&mut self, width: usize, height: usize) {
        let width = width.max(1);
        let height = height.max(1);
        if width == self.width() && height == self.height() {
            return;
        }

        self.grid.resize(width, height, self.style.erase_cell());
        self.dirty.mark_all(height);
        self.dirty.mark(ChangeFlags::SIZE);
        self.set_cursor(self.cursor.row, self.cursor.col);
        if let Some(saved) = self.saved_cursor.as_mut() {
            saved.row = saved.row.min(height - 1);
            saved.col = saved.col.min(width - 1);
        }
    }

    /// Reset terminal state (RIS)
    pub fn reset(&mut self) {
        self.style.reset();
        self.saved_cursor = None;
        self.clear(ClearMode::All);
        self.set_cursor(0, 0);
    }
}
