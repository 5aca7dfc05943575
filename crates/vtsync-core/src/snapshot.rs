//! Immutable captures of emulator state

use crate::grid::Row;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Categories of state that changed since the previous snapshot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ChangeFlags: u32 {
        /// Cell content changed
        const SCREEN = 1 << 0;
        /// Cursor moved
        const CURSOR = 1 << 1;
        /// Title changed
        const TITLE = 1 << 2;
        /// Dimensions changed
        const SIZE = 1 << 3;
    }
}

/// A point-in-time capture of a [`TerminalBuffer`](crate::TerminalBuffer)
///
/// Snapshots are shared as `Arc<Snapshot>` and never mutated once built.
/// A full snapshot carries every row; an incremental one carries only the
/// rows listed in `dirty_rows` and leaves the others as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub cols: usize,
    pub rows: usize,
    /// First visible line; always 0 while the buffer keeps no scrollback
    pub viewport_y: usize,
    pub cursor_x: usize,
    pub cursor_y: usize,
    /// One entry per screen row, `None` when the row is not included
    pub cells: Vec<Option<Row>>,
    /// Rows that changed since the previous snapshot, ascending
    pub dirty_rows: Vec<usize>,
    pub incremental: bool,
    pub change_flags: ChangeFlags,
    /// Monotonic per-buffer counter
    pub sequence_id: u64,
    pub title: String,
}

impl Snapshot {
    /// Whether this is a full snapshot
    pub fn is_full(&self) -> bool {
        !self.incremental
    }

    /// Row at `index` if it is included in this snapshot
    pub fn row(&self, index: usize) -> Option<&Row> {
        self.cells.get(index)?.as_ref()
    }

    /// Text of an included row, trailing blanks trimmed
    pub fn row_text(&self, index: usize) -> Option<String> {
        self.row(index).map(Row::text)
    }

    /// Iterator over the rows included in this snapshot with their indices
    pub fn included_rows(&self) -> impl Iterator<Item = (usize, &Row)> {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(i, row)| row.as_ref().map(|r| (i, r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(incremental: bool) -> Snapshot {
        let mut row = Row::new(4);
        row[0].c = 'o';
        row[1].c = 'k';
        Snapshot {
            cols: 4,
            rows: 2,
            viewport_y: 0,
            cursor_x: 2,
            cursor_y: 0,
            cells: vec![Some(row), if incremental { None } else { Some(Row::new(4)) }],
            dirty_rows: vec![0],
            incremental,
            change_flags: ChangeFlags::SCREEN,
            sequence_id: 3,
            title: String::new(),
        }
    }

    #[test]
    fn test_included_rows() {
        let full = sample(false);
        assert!(full.is_full());
        assert_eq!(full.included_rows().count(), 2);

        let partial = sample(true);
        assert_eq!(partial.included_rows().map(|(i, _)| i).collect::<Vec<_>>(), vec![0]);
        assert_eq!(partial.row_text(0).as_deref(), Some("ok"));
        assert!(partial.row(1).is_none());
        assert!(partial.row(5).is_none());
    }
}
