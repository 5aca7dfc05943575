//! Buffer emulator - thread-safe terminal state with snapshot capture
//!
//! A [`TerminalBuffer`] owns one [`Screen`] and its [`Parser`] behind a single
//! read-write lock. Writes take the lock exclusively; snapshot capture only
//! upgrades to exclusive access when there is dirty state to clear, so a
//! clean buffer answers with its cached snapshot under a shared lock.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::parser::Parser;
use crate::screen::{Cursor, Screen};
use crate::snapshot::{ChangeFlags, Snapshot};

#[derive(Debug)]
struct BufferState {
    screen: Screen,
    parser: Parser,
    sequence_id: u64,
    last_snapshot: Option<Arc<Snapshot>>,
}

impl BufferState {
    /// Build a snapshot, consuming the dirty state
    fn capture(&mut self, force_full: bool) -> Arc<Snapshot> {
        let (dirty_rows, change_flags) = self.screen.take_dirty();
        self.sequence_id += 1;

        let incremental = !force_full && !dirty_rows.is_empty() && self.last_snapshot.is_some();
        let snapshot = Arc::new(self.build(dirty_rows, change_flags, incremental));
        self.last_snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    fn build(&self, dirty_rows: Vec<usize>, change_flags: ChangeFlags, incremental: bool) -> Snapshot {
        let grid = self.screen.grid();
        let cells = grid
            .iter()
            .enumerate()
            .map(|(i, row)| {
                if incremental && dirty_rows.binary_search(&i).is_err() {
                    None
                } else {
                    Some(row.clone())
                }
            })
            .collect();
        let cursor = self.screen.cursor();

        Snapshot {
            cols: grid.width(),
            rows: grid.height(),
            viewport_y: 0,
            cursor_x: cursor.col,
            cursor_y: cursor.row,
            cells,
            dirty_rows,
            incremental,
            change_flags,
            sequence_id: self.sequence_id,
            title: self.screen.title().to_string(),
        }
    }
}

/// Emulated terminal fed from a raw PTY byte stream
#[derive(Debug)]
pub struct TerminalBuffer {
    state: RwLock<BufferState>,
}

impl TerminalBuffer {
    /// Create a buffer of `cols` x `rows` (each clamped to at least 1)
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            state: RwLock::new(BufferState {
                screen: Screen::new(cols, rows),
                parser: Parser::new(),
                sequence_id: 0,
                last_snapshot: None,
            }),
        }
    }

    /// Apply raw output bytes to the screen
    ///
    /// Sequences and UTF-8 characters may be split across calls.
    pub fn write(&self, data: &[u8]) {
        let mut state = self.state.write();
        let BufferState { screen, parser, .. } = &mut *state;
        parser.parse(screen, data);
    }

    /// Resize the screen, keeping the top-left overlap
    pub fn resize(&self, cols: usize, rows: usize) {
        log::debug!("Resizing buffer to {}x{}", cols, rows);
        self.state.write().screen.resize(cols, rows);
    }

    /// Capture the current state
    ///
    /// Returns the cached snapshot when nothing changed since the previous
    /// call. Otherwise bumps the sequence id, builds an incremental snapshot
    /// if rows are dirty and an earlier snapshot exists (a full one if not)
    /// and clears the dirty state.
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        let state = self.state.upgradable_read();
        if !state.screen.dirty().is_dirty() {
            if let Some(last) = &state.last_snapshot {
                return Arc::clone(last);
            }
        }

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.capture(false)
    }

    /// Capture a snapshot that always carries every row
    ///
    /// Used to resync a consumer that missed updates. A clean buffer keeps
    /// its sequence id.
    pub fn get_full_snapshot(&self) -> Arc<Snapshot> {
        let state = self.state.upgradable_read();
        if !state.screen.dirty().is_dirty() {
            match &state.last_snapshot {
                Some(last) if last.is_full() => return Arc::clone(last),
                Some(_) => {
                    let mut state = RwLockUpgradableReadGuard::upgrade(state);
                    let snapshot = Arc::new(state.build(Vec::new(), ChangeFlags::empty(), false));
                    state.last_snapshot = Some(Arc::clone(&snapshot));
                    return snapshot;
                }
                None => {}
            }
        }

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.capture(true)
    }

    /// Current (cols, rows)
    pub fn size(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.screen.width(), state.screen.height())
    }

    /// Current cursor position
    pub fn cursor(&self) -> Cursor {
        self.state.read().screen.cursor()
    }

    /// Current title
    pub fn title(&self) -> String {
        self.state.read().screen.title().to_string()
    }

    /// Sequence id of the most recent snapshot (0 before the first)
    pub fn sequence_id(&self) -> u64 {
        self.state.read().sequence_id
    }

    /// Whether anything changed since the last snapshot
    pub fn is_dirty(&self) -> bool {
        self.state.read().screen.dirty().is_dirty()
    }

    /// Inspect the screen under the shared lock
    pub fn with_screen<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Screen) -> R,
    {
        f(&self.state.read().screen)
    }
}
