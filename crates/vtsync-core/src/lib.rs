//! vtsync-core: terminal state emulation and snapshot encoding
//!
//! This crate turns a raw PTY byte stream into screen state that can be
//! shipped to remote renderers:
//! - Color and cell attribute types
//! - Screen grid with dirty-row tracking
//! - ANSI/VT sequence parsing
//! - Snapshots and their binary wire format
//! - Stream analysis for safe byte injection

pub mod analyzer;
pub mod buffer;
pub mod cell;
pub mod color;
pub mod grid;
pub mod parser;
pub mod screen;
pub mod snapshot;
pub mod wire;

pub use analyzer::{AnalyzerState, InjectionReason, SafeInjectionPoint, StreamAnalyzer};
pub use buffer::TerminalBuffer;
pub use cell::{Cell, CellAttrs, CellStyle};
pub use color::{AnsiColor, Color, Rgb};
pub use grid::{Grid, Row};
pub use parser::Parser;
pub use screen::{Cursor, Screen};
pub use snapshot::{ChangeFlags, Snapshot};
pub use wire::{DecodeError, DecodedSnapshot};
