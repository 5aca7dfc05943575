//! Terminal cell types
//!
//! A cell represents a single character position in the terminal grid,
//! including its character, colors, and attributes.

use crate::color::Color;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Cell rendering attributes
    ///
    /// Bit values match the packed attribute byte of the snapshot wire format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CellAttrs: u8 {
        /// Bold/bright text
        const BOLD = 1 << 0;
        /// Italic text
        const ITALIC = 1 << 1;
        /// Underlined text
        const UNDERLINE = 1 << 2;
        /// Reverse video (swap fg/bg)
        const INVERSE = 1 << 3;
    }
}

/// A single terminal cell
///
/// Never holds a control character: controls are interpreted by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// The character in this cell
    pub c: char,
    /// Foreground color
    pub fg: Color,
    /// Background color
    pub bg: Color,
    /// Cell attributes (bold, italic, etc.)
    pub attrs: CellAttrs,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            c: ' ',
            fg: Color::Default,
            bg: Color::Default,
            attrs: CellAttrs::empty(),
        }
    }
}

impl Cell {
    /// Create a new cell with the given character
    pub fn new(c: char) -> Self {
        Self {
            c,
            ..Default::default()
        }
    }

    /// Check if this cell is empty (space with default colors and no attrs)
    pub fn is_empty(&self) -> bool {
        self.c == ' ' && self.fg.is_default() && self.bg.is_default() && self.attrs.is_empty()
    }
}

/// Current terminal styling state (used when writing new characters)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellStyle {
    pub fg: Color,
    pub bg: Color,
    pub attrs: CellAttrs,
}

impl CellStyle {
    /// Create a cell with this style and the given character
    pub fn create_cell(&self, c: char) -> Cell {
        Cell {
            c,
            fg: self.fg,
            bg: self.bg,
            attrs: self.attrs,
        }
    }

    /// Blank cell used when erasing: keeps the current colors, drops attributes
    pub fn erase_cell(&self) -> Cell {
        Cell {
            c: ' ',
            fg: self.fg,
            bg: self.bg,
            attrs: CellAttrs::empty(),
        }
    }

    /// Reset to default style
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
