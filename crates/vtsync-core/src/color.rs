//! Cell colors
//!
//! Palette colors are kept in a canonical form: indices 0-15 are always
//! stored as [`Color::Ansi`], 16-255 as [`Color::Indexed`]. The wire format
//! only knows "palette byte" vs "RGB triple", so the canonical form is what
//! makes a decoded cell compare equal to the cell that was encoded.

use serde::{Deserialize, Serialize};

/// 24-bit color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// The 16 ANSI colors, discriminant = palette index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AnsiColor {
    Black = 0,
    Red = 1,
    Green = 2,
    Yellow = 3,
    Blue = 4,
    Magenta = 5,
    Cyan = 6,
    White = 7,
    BrightBlack = 8,
    BrightRed = 9,
    BrightGreen = 10,
    BrightYellow = 11,
    BrightBlue = 12,
    BrightMagenta = 13,
    BrightCyan = 14,
    BrightWhite = 15,
}

const ANSI_PALETTE: [AnsiColor; 16] = [
    AnsiColor::Black,
    AnsiColor::Red,
    AnsiColor::Green,
    AnsiColor::Yellow,
    AnsiColor::Blue,
    AnsiColor::Magenta,
    AnsiColor::Cyan,
    AnsiColor::White,
    AnsiColor::BrightBlack,
    AnsiColor::BrightRed,
    AnsiColor::BrightGreen,
    AnsiColor::BrightYellow,
    AnsiColor::BrightBlue,
    AnsiColor::BrightMagenta,
    AnsiColor::BrightCyan,
    AnsiColor::BrightWhite,
];

impl AnsiColor {
    /// Color at palette `index`, `None` above 15
    pub fn from_index(index: u8) -> Option<Self> {
        ANSI_PALETTE.get(index as usize).copied()
    }
}

/// Foreground or background color of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Color {
    /// Whatever the renderer uses by default
    #[default]
    Default,
    /// Palette index 0-15
    Ansi(AnsiColor),
    /// Palette index 16-255
    Indexed(u8),
    /// True color
    Rgb(Rgb),
}

impl Color {
    /// Canonical color for a 256-color palette index
    pub fn from_palette(index: u8) -> Self {
        AnsiColor::from_index(index).map_or(Self::Indexed(index), Self::Ansi)
    }

    /// Palette index if this is a palette color
    pub fn palette_index(&self) -> Option<u8> {
        match self {
            Self::Ansi(ansi) => Some(*ansi as u8),
            Self::Indexed(idx) => Some(*idx),
            Self::Default | Self::Rgb(_) => None,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }
}
