//! ANSI/VT sequence parser
//!
//! Uses the `vte` crate for parsing escape sequences and applies the
//! resulting actions to a [`Screen`]. Anything outside the supported subset
//! is logged at trace level and ignored; malformed input is recovered by the
//! vte state machine itself.

use vte::Params;

use crate::cell::CellAttrs;
use crate::color::{AnsiColor, Color, Rgb};
use crate::screen::{ClearMode, LineClearMode, Screen};

/// Parser wraps the vte parser and applies actions to a Screen
pub struct Parser {
    state_machine: vte::Parser,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser").finish_non_exhaustive()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state_machine: vte::Parser::new(),
        }
    }

    /// Parse input bytes and apply actions to the screen
    pub fn parse(&mut self, screen: &mut Screen, bytes: &[u8]) {
        let mut performer = ScreenPerformer { screen };
        for byte in bytes {
            self.state_machine.advance(&mut performer, *byte);
        }
    }
}

/// Performer that applies VTE actions to a Screen
struct ScreenPerformer<'a> {
    screen: &'a mut Screen,
}

impl vte::Perform for ScreenPerformer<'_> {
    fn print(&mut self, c: char) {
        self.screen.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            // Backspace (BS)
            0x08 => self.screen.backspace(),
            // Horizontal Tab (HT)
            0x09 => self.screen.tab(),
            // Line Feed (LF), Vertical Tab (VT), Form Feed (FF)
            0x0a..=0x0c => self.screen.line_feed(),
            // Carriage Return (CR)
            0x0d => self.screen.carriage_return(),
            _ => {
                log::trace!("Unhandled execute byte: 0x{:02x}", byte);
            }
        }
    }

    fn hook(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        log::trace!(
            "Ignoring DCS: params={:?}, intermediates={:?}, action={:?}",
            params_to_vec(params),
            intermediates,
            action
        );
    }

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        let Some(first) = params.first() else {
            return;
        };

        let command = match std::str::from_utf8(first) {
            Ok(s) => s.parse::<u32>().unwrap_or(u32::MAX),
            Err(_) => return,
        };

        match command {
            // Set icon name and window title / set window title
            0 | 2 => {
                if params.len() > 1 {
                    // The title itself may contain ';'
                    let title = params[1..]
                        .iter()
                        .map(|p| String::from_utf8_lossy(p))
                        .collect::<Vec<_>>()
                        .join(";");
                    log::debug!("Set title: {}", title);
                    self.screen.set_title(&title);
                }
            }
            _ => {
                log::trace!("Unhandled OSC: {}", command);
            }
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        if ignore {
            log::trace!("Ignoring oversized CSI sequence: action={:?}", action);
            return;
        }

        let params_vec = params_to_vec(params);

        match (action, intermediates) {
            // Cursor Up (CUU)
            ('A', []) => {
                let n = first_param(&params_vec, 1) as isize;
                self.screen.move_cursor_relative(-n, 0);
            }
            // Cursor Down (CUD)
            ('B', []) => {
                let n = first_param(&params_vec, 1) as isize;
                self.screen.move_cursor_relative(n, 0);
            }
            // Cursor Forward (CUF)
            ('C', []) => {
                let n = first_param(&params_vec, 1) as isize;
                self.screen.move_cursor_relative(0, n);
            }
            // Cursor Back (CUB)
            ('D', []) => {
                let n = first_param(&params_vec, 1) as isize;
                self.screen.move_cursor_relative(0, -n);
            }
            // Cursor Next Line (CNL)
            ('E', []) => {
                let n = first_param(&params_vec, 1) as isize;
                self.screen.move_cursor_relative(n, 0);
                self.screen.set_column(0);
            }
            // Cursor Previous Line (CPL)
            ('F', []) => {
                let n = first_param(&params_vec, 1) as isize;
                self.screen.move_cursor_relative(-n, 0);
                self.screen.set_column(0);
            }
            // Cursor Horizontal Absolute (CHA)
            ('G', []) => {
                let col = first_param(&params_vec, 1).saturating_sub(1);
                self.screen.set_column(col);
            }
            // Cursor Position (CUP) / Horizontal and Vertical Position (HVP)
            ('H', []) | ('f', []) => {
                let row = first_param(&params_vec, 1).saturating_sub(1);
                let col = second_param(&params_vec, 1).saturating_sub(1);
                self.screen.move_cursor(row, col);
            }
            // Erase in Display (ED)
            ('J', []) => match first_param(&params_vec, 0) {
                0 => self.screen.clear(ClearMode::Below),
                1 => self.screen.clear(ClearMode::Above),
                // 3 would also drop scrollback, which the buffer does not keep
                2 | 3 => self.screen.clear(ClearMode::All),
                mode => log::trace!("Unknown ED mode: {}", mode),
            },
            // Erase in Line (EL)
            ('K', []) => match first_param(&params_vec, 0) {
                0 => self.screen.clear_line(LineClearMode::Right),
                1 => self.screen.clear_line(LineClearMode::Left),
                2 => self.screen.clear_line(LineClearMode::All),
                mode => log::trace!("Unknown EL mode: {}", mode),
            },
            // Scroll Up (SU)
            ('S', []) => {
                let n = first_param(&params_vec, 1);
                self.screen.scroll_up(n);
            }
            // Vertical Line Position Absolute (VPA)
            ('d', []) => {
                let row = first_param(&params_vec, 1).saturating_sub(1);
                self.screen.set_row(row);
            }
            // SGR - Select Graphic Rendition
            ('m', []) => {
                self.handle_sgr(&params_vec);
            }
            // Save Cursor (SCOSC)
            ('s', []) => {
                self.screen.save_cursor();
            }
            // Restore Cursor (SCORC)
            ('u', []) => {
                self.screen.restore_cursor();
            }
            _ => {
                log::trace!(
                    "Unhandled CSI: action={:?}, intermediates={:?}, params={:?}",
                    action,
                    intermediates,
                    params_vec
                );
            }
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        match (byte, intermediates) {
            // Reset (RIS)
            (b'c', []) => {
                self.screen.reset();
            }
            // Save Cursor (DECSC)
            (b'7', []) => {
                self.screen.save_cursor();
            }
            // Restore Cursor (DECRC)
            (b'8', []) => {
                self.screen.restore_cursor();
            }
            // Index (IND) - move cursor down, scroll if at bottom
            (b'D', []) => {
                self.screen.line_feed();
            }
            // Next Line (NEL)
            (b'E', []) => {
                self.screen.carriage_return();
                self.screen.line_feed();
            }
            _ => {
                log::trace!(
                    "Unhandled ESC: byte=0x{:02x} ({:?}), intermediates={:?}",
                    byte,
                    byte as char,
                    intermediates
                );
            }
        }
    }
}

impl ScreenPerformer<'_> {
    /// Handle SGR (Select Graphic Rendition) sequences
    fn handle_sgr(&mut self, params: &[usize]) {
        if params.is_empty() {
            self.screen.style.reset();
            return;
        }

        let style = &mut self.screen.style;
        let mut iter = params.iter().peekable();

        while let Some(&param) = iter.next() {
            match param {
                // Reset
                0 => style.reset(),
                // Bold
                1 => style.attrs.insert(CellAttrs::BOLD),
                // Italic
                3 => style.attrs.insert(CellAttrs::ITALIC),
                // Underline
                4 => style.attrs.insert(CellAttrs::UNDERLINE),
                // Inverse
                7 => style.attrs.insert(CellAttrs::INVERSE),
                // Double underline on some terminals, bold off on others;
                // both treat 22 as normal intensity
                21 | 22 => style.attrs.remove(CellAttrs::BOLD),
                // Not italic
                23 => style.attrs.remove(CellAttrs::ITALIC),
                // Not underlined
                24 => style.attrs.remove(CellAttrs::UNDERLINE),
                // Not inverse
                27 => style.attrs.remove(CellAttrs::INVERSE),
                // Foreground colors (30-37)
                30..=37 => {
                    if let Some(color) = AnsiColor::from_index((param - 30) as u8) {
                        style.fg = Color::Ansi(color);
                    }
                }
                // Extended foreground color
                38 => {
                    if let Some(color) = parse_extended_color(&mut iter) {
                        style.fg = color;
                    }
                }
                // Default foreground
                39 => style.fg = Color::Default,
                // Background colors (40-47)
                40..=47 => {
                    if let Some(color) = AnsiColor::from_index((param - 40) as u8) {
                        style.bg = Color::Ansi(color);
                    }
                }
                // Extended background color
                48 => {
                    if let Some(color) = parse_extended_color(&mut iter) {
                        style.bg = color;
                    }
                }
                // Default background
                49 => style.bg = Color::Default,
                // Bright foreground colors (90-97)
                90..=97 => {
                    if let Some(color) = AnsiColor::from_index((param - 90 + 8) as u8) {
                        style.fg = Color::Ansi(color);
                    }
                }
                // Bright background colors (100-107)
                100..=107 => {
                    if let Some(color) = AnsiColor::from_index((param - 100 + 8) as u8) {
                        style.bg = Color::Ansi(color);
                    }
                }
                _ => {
                    log::trace!("Unknown SGR parameter: {}", param);
                }
            }
        }
    }
}

/// Parse extended color (256-color or RGB)
fn parse_extended_color(iter: &mut std::iter::Peekable<std::slice::Iter<usize>>) -> Option<Color> {
    let mode = *iter.next()?;

    match mode {
        // 256-color
        5 => {
            let index = u8::try_from(*iter.next()?).ok()?;
            Some(Color::from_palette(index))
        }
        // RGB
        2 => {
            let r = *iter.next()? as u8;
            let g = *iter.next()? as u8;
            let b = *iter.next()? as u8;
            Some(Color::Rgb(Rgb::new(r, g, b)))
        }
        _ => None,
    }
}

// Helper functions

fn params_to_vec(params: &Params) -> Vec<usize> {
    let mut result = Vec::new();
    for item in params.iter() {
        for &subparam in item {
            result.push(subparam as usize);
        }
    }
    result
}

fn first_param(params: &[usize], default: usize) -> usize {
    params
        .first()
        .copied()
        .filter(|&v| v != 0)
        .unwrap_or(default)
}

fn second_param(params: &[usize], default: usize) -> usize {
    params
        .get(1)
        .copied()
        .filter(|&v| v != 0)
        .unwrap_or(default)
}
