//! Stream analyzer - finds offsets where bytes can be spliced into live output
//!
//! A byte-level state machine that tracks whether the stream is currently
//! inside an escape sequence or a multi-byte UTF-8 character. It reports the
//! positions right after bytes that close such a unit, together with a
//! confidence: line ends are the safest, then shell prompts, then the end
//! of an escape sequence. State persists across calls, so sequences split
//! between chunks are handled.

use std::collections::VecDeque;
use std::sync::OnceLock;

use regex::RegexSet;

/// Longest escape sequence tracked before the analyzer gives up on it
pub const MAX_SEQUENCE_LEN: usize = 1024;

/// Printable characters kept for prompt detection
const PROMPT_WINDOW: usize = 20;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;
const CAN: u8 = 0x18;
const SUB: u8 = 0x1a;

fn prompt_patterns() -> Option<&'static RegexSet> {
    static PATTERNS: OnceLock<Option<RegexSet>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            RegexSet::new([
                // sh/bash, root, zsh/csh, generic
                r"[$#%>] $",
                // starship, oh-my-zsh and similar themes
                r"[❯➜λ»] $",
            ])
            .map_err(|e| log::error!("Failed to compile prompt patterns: {}", e))
            .ok()
        })
        .as_ref()
}

/// Analyzer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalyzerState {
    #[default]
    Normal,
    /// Saw ESC, waiting for the byte that selects the sequence kind
    EscapeStart,
    /// ESC followed by intermediate bytes, e.g. `ESC ( B`
    EscapeIntermediate,
    Csi,
    Osc,
    Dcs,
    Apc,
    /// Privacy message (SOS is treated the same way)
    Pm,
    Utf8Multibyte,
}

impl AnalyzerState {
    fn is_string(self) -> bool {
        matches!(self, Self::Osc | Self::Dcs | Self::Apc | Self::Pm)
    }

    fn is_escape(self) -> bool {
        !matches!(self, Self::Normal | Self::Utf8Multibyte)
    }
}

/// Why a position is safe for injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionReason {
    Newline,
    CarriageReturn,
    Prompt,
    SequenceEnd,
}

/// Offset in a processed chunk where a payload can be inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeInjectionPoint {
    /// Byte offset into the chunk; the payload goes before the byte at this index
    pub position: usize,
    pub reason: InjectionReason,
    /// 0-100, higher is safer
    pub confidence: u8,
}

/// Byte-level stream state machine
#[derive(Debug, Default)]
pub struct StreamAnalyzer {
    state: AnalyzerState,
    sequence_len: usize,
    /// ESC seen inside a string sequence, possibly the start of ST
    string_escape: bool,
    utf8_buf: [u8; 4],
    utf8_len: usize,
    utf8_needed: usize,
    prompt: VecDeque<char>,
}

impl StreamAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> AnalyzerState {
        self.state
    }

    /// Whether the stream is in the middle of a sequence or character
    pub fn in_sequence(&self) -> bool {
        self.state != AnalyzerState::Normal
    }

    /// Forget all state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Scan a chunk and return its safe injection points in ascending order
    pub fn process(&mut self, data: &[u8]) -> Vec<SafeInjectionPoint> {
        let mut points = Vec::new();
        for (i, &byte) in data.iter().enumerate() {
            if let Some((reason, confidence)) = self.advance(byte) {
                points.push(SafeInjectionPoint {
                    position: i + 1,
                    reason,
                    confidence,
                });
            }
        }
        points
    }

    fn enter(&mut self, state: AnalyzerState) {
        self.state = state;
        self.string_escape = false;
        if state == AnalyzerState::Normal {
            self.sequence_len = 0;
        }
    }

    fn advance(&mut self, byte: u8) -> Option<(InjectionReason, u8)> {
        if self.state.is_escape() {
            self.sequence_len += 1;
            if self.sequence_len > MAX_SEQUENCE_LEN {
                log::warn!(
                    "Escape sequence exceeded {} bytes in state {:?}, resetting",
                    MAX_SEQUENCE_LEN,
                    self.state
                );
                self.enter(AnalyzerState::Normal);
                return None;
            }
        }

        match self.state {
            AnalyzerState::Normal => self.normal(byte),
            AnalyzerState::Utf8Multibyte => self.utf8_continuation(byte),
            AnalyzerState::EscapeStart => self.escape_start(byte),
            AnalyzerState::EscapeIntermediate => match byte {
                0x20..=0x2f => None,
                0x30..=0x7e => {
                    self.enter(AnalyzerState::Normal);
                    Some((InjectionReason::SequenceEnd, 70))
                }
                ESC => {
                    self.enter(AnalyzerState::EscapeStart);
                    None
                }
                _ => self.abort_escape(byte),
            },
            AnalyzerState::Csi => match byte {
                0x40..=0x7e => {
                    self.enter(AnalyzerState::Normal);
                    Some((InjectionReason::SequenceEnd, 80))
                }
                ESC => {
                    log::trace!("CSI interrupted by ESC");
                    self.enter(AnalyzerState::EscapeStart);
                    None
                }
                CAN | SUB => {
                    self.enter(AnalyzerState::Normal);
                    None
                }
                _ => None,
            },
            state if state.is_string() => self.string_byte(byte),
            _ => None,
        }
    }

    fn normal(&mut self, byte: u8) -> Option<(InjectionReason, u8)> {
        match byte {
            ESC => {
                self.prompt.clear();
                self.enter(AnalyzerState::EscapeStart);
                self.sequence_len = 1;
                None
            }
            b'\n' => {
                self.prompt.clear();
                Some((InjectionReason::Newline, 100))
            }
            b'\r' => {
                self.prompt.clear();
                Some((InjectionReason::CarriageReturn, 90))
            }
            0x20..=0x7e => {
                self.push_prompt_char(byte as char);
                (byte == b' ' && self.prompt_matches()).then_some((InjectionReason::Prompt, 85))
            }
            0xc0..=0xdf => self.start_utf8(byte, 1),
            0xe0..=0xef => self.start_utf8(byte, 2),
            0xf0..=0xf7 => self.start_utf8(byte, 3),
            0x80..=0xbf | 0xf8..=0xff => {
                log::trace!("Stray UTF-8 byte 0x{:02x}", byte);
                self.prompt.clear();
                None
            }
            _ => {
                self.prompt.clear();
                None
            }
        }
    }

    fn start_utf8(&mut self, lead: u8, continuation: usize) -> Option<(InjectionReason, u8)> {
        self.utf8_buf[0] = lead;
        self.utf8_len = 1;
        self.utf8_needed = continuation;
        self.enter(AnalyzerState::Utf8Multibyte);
        None
    }

    fn utf8_continuation(&mut self, byte: u8) -> Option<(InjectionReason, u8)> {
        if byte & 0xc0 != 0x80 {
            log::debug!("Invalid UTF-8 continuation byte 0x{:02x}, resetting", byte);
            self.prompt.clear();
            self.enter(AnalyzerState::Normal);
            return self.normal(byte);
        }

        self.utf8_buf[self.utf8_len] = byte;
        self.utf8_len += 1;
        self.utf8_needed -= 1;
        if self.utf8_needed == 0 {
            let buf = self.utf8_buf;
            match std::str::from_utf8(&buf[..self.utf8_len]) {
                Ok(s) => s.chars().for_each(|c| self.push_prompt_char(c)),
                Err(_) => self.prompt.clear(),
            }
            self.enter(AnalyzerState::Normal);
        }
        None
    }

    fn escape_start(&mut self, byte: u8) -> Option<(InjectionReason, u8)> {
        match byte {
            b'[' => self.enter(AnalyzerState::Csi),
            b']' => self.enter(AnalyzerState::Osc),
            b'P' => self.enter(AnalyzerState::Dcs),
            b'_' => self.enter(AnalyzerState::Apc),
            b'^' | b'X' => self.enter(AnalyzerState::Pm),
            0x20..=0x2f => self.enter(AnalyzerState::EscapeIntermediate),
            ESC => {}
            0x30..=0x7e => {
                self.enter(AnalyzerState::Normal);
                return Some((InjectionReason::SequenceEnd, 70));
            }
            _ => return self.abort_escape(byte),
        }
        None
    }

    /// Leave an escape on a byte that cannot continue it
    ///
    /// A UTF-8 lead byte starts a character, anything else is dropped.
    fn abort_escape(&mut self, byte: u8) -> Option<(InjectionReason, u8)> {
        self.enter(AnalyzerState::Normal);
        match byte {
            0xc0..=0xf7 => self.normal(byte),
            _ => None,
        }
    }

    fn string_byte(&mut self, byte: u8) -> Option<(InjectionReason, u8)> {
        if self.string_escape {
            if byte == b'\\' {
                self.enter(AnalyzerState::Normal);
                return Some((InjectionReason::SequenceEnd, 75));
            }
            // The ESC ended the string and starts a new sequence
            self.enter(AnalyzerState::EscapeStart);
            return self.escape_start(byte);
        }

        match byte {
            BEL => {
                self.enter(AnalyzerState::Normal);
                Some((InjectionReason::SequenceEnd, 75))
            }
            ESC => {
                self.string_escape = true;
                None
            }
            CAN | SUB => {
                self.enter(AnalyzerState::Normal);
                None
            }
            _ => None,
        }
    }

    fn push_prompt_char(&mut self, c: char) {
        if self.prompt.len() == PROMPT_WINDOW {
            self.prompt.pop_front();
        }
        self.prompt.push_back(c);
    }

    fn prompt_matches(&self) -> bool {
        let Some(patterns) = prompt_patterns() else {
            return false;
        };
        let tail: String = self.prompt.iter().collect();
        patterns.is_match(&tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(points: &[SafeInjectionPoint]) -> Vec<usize> {
        points.iter().map(|p| p.position).collect()
    }

    #[test]
    fn test_line_ends() {
        let mut analyzer = StreamAnalyzer::new();
        let points = analyzer.process(b"ab\r\ncd\n");

        assert_eq!(positions(&points), vec![3, 4, 7]);
        assert_eq!(points[0].reason, InjectionReason::CarriageReturn);
        assert_eq!(points[0].confidence, 90);
        assert_eq!(points[1].reason, InjectionReason::Newline);
        assert_eq!(points[1].confidence, 100);
    }

    #[test]
    fn test_mixed_sequences() {
        let mut analyzer = StreamAnalyzer::new();
        let points = analyzer.process("\x1b[31mré\x1b]0;t\x07\n".as_bytes());

        assert_eq!(positions(&points), vec![5, 14, 15]);
        assert_eq!(points[0].confidence, 80);
        assert_eq!(points[1].confidence, 75);
        assert_eq!(analyzer.state(), AnalyzerState::Normal);
    }

    #[test]
    fn test_string_terminator() {
        let mut analyzer = StreamAnalyzer::new();
        let points = analyzer.process(b"\x1bPdata\x1b\\x");
        assert_eq!(positions(&points), vec![8]);
        assert_eq!(points[0].reason, InjectionReason::SequenceEnd);
    }

    #[test]
    fn test_escape_inside_string_starts_new_sequence() {
        let mut analyzer = StreamAnalyzer::new();
        let points = analyzer.process(b"\x1b]2;t\x1b[1m");
        assert_eq!(positions(&points), vec![9]);
    }

    #[test]
    fn test_two_byte_and_charset_escapes() {
        let mut analyzer = StreamAnalyzer::new();
        assert_eq!(positions(&analyzer.process(b"\x1b7")), vec![2]);
        assert_eq!(positions(&analyzer.process(b"\x1b(B")), vec![3]);
    }

    #[test]
    fn test_sequence_split_across_chunks() {
        let mut analyzer = StreamAnalyzer::new();
        assert!(analyzer.process(b"\x1b[1").is_empty());
        assert!(analyzer.in_sequence());
        assert_eq!(positions(&analyzer.process(b";2Hx")), vec![3]);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut analyzer = StreamAnalyzer::new();
        let euro = "€".as_bytes();

        assert!(analyzer.process(&euro[..1]).is_empty());
        assert_eq!(analyzer.state(), AnalyzerState::Utf8Multibyte);
        assert!(analyzer.process(&euro[1..2]).is_empty());
        let points = analyzer.process(&[euro[2], b'\n']);
        assert_eq!(positions(&points), vec![2]);
    }

    #[test]
    fn test_invalid_continuation_recovers() {
        let mut analyzer = StreamAnalyzer::new();
        let points = analyzer.process(&[0xe2, b'\n']);
        assert_eq!(positions(&points), vec![2]);
        assert_eq!(analyzer.state(), AnalyzerState::Normal);
    }

    #[test]
    fn test_prompt_detection() {
        let mut analyzer = StreamAnalyzer::new();

        let points = analyzer.process(b"\r\nuser@host:~$ ");
        let last = points.last().unwrap();
        assert_eq!(last.reason, InjectionReason::Prompt);
        assert_eq!(last.confidence, 85);
        assert_eq!(last.position, 15);

        let points = analyzer.process("\n~/src ❯ ".as_bytes());
        assert_eq!(points.last().unwrap().reason, InjectionReason::Prompt);
    }

    #[test]
    fn test_prompt_buffer_resets_on_control() {
        let mut analyzer = StreamAnalyzer::new();
        let points = analyzer.process(b"$\x07 ");
        assert!(points.is_empty());

        let points = analyzer.process(b"$\x1b[0m ");
        assert_eq!(
            points.iter().map(|p| p.reason).collect::<Vec<_>>(),
            vec![InjectionReason::SequenceEnd]
        );
    }

    #[test]
    fn test_oversized_sequence_resets() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut analyzer = StreamAnalyzer::new();

        let mut data = b"\x1b[".to_vec();
        data.extend(std::iter::repeat(b'1').take(MAX_SEQUENCE_LEN + 10));
        let points = analyzer.process(&data);
        assert!(points.is_empty());
        assert!(!analyzer.in_sequence());

        assert_eq!(positions(&analyzer.process(b"\n")), vec![1]);
    }

    #[test]
    fn test_escape_before_multibyte_char() {
        let mut analyzer = StreamAnalyzer::new();
        let data = "\x1bé\n".as_bytes();
        let points = analyzer.process(data);
        assert_eq!(positions(&points), vec![4]);
        assert_eq!(analyzer.state(), AnalyzerState::Normal);

        // Same path when ESC cuts a string short
        let data = "\x1b]0;t\x1b€x".as_bytes();
        let points = analyzer.process(data);
        assert!(points.is_empty());
        assert_eq!(analyzer.state(), AnalyzerState::Normal);

        assert!(analyzer.process(b"\x1b\x85x").is_empty());
        assert!(analyzer.process(b"\x1b(\x07").is_empty());
    }

    #[test]
    fn test_cancel_aborts_sequence() {
        let mut analyzer = StreamAnalyzer::new();
        let points = analyzer.process(b"\x1b[12\x18\n");
        assert_eq!(positions(&points), vec![6]);
    }
}
