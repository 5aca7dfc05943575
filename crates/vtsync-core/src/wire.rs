//! Binary snapshot wire format
//!
//! Little-endian throughout. Layout:
//!
//! ```text
//! header (28 bytes)
//!   u16 magic 0x5654 ("VT") | u8 version | u8 flags
//!   u32 cols | u32 rows | u32 viewport_y | u32 cursor_x | u32 cursor_y
//!   u32 reserved (0)
//! rows, top to bottom
//!   0xFE n          n consecutive blank rows
//!   0xFC n          n consecutive rows not carried (incremental only)
//!   0xFD u16 count  count encoded cells, trailing blanks trimmed
//! cell
//!   type byte, then char data, then attr byte and colors if extended
//! ```
//!
//! Type byte bits: `0x80` extended (attributes or colors follow), `0x40`
//! unicode, `0x20` has fg, `0x10` has bg, `0x08` fg is RGB, `0x04` bg is RGB,
//! low two bits are the char kind (`00` space, `01` ASCII, `10` unicode).
//! A lone `0x00` is a default blank cell. Spaces carry no char data, so a
//! styled space is its type byte plus the extended data. Other ASCII chars
//! take one byte, the rest a length byte plus UTF-8. Palette colors take one
//! byte, RGB colors three.

use crate::cell::{Cell, CellAttrs};
use crate::color::{Color, Rgb};
use crate::grid::Row;
use crate::snapshot::Snapshot;

pub const MAGIC: u16 = 0x5654;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 28;

/// Flags byte: the blob only carries the rows that changed
pub const FLAG_INCREMENTAL: u8 = 0x01;

pub const ROW_UNCHANGED: u8 = 0xFC;
pub const ROW_CONTENT: u8 = 0xFD;
pub const ROW_EMPTY: u8 = 0xFE;

const TYPE_EXTENDED: u8 = 0x80;
const TYPE_UNICODE: u8 = 0x40;
const TYPE_FG: u8 = 0x20;
const TYPE_BG: u8 = 0x10;
const TYPE_FG_RGB: u8 = 0x08;
const TYPE_BG_RGB: u8 = 0x04;
const KIND_MASK: u8 = 0x03;
const KIND_SPACE: u8 = 0x00;
const KIND_ASCII: u8 = 0x01;
const KIND_UNICODE: u8 = 0x02;

/// Upper bound on cols * rows accepted by the decoder
const MAX_DECODED_CELLS: usize = 1 << 24;

/// Errors from [`decode`]
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),

    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("input truncated at offset {0}")]
    Truncated(usize),

    #[error("invalid UTF-8 character at offset {0}")]
    InvalidUtf8(usize),

    #[error("unknown row marker 0x{marker:02x} at offset {offset}")]
    UnknownRowMarker { marker: u8, offset: usize },

    #[error("row {row} has {cells} cells but the screen is {cols} wide")]
    RowTooWide { row: usize, cells: usize, cols: usize },

    #[error("row data exceeds the {rows} rows declared in the header")]
    TooManyRows { rows: usize },

    #[error("screen {cols}x{rows} is too large to decode")]
    TooLarge { cols: usize, rows: usize },

    #[error("zero-length row run at offset {0}")]
    EmptyRun(usize),

    #[error("{0} trailing bytes after the last row")]
    TrailingBytes(usize),
}

enum RowPlan<'a> {
    Unchanged(u8),
    Empty(u8),
    Content(&'a [Cell]),
}

impl RowPlan<'_> {
    fn encoded_len(&self) -> usize {
        match self {
            RowPlan::Unchanged(_) | RowPlan::Empty(_) => 2,
            RowPlan::Content(cells) => 3 + cells.iter().map(cell_len).sum::<usize>(),
        }
    }
}

fn plan_rows(snapshot: &Snapshot) -> Vec<RowPlan<'_>> {
    let mut plan: Vec<RowPlan<'_>> = Vec::new();

    for index in 0..snapshot.rows {
        match snapshot.cells.get(index) {
            Some(Some(row)) if !row.is_all_empty() => {
                plan.push(RowPlan::Content(trimmed(row)));
            }
            Some(Some(_)) => match plan.last_mut() {
                Some(RowPlan::Empty(n)) if *n < u8::MAX => *n += 1,
                _ => plan.push(RowPlan::Empty(1)),
            },
            Some(None) | None => match plan.last_mut() {
                Some(RowPlan::Unchanged(n)) if *n < u8::MAX => *n += 1,
                _ => plan.push(RowPlan::Unchanged(1)),
            },
        }
    }

    plan
}

/// Cells up to the last non-blank one, at least one and at most u16::MAX
fn trimmed(row: &Row) -> &[Cell] {
    let cells = row.cells();
    let end = cells
        .iter()
        .rposition(|c| !c.is_empty())
        .map_or(1, |last| last + 1)
        .min(cells.len())
        .min(u16::MAX as usize);
    &cells[..end]
}

fn is_plain_space(cell: &Cell) -> bool {
    cell.is_empty()
}

fn is_extended(cell: &Cell) -> bool {
    !cell.attrs.is_empty() || !cell.fg.is_default() || !cell.bg.is_default()
}

fn color_len(color: &Color) -> usize {
    match color {
        Color::Default => 0,
        Color::Ansi(_) | Color::Indexed(_) => 1,
        Color::Rgb(_) => 3,
    }
}

fn cell_len(cell: &Cell) -> usize {
    if is_plain_space(cell) {
        return 1;
    }

    let char_len = match cell.c {
        ' ' => 0,
        c if c.is_ascii() => 1,
        c => 1 + c.len_utf8(),
    };
    let ext_len = if is_extended(cell) {
        1 + color_len(&cell.fg) + color_len(&cell.bg)
    } else {
        0
    };
    1 + char_len + ext_len
}

fn type_byte(cell: &Cell) -> u8 {
    let mut t = 0;
    if is_extended(cell) {
        t |= TYPE_EXTENDED;
    }
    t |= match cell.c {
        ' ' => KIND_SPACE,
        c if c.is_ascii() => KIND_ASCII,
        _ => TYPE_UNICODE | KIND_UNICODE,
    };
    match cell.fg {
        Color::Default => {}
        Color::Rgb(_) => t |= TYPE_FG | TYPE_FG_RGB,
        _ => t |= TYPE_FG,
    }
    match cell.bg {
        Color::Default => {}
        Color::Rgb(_) => t |= TYPE_BG | TYPE_BG_RGB,
        _ => t |= TYPE_BG,
    }
    t
}

fn put_color(out: &mut Vec<u8>, color: &Color) {
    match color {
        Color::Default => {}
        Color::Rgb(rgb) => out.extend_from_slice(&[rgb.r, rgb.g, rgb.b]),
        palette => {
            if let Some(index) = palette.palette_index() {
                out.push(index);
            }
        }
    }
}

fn put_cell(out: &mut Vec<u8>, cell: &Cell) {
    if is_plain_space(cell) {
        out.push(0x00);
        return;
    }

    out.push(type_byte(cell));
    match cell.c {
        ' ' => {}
        c if c.is_ascii() => out.push(c as u8),
        c => {
            let mut utf8 = [0u8; 4];
            let encoded = c.encode_utf8(&mut utf8);
            out.push(encoded.len() as u8);
            out.extend_from_slice(encoded.as_bytes());
        }
    }

    if is_extended(cell) {
        out.push(cell.attrs.bits());
        put_color(out, &cell.fg);
        put_color(out, &cell.bg);
    }
}

fn put_u32(out: &mut Vec<u8>, value: usize) {
    let value = u32::try_from(value).unwrap_or(u32::MAX);
    out.extend_from_slice(&value.to_le_bytes());
}

/// Exact encoded size of a snapshot
pub fn encoded_len(snapshot: &Snapshot) -> usize {
    HEADER_LEN + plan_rows(snapshot).iter().map(RowPlan::encoded_len).sum::<usize>()
}

/// Encode a snapshot
///
/// The output size is computed up front so the buffer is allocated once.
pub fn encode(snapshot: &Snapshot) -> Vec<u8> {
    let plan = plan_rows(snapshot);
    let size = HEADER_LEN + plan.iter().map(RowPlan::encoded_len).sum::<usize>();
    let mut out = Vec::with_capacity(size);

    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.push(VERSION);
    out.push(if snapshot.incremental { FLAG_INCREMENTAL } else { 0 });
    put_u32(&mut out, snapshot.cols);
    put_u32(&mut out, snapshot.rows);
    put_u32(&mut out, snapshot.viewport_y);
    put_u32(&mut out, snapshot.cursor_x);
    put_u32(&mut out, snapshot.cursor_y);
    put_u32(&mut out, 0);

    for row in &plan {
        match row {
            RowPlan::Unchanged(n) => out.extend_from_slice(&[ROW_UNCHANGED, *n]),
            RowPlan::Empty(n) => out.extend_from_slice(&[ROW_EMPTY, *n]),
            RowPlan::Content(cells) => {
                out.push(ROW_CONTENT);
                out.extend_from_slice(&(cells.len() as u16).to_le_bytes());
                for cell in *cells {
                    put_cell(&mut out, cell);
                }
            }
        }
    }

    debug_assert_eq!(out.len(), size);
    out
}

/// A snapshot as reconstructed by [`decode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSnapshot {
    pub version: u8,
    pub incremental: bool,
    pub cols: usize,
    pub rows: usize,
    pub viewport_y: usize,
    pub cursor_x: usize,
    pub cursor_y: usize,
    /// One entry per row, padded to `cols`; `None` for rows not carried
    pub cells: Vec<Option<Row>>,
}

impl DecodedSnapshot {
    pub fn row(&self, index: usize) -> Option<&Row> {
        self.cells.get(index)?.as_ref()
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(DecodeError::Truncated(self.pos))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<usize, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn color(&mut self, present: bool, rgb: bool) -> Result<Color, DecodeError> {
        if !present {
            return Ok(Color::Default);
        }
        if rgb {
            let b = self.take(3)?;
            Ok(Color::Rgb(Rgb::new(b[0], b[1], b[2])))
        } else {
            Ok(Color::from_palette(self.u8()?))
        }
    }

    fn cell(&mut self) -> Result<Cell, DecodeError> {
        let start = self.pos;
        let t = self.u8()?;
        if t == 0x00 {
            return Ok(Cell::default());
        }

        let extended = t & TYPE_EXTENDED != 0;
        let c = if t & TYPE_UNICODE != 0 || t & KIND_MASK == KIND_UNICODE {
            let len = self.u8()? as usize;
            let bytes = self.take(len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8(start))?;
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => return Err(DecodeError::InvalidUtf8(start)),
            }
        } else if t & KIND_MASK == KIND_ASCII {
            let byte = self.u8()?;
            if !byte.is_ascii() {
                return Err(DecodeError::InvalidUtf8(start));
            }
            byte as char
        } else {
            ' '
        };

        let mut cell = Cell::new(c);
        if extended {
            cell.attrs = CellAttrs::from_bits_truncate(self.u8()?);
            cell.fg = self.color(t & TYPE_FG != 0, t & TYPE_FG_RGB != 0)?;
            cell.bg = self.color(t & TYPE_BG != 0, t & TYPE_BG_RGB != 0)?;
        }
        Ok(cell)
    }
}

/// Decode a blob produced by [`encode`]
pub fn decode(data: &[u8]) -> Result<DecodedSnapshot, DecodeError> {
    let mut reader = Reader { data, pos: 0 };

    let magic = reader.u16()?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = reader.u8()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let flags = reader.u8()?;
    let cols = reader.u32()?;
    let rows = reader.u32()?;
    let viewport_y = reader.u32()?;
    let cursor_x = reader.u32()?;
    let cursor_y = reader.u32()?;
    let _reserved = reader.u32()?;

    if cols.saturating_mul(rows) > MAX_DECODED_CELLS {
        return Err(DecodeError::TooLarge { cols, rows });
    }

    let mut cells: Vec<Option<Row>> = Vec::with_capacity(rows);
    while cells.len() < rows {
        let offset = reader.pos;
        let marker = reader.u8()?;
        match marker {
            ROW_EMPTY | ROW_UNCHANGED => {
                let count = reader.u8()? as usize;
                if count == 0 {
                    return Err(DecodeError::EmptyRun(offset));
                }
                if cells.len() + count > rows {
                    return Err(DecodeError::TooManyRows { rows });
                }
                for _ in 0..count {
                    cells.push((marker == ROW_EMPTY).then(|| Row::new(cols)));
                }
            }
            ROW_CONTENT => {
                let count = reader.u16()? as usize;
                if count > cols {
                    return Err(DecodeError::RowTooWide {
                        row: cells.len(),
                        cells: count,
                        cols,
                    });
                }
                let mut row = Vec::with_capacity(cols);
                for _ in 0..count {
                    row.push(reader.cell()?);
                }
                row.resize(cols, Cell::default());
                cells.push(Some(Row::from_cells(row)));
            }
            marker => return Err(DecodeError::UnknownRowMarker { marker, offset }),
        }
    }

    if reader.remaining() > 0 {
        return Err(DecodeError::TrailingBytes(reader.remaining()));
    }

    Ok(DecodedSnapshot {
        version,
        incremental: flags & FLAG_INCREMENTAL != 0,
        cols,
        rows,
        viewport_y,
        cursor_x,
        cursor_y,
        cells,
    })
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::snapshot::ChangeFlags;
    use proptest::prelude::*;

    fn arb_color() -> impl Strategy<Value = Color> {
        prop_oneof![
            Just(Color::Default),
            any::<u8>().prop_map(Color::from_palette),
            any::<(u8, u8, u8)>().prop_map(|(r, g, b)| Color::Rgb(Rgb::new(r, g, b))),
        ]
    }

    fn arb_cell() -> impl Strategy<Value = Cell> {
        let c = prop_oneof![
            Just(' '),
            prop::char::range(' ', '~'),
            prop::sample::select(vec!['é', '€', '日', '❯']),
        ];
        let styled = (c, arb_color(), arb_color(), any::<u8>()).prop_map(|(c, fg, bg, attrs)| Cell {
            c,
            fg,
            bg,
            attrs: CellAttrs::from_bits_truncate(attrs),
        });
        prop_oneof![2 => Just(Cell::default()), 3 => styled]
    }

    fn arb_snapshot() -> impl Strategy<Value = Snapshot> {
        (1..12usize, 1..8usize, any::<bool>())
            .prop_flat_map(|(cols, rows, incremental)| {
                let row = prop::collection::vec(arb_cell(), cols).prop_map(Row::from_cells);
                let included = if incremental { 0.6 } else { 1.0 };
                (
                    Just((cols, incremental)),
                    prop::collection::vec(prop::option::weighted(included, row), rows),
                    0..cols,
                    0..rows,
                )
            })
            .prop_map(|((cols, incremental), cells, cursor_x, cursor_y)| Snapshot {
                cols,
                rows: cells.len(),
                viewport_y: 0,
                cursor_x,
                cursor_y,
                cells,
                dirty_rows: Vec::new(),
                incremental,
                change_flags: ChangeFlags::empty(),
                sequence_id: 1,
                title: String::new(),
            })
    }

    proptest! {
        #[test]
        fn decode_restores_every_carried_row(snapshot in arb_snapshot()) {
            let bytes = encode(&snapshot);
            prop_assert_eq!(bytes.len(), encoded_len(&snapshot));

            let decoded = decode(&bytes).unwrap();
            prop_assert_eq!(decoded.incremental, snapshot.incremental);
            prop_assert_eq!((decoded.cursor_x, decoded.cursor_y), (snapshot.cursor_x, snapshot.cursor_y));
            prop_assert_eq!((decoded.cols, decoded.rows), (snapshot.cols, snapshot.rows));
            prop_assert_eq!(&decoded.cells, &snapshot.cells);
        }
    }
}
