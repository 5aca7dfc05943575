//! Stream log tailer - fallback when direct output callbacks are unavailable
//!
//! Sessions may persist their output as an asciinema-style log: one JSON
//! header object followed by one `[timestamp, type, data]` array per line.
//! `"o"` records carry output, `"r"` records a `"COLSxROWS"` resize. The
//! reader remembers its byte offset and only consumes complete lines, so a
//! record that is still being written is picked up on the next read.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde::de::IgnoredAny;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{RelayError, Result};

/// Event recovered from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Output(Vec<u8>),
    Resize { cols: usize, rows: usize },
}

#[derive(Deserialize)]
struct LogHeader {
    width: Option<usize>,
    height: Option<usize>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LogRecord {
    /// Timestamp, kind, payload
    Event(IgnoredAny, String, serde_json::Value),
    Header(LogHeader),
}

/// Parse a `"COLSxROWS"` size
fn parse_size(s: &str) -> Option<(usize, usize)> {
    let (cols, rows) = s.split_once('x')?;
    Some((cols.trim().parse().ok()?, rows.trim().parse().ok()?))
}

/// Parse one log line
///
/// Returns `Ok(None)` for records that carry nothing for the buffer
/// (input, markers, headers without a size).
pub fn parse_record(line: &str) -> std::result::Result<Option<StreamEvent>, String> {
    let record: LogRecord = serde_json::from_str(line).map_err(|e| e.to_string())?;

    let event = match record {
        LogRecord::Header(LogHeader {
            width: Some(cols),
            height: Some(rows),
        }) => Some(StreamEvent::Resize { cols, rows }),
        LogRecord::Header(_) => None,
        LogRecord::Event(_, kind, data) => match (kind.as_str(), data) {
            ("o", serde_json::Value::String(s)) if !s.is_empty() => {
                Some(StreamEvent::Output(s.into_bytes()))
            }
            ("o", serde_json::Value::String(_)) => None,
            ("r", serde_json::Value::String(s)) => {
                let (cols, rows) =
                    parse_size(&s).ok_or_else(|| format!("bad resize payload {:?}", s))?;
                Some(StreamEvent::Resize { cols, rows })
            }
            ("o" | "r", other) => return Err(format!("unexpected payload {}", other)),
            _ => None,
        },
    };
    Ok(event)
}

/// Incremental reader over a growing stream log
#[derive(Debug)]
pub struct StreamLogReader {
    path: PathBuf,
    offset: u64,
    line: usize,
}

impl StreamLogReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            line: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read events appended since the last call
    ///
    /// A missing file yields no events. Malformed lines are logged and
    /// skipped; they never stop the tail.
    pub async fn read_new(&mut self) -> Result<Vec<StreamEvent>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RelayError::Io(e)),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            log::warn!(
                "Stream log {} shrank from {} to {} bytes, rereading",
                self.path.display(),
                self.offset,
                len
            );
            self.offset = 0;
            self.line = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut buf).await?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &buf[..=last_newline];

        let mut events = Vec::new();
        for raw in complete.split(|&b| b == b'\n') {
            if raw.is_empty() {
                continue;
            }
            self.line += 1;
            let parsed = std::str::from_utf8(raw)
                .map_err(|e| e.to_string())
                .and_then(|line| parse_record(line.trim_end_matches('\r')));
            match parsed {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(reason) => {
                    let err = RelayError::StreamLog {
                        line: self.line,
                        reason,
                    };
                    log::warn!("{}: {}", self.path.display(), err);
                }
            }
        }

        self.offset += complete.len() as u64;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_record() {
        assert_eq!(
            parse_record(r#"[0.5, "o", "hi\r\n"]"#),
            Ok(Some(StreamEvent::Output(b"hi\r\n".to_vec())))
        );
        assert_eq!(
            parse_record(r#"[1.0, "r", "120x40"]"#),
            Ok(Some(StreamEvent::Resize { cols: 120, rows: 40 }))
        );
        assert_eq!(
            parse_record(r#"{"version": 2, "width": 80, "height": 24}"#),
            Ok(Some(StreamEvent::Resize { cols: 80, rows: 24 }))
        );
        assert_eq!(parse_record(r#"{"version": 2}"#), Ok(None));
        assert_eq!(parse_record(r#"[1.0, "i", "ls\r"]"#), Ok(None));
        assert!(parse_record(r#"[1.0, "r", "wide"]"#).is_err());
        assert!(parse_record(r#"[1.0, "o", 5]"#).is_err());
        assert!(parse_record("not json").is_err());
        assert_eq!(
            parse_record(r#"[12, "o", "x"]"#),
            Ok(Some(StreamEvent::Output(b"x".to_vec())))
        );
    }

    #[tokio::test]
    async fn test_tail_only_consumes_complete_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut reader = StreamLogReader::new(file.path());

        write!(
            file,
            "{{\"version\": 2, \"width\": 80, \"height\": 24}}\n[0.1, \"o\", \"ab\"]\n[0.2, \"o\", \"c"
        )
        .unwrap();
        file.flush().unwrap();

        let events = reader.read_new().await.unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::Resize { cols: 80, rows: 24 },
                StreamEvent::Output(b"ab".to_vec()),
            ]
        );
        let offset = reader.offset();

        assert!(reader.read_new().await.unwrap().is_empty());
        assert_eq!(reader.offset(), offset);

        write!(file, "d\"]\nnot json\n[0.3, \"r\", \"100x30\"]\n").unwrap();
        file.flush().unwrap();

        let events = reader.read_new().await.unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::Output(b"cd".to_vec()),
                StreamEvent::Resize { cols: 100, rows: 30 },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = StreamLogReader::new(dir.path().join("absent.cast"));
        assert!(reader.read_new().await.unwrap().is_empty());
        assert_eq!(reader.offset(), 0);
    }

    #[tokio::test]
    async fn test_truncated_file_is_reread() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[0.1, \"o\", \"first line of output\"]").unwrap();
        file.flush().unwrap();

        let mut reader = StreamLogReader::new(file.path());
        assert_eq!(reader.read_new().await.unwrap().len(), 1);

        std::fs::write(file.path(), "[0.1, \"o\", \"new\"]\n").unwrap();
        assert_eq!(
            reader.read_new().await.unwrap(),
            vec![StreamEvent::Output(b"new".to_vec())]
        );
    }
}
