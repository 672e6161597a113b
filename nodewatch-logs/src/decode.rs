//! Line decoders turning an upstream text stream into log records.

use chrono::{DateTime, TimeZone, Utc};
use nodewatch_core::{LogLevel, LogRecord};
use thiserror::Error;

/// A block of upstream output that could not be turned into a record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Undecodable log block: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Incremental decoder fed one line at a time.
///
/// Decoders may buffer partial input across lines. The pump calls
/// [`reset`](RecordDecoder::reset) after every reconnect so a block cut off by
/// a disconnect is never glued onto the next stream's first lines.
pub trait RecordDecoder: Send {
    /// Feed one line. Returns a result once a complete unit was seen.
    fn push_line(&mut self, line: &str) -> Option<Result<LogRecord, DecodeError>>;

    /// Discard any buffered partial input.
    fn reset(&mut self);
}

/// Builds a fresh decoder for each ingestion pump.
pub type DecoderFactory = std::sync::Arc<dyn Fn() -> Box<dyn RecordDecoder> + Send + Sync>;

// ============================================================================
// ROSOUT
// ============================================================================

/// Block terminator printed by `ros2 topic echo`.
const BLOCK_END: &str = "---";

/// Decoder for `ros2 topic echo /rosout` output.
///
/// Each message is a YAML-like block ending with a `---` line:
///
/// ```text
/// stamp:
///   sec: 1714564800
///   nanosec: 250000000
/// level: 30
/// name: sensing.lidar.driver
/// msg: point cloud delayed
/// ---
/// ```
///
/// Logger names use dots as separators; they are reported as a slash path
/// (`/sensing/lidar/driver`) so they line up with node names.
///
/// Long values are wrapped by the YAML emitter. Indented lines following a
/// top-level `key: value`, and any line inside an unterminated quoted value,
/// are folded back into that value:
///
/// ```text
/// msg: 'planner failed to converge after
///   50 iterations'
/// ```
#[derive(Debug, Default)]
pub struct RosoutDecoder {
    block: Vec<String>,
}

impl RosoutDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_block(lines: &[String]) -> Result<LogRecord, DecodeError> {
        let mut sec: Option<i64> = None;
        let mut nanosec: u32 = 0;
        let mut level: Option<u8> = None;
        let mut name: Option<String> = None;
        let mut msg: Option<String> = None;

        for line in fold_wrapped(lines) {
            let Some((key, value)) = line.trim().split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "sec" if sec.is_none() => sec = value.parse().ok(),
                "nanosec" => nanosec = value.parse().unwrap_or(0),
                "level" => level = value.parse().ok(),
                "name" => name = Some(unquote(value)),
                "msg" => msg = Some(unquote(value)),
                _ => {}
            }
        }

        let sec = sec.ok_or_else(|| DecodeError::new("missing stamp.sec"))?;
        let level = level.ok_or_else(|| DecodeError::new("missing level"))?;
        let name = name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| DecodeError::new("missing name"))?;
        let msg = msg.ok_or_else(|| DecodeError::new("missing msg"))?;

        Ok(LogRecord::new(
            timestamp(sec, nanosec)?,
            LogLevel::from_rosout_code(level),
            source_path(&name),
            msg,
        ))
    }
}

impl RecordDecoder for RosoutDecoder {
    fn push_line(&mut self, line: &str) -> Option<Result<LogRecord, DecodeError>> {
        if line.trim() == BLOCK_END {
            if self.block.is_empty() {
                return None;
            }
            let block = std::mem::take(&mut self.block);
            return Some(Self::decode_block(&block));
        }
        self.block.push(line.to_string());
        None
    }

    fn reset(&mut self) {
        self.block.clear();
    }
}

/// Join wrapped continuation lines onto the entry they continue.
fn fold_wrapped(lines: &[String]) -> Vec<String> {
    let mut folded: Vec<String> = Vec::with_capacity(lines.len());
    let mut open_scalar = false;

    for line in lines {
        let indented = line.starts_with(' ') || line.starts_with('\t');
        if open_scalar {
            if let Some(last) = folded.last_mut() {
                if indented || in_open_quote(last) {
                    append_continuation(last, line.trim());
                    continue;
                }
            }
        }
        // Only a top-level key with an inline value can wrap; `stamp:` opens a mapping.
        open_scalar = !indented
            && line
                .split_once(':')
                .is_some_and(|(_, value)| !value.trim().is_empty());
        folded.push(line.clone());
    }
    folded
}

/// Whether the entry's value opens a quote it has not closed yet.
fn in_open_quote(entry: &str) -> bool {
    let Some((_, value)) = entry.split_once(':') else {
        return false;
    };
    let value = value.trim_start();
    if let Some(rest) = value.strip_prefix('\'') {
        // '' is an escaped quote inside a single-quoted scalar.
        return !rest.replace("''", "").ends_with('\'');
    }
    if let Some(rest) = value.strip_prefix('"') {
        let Some(body) = rest.strip_suffix('"') else {
            return true;
        };
        let escapes = body.chars().rev().take_while(|c| *c == '\\').count();
        return escapes % 2 == 1;
    }
    false
}

fn append_continuation(entry: &mut String, piece: &str) {
    if piece.is_empty() {
        // A blank line inside a folded scalar is a line break.
        entry.push('\n');
        return;
    }
    let double_quoted = entry
        .split_once(':')
        .is_some_and(|(_, value)| value.trim_start().starts_with('"'));
    if double_quoted && entry.ends_with('\\') {
        // Escaped line break in a double-quoted scalar joins without a space.
        entry.pop();
        entry.push_str(piece.strip_prefix('\\').unwrap_or(piece));
        return;
    }
    if !entry.ends_with('\n') {
        entry.push(' ');
    }
    entry.push_str(piece);
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if let Some(inner) = value.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')) {
        return inner.replace("''", "'");
    }
    if let Some(inner) = value.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) {
        return unescape_double_quoted(inner);
    }
    value.to_string()
}

fn unescape_double_quoted(inner: &str) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn timestamp(sec: i64, nanosec: u32) -> Result<DateTime<Utc>, DecodeError> {
    Utc.timestamp_opt(sec, nanosec)
        .single()
        .ok_or_else(|| DecodeError::new(format!("invalid stamp {}.{}", sec, nanosec)))
}

/// `sensing.lidar.driver` -> `/sensing/lidar/driver`. Names already in path
/// form are kept.
fn source_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name.replace('.', "/"))
    }
}

// ============================================================================
// JSON LINES
// ============================================================================

/// Decoder for sources that emit one JSON-encoded [`LogRecord`] per line.
#[derive(Debug, Default)]
pub struct JsonLineDecoder;

impl RecordDecoder for JsonLineDecoder {
    fn push_line(&mut self, line: &str) -> Option<Result<LogRecord, DecodeError>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(serde_json::from_str(line).map_err(|e| DecodeError::new(e.to_string())))
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut dyn RecordDecoder, text: &str) -> Vec<Result<LogRecord, DecodeError>> {
        text.lines().filter_map(|line| decoder.push_line(line)).collect()
    }

    const BLOCK: &str = "\
stamp:
  sec: 1714564800
  nanosec: 500000000
level: 30
name: sensing.lidar.driver
msg: 'point cloud delayed'
file: /src/driver.cpp
function: publish
line: 42
---";

    #[test]
    fn test_rosout_block() {
        let mut decoder = RosoutDecoder::new();
        let mut results = feed(&mut decoder, BLOCK);
        assert_eq!(results.len(), 1);
        let record = results.remove(0).unwrap();
        assert_eq!(record.level, LogLevel::Warn);
        assert_eq!(record.source, "/sensing/lidar/driver");
        assert_eq!(record.message, "point cloud delayed");
        assert_eq!(record.timestamp.timestamp(), 1714564800);
        assert_eq!(record.timestamp.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_rosout_unknown_level_is_info() {
        let mut decoder = RosoutDecoder::new();
        let text = "stamp:\n  sec: 1\nlevel: 7\nname: /talker\nmsg: hi\n---";
        let record = feed(&mut decoder, text).remove(0).unwrap();
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.source, "/talker");
    }

    #[test]
    fn test_rosout_incomplete_block_is_error() {
        let mut decoder = RosoutDecoder::new();
        let results = feed(&mut decoder, "level: 20\nmsg: no name\n---");
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_rosout_reset_discards_partial_block() {
        let mut decoder = RosoutDecoder::new();
        assert!(feed(&mut decoder, "stamp:\n  sec: 1\nlevel: 40\n").is_empty());
        decoder.reset();
        let record = feed(&mut decoder, "stamp:\n  sec: 2\nlevel: 20\nname: b\nmsg: ok\n---")
            .remove(0)
            .unwrap();
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.timestamp.timestamp(), 2);
    }

    #[test]
    fn test_rosout_wrapped_message_is_joined() {
        let mut decoder = RosoutDecoder::new();
        let text = "\
stamp:
  sec: 1714564800
  nanosec: 0
level: 40
name: planning.planner
msg: 'planner failed to converge after 50 iterations: cost 12.5, horizon
  exceeded, it''s giving up'
file: /src/planner.cpp
line: 7
---";
        let record = feed(&mut decoder, text).remove(0).unwrap();
        assert_eq!(record.source, "/planning/planner");
        assert_eq!(
            record.message,
            "planner failed to converge after 50 iterations: cost 12.5, horizon exceeded, it's giving up"
        );
    }

    #[test]
    fn test_rosout_wrapped_plain_and_double_quoted() {
        let mut decoder = RosoutDecoder::new();
        let plain = "stamp:\n  sec: 1\nlevel: 20\nname: a\nmsg: first part\n  second: part\nline: 3\n---";
        let record = feed(&mut decoder, plain).remove(0).unwrap();
        assert_eq!(record.message, "first part second: part");

        let escaped = "stamp:\n  sec: 1\nlevel: 20\nname: a\nmsg: \"tab\\there, joined\\\n  \\ here\"\n---";
        let record = feed(&mut decoder, escaped).remove(0).unwrap();
        assert_eq!(record.message, "tab\there, joined here");
    }

    #[test]
    fn test_rosout_ignores_empty_blocks() {
        let mut decoder = RosoutDecoder::new();
        assert!(feed(&mut decoder, "---\n---").is_empty());
    }

    #[test]
    fn test_json_lines() {
        let mut decoder = JsonLineDecoder;
        let text = r#"{"timestamp":"2024-05-01T12:00:00Z","level":"ERROR","source":"/a","message":"boom"}

not json"#;
        let results = feed(&mut decoder, text);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().level, LogLevel::Error);
        assert!(results[1].is_err());
    }
}
