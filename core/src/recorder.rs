//! Recorder (§4.2): persists a session's output as an append-only asciinema-v2-compatible
//! transcript and derives "prune point" byte offsets so later readers can skip ancient bytes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::VtError;

/// Output/input chunks longer than this are split across multiple events so a reader
/// never has to buffer an unbounded line.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// First line of every transcript: an asciinema-v2 header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

/// Kind discriminant for a transcript event, matching the single-character wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Output,
    Input,
    Resize,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            EventKind::Output => "o",
            EventKind::Input => "i",
            EventKind::Resize => "r",
        }
    }
}

/// Append-only writer bound to one session's transcript file.
pub struct RecordingWriter {
    file: Mutex<File>,
    start: Instant,
    last_t: Mutex<f64>,
}

impl RecordingWriter {
    /// Creates the transcript file and writes the header line. Fails if the file already
    /// exists (a session's recording is created exactly once).
    pub fn open(path: &Path, header: &RecordingHeader) -> Result<Self, VtError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut line = serde_json::to_string(header)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(Self {
            file: Mutex::new(file),
            start: Instant::now(),
            last_t: Mutex::new(0.0),
        })
    }

    fn next_t(&self) -> f64 {
        let now = self.start.elapsed().as_secs_f64();
        let mut last = self.last_t.lock().expect("recorder timestamp mutex");
        let t = now.max(*last);
        *last = t;
        t
    }

    fn append_chunk(&self, kind: EventKind, data: &[u8]) -> Result<(), VtError> {
        let mut file = self.file.lock().expect("recorder file mutex");
        for piece in data.chunks(MAX_CHUNK_BYTES) {
            let t = self.next_t();
            let text = String::from_utf8_lossy(piece);
            let mut line = serde_json::to_string(&(t, kind.as_str(), text.as_ref()))?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    pub fn append_output(&self, data: &[u8]) -> Result<(), VtError> {
        self.append_chunk(EventKind::Output, data)
    }

    pub fn append_input(&self, data: &[u8]) -> Result<(), VtError> {
        self.append_chunk(EventKind::Input, data)
    }

    pub fn append_resize(&self, cols: u16, rows: u16) -> Result<(), VtError> {
        let t = self.next_t();
        let mut file = self.file.lock().expect("recorder file mutex");
        let mut line = serde_json::to_string(&(t, "r", format!("{}x{}", cols, rows)))?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Flushes and fsyncs; the file remains valid for replay after this returns.
    pub fn close(&self) -> Result<(), VtError> {
        let mut file = self.file.lock().expect("recorder file mutex");
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

/// Exhaustive list of terminal "clear/reset" escape sequences that mark safe replay
/// restart points (§4.2). Order matters only in that longer sequences sharing a prefix
/// with a shorter one must be tried first.
const PRUNE_SEQUENCES: &[&str] = &[
    "\x1b[H\x1b[2J",
    "\x1b[H\x1b[J",
    "\x1b[?1049h",
    "\x1b[?1049l",
    "\x1b[?47h",
    "\x1b[?47l",
    "\x1b[3J",
    "\x1b[2J",
    "\x1bc",
];

/// Finds the byte end-offset (within `text`) of every non-overlapping prune sequence
/// occurrence, longest match winning at a given start position.
fn find_prune_ends(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut ends = Vec::new();
    let mut i = 0;
    'outer: while i < bytes.len() {
        for seq in PRUNE_SEQUENCES {
            let sb = seq.as_bytes();
            if bytes[i..].starts_with(sb) {
                let end = i + sb.len();
                ends.push(end);
                i = end;
                continue 'outer;
            }
        }
        i += 1;
    }
    ends
}

/// Scans a transcript for prune points, returning byte offsets in the file where each
/// prune sequence ends within a decoded `"o"` event's data.
pub fn scan_prune_points(path: &Path) -> Result<Vec<u64>, VtError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut offsets = Vec::new();
    let mut line_start: u64 = 0;
    let mut raw_line = String::new();
    let mut first = true;

    loop {
        raw_line.clear();
        let n = reader.read_line(&mut raw_line)?;
        if n == 0 {
            break;
        }
        if first {
            first = false;
            line_start += n as u64;
            continue;
        }
        if let Some(data_offset_in_line) = find_output_data_offset(&raw_line) {
            if let Ok(serde_json::Value::Array(arr)) = serde_json::from_str::<serde_json::Value>(&raw_line) {
                if let Some(serde_json::Value::String(data)) = arr.get(2) {
                    for end in find_prune_ends(data) {
                        let escaped_len = serde_json::to_string(&data[..end])
                            .map(|s| s.len().saturating_sub(2))
                            .unwrap_or(0);
                        offsets.push(line_start + data_offset_in_line as u64 + escaped_len as u64);
                    }
                }
            }
        }
        line_start += n as u64;
    }

    Ok(offsets)
}

/// Finds the byte offset, within a single transcript line, of the first character of an
/// `"o"` event's data string (i.e. just past its opening quote). Returns `None` for
/// non-output events.
fn find_output_data_offset(line: &str) -> Option<usize> {
    let pat = ",\"o\",";
    let idx = line.find(pat)?;
    Some(idx + pat.len() + 1)
}

/// Reads the transcript from `offset` (a byte returned by [`scan_prune_points`], or 0 for
/// the whole file) and returns the concatenated decoded bytes of every `"o"` event whose
/// line starts at or after the line containing `offset`. `offset` may land mid-line (it
/// points just past an escape sequence within a JSON string), so this always re-parses
/// from that line's start rather than seeking to the raw byte.
pub fn read_output_from(path: &Path, offset: u64) -> Result<Vec<u8>, VtError> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let line_start = contents[..(offset as usize).min(contents.len())]
        .rfind('\n')
        .map(|i| i + 1)
        .unwrap_or(0);

    let mut out = Vec::new();
    for line in contents[line_start..].lines() {
        if let Ok(serde_json::Value::Array(arr)) = serde_json::from_str::<serde_json::Value>(line) {
            if let (Some(serde_json::Value::String(kind)), Some(serde_json::Value::String(data))) =
                (arr.get(1), arr.get(2))
            {
                if kind == "o" {
                    out.extend_from_slice(data.as_bytes());
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_recording_has_no_prune_points() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.cast");
        let w = RecordingWriter::open(
            &path,
            &RecordingHeader { version: 2, width: 80, height: 24, timestamp: 0, env: None },
        )
        .unwrap();
        w.append_output(b"plain output\n").unwrap();
        w.close().unwrap();
        assert!(scan_prune_points(&path).unwrap().is_empty());
    }

    #[test]
    fn single_clear_mid_line_yields_one_prune_point() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.cast");
        let w = RecordingWriter::open(
            &path,
            &RecordingHeader { version: 2, width: 80, height: 24, timestamp: 0, env: None },
        )
        .unwrap();
        w.append_output(b"A\nB\n\x1b[3JC\n").unwrap();
        w.close().unwrap();
        let points = scan_prune_points(&path).unwrap();
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn timestamps_are_monotonic_under_clock_regression() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.cast");
        let w = RecordingWriter::open(
            &path,
            &RecordingHeader { version: 2, width: 80, height: 24, timestamp: 0, env: None },
        )
        .unwrap();
        let first = w.next_t();
        let second = w.next_t();
        assert!(second >= first);
    }

    #[test]
    fn find_prune_ends_prefers_longest_match() {
        let ends = find_prune_ends("\x1b[H\x1b[2Jtail");
        assert_eq!(ends, vec!["\x1b[H\x1b[2J".len()]);
    }
}
