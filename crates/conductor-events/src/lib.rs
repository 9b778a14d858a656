//! Append-only JSONL event streams for conductor runs.
//!
//! Every routing decision, degradation, and kernel event lands in a
//! one-line-per-entry stream. Writers only ever append; readers either load
//! the whole stream or tail it lazily from a byte offset, which is how the
//! server-sent event feed follows a live run without buffering transcripts
//! in memory.
//!
//! # Example
//!
//! ```
//! use conductor_events::EventStream;
//! use tempfile::tempdir;
//!
//! let dir = tempdir().unwrap();
//! let stream = EventStream::new(dir.path().join("events.jsonl"));
//! stream.append(&serde_json::json!({"event": "step_start"})).unwrap();
//!
//! let entries: Vec<serde_json::Value> = stream.read_all().unwrap();
//! assert_eq!(entries.len(), 1);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// An append-only JSONL stream on disk.
#[derive(Debug, Clone)]
pub struct EventStream {
    path: PathBuf,
}

impl EventStream {
    /// Create a handle for the stream at `path`. The file is created lazily
    /// on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single JSON line and flush it.
    pub fn append<T: Serialize>(&self, entry: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create stream dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open stream {}", self.path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        let line = serde_json::to_string(entry).context("failed to serialize stream entry")?;
        writeln!(writer, "{}", line).context("failed to write stream entry")?;
        writer.flush().context("failed to flush stream")?;
        Ok(())
    }

    /// Append a batch of entries in order.
    pub fn append_all<T: Serialize>(&self, entries: &[T]) -> Result<()> {
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    /// Read every entry in commit order. A missing file reads as empty.
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .with_context(|| format!("failed to open stream {}", self.path.display()))?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line
                .with_context(|| format!("failed to read line from {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: T = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse stream entry: {}", line))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Number of entries currently in the stream.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read_all::<serde_json::Value>()?.len())
    }

    /// Whether the stream has no entries yet.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read complete lines starting at byte `offset`.
    ///
    /// Returns the parsed entries and the offset one past the last complete
    /// line, suitable for the next call. A trailing partial line (a write in
    /// flight) is left for the next tail.
    pub fn tail_from<T: DeserializeOwned>(&self, offset: u64) -> Result<(Vec<T>, u64)> {
        if !self.path.exists() {
            return Ok((Vec::new(), offset));
        }

        let mut file = File::open(&self.path)
            .with_context(|| format!("failed to open stream {}", self.path.display()))?;
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed to seek stream {}", self.path.display()))?;

        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .with_context(|| format!("failed to read stream {}", self.path.display()))?;

        let mut entries = Vec::new();
        let mut consumed = 0u64;
        for line in buf.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break;
            }
            consumed += line.len() as u64;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let entry: T = serde_json::from_str(trimmed)
                .with_context(|| format!("failed to parse stream entry: {}", trimmed))?;
            entries.push(entry);
        }

        Ok((entries, offset + consumed))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        seq: u32,
        label: String,
    }

    fn entry(seq: u32) -> Entry {
        Entry {
            seq,
            label: format!("entry-{seq}"),
        }
    }

    #[test]
    fn append_then_read_preserves_order() {
        let td = tempdir().expect("tempdir");
        let stream = EventStream::new(td.path().join("routing").join("decisions.jsonl"));

        for seq in 0..5 {
            stream.append(&entry(seq)).expect("append");
        }

        let read: Vec<Entry> = stream.read_all().expect("read");
        assert_eq!(read.len(), 5);
        assert_eq!(read[0], entry(0));
        assert_eq!(read[4], entry(4));
    }

    #[test]
    fn missing_file_reads_empty() {
        let td = tempdir().expect("tempdir");
        let stream = EventStream::new(td.path().join("absent.jsonl"));
        let read: Vec<Entry> = stream.read_all().expect("read");
        assert!(read.is_empty());
        assert!(stream.is_empty().expect("is_empty"));
    }

    #[test]
    fn appends_never_rewrite_existing_bytes() {
        let td = tempdir().expect("tempdir");
        let stream = EventStream::new(td.path().join("events.jsonl"));

        stream.append(&entry(0)).expect("append");
        let first = fs::read(stream.path()).expect("read bytes");

        stream.append(&entry(1)).expect("append");
        let second = fs::read(stream.path()).expect("read bytes");

        assert_eq!(&second[..first.len()], &first[..]);
    }

    #[test]
    fn tail_from_resumes_at_offset() {
        let td = tempdir().expect("tempdir");
        let stream = EventStream::new(td.path().join("events.jsonl"));

        stream.append(&entry(0)).expect("append");
        let (batch, offset) = stream.tail_from::<Entry>(0).expect("tail");
        assert_eq!(batch, vec![entry(0)]);

        let (none, same) = stream.tail_from::<Entry>(offset).expect("tail");
        assert!(none.is_empty());
        assert_eq!(same, offset);

        stream.append(&entry(1)).expect("append");
        stream.append(&entry(2)).expect("append");
        let (rest, _) = stream.tail_from::<Entry>(offset).expect("tail");
        assert_eq!(rest, vec![entry(1), entry(2)]);
    }

    #[test]
    fn tail_leaves_partial_trailing_line_for_next_call() {
        let td = tempdir().expect("tempdir");
        let stream = EventStream::new(td.path().join("events.jsonl"));
        stream.append(&entry(0)).expect("append");

        // Simulate a write in flight: partial JSON without a newline.
        let mut file = OpenOptions::new()
            .append(true)
            .open(stream.path())
            .expect("open");
        file.write_all(b"{\"seq\":1,").expect("write");
        file.flush().expect("flush");

        let (batch, offset) = stream.tail_from::<Entry>(0).expect("tail");
        assert_eq!(batch, vec![entry(0)]);

        // Complete the line; the tail picks it up from the saved offset.
        file.write_all(b"\"label\":\"entry-1\"}\n").expect("write");
        file.flush().expect("flush");
        let (rest, _) = stream.tail_from::<Entry>(offset).expect("tail");
        assert_eq!(rest, vec![entry(1)]);
    }
}
