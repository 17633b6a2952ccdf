//! Segment files.
//!
//! A segment holds up to [`SEGMENT_CAPACITY`] consecutive entries as NDJSON.
//! Its file name encodes the aligned index of its first slot.

use crate::types::ClusterEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Entries per segment before rotating to a new file.
pub const SEGMENT_CAPACITY: u64 = 1000;

/// First index of the segment slot containing `index`.
pub fn segment_base(index: u64) -> u64 {
    (index / SEGMENT_CAPACITY) * SEGMENT_CAPACITY
}

/// File name of the segment starting at `base`.
pub fn segment_name(base: u64) -> String {
    format!("seg_{:012}.log", base)
}

/// Inverse of [`segment_name`].
pub fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix("seg_")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

/// All segment files in `dir`, ordered by base index.
pub fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let base = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_name);
        if let Some(base) = base {
            segments.push((base, path));
        }
    }
    segments.sort_by_key(|(base, _)| *base);
    Ok(segments)
}

/// Read every entry stored in a segment file.
pub fn read_segment(path: &Path) -> io::Result<Vec<ClusterEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let entry: ClusterEntry = serde_json::from_str(&line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Replace the segment at `base` with `entries`.
pub fn rewrite_segment(dir: &Path, base: u64, entries: &[ClusterEntry]) -> io::Result<()> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        buf.push(b'\n');
    }
    crate::persist::write_bytes_atomic(&dir.join(segment_name(base)), &buf)
}

/// The segment currently receiving appends.
pub struct ActiveSegment {
    /// Aligned first index of this segment.
    pub base: u64,
    writer: BufWriter<File>,
}

impl ActiveSegment {
    /// Open (or create) the segment at `base` for appending.
    pub fn open(dir: &Path, base: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(segment_name(base)))?;
        Ok(Self {
            base,
            writer: BufWriter::new(file),
        })
    }

    /// Whether `index` belongs in this segment.
    pub fn covers(&self, index: u64) -> bool {
        segment_base(index) == self.base
    }

    /// Buffer one entry.
    pub fn write(&mut self, entry: &ClusterEntry) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(b"\n")
    }

    /// Flush and fsync.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_names() {
        assert_eq!(segment_name(2000), "seg_000000002000.log");
        assert_eq!(parse_segment_name("seg_000000002000.log"), Some(2000));
        assert_eq!(parse_segment_name("seg_000000002000.log.tmp"), None);
        assert_eq!(parse_segment_name("vote.json"), None);
    }

    #[test]
    fn test_segment_base() {
        assert_eq!(segment_base(0), 0);
        assert_eq!(segment_base(999), 0);
        assert_eq!(segment_base(1000), 1000);
        assert_eq!(segment_base(1501), 1000);
    }
}
