//! Append-only WAL segment files.
//!
//! Segments are named `wal_NNNNNN.log` (zero-padded to six digits, starting
//! at 0) inside a shard directory. The writer frames every record with a
//! 4-byte little-endian length; the length prefix is the sole framing
//! mechanism. Rotation happens after a successful append, so a record is
//! always wholly inside exactly one segment.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_SUFFIX: &str = ".log";

/// Generate a segment file path.
///
/// Format: `wal_NNNNNN.log` where NNNNNN is the zero-padded segment number.
pub fn segment_path(dir: &Path, segment_number: u64) -> PathBuf {
    dir.join(format!("{}{:06}{}", SEGMENT_PREFIX, segment_number, SEGMENT_SUFFIX))
}

/// Parse a segment number out of a file name, if it is a segment file.
pub fn parse_segment_name(name: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    if digits.len() < 6 {
        return None;
    }
    digits.parse::<u64>().ok()
}

/// List all segment numbers in a directory, sorted ascending.
///
/// A missing directory is reported as an empty list, not an error; a shard
/// that has never written anything replays as empty.
pub fn list_segment_numbers(dir: &Path) -> std::io::Result<Vec<u64>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(num) = parse_segment_name(&name) {
            segments.push(num);
        }
    }

    segments.sort_unstable();
    Ok(segments)
}

/// Append-only writer over one segment stream.
///
/// Owns the active segment file and provides ordered, length-framed writes
/// with caller-controlled flushing. Exactly one worker thread accesses a
/// given writer; the type itself holds no locks.
pub struct SegmentWriter {
    /// Shard directory containing the segments.
    dir: PathBuf,

    /// Active segment file, opened in append mode.
    file: File,

    /// Active segment number.
    segment_number: u64,

    /// Bytes written to the active segment (including pre-existing content
    /// when resuming).
    write_position: u64,
}

impl SegmentWriter {
    /// Open a segment stream in `dir`, creating the directory if absent.
    ///
    /// Resumes at the highest existing segment number, positioned at
    /// end-of-file; a fresh directory starts at segment 0.
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;

        let segment_number = list_segment_numbers(dir)?.last().copied().unwrap_or(0);
        let path = segment_path(dir, segment_number);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let write_position = file.metadata()?.len();

        Ok(SegmentWriter {
            dir: dir.to_path_buf(),
            file,
            segment_number,
            write_position,
        })
    }

    /// Append one length-framed record.
    ///
    /// Writes a 4-byte little-endian length followed by the payload, then
    /// optionally forces the bytes to disk. Returns the number of bytes
    /// appended (frame included).
    ///
    /// A failed write may leave the file with a truncated tail; replay is
    /// built to stop cleanly at the last well-framed record.
    pub fn append(&mut self, payload: &[u8], flush_now: bool) -> std::io::Result<usize> {
        let len = payload.len() as u32;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(payload)?;

        if flush_now {
            self.file.sync_all()?;
        }

        let written = 4 + payload.len();
        self.write_position += written as u64;
        Ok(written)
    }

    /// Force everything written so far to disk.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }

    /// Close the active segment and open the next number.
    ///
    /// The outgoing segment is synced first so its contents are stable
    /// before it becomes immutable.
    pub fn rotate(&mut self) -> std::io::Result<()> {
        self.file.sync_all()?;

        self.segment_number += 1;
        let path = segment_path(&self.dir, self.segment_number);
        self.file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.write_position = 0;

        tracing::debug!(
            target: "tephra::wal",
            segment = self.segment_number,
            "Rotated to new WAL segment"
        );
        Ok(())
    }

    /// Flush and close the writer.
    pub fn close(mut self) -> std::io::Result<()> {
        self.sync()
    }

    /// Active segment number.
    pub fn segment_number(&self) -> u64 {
        self.segment_number
    }

    /// Size of the active segment in bytes.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// Shard directory this writer appends into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_segment_path_format() {
        let dir = Path::new("/tmp/shard");
        assert_eq!(
            segment_path(dir, 0),
            PathBuf::from("/tmp/shard/wal_000000.log")
        );
        assert_eq!(
            segment_path(dir, 999_999),
            PathBuf::from("/tmp/shard/wal_999999.log")
        );
    }

    #[test]
    fn test_parse_segment_name() {
        assert_eq!(parse_segment_name("wal_000042.log"), Some(42));
        assert_eq!(parse_segment_name("wal_000000.log"), Some(0));
        assert_eq!(parse_segment_name("wal_42.log"), None);
        assert_eq!(parse_segment_name("snapshot_000001.log"), None);
        assert_eq!(parse_segment_name("wal_000001.tmp"), None);
    }

    #[test]
    fn test_open_creates_directory_and_first_segment() {
        let dir = tempdir().unwrap();
        let shard_dir = dir.path().join("shard_000");

        let writer = SegmentWriter::open(&shard_dir).unwrap();
        assert_eq!(writer.segment_number(), 0);
        assert_eq!(writer.size(), 0);
        assert!(segment_path(&shard_dir, 0).exists());
    }

    #[test]
    fn test_append_frames_record() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path()).unwrap();

        let written = writer.append(b"hello", true).unwrap();
        assert_eq!(written, 9); // 4-byte length + 5-byte payload
        assert_eq!(writer.size(), 9);

        let bytes = std::fs::read(segment_path(dir.path(), 0)).unwrap();
        assert_eq!(&bytes[0..4], &5u32.to_le_bytes());
        assert_eq!(&bytes[4..], b"hello");
    }

    #[test]
    fn test_rotate_opens_next_segment() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path()).unwrap();

        writer.append(b"one", false).unwrap();
        writer.rotate().unwrap();
        assert_eq!(writer.segment_number(), 1);
        assert_eq!(writer.size(), 0);

        writer.append(b"two", true).unwrap();
        assert!(segment_path(dir.path(), 0).exists());
        assert!(segment_path(dir.path(), 1).exists());
        assert_eq!(list_segment_numbers(dir.path()).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_reopen_resumes_highest_segment() {
        let dir = tempdir().unwrap();

        {
            let mut writer = SegmentWriter::open(dir.path()).unwrap();
            writer.append(b"first", false).unwrap();
            writer.rotate().unwrap();
            writer.append(b"second", true).unwrap();
        }

        let writer = SegmentWriter::open(dir.path()).unwrap();
        assert_eq!(writer.segment_number(), 1);
        assert_eq!(writer.size(), 10); // 4 + len("second")
    }

    #[test]
    fn test_list_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("never_created");
        assert!(list_segment_numbers(&missing).unwrap().is_empty());
    }
}
