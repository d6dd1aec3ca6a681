//! Tail-tolerant WAL replay.
//!
//! Replay scans a shard directory for segments, sorted by number, and walks
//! each one frame by frame. Crash recovery must tolerate every way a tail
//! can be damaged:
//!
//! - a truncated length field at end-of-file — stop cleanly
//! - a length extending past end-of-file (torn write) — stop cleanly
//! - a zero length or a length above [`MAX_RECORD_LEN`] — stop cleanly,
//!   the rest of the file is considered corrupt
//! - an inner decode failure — skip just that record and continue, because
//!   the frame length is still trustworthy
//!
//! A stop condemns the remainder of one segment only; later segments are
//! still scanned. A missing shard directory replays as empty.

use crate::encoding::decode_series;
use crate::segment::{list_segment_numbers, segment_path};
use std::io::Read;
use std::path::Path;
use tephra_core::TimeSeries;
use tracing::warn;

/// Sanity ceiling on a single record length (1 GiB). A frame above this is
/// treated as corruption rather than an allocation request.
pub const MAX_RECORD_LEN: u32 = 1024 * 1024 * 1024;

/// Why a segment scan stopped before end-of-data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStop {
    /// Reached the end of the segment cleanly.
    EndOfData,
    /// Fewer than 4 bytes remained for the next length field.
    TruncatedLength,
    /// The length field pointed past end-of-file.
    TruncatedRecord,
    /// The length field was zero or above [`MAX_RECORD_LEN`].
    ImplausibleLength,
}

/// Aggregate result of replaying a shard directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Records successfully decoded and delivered to the callback.
    pub decoded: u64,
    /// Records skipped due to inner decode failure (frame length was valid).
    pub skipped: u64,
    /// Segments whose scan stopped before end-of-data.
    pub damaged_segments: u64,
}

/// Replay every segment in `dir`, invoking `callback` for each decoded
/// series in on-disk order.
pub fn replay_dir(
    dir: &Path,
    callback: &mut dyn FnMut(TimeSeries),
) -> std::io::Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();

    for segment_number in list_segment_numbers(dir)? {
        let path = segment_path(dir, segment_number);
        let mut buffer = Vec::new();
        std::fs::File::open(&path)?.read_to_end(&mut buffer)?;

        let (decoded, skipped, stop) = scan_segment(&buffer, callback);
        summary.decoded += decoded;
        summary.skipped += skipped;

        if stop != ReplayStop::EndOfData {
            summary.damaged_segments += 1;
            warn!(
                target: "tephra::wal",
                segment = segment_number,
                ?stop,
                decoded,
                "WAL segment scan stopped early; remainder of segment dropped"
            );
        }
        if skipped > 0 {
            warn!(
                target: "tephra::wal",
                segment = segment_number,
                skipped,
                "Skipped undecodable WAL records with valid framing"
            );
        }
    }

    Ok(summary)
}

/// Walk one segment buffer, decoding frames until the tail gives out.
///
/// Returns `(decoded, skipped, stop_reason)`.
fn scan_segment(buffer: &[u8], callback: &mut dyn FnMut(TimeSeries)) -> (u64, u64, ReplayStop) {
    let mut offset = 0usize;
    let mut decoded = 0u64;
    let mut skipped = 0u64;

    loop {
        if offset == buffer.len() {
            return (decoded, skipped, ReplayStop::EndOfData);
        }
        if offset + 4 > buffer.len() {
            return (decoded, skipped, ReplayStop::TruncatedLength);
        }

        let len_bytes: [u8; 4] = buffer[offset..offset + 4]
            .try_into()
            .expect("4-byte slice");
        let len = u32::from_le_bytes(len_bytes);

        if len == 0 || len > MAX_RECORD_LEN {
            return (decoded, skipped, ReplayStop::ImplausibleLength);
        }

        let payload_start = offset + 4;
        let payload_end = payload_start + len as usize;
        if payload_end > buffer.len() {
            return (decoded, skipped, ReplayStop::TruncatedRecord);
        }

        match decode_series(&buffer[payload_start..payload_end]) {
            Ok(series) => {
                callback(series);
                decoded += 1;
            }
            Err(_) => {
                // The frame length is known, so corruption inside one
                // payload does not condemn the records after it.
                skipped += 1;
            }
        }

        offset = payload_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_series;
    use crate::segment::SegmentWriter;
    use tempfile::tempdir;
    use tephra_core::Labels;

    fn series(host: &str, n_samples: usize) -> TimeSeries {
        let labels =
            Labels::from_pairs([("metric", "cpu"), ("host", host)].iter().copied()).unwrap();
        let mut ts = TimeSeries::new(labels);
        for i in 0..n_samples {
            ts.push(1000 + i as i64, i as f64).unwrap();
        }
        ts
    }

    fn collect_replay(dir: &Path) -> (Vec<TimeSeries>, ReplaySummary) {
        let mut out = Vec::new();
        let summary = replay_dir(dir, &mut |s| out.push(s)).unwrap();
        (out, summary)
    }

    #[test]
    fn test_replay_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let (out, summary) = collect_replay(&dir.path().join("nope"));
        assert!(out.is_empty());
        assert_eq!(summary, ReplaySummary::default());
    }

    #[test]
    fn test_replay_preserves_order_across_segments() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path()).unwrap();

        for i in 0..10 {
            writer
                .append(&encode_series(&series(&format!("h{}", i), 1)), false)
                .unwrap();
            if i == 4 {
                writer.rotate().unwrap();
            }
        }
        writer.close().unwrap();

        let (out, summary) = collect_replay(dir.path());
        assert_eq!(summary.decoded, 10);
        assert_eq!(summary.damaged_segments, 0);
        for (i, s) in out.iter().enumerate() {
            assert_eq!(s.labels().get("host"), Some(format!("h{}", i).as_str()));
        }
    }

    #[test]
    fn test_truncated_length_field() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path()).unwrap();
        writer.append(&encode_series(&series("a", 1)), true).unwrap();
        drop(writer);

        // Append 2 stray bytes: not enough for a length field.
        let path = segment_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0x01, 0x02]);
        std::fs::write(&path, &bytes).unwrap();

        let (out, summary) = collect_replay(dir.path());
        assert_eq!(out.len(), 1);
        assert_eq!(summary.damaged_segments, 1);
    }

    #[test]
    fn test_length_past_end_of_file() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path()).unwrap();
        writer.append(&encode_series(&series("a", 1)), true).unwrap();
        drop(writer);

        // A frame claiming 100 bytes with only 3 present: torn write.
        let path = segment_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        std::fs::write(&path, &bytes).unwrap();

        let (out, summary) = collect_replay(dir.path());
        assert_eq!(out.len(), 1);
        assert_eq!(summary.decoded, 1);
        assert_eq!(summary.damaged_segments, 1);
    }

    #[test]
    fn test_zero_length_stops_segment() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path()).unwrap();
        writer.append(&encode_series(&series("a", 1)), true).unwrap();
        drop(writer);

        let path = segment_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        // A valid-looking record after the zero frame must NOT be reached:
        // the file is condemned past that point.
        bytes.extend_from_slice(&encode_series(&series("b", 1)));
        std::fs::write(&path, &bytes).unwrap();

        let (out, _) = collect_replay(dir.path());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_implausible_length_stops_segment() {
        let dir = tempdir().unwrap();
        let path = segment_path(dir.path(), 0);
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(&path, (MAX_RECORD_LEN + 1).to_le_bytes()).unwrap();

        let (out, summary) = collect_replay(dir.path());
        assert!(out.is_empty());
        assert_eq!(summary.damaged_segments, 1);
    }

    #[test]
    fn test_undecodable_record_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path()).unwrap();

        writer.append(&encode_series(&series("a", 1)), false).unwrap();
        // Well-framed garbage: the frame is valid, the payload is not.
        writer.append(&[0xFF; 16], false).unwrap();
        writer.append(&encode_series(&series("c", 1)), true).unwrap();
        drop(writer);

        let (out, summary) = collect_replay(dir.path());
        assert_eq!(out.len(), 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.damaged_segments, 0);
        assert_eq!(out[0].labels().get("host"), Some("a"));
        assert_eq!(out[1].labels().get("host"), Some("c"));
    }

    #[test]
    fn test_truncation_mid_record_drops_only_tail() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path()).unwrap();
        for i in 0..100 {
            writer
                .append(&encode_series(&series(&format!("h{}", i), 2)), false)
                .unwrap();
        }
        writer.close().unwrap();

        // Chop the last 3 bytes: the final record becomes a torn write.
        let path = segment_path(dir.path(), 0);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let (out, summary) = collect_replay(dir.path());
        assert_eq!(out.len(), 99);
        assert_eq!(summary.decoded, 99);
        assert_eq!(summary.damaged_segments, 1);
    }
}
