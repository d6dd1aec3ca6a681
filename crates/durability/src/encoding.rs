//! On-disk encoding for WAL records.
//!
//! Each record payload encodes one time series fragment:
//!
//! ```text
//! ┌───────────────┬──────────────────────────────────────────────┐
//! │ label_count u32│ per label: key_len u32, key, val_len u32, val│
//! ├───────────────┼──────────────────────────────────────────────┤
//! │ sample_count u32│ per sample: timestamp i64, value f64        │
//! └───────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian; values are IEEE-754 bit patterns, so
//! NaN payloads round-trip exactly. The 4-byte record length prefix is
//! written by the segment writer, not here — this module only deals with
//! the payload. There is no per-record checksum; replay relies on length
//! framing plus decode validation.

use tephra_core::{Labels, Sample, TimeSeries};

/// Upper bound on labels in a single record. Decode treats anything larger
/// as corruption.
const MAX_LABELS: u32 = 1_000;

/// Upper bound on samples in a single record.
const MAX_SAMPLES: u32 = 10_000_000;

/// Serialize a series into its WAL payload.
pub fn encode_series(series: &TimeSeries) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(series));

    buf.extend_from_slice(&(series.labels().len() as u32).to_le_bytes());
    for (key, value) in series.labels().iter() {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value.as_bytes());
    }

    buf.extend_from_slice(&(series.samples().len() as u32).to_le_bytes());
    for sample in series.samples() {
        buf.extend_from_slice(&sample.timestamp.to_le_bytes());
        buf.extend_from_slice(&sample.value.to_le_bytes());
    }

    buf
}

/// Exact payload size of a series without encoding it.
///
/// Lets the sharded WAL account bytes on the hot path without a second
/// serialization pass.
pub fn encoded_len(series: &TimeSeries) -> usize {
    let label_bytes: usize = series
        .labels()
        .iter()
        .map(|(k, v)| 8 + k.len() + v.len())
        .sum();
    4 + label_bytes + 4 + series.samples().len() * 16
}

/// Deserialize a WAL payload back into a series.
pub fn decode_series(bytes: &[u8]) -> Result<TimeSeries, DecodeError> {
    let mut cursor = Cursor::new(bytes);

    let label_count = cursor.read_u32()?;
    if label_count > MAX_LABELS {
        return Err(DecodeError::ImplausibleLabelCount(label_count));
    }

    let mut labels = Labels::new();
    for _ in 0..label_count {
        let key = cursor.read_string()?;
        let value = cursor.read_string()?;
        labels
            .add(key, value)
            .map_err(|_| DecodeError::EmptyLabelName)?;
    }

    let sample_count = cursor.read_u32()?;
    if sample_count > MAX_SAMPLES {
        return Err(DecodeError::ImplausibleSampleCount(sample_count));
    }

    let mut samples = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        let timestamp = cursor.read_i64()?;
        let value = cursor.read_f64()?;
        samples.push(Sample::new(timestamp, value));
    }

    Ok(TimeSeries::from_parts(labels, samples))
}

/// Payload decode errors.
///
/// A decode error condemns only the record it occurred in: the frame length
/// is known, so replay skips past it and continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Payload ended before the declared contents.
    #[error("Unexpected end of record payload")]
    UnexpectedEof,

    /// Label count exceeds the sanity ceiling.
    #[error("Implausible label count: {0}")]
    ImplausibleLabelCount(u32),

    /// Sample count exceeds the sanity ceiling.
    #[error("Implausible sample count: {0}")]
    ImplausibleSampleCount(u32),

    /// A label key or value was not valid UTF-8.
    #[error("Label bytes are not valid UTF-8")]
    InvalidUtf8,

    /// A label with an empty name was encoded.
    #[error("Record contains an empty label name")]
    EmptyLabelName,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(n)
            .ok_or(DecodeError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    fn read_f64(&mut self) -> Result<f64, DecodeError> {
        let bytes = self.take(8)?;
        Ok(f64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
}
