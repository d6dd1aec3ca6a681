//! Core types for Tephra
//!
//! This crate defines the shared data model used by every other layer:
//!
//! - Label sets, samples, and time series
//! - Deterministic series identity (stable across processes)
//! - The unified error type and `Result` alias
//!
//! Nothing in this crate touches disk or spawns threads.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Labels, Sample, SeriesId, TimeSeries, Timestamp, Value};
