//! # eodtrack - EOD Frequency Track Cleanup
//!
//! Post-processing engine for electric-fish electric-organ-discharge (EOD)
//! frequency recordings. An upstream tracker turns a spectrogram into noisy
//! per-time-bin frequency detections with provisional track labels; this crate
//! resolves those labels into the N highest-confidence, longest-lived signal
//! sources.
//!
//! The engine runs four stages over a shared [`DetectionStore`]:
//!
//! 1. [`density`] - windowed kernel-density validation of track candidates
//! 2. [`similarity`] - short-range merging of fragmented tracks
//! 3. [`power`] - lifetime density/power filtering with segment recovery
//! 4. [`overlap`] - global resolution of temporally overlapping tracks
//!
//! driven by [`Pipeline`], which finishes with a top-N selection.
//!
//! ## Example
//!
//! ```rust,ignore
//! use eodtrack::{CleanupConfig, DetectionStore, Pipeline};
//!
//! let mut store = DetectionStore::new(frequency, time_index, power, track_id, times)?;
//! let pipeline = Pipeline::new(CleanupConfig::default())?;
//! let summary = pipeline.run(&mut store)?;
//! ```

pub mod config;
pub mod density;
pub mod overlap;
pub mod pipeline;
pub mod power;
pub mod similarity;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use config::CleanupConfig;
pub use density::{validate_window, ValidCandidate};
pub use overlap::{resolve_overlaps, MergeDecision};
pub use pipeline::{CleanupSummary, Pipeline, TrackSummary};
pub use power::power_density_filter;
pub use similarity::merge_by_similarity;
pub use store::{DetectionStore, TrackId, TrackStats};

// Error types
pub use crate::error::{Error, Result};

mod error {
    use thiserror::Error;

    /// Errors that can occur in the cleanup engine.
    ///
    /// Only malformed input is fatal. Every steady-state condition (empty
    /// windows, degenerate support, rejected merges, absent candidate pairs)
    /// is ordinary control flow inside the stages and never surfaces here.
    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        #[error("Mismatched input lengths: {0}")]
        MismatchedInput(String),

        #[error("Time axis must contain at least two bins")]
        DegenerateTimeAxis,

        #[error("Time axis is not strictly increasing at bin {0}")]
        NonMonotonicTimes(usize),

        #[error("Time-bin index {index} out of range for time axis of {bins} bins")]
        TimeIndexOutOfRange { index: usize, bins: usize },
    }

    /// Result type for cleanup operations.
    pub type Result<T> = std::result::Result<T, Error>;
}
