//! Configuration surface of the cleanup engine.
//!
//! All knobs are plain scalars injected by the host application's config
//! loader; defaults reproduce the reference recording setup.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Parameters consumed by the cleanup pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Sliding-window length in seconds (default: 600.0)
    pub window_seconds: f64,

    /// Fractional overlap between consecutive windows (default: 0.2)
    pub window_overlap: f64,

    /// Frequency tolerance in Hz; KDE bandwidth is twice this value and
    /// similarity merges must stay within it (default: 2.5)
    pub freq_tolerance: f64,

    /// Lower edge of the KDE frequency axis in Hz (default: 400.0)
    pub freq_min: f64,

    /// Upper edge of the KDE frequency axis in Hz (default: 1200.0)
    pub freq_max: f64,

    /// Resolution of the KDE frequency axis in Hz (default: 0.1)
    pub freq_resolution: f64,

    /// Fraction of an idealized fully-supported cluster a frequency needs
    /// before it counts as valid support (default: 0.05)
    pub kde_floor_fraction: f64,

    /// Minimum fraction of occupied time bins for a track to survive the
    /// power-density filter (default: 0.1)
    pub density_threshold: f64,

    /// Minimum mean peak-channel power in dB for a track to survive the
    /// power-density filter (default: -100.0)
    pub power_threshold_db: f64,

    /// Fraction of shared time bins above which two tracks are treated as
    /// genuinely distinct co-occurring sources (default: 0.01)
    pub duplicate_fraction: f64,

    /// Time tolerance pad in seconds for the overlap resolver (default: 300.0)
    pub overlap_time_tolerance: f64,

    /// Frequency tolerance pad in Hz for the overlap resolver (default: 2.5)
    pub overlap_freq_tolerance: f64,

    /// A contention-region track at most this many times denser than its
    /// partner is absorbed under the strict rule (default: 3.0)
    pub absorb_ratio_strict: f64,

    /// Density ratio for the looser absorption rule (default: 2.0)
    pub absorb_ratio_loose: f64,

    /// Minimum fraction of above-threshold detections required before a
    /// power-rejected track is re-split into segments (default: 0.1)
    pub recovery_fraction: f64,

    /// Number of tracks kept by the final selection (default: 2)
    pub n_fish: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            window_seconds: 600.0,
            window_overlap: 0.2,
            freq_tolerance: 2.5,
            freq_min: 400.0,
            freq_max: 1200.0,
            freq_resolution: 0.1,
            kde_floor_fraction: 0.05,
            density_threshold: 0.1,
            power_threshold_db: -100.0,
            duplicate_fraction: 0.01,
            overlap_time_tolerance: 300.0,
            overlap_freq_tolerance: 2.5,
            absorb_ratio_strict: 3.0,
            absorb_ratio_loose: 2.0,
            recovery_fraction: 0.1,
            n_fish: 2,
        }
    }
}

impl CleanupConfig {
    /// Check the configuration for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.window_seconds <= 0.0 {
            return Err(Error::InvalidConfig(
                "window_seconds must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.window_overlap) {
            return Err(Error::InvalidConfig(
                "window_overlap must be in [0, 1)".to_string(),
            ));
        }
        if self.freq_tolerance <= 0.0 {
            return Err(Error::InvalidConfig(
                "freq_tolerance must be positive".to_string(),
            ));
        }
        if self.freq_min >= self.freq_max {
            return Err(Error::InvalidConfig(
                "freq_min must be below freq_max".to_string(),
            ));
        }
        if self.freq_resolution <= 0.0 {
            return Err(Error::InvalidConfig(
                "freq_resolution must be positive".to_string(),
            ));
        }
        if self.n_fish == 0 {
            return Err(Error::InvalidConfig(
                "n_fish must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Step between consecutive window starts, seconds.
    pub fn window_step(&self) -> f64 {
        self.window_seconds * (1.0 - self.window_overlap)
    }
}
