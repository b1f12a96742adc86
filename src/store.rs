//! Detection store: the shared data model mutated by every cleanup stage.
//!
//! Detections are kept as index-aligned parallel arrays populated once by the
//! upstream tracker. The engine only relabels (`track_id`) and marks
//! (`valid`); it never deletes or reorders detections and never touches
//! `frequency`, `power` or `time_index`.

use std::collections::BTreeMap;
use std::fmt;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::utils::decibel;
use crate::{Error, Result};

/// Opaque track identifier.
///
/// The upstream producer encodes "no track" as a NaN float; inside the engine
/// that sentinel becomes `Option<TrackId>` so every assignment check is a tag
/// check instead of a NaN comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u32);

impl TrackId {
    /// Raw id value.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Convert an upstream float id column (NaN = unassigned) into the engine's
/// optional id representation.
pub fn track_ids_from_f64(ids: &[f64]) -> Vec<Option<TrackId>> {
    ids.iter()
        .map(|&id| {
            if id.is_nan() {
                None
            } else {
                Some(TrackId(id as u32))
            }
        })
        .collect()
}

/// Lifetime metrics of a track, as used by the power-density filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackStats {
    /// Number of detections carrying the id.
    pub detections: usize,
    /// Fraction of time bins within the track's span that hold a detection.
    pub density: f64,
    /// Mean over the track of the per-detection peak-channel power, in dB.
    pub mean_power_db: f64,
}

/// Parallel arrays of detections plus the per-bin time axis.
#[derive(Debug, Clone)]
pub struct DetectionStore {
    frequency: Vec<f64>,
    time_index: Vec<usize>,
    /// Power per measurement channel, one row per detection.
    power: DMatrix<f64>,
    track_id: Vec<Option<TrackId>>,
    valid: Vec<bool>,
    /// Maps time-bin index to elapsed seconds; strictly increasing.
    times: Vec<f64>,
}

impl DetectionStore {
    /// Build a store from the upstream tracker's output arrays.
    ///
    /// # Arguments
    /// * `frequency` - estimated frequency per detection, Hz
    /// * `time_index` - time-bin index per detection
    /// * `power` - power per channel, one row per detection
    /// * `track_id` - provisional track label per detection
    /// * `times` - time-bin index to elapsed-seconds mapping
    ///
    /// Fails fast on mismatched array lengths, a time axis with fewer than
    /// two bins or one that is not strictly increasing, and out-of-range
    /// time-bin indices. If all power values are positive the block is
    /// assumed to be linear and is converted to decibel scale once.
    pub fn new(
        frequency: Vec<f64>,
        time_index: Vec<usize>,
        power: DMatrix<f64>,
        track_id: Vec<Option<TrackId>>,
        times: Vec<f64>,
    ) -> Result<Self> {
        let n = frequency.len();
        if time_index.len() != n || power.nrows() != n || track_id.len() != n {
            return Err(Error::MismatchedInput(format!(
                "frequency: {}, time_index: {}, power rows: {}, track_id: {}",
                n,
                time_index.len(),
                power.nrows(),
                track_id.len()
            )));
        }

        if times.len() < 2 {
            return Err(Error::DegenerateTimeAxis);
        }
        for i in 1..times.len() {
            if times[i] <= times[i - 1] {
                return Err(Error::NonMonotonicTimes(i));
            }
        }

        for &idx in &time_index {
            if idx >= times.len() {
                return Err(Error::TimeIndexOutOfRange {
                    index: idx,
                    bins: times.len(),
                });
            }
        }

        // A single global scale check: all-positive power is linear and gets
        // converted once; anything else is already decibel.
        let min_power = power
            .iter()
            .filter(|v| !v.is_nan())
            .fold(f64::INFINITY, |acc, &v| acc.min(v));
        let power = if power.len() > 0 && min_power > 0.0 {
            power.map(decibel)
        } else {
            power
        };

        Ok(Self {
            frequency,
            time_index,
            power,
            track_id,
            valid: vec![false; n],
            times,
        })
    }

    /// Number of detections.
    pub fn len(&self) -> usize {
        self.frequency.len()
    }

    /// True if the store holds no detections.
    pub fn is_empty(&self) -> bool {
        self.frequency.is_empty()
    }

    /// Frequency of detection `i`, Hz.
    pub fn frequency(&self, i: usize) -> f64 {
        self.frequency[i]
    }

    /// Time-bin index of detection `i`.
    pub fn time_index(&self, i: usize) -> usize {
        self.time_index[i]
    }

    /// Elapsed time of detection `i`, seconds.
    pub fn time_of(&self, i: usize) -> f64 {
        self.times[self.time_index[i]]
    }

    /// Current track label of detection `i`.
    pub fn track_id(&self, i: usize) -> Option<TrackId> {
        self.track_id[i]
    }

    /// Relabel detection `i`. Clearing the id also clears validity since an
    /// unassigned detection is never valid.
    pub fn set_track_id(&mut self, i: usize, id: Option<TrackId>) {
        self.track_id[i] = id;
        if id.is_none() {
            self.valid[i] = false;
        }
    }

    /// Validity flag of detection `i`.
    pub fn is_valid(&self, i: usize) -> bool {
        self.valid[i]
    }

    /// Set the validity flag of detection `i`.
    pub fn set_valid(&mut self, i: usize, valid: bool) {
        self.valid[i] = valid;
    }

    /// Set the validity flag on every detection of a track.
    pub fn set_track_valid(&mut self, id: TrackId, valid: bool) {
        for i in 0..self.track_id.len() {
            if self.track_id[i] == Some(id) {
                self.valid[i] = valid;
            }
        }
    }

    /// The time axis (bin index to elapsed seconds).
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Elapsed time of the last bin in the recording.
    pub fn last_time(&self) -> f64 {
        *self.times.last().expect("time axis validated non-empty")
    }

    /// Duration of one time bin, seconds.
    pub fn bin_seconds(&self) -> f64 {
        self.times[1] - self.times[0]
    }

    /// Peak-channel power of detection `i`, dB.
    pub fn peak_power(&self, i: usize) -> f64 {
        self.power
            .row(i)
            .iter()
            .fold(f64::NEG_INFINITY, |acc, &v| acc.max(v))
    }

    /// Detection indices carrying `id`, in storage order.
    pub fn track_indices(&self, id: TrackId) -> Vec<usize> {
        (0..self.track_id.len())
            .filter(|&i| self.track_id[i] == Some(id))
            .collect()
    }

    /// Map every assigned id to its detection indices, ids ascending.
    pub fn track_map(&self) -> BTreeMap<TrackId, Vec<usize>> {
        let mut map: BTreeMap<TrackId, Vec<usize>> = BTreeMap::new();
        for (i, id) in self.track_id.iter().enumerate() {
            if let Some(id) = id {
                map.entry(*id).or_default().push(i);
            }
        }
        map
    }

    /// All distinct assigned ids, ascending.
    pub fn assigned_track_ids(&self) -> Vec<TrackId> {
        self.track_map().into_keys().collect()
    }

    /// Distinct ids that still carry at least one valid detection, ascending.
    pub fn valid_track_ids(&self) -> Vec<TrackId> {
        let mut map: BTreeMap<TrackId, ()> = BTreeMap::new();
        for i in 0..self.track_id.len() {
            if self.valid[i] {
                if let Some(id) = self.track_id[i] {
                    map.entry(id).or_insert(());
                }
            }
        }
        map.into_keys().collect()
    }

    /// Largest id currently assigned to any detection.
    pub fn max_track_id(&self) -> Option<TrackId> {
        self.track_id.iter().flatten().max().copied()
    }

    /// Lifetime metrics of a track; `None` if the id is unassigned.
    pub fn track_stats(&self, id: TrackId) -> Option<TrackStats> {
        let idxs = self.track_indices(id);
        if idxs.is_empty() {
            return None;
        }
        let first = idxs.iter().map(|&i| self.time_index[i]).min().unwrap();
        let last = idxs.iter().map(|&i| self.time_index[i]).max().unwrap();
        let density = idxs.len() as f64 / (last - first + 1) as f64;
        let mean_power_db =
            idxs.iter().map(|&i| self.peak_power(i)).sum::<f64>() / idxs.len() as f64;
        Some(TrackStats {
            detections: idxs.len(),
            density,
            mean_power_db,
        })
    }
}
