//! Window density validator.
//!
//! For one sliding window, a kernel density estimate over a fixed frequency
//! axis separates frequencies with concentrated detection support from noise.
//! Tracks whose detections touch the supported frequencies are flagged as
//! valid candidates for the similarity merger; ids that were valid in the
//! previous window stay valid (hysteresis against flicker at cluster edges).

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use nalgebra::DVector;

use crate::config::CleanupConfig;
use crate::store::{DetectionStore, TrackId};
use crate::utils::{median, min_distance_to_sorted};

/// A track judged valid within one window.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidCandidate {
    pub id: TrackId,
    /// Median frequency of the track's detections inside the window, Hz.
    pub median_freq: f64,
    /// First occurrence time of the track over the whole recording, seconds.
    pub first_time: f64,
}

/// Validate the tracks inside the window starting at `window_start`.
///
/// # Arguments
/// * `kde_threshold` - density threshold computed by an earlier window, if any
/// * `previously_valid` - ids valid after the previous window (hysteresis)
///
/// # Returns
/// The (possibly newly derived) density threshold and the candidate table.
/// An empty window yields `None` candidates and passes the threshold through
/// unchanged; the caller keeps its previous valid-id set in that case.
///
/// Every track flagged valid is marked valid in the store over its entire
/// lifetime, not only inside the window.
pub fn validate_window(
    store: &mut DetectionStore,
    config: &CleanupConfig,
    window_start: f64,
    kde_threshold: Option<f64>,
    previously_valid: &BTreeSet<TrackId>,
) -> (Option<f64>, Option<Vec<ValidCandidate>>) {
    let window_end = window_start + config.window_seconds;
    let in_window: Vec<usize> = (0..store.len())
        .filter(|&i| {
            store.track_id(i).is_some() && {
                let t = store.time_of(i);
                t >= window_start && t < window_end
            }
        })
        .collect();

    if in_window.is_empty() {
        return (kde_threshold, None);
    }

    // Unit-area Gaussian kernels with bandwidth 2 x freq tolerance, summed
    // over a fixed frequency axis.
    let n_bins =
        ((config.freq_max - config.freq_min) / config.freq_resolution).ceil() as usize;
    let axis_freq = |j: usize| config.freq_min + j as f64 * config.freq_resolution;
    let sigma = 2.0 * config.freq_tolerance;

    let mut kde = DVector::<f64>::zeros(n_bins);
    let mut peak_kernel = 0.0_f64;
    let mut kernel = DVector::<f64>::zeros(n_bins);
    for &i in &in_window {
        let f = store.frequency(i);
        let mut sum = 0.0;
        for j in 0..n_bins {
            let z = (axis_freq(j) - f) / sigma;
            let v = (-z * z / 2.0).exp();
            kernel[j] = v;
            sum += v;
        }
        if sum <= 0.0 {
            continue;
        }
        for j in 0..n_bins {
            let v = kernel[j] / sum;
            peak_kernel = peak_kernel.max(v);
            kde[j] += v;
        }
    }

    // Threshold floor: a cluster must be supported by a fraction of an
    // idealized track that occupies every bin of a window.
    let threshold = kde_threshold.unwrap_or_else(|| {
        let start = store.times()[0];
        let window_bins = store
            .times()
            .iter()
            .filter(|&&t| t >= start && t < start + config.window_seconds)
            .count();
        peak_kernel * window_bins as f64 * config.kde_floor_fraction
    });

    let support: Vec<f64> = (0..n_bins)
        .filter(|&j| kde[j] > threshold)
        .map(axis_freq)
        .collect();

    // Group the windowed detections per id, ascending.
    let mut by_id: BTreeMap<TrackId, Vec<usize>> = BTreeMap::new();
    for &i in &in_window {
        if let Some(id) = store.track_id(i) {
            by_id.entry(id).or_default().push(i);
        }
    }

    let mut candidates = Vec::new();
    for (id, idxs) in &by_id {
        if idxs.len() <= 1 {
            continue;
        }
        let freqs: Vec<f64> = idxs.iter().map(|&i| store.frequency(i)).collect();
        let min_dist = freqs
            .iter()
            .map(|&f| min_distance_to_sorted(&support, f))
            .fold(f64::INFINITY, f64::min);

        let valid = min_dist <= config.freq_resolution / 2.0 || previously_valid.contains(id);
        if !valid {
            continue;
        }

        let first_time = store
            .track_indices(*id)
            .iter()
            .map(|&i| store.time_of(i))
            .fold(f64::INFINITY, f64::min);
        candidates.push(ValidCandidate {
            id: *id,
            median_freq: median(&freqs),
            first_time,
        });
    }

    for candidate in &candidates {
        store.set_track_valid(candidate.id, true);
    }

    debug!(
        "window {:.0}s-{:.0}s: {} detections, {} ids, {} valid",
        window_start,
        window_end,
        in_window.len(),
        by_id.len(),
        candidates.len()
    );

    (Some(threshold), Some(candidates))
}
