//! Power-density filter.
//!
//! Each currently-valid track is judged over its entire lifetime: tracks that
//! occupy too few of their time bins or whose mean peak-channel power sits at
//! or below the noise floor are invalidated. A track rejected purely on power
//! whose power oscillates around the threshold is re-split into the segments
//! where its smoothed power stays above the floor, each under a fresh id.

use log::debug;

use crate::config::CleanupConfig;
use crate::store::{DetectionStore, TrackId};
use crate::utils::{interp_bins, moving_average};

/// Seconds of smoothing applied to the interpolated power trace.
const SMOOTHING_SECONDS: f64 = 60.0;
/// Minimum lifetime before a power-rejected track is considered for re-split.
const RESPLIT_MIN_LIFETIME: f64 = 10.0 * 60.0;

/// Filter every valid track by lifetime density and mean power.
///
/// Mutates track ids (for recovered segments) and the validity mask in place.
pub fn power_density_filter(store: &mut DetectionStore, config: &CleanupConfig) {
    let bin_dt = store.bin_seconds();

    for id in store.valid_track_ids() {
        let idxs = store.track_indices(id);
        if idxs.is_empty() {
            continue;
        }

        // Bins and peak powers in ascending bin order.
        let mut samples: Vec<(usize, f64)> = idxs
            .iter()
            .map(|&i| (store.time_index(i), store.peak_power(i)))
            .collect();
        samples.sort_by_key(|&(bin, _)| bin);
        let bins: Vec<usize> = samples.iter().map(|s| s.0).collect();
        let powers: Vec<f64> = samples.iter().map(|s| s.1).collect();

        let first = bins[0];
        let last = bins[bins.len() - 1];
        let density = bins.len() as f64 / (last - first + 1) as f64;
        let mean_power = powers.iter().sum::<f64>() / powers.len() as f64;

        if density >= config.density_threshold && mean_power > config.power_threshold_db {
            continue;
        }

        debug!(
            "track {}: rejected (density {:.3}, mean power {:.1} dB)",
            id, density, mean_power
        );
        store.set_track_valid(id, false);

        // Re-split applies only to power-driven rejections of long,
        // sufficiently dense tracks.
        let lifetime = (last - first) as f64 * bin_dt;
        if !(mean_power <= config.power_threshold_db
            && density > config.density_threshold
            && lifetime > RESPLIT_MIN_LIFETIME)
        {
            continue;
        }

        resplit_track(store, config, id, &idxs, &bins, &powers, bin_dt);
    }
}

/// Recover the above-threshold segments of a power-rejected track.
#[allow(clippy::too_many_arguments)]
fn resplit_track(
    store: &mut DetectionStore,
    config: &CleanupConfig,
    id: TrackId,
    idxs: &[usize],
    bins: &[usize],
    powers: &[f64],
    bin_dt: f64,
) {
    let threshold = config.power_threshold_db;
    let first = bins[0];
    let last = bins[bins.len() - 1];

    let above = powers.iter().filter(|&&p| p > threshold).count();
    if above as f64 / powers.len() as f64 <= config.recovery_fraction {
        return;
    }

    // Interpolate the power over every bin of the span and smooth it.
    let span: Vec<usize> = (first..=last).collect();
    let trace = interp_bins(&span, bins, powers);
    let window = ((SMOOTHING_SECONDS / bin_dt) as usize).max(1);
    let smoothed = moving_average(&trace, window);

    // Threshold crossings of the smoothed trace. Signed bins: the leading
    // segment may start one bin before the span.
    let mut up: Vec<i64> = Vec::new();
    let mut down: Vec<i64> = Vec::new();
    for k in 0..smoothed.len() - 1 {
        if smoothed[k] < threshold && smoothed[k + 1] > threshold {
            up.push(span[k] as i64);
        }
        if smoothed[k] > threshold && smoothed[k + 1] < threshold {
            down.push(span[k + 1] as i64);
        }
    }
    if up.is_empty() {
        up.push(first as i64);
    }
    if down.is_empty() {
        down.push(last as i64);
    }
    if up[0] > down[0] {
        up.insert(0, first as i64 - 1);
    }
    if down[down.len() - 1] < up[up.len() - 1] {
        down.push(last as i64 + 1);
    }

    let mut next = store.max_track_id().map(|t| t.value() + 1).unwrap_or(0);
    for (&ui, &di) in up.iter().zip(down.iter()) {
        let segment = TrackId(next);
        next += 1;
        let mut relabeled = 0;
        for &i in idxs {
            let bin = store.time_index(i) as i64;
            if store.track_id(i) == Some(id) && bin >= ui && bin < di {
                store.set_track_id(i, Some(segment));
                store.set_valid(i, true);
                relabeled += 1;
            }
        }
        debug!(
            "track {}: recovered segment {} over bins [{}, {}) with {} detections",
            id, segment, ui, di, relabeled
        );
    }
}
