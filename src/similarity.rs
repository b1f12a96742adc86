//! Similarity merger.
//!
//! Within one window, pairs of valid candidate tracks that sit close in
//! frequency and occupy disjoint time bins are fragments of a single source
//! left behind by the upstream tracker. Candidate pairs are processed in
//! ascending order of median-frequency distance; merging relabels the
//! absorbed track and drops its duplicate claims at shared time bins.

use std::collections::BTreeSet;

use log::debug;
use nalgebra::DMatrix;

use crate::config::CleanupConfig;
use crate::density::ValidCandidate;
use crate::store::{DetectionStore, TrackId};

/// Merge window-local track fragments among `candidates`.
///
/// Candidate rows are rewritten in place as ids are unified; the returned set
/// holds the distinct surviving ids and feeds the next window's hysteresis.
pub fn merge_by_similarity(
    store: &mut DetectionStore,
    config: &CleanupConfig,
    candidates: &mut [ValidCandidate],
    window_start: f64,
) -> BTreeSet<TrackId> {
    let n = candidates.len();
    if n < 2 {
        return candidates.iter().map(|c| c.id).collect();
    }

    // Pairwise median-frequency distance table; pairs are visited in
    // ascending distance so the most confident merges run first.
    let dist = DMatrix::from_fn(n, n, |r, c| {
        (candidates[r].median_freq - candidates[c].median_freq).abs()
    });
    let mut pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|r| (0..n).map(move |c| (r, c)))
        .filter(|&(r, c)| r != c)
        .collect();
    pairs.sort_by(|a, b| {
        dist[(a.0, a.1)]
            .partial_cmp(&dist[(b.0, b.1)])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let window_end = window_start + config.window_seconds;

    for (r, c) in pairs {
        // Sorted ascending, so everything beyond the tolerance stays beyond it.
        if dist[(r, c)] > config.freq_tolerance {
            break;
        }

        let id0 = candidates[r].id;
        let id1 = candidates[c].id;
        if id0 == id1 {
            continue;
        }

        let idxs0 = store.track_indices(id0);
        let idxs1 = store.track_indices(id1);
        let bins0: Vec<usize> = idxs0.iter().map(|&i| store.time_index(i)).collect();
        let bins1: Vec<usize> = idxs1.iter().map(|&i| store.time_index(i)).collect();

        // Unique intersection: repeated detections at one bin count once.
        let mut shared: Vec<usize> =
            bins0.iter().copied().filter(|b| bins1.contains(b)).collect();
        shared.sort_unstable();
        shared.dedup();

        // Heavily co-occurring tracks are genuinely distinct sources.
        if shared.len() as f64 > bins1.len() as f64 * config.duplicate_fraction
            && shared.len() as f64 > bins0.len() as f64 * config.duplicate_fraction
        {
            continue;
        }

        let (survivor, absorbed) = pick_survivor(&candidates[r], &candidates[c], idxs0.len(), idxs1.len());

        // Interleave the two tracks' windowed detections by time bin and
        // check that the frequency trace stays smooth at every point where
        // the source id switches.
        let windowed = |idxs: &[usize]| -> Vec<usize> {
            idxs.iter()
                .copied()
                .filter(|&i| {
                    let t = store.time_of(i);
                    t >= window_start && t < window_end
                })
                .collect()
        };
        let win_survivor = windowed(&store.track_indices(survivor));
        let win_absorbed = windowed(&store.track_indices(absorbed));
        let survivor_bins: BTreeSet<usize> =
            win_survivor.iter().map(|&i| store.time_index(i)).collect();

        let mut joined: Vec<(usize, f64, bool)> = win_survivor
            .iter()
            .map(|&i| (store.time_index(i), store.frequency(i), false))
            .collect();
        joined.extend(
            win_absorbed
                .iter()
                .filter(|&&i| !survivor_bins.contains(&store.time_index(i)))
                .map(|&i| (store.time_index(i), store.frequency(i), true)),
        );
        joined.sort_by_key(|&(bin, _, _)| bin);

        let jump_too_large = joined.windows(2).any(|w| {
            w[0].2 != w[1].2 && (w[1].1 - w[0].1).abs() > config.freq_tolerance
        });
        if jump_too_large {
            continue;
        }

        // Duplicate claims at shared bins are dropped from the absorbed
        // track; the rest of it takes the surviving id.
        let absorbed_idxs = store.track_indices(absorbed);
        for &i in &absorbed_idxs {
            if shared.contains(&store.time_index(i)) {
                store.set_track_id(i, None);
            } else {
                store.set_track_id(i, Some(survivor));
            }
        }

        for candidate in candidates.iter_mut() {
            if candidate.id == absorbed {
                candidate.id = survivor;
            }
        }

        debug!(
            "window {:.0}s: merged track {} into {} ({} duplicate claims dropped)",
            window_start,
            absorbed,
            survivor,
            shared.len()
        );
    }

    candidates.iter().map(|c| c.id).collect()
}

/// The more populous track survives; equal counts fall back to the earlier
/// first-occurrence time.
fn pick_survivor(
    cand0: &ValidCandidate,
    cand1: &ValidCandidate,
    count0: usize,
    count1: usize,
) -> (TrackId, TrackId) {
    if count0 > count1 {
        (cand0.id, cand1.id)
    } else if count1 > count0 {
        (cand1.id, cand0.id)
    } else if cand0.first_time <= cand1.first_time {
        (cand0.id, cand1.id)
    } else {
        (cand1.id, cand0.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    /// Build a store from (id, bin, freq) triples over a 1 s time grid.
    fn store_from(detections: &[(u32, usize, f64)], n_bins: usize) -> DetectionStore {
        let frequency = detections.iter().map(|d| d.2).collect();
        let time_index = detections.iter().map(|d| d.1).collect();
        let track_id = detections.iter().map(|d| Some(TrackId(d.0))).collect();
        let power = DMatrix::from_element(detections.len(), 1, -40.0);
        let times = (0..n_bins).map(|i| i as f64).collect();
        DetectionStore::new(frequency, time_index, power, track_id, times).unwrap()
    }

    fn candidate(id: u32, median_freq: f64, first_time: f64) -> ValidCandidate {
        ValidCandidate {
            id: TrackId(id),
            median_freq,
            first_time,
        }
    }

    #[test]
    fn test_fragments_are_merged() {
        // One source fragmented into two ids with disjoint bins.
        let mut detections: Vec<(u32, usize, f64)> = (0..30).map(|b| (1, b, 600.0)).collect();
        detections.extend((30..80).map(|b| (2, b, 600.4)));
        let mut store = store_from(&detections, 600);

        let mut candidates = vec![candidate(1, 600.0, 0.0), candidate(2, 600.4, 30.0)];
        let survivors =
            merge_by_similarity(&mut store, &CleanupConfig::default(), &mut candidates, 0.0);

        // Track 2 is more populous and absorbs track 1.
        assert_eq!(survivors.into_iter().collect::<Vec<_>>(), vec![TrackId(2)]);
        assert!(store.track_indices(TrackId(1)).is_empty());
        assert_eq!(store.track_indices(TrackId(2)).len(), 80);
    }

    #[test]
    fn test_duplicate_claims_dropped_from_absorbed_track() {
        // Fragments overlap at bins 298 and 299 (2 of 300+ bins, under 1%).
        let mut detections: Vec<(u32, usize, f64)> = (0..300).map(|b| (1, b, 600.0)).collect();
        detections.extend((298..600).map(|b| (2, b, 600.4)));
        let mut store = store_from(&detections, 600);

        let mut candidates = vec![candidate(1, 600.0, 0.0), candidate(2, 600.4, 298.0)];
        merge_by_similarity(&mut store, &CleanupConfig::default(), &mut candidates, 0.0);

        // Track 2 survived (302 vs 300 detections); track 1's claims at the
        // shared bins were dropped entirely.
        let merged = store.track_indices(TrackId(2));
        let mut bins: Vec<usize> = merged.iter().map(|&i| store.time_index(i)).collect();
        let total = bins.len();
        bins.dedup();
        assert_eq!(bins.len(), total, "merged track double-claims a time bin");
        assert_eq!(total, 300 + 302 - 2);
        assert!(store.track_indices(TrackId(1)).is_empty());
    }

    #[test]
    fn test_repeated_bins_count_once_in_duplicate_share() {
        // Track 1 carries six detections stacked on bin 298; the overlap
        // with track 2 is still a single shared bin and must not block the
        // merge.
        let mut detections: Vec<(u32, usize, f64)> = (0..298).map(|b| (1, b, 600.0)).collect();
        detections.extend((0..6).map(|_| (1, 298, 600.0)));
        detections.extend((298..600).map(|b| (2, b, 600.4)));
        let mut store = store_from(&detections, 600);

        let mut candidates = vec![candidate(1, 600.0, 0.0), candidate(2, 600.4, 298.0)];
        let survivors =
            merge_by_similarity(&mut store, &CleanupConfig::default(), &mut candidates, 0.0);

        // Track 1 is more populous (304 vs 302) and survives; track 2's
        // claim at the shared bin is dropped, the rest relabeled.
        assert_eq!(survivors.into_iter().collect::<Vec<_>>(), vec![TrackId(1)]);
        assert!(store.track_indices(TrackId(2)).is_empty());
        assert_eq!(store.track_indices(TrackId(1)).len(), 304 + 301);
    }

    #[test]
    fn test_cooccurring_tracks_are_not_merged() {
        // Two tracks sharing most of their bins are distinct sources.
        let mut detections: Vec<(u32, usize, f64)> = (0..100).map(|b| (1, b, 600.0)).collect();
        detections.extend((0..100).map(|b| (2, b, 601.0)));
        let mut store = store_from(&detections, 600);

        let mut candidates = vec![candidate(1, 600.0, 0.0), candidate(2, 601.0, 0.0)];
        let survivors =
            merge_by_similarity(&mut store, &CleanupConfig::default(), &mut candidates, 0.0);

        assert_eq!(survivors.len(), 2);
        assert_eq!(store.track_indices(TrackId(1)).len(), 100);
        assert_eq!(store.track_indices(TrackId(2)).len(), 100);
    }

    #[test]
    fn test_merge_rejected_on_frequency_jump_at_stitch() {
        // Medians are close but the traces do not connect smoothly: track 1
        // ends at 605 Hz right where track 2 starts at 601 Hz.
        let mut detections: Vec<(u32, usize, f64)> = (0..9).map(|b| (1, b, 600.0)).collect();
        detections.push((1, 9, 605.0));
        detections.extend((10..20).map(|b| (2, b, 601.0)));
        let mut store = store_from(&detections, 600);

        let mut candidates = vec![candidate(1, 600.0, 0.0), candidate(2, 601.0, 10.0)];
        let survivors =
            merge_by_similarity(&mut store, &CleanupConfig::default(), &mut candidates, 0.0);

        assert_eq!(survivors.len(), 2);
        assert_eq!(store.track_indices(TrackId(1)).len(), 10);
        assert_eq!(store.track_indices(TrackId(2)).len(), 10);
    }

    #[test]
    fn test_distant_frequencies_are_never_considered() {
        let mut detections: Vec<(u32, usize, f64)> = (0..10).map(|b| (1, b, 600.0)).collect();
        detections.extend((10..20).map(|b| (2, b, 700.0)));
        let mut store = store_from(&detections, 600);

        let mut candidates = vec![candidate(1, 600.0, 0.0), candidate(2, 700.0, 10.0)];
        let survivors =
            merge_by_similarity(&mut store, &CleanupConfig::default(), &mut candidates, 0.0);
        assert_eq!(survivors.len(), 2);
    }

    #[test]
    fn test_equal_counts_older_track_wins() {
        let mut detections: Vec<(u32, usize, f64)> = (0..10).map(|b| (2, b, 600.0)).collect();
        detections.extend((10..20).map(|b| (1, b, 600.4)));
        let mut store = store_from(&detections, 600);

        // Track 2 appeared first and has the same count; it survives.
        let mut candidates = vec![candidate(2, 600.0, 0.0), candidate(1, 600.4, 10.0)];
        let survivors =
            merge_by_similarity(&mut store, &CleanupConfig::default(), &mut candidates, 0.0);
        assert_eq!(survivors.into_iter().collect::<Vec<_>>(), vec![TrackId(2)]);
    }
}
