//! Overlap resolver.
//!
//! Global pass over all valid tracks: pairs whose padded time spans and
//! frequency ranges overlap are candidate identities of the same source.
//! Candidates are resolved closest-frequency first; each resolution applies
//! an ordered decision table over the pair's contention region and merges or
//! partially reassigns detections accordingly.

use log::{debug, info};

use crate::config::CleanupConfig;
use crate::store::{DetectionStore, TrackId};

/// Contention-region density below which a track counts as sparse.
const SPARSE_DENSITY: f64 = 0.1;
/// Overlap ratio below which contention evidence is considered weak.
const LOW_EVIDENCE_RATIO: f64 = 0.1;
/// Looser sparse-density bound used together with a high overlap ratio.
const LOOSE_DENSITY: f64 = 0.3;
/// Overlap ratio required by the looser absorption rule.
const LOOSE_RATIO: f64 = 0.7;
/// Counterpart of the strict absorption ratio on the second track's side.
/// The reference tuning is deliberately not a mirror image of the first
/// side's `absorb_ratio_strict`.
const SPARSE_RATIO_INVERTED: f64 = 0.3;

/// How a candidate pair is to be merged, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Both tracks stand; the pair stays unresolved.
    NoMerge,
    /// No real contention: the later-starting track is relabeled wholesale.
    FullMerge,
    /// Merge with a contested region: `keep`'s detections in the region are
    /// relabeled to the canonical id, `discard`'s are dropped.
    RegionMerge { keep: TrackId, discard: TrackId },
}

/// Per-pair evidence inside the contention region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContentionStats {
    pub count0: usize,
    pub count1: usize,
    pub density0: f64,
    pub density1: f64,
    /// Fraction of each track's contention-region detections that sit on a
    /// bin claimed by both tracks; NaN when the track has no detections there.
    pub ratio0: f64,
    pub ratio1: f64,
}

/// Ordered decision table; the first matching rule wins.
pub(crate) fn decide_merge(
    id0: TrackId,
    id1: TrackId,
    stats: &ContentionStats,
    config: &CleanupConfig,
) -> MergeDecision {
    // Next to no evidence in the contention region: trivial merge.
    if stats.count0 <= 1 && stats.count1 <= 1 {
        return MergeDecision::FullMerge;
    }

    // Both overlap ratios weak or undefined: low-evidence contention, the
    // lower id is canonical and the other's contested detections go.
    let weak0 = stats.ratio0 <= LOW_EVIDENCE_RATIO || stats.ratio0.is_nan();
    let weak1 = stats.ratio1 <= LOW_EVIDENCE_RATIO || stats.ratio1.is_nan();
    if weak0 && weak1 {
        return MergeDecision::RegionMerge {
            keep: id0,
            discard: id1,
        };
    }

    // A sparse track is absorbed by a clearly denser one.
    if stats.density0 <= SPARSE_DENSITY && stats.density0 * config.absorb_ratio_strict < stats.density1 {
        return MergeDecision::RegionMerge {
            keep: id1,
            discard: id0,
        };
    }
    if stats.density1 <= SPARSE_DENSITY && stats.density1 * SPARSE_RATIO_INVERTED < stats.density0 {
        return MergeDecision::RegionMerge {
            keep: id0,
            discard: id1,
        };
    }
    if stats.density0 <= LOOSE_DENSITY
        && stats.ratio0 >= LOOSE_RATIO
        && stats.density0 * config.absorb_ratio_loose < stats.density1
    {
        return MergeDecision::RegionMerge {
            keep: id1,
            discard: id0,
        };
    }
    if stats.density1 <= LOOSE_DENSITY
        && stats.ratio1 >= LOOSE_RATIO
        && stats.density1 * config.absorb_ratio_loose < stats.density0
    {
        return MergeDecision::RegionMerge {
            keep: id0,
            discard: id1,
        };
    }

    MergeDecision::NoMerge
}

/// A pair of tracks whose padded spans overlap, ranked by how close their
/// frequencies sit inside the overlap window.
#[derive(Debug, Clone, Copy)]
struct OverlapCandidate {
    id0: TrackId,
    id1: TrackId,
    mean_freq_dist: f64,
}

/// Resolve duplicate/competing identities among all valid tracks.
///
/// Returns the number of merges applied.
pub fn resolve_overlaps(store: &mut DetectionStore, config: &CleanupConfig) -> usize {
    let mut candidates = collect_candidates(store, config);
    if candidates.is_empty() {
        return 0;
    }

    // Closest pairs first; undefined distances (no close detection pairs)
    // resolve last.
    candidates.sort_by(|a, b| {
        match (a.mean_freq_dist.is_nan(), b.mean_freq_dist.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => a
                .mean_freq_dist
                .partial_cmp(&b.mean_freq_dist)
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    });

    let mut merges = 0;
    for k in 0..candidates.len() {
        let OverlapCandidate { id0, id1, .. } = candidates[k];
        if id0 == id1 {
            continue;
        }

        let bins0 = sorted_bins(store, id0);
        let bins1 = sorted_bins(store, id1);
        if bins0.is_empty() || bins1.is_empty() {
            continue;
        }

        // The contention region is bounded by the middle two of the four
        // sorted span boundaries.
        let mut boundaries = [
            (bins0[0], false),
            (bins0[bins0.len() - 1], false),
            (bins1[0], true),
            (bins1[bins1.len() - 1], true),
        ];
        boundaries.sort_by_key(|&(bin, _)| bin);
        let lo = boundaries[1].0;
        let hi = boundaries[2].0;

        let count0 = bins0.iter().filter(|&&b| b >= lo && b <= hi).count();
        let count1 = bins1.iter().filter(|&&b| b >= lo && b <= hi).count();
        // Unique intersection of the tracks' occupied bins.
        let mut shared: Vec<usize> = bins0
            .iter()
            .copied()
            .filter(|b| bins1.binary_search(b).is_ok())
            .collect();
        shared.dedup();
        let doubles = shared.len();
        let region_bins = (hi - lo + 1) as f64;

        let stats = ContentionStats {
            count0,
            count1,
            density0: count0 as f64 / region_bins,
            density1: count1 as f64 / region_bins,
            ratio0: if count0 > 0 {
                doubles as f64 / count0 as f64
            } else {
                f64::NAN
            },
            ratio1: if count1 > 0 {
                doubles as f64 / count1 as f64
            } else {
                f64::NAN
            },
        };

        let decision = decide_merge(id0, id1, &stats, config);
        if decision == MergeDecision::NoMerge {
            continue;
        }

        // The earlier-starting track is the canonical identity.
        let first_id = if !boundaries[0].1 { id0 } else { id1 };
        let not_first_id = if first_id == id0 { id1 } else { id0 };
        let last_id = if !boundaries[3].1 { id0 } else { id1 };

        match decision {
            MergeDecision::FullMerge => {
                for i in store.track_indices(not_first_id) {
                    store.set_track_id(i, Some(first_id));
                }
            }
            MergeDecision::RegionMerge { keep, discard } => {
                for i in store.track_indices(discard) {
                    let b = store.time_index(i);
                    if b >= lo && b <= hi {
                        store.set_track_id(i, None);
                    }
                }
                for i in store.track_indices(keep) {
                    let b = store.time_index(i);
                    if b >= lo && b <= hi {
                        store.set_track_id(i, Some(first_id));
                    }
                }
                // Extend the canonical identity over the later track's tail.
                if last_id != first_id {
                    for i in store.track_indices(last_id) {
                        if store.time_index(i) > hi {
                            store.set_track_id(i, Some(first_id));
                        }
                    }
                }
            }
            MergeDecision::NoMerge => unreachable!(),
        }

        debug!(
            "overlap: {:?} for tracks {} / {} over bins [{}, {}]",
            decision, id0, id1, lo, hi
        );
        merges += 1;

        // The retired id must not resurface in later resolutions.
        for candidate in candidates[k + 1..].iter_mut() {
            if candidate.id0 == not_first_id {
                candidate.id0 = first_id;
            }
            if candidate.id1 == not_first_id {
                candidate.id1 = first_id;
            }
        }
    }

    info!(
        "overlap resolver: {} candidate pairs, {} merges",
        candidates.len(),
        merges
    );
    merges
}

fn sorted_bins(store: &DetectionStore, id: TrackId) -> Vec<usize> {
    let mut bins: Vec<usize> = store
        .track_indices(id)
        .iter()
        .map(|&i| store.time_index(i))
        .collect();
    bins.sort_unstable();
    bins
}

/// Find all pairs of valid tracks with overlapping padded time spans and
/// overlapping frequency ranges inside the shared window.
fn collect_candidates(store: &DetectionStore, config: &CleanupConfig) -> Vec<OverlapCandidate> {
    let time_tol = config.overlap_time_tolerance;
    let freq_tol = config.overlap_freq_tolerance;
    let ids = store.valid_track_ids();

    let mut candidates = Vec::new();
    for a in 0..ids.len() {
        for b in a + 1..ids.len() {
            let id0 = ids[a];
            let id1 = ids[b];
            let idxs0 = store.track_indices(id0);
            let idxs1 = store.track_indices(id1);
            if idxs0.is_empty() || idxs1.is_empty() {
                continue;
            }

            let times0: Vec<f64> = idxs0.iter().map(|&i| store.time_of(i)).collect();
            let times1: Vec<f64> = idxs1.iter().map(|&i| store.time_of(i)).collect();
            let span0 = padded_span(&times0, time_tol);
            let span1 = padded_span(&times1, time_tol);
            if !spans_overlap(span0, span1) {
                continue;
            }

            // Middle two of the four padded boundaries bound the shared
            // time window.
            let mut edges = [span0.0, span0.1, span1.0, span1.1];
            edges.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
            let (win_lo, win_hi) = (edges[1], edges[2]);

            let in_window = |idxs: &[usize]| -> Vec<usize> {
                idxs.iter()
                    .copied()
                    .filter(|&i| {
                        let t = store.time_of(i);
                        t > win_lo && t < win_hi
                    })
                    .collect()
            };
            let win0 = in_window(&idxs0);
            let win1 = in_window(&idxs1);
            if win0.len() <= 1 || win1.len() <= 1 {
                continue;
            }

            let freqs0: Vec<f64> = win0.iter().map(|&i| store.frequency(i)).collect();
            let freqs1: Vec<f64> = win1.iter().map(|&i| store.frequency(i)).collect();
            let fspan0 = padded_span(&freqs0, freq_tol);
            let fspan1 = padded_span(&freqs1, freq_tol);
            if !spans_overlap(fspan0, fspan1) {
                continue;
            }

            // Near-duplicate tracks were dealt with by the similarity merger.
            let bins0: Vec<usize> = idxs0.iter().map(|&i| store.time_index(i)).collect();
            let bins1: Vec<usize> = idxs1.iter().map(|&i| store.time_index(i)).collect();
            let mut shared: Vec<usize> =
                bins0.iter().copied().filter(|b| bins1.contains(b)).collect();
            shared.sort_unstable();
            shared.dedup();
            let doubles = shared.len();
            if doubles as f64 > bins1.len() as f64 * config.duplicate_fraction
                && doubles as f64 > bins0.len() as f64 * config.duplicate_fraction
            {
                continue;
            }

            // Mean frequency distance over detection pairs no further apart
            // in time than the tolerance; NaN when no such pair exists.
            let times = store.times();
            let mut sum = 0.0;
            let mut n_pairs = 0usize;
            for &i in &win0 {
                for &j in &win1 {
                    let sep = store.time_index(i).abs_diff(store.time_index(j));
                    if times[sep.min(times.len() - 1)] <= time_tol {
                        sum += (store.frequency(i) - store.frequency(j)).abs();
                        n_pairs += 1;
                    }
                }
            }
            let mean_freq_dist = if n_pairs > 0 {
                sum / n_pairs as f64
            } else {
                f64::NAN
            };

            candidates.push(OverlapCandidate {
                id0,
                id1,
                mean_freq_dist,
            });
        }
    }
    candidates
}

fn padded_span(values: &[f64], tol: f64) -> (f64, f64) {
    let lo = values.iter().fold(f64::INFINITY, |acc, &v| acc.min(v));
    let hi = values.iter().fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    (lo - tol, hi + tol)
}

fn spans_overlap(a: (f64, f64), b: (f64, f64)) -> bool {
    (a.0 <= b.0 && a.1 > b.0) || (b.0 <= a.0 && b.1 > a.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    /// Build a store from (id, bin, freq) triples over a 1 s time grid, all
    /// detections valid.
    fn store_from(detections: &[(u32, usize, f64)], n_bins: usize) -> DetectionStore {
        let frequency = detections.iter().map(|d| d.2).collect();
        let time_index = detections.iter().map(|d| d.1).collect();
        let track_id: Vec<_> = detections.iter().map(|d| Some(TrackId(d.0))).collect();
        let power = DMatrix::from_element(detections.len(), 1, -40.0);
        let times = (0..n_bins).map(|i| i as f64).collect();
        let mut store =
            DetectionStore::new(frequency, time_index, power, track_id, times).unwrap();
        for i in 0..store.len() {
            store.set_valid(i, true);
        }
        store
    }

    fn stats(
        count0: usize,
        count1: usize,
        density0: f64,
        density1: f64,
        ratio0: f64,
        ratio1: f64,
    ) -> ContentionStats {
        ContentionStats {
            count0,
            count1,
            density0,
            density1,
            ratio0,
            ratio1,
        }
    }

    // ===== Decision table =====

    #[test]
    fn test_decide_trivial_merge() {
        let s = stats(1, 0, 0.01, 0.0, f64::NAN, f64::NAN);
        assert_eq!(
            decide_merge(TrackId(1), TrackId(2), &s, &CleanupConfig::default()),
            MergeDecision::FullMerge
        );
    }

    #[test]
    fn test_decide_low_evidence_keeps_lower_id() {
        let s = stats(50, 40, 0.5, 0.4, 0.05, f64::NAN);
        assert_eq!(
            decide_merge(TrackId(3), TrackId(7), &s, &CleanupConfig::default()),
            MergeDecision::RegionMerge {
                keep: TrackId(3),
                discard: TrackId(7)
            }
        );
    }

    #[test]
    fn test_decide_sparse_track_absorbed() {
        // Track 0 sparse and 3x sparser than track 1.
        let s = stats(5, 500, 0.05, 0.9, 0.9, 0.5);
        assert_eq!(
            decide_merge(TrackId(1), TrackId(2), &s, &CleanupConfig::default()),
            MergeDecision::RegionMerge {
                keep: TrackId(2),
                discard: TrackId(1)
            }
        );
        // Mirrored evidence absorbs track 1 instead.
        let s = stats(500, 5, 0.9, 0.05, 0.5, 0.9);
        assert_eq!(
            decide_merge(TrackId(1), TrackId(2), &s, &CleanupConfig::default()),
            MergeDecision::RegionMerge {
                keep: TrackId(1),
                discard: TrackId(2)
            }
        );
    }

    #[test]
    fn test_decide_loose_absorption_needs_high_ratio() {
        // Density 0.25 with ratio 0.8 and a 2x denser partner: absorbed.
        let s = stats(25, 100, 0.25, 0.9, 0.8, 0.2);
        assert_eq!(
            decide_merge(TrackId(1), TrackId(2), &s, &CleanupConfig::default()),
            MergeDecision::RegionMerge {
                keep: TrackId(2),
                discard: TrackId(1)
            }
        );
        // Same densities but weak ratio: unresolved.
        let s = stats(25, 100, 0.25, 0.9, 0.4, 0.2);
        assert_eq!(
            decide_merge(TrackId(1), TrackId(2), &s, &CleanupConfig::default()),
            MergeDecision::NoMerge
        );
    }

    #[test]
    fn test_decide_balanced_pair_unresolved() {
        let s = stats(400, 420, 0.8, 0.84, 0.5, 0.48);
        assert_eq!(
            decide_merge(TrackId(1), TrackId(2), &s, &CleanupConfig::default()),
            MergeDecision::NoMerge
        );
    }

    // ===== Resolver =====

    #[test]
    fn test_gap_within_tolerance_trivially_merged() {
        // Consecutive fragments 20 bins apart: at most one detection each in
        // the contention region, so the later track takes the earlier id.
        let mut detections: Vec<(u32, usize, f64)> = (0..500).map(|b| (1, b, 600.0)).collect();
        detections.extend((520..1000).map(|b| (2, b, 600.5)));
        let mut store = store_from(&detections, 1300);

        let merges = resolve_overlaps(&mut store, &CleanupConfig::default());

        assert_eq!(merges, 1);
        assert!(store.track_indices(TrackId(2)).is_empty());
        assert_eq!(store.track_indices(TrackId(1)).len(), 980);
    }

    #[test]
    fn test_disjoint_spans_never_merged() {
        // Gap larger than twice the 5-minute pad: no candidate pair at all.
        let mut detections: Vec<(u32, usize, f64)> = (0..100).map(|b| (1, b, 600.0)).collect();
        detections.extend((800..900).map(|b| (2, b, 600.0)));
        let mut store = store_from(&detections, 1000);

        let merges = resolve_overlaps(&mut store, &CleanupConfig::default());

        assert_eq!(merges, 0);
        assert_eq!(store.track_indices(TrackId(1)).len(), 100);
        assert_eq!(store.track_indices(TrackId(2)).len(), 100);
    }

    #[test]
    fn test_sparse_interloper_absorbed_by_dense_track() {
        // A dense track and five stray detections scattered inside its span.
        let mut detections: Vec<(u32, usize, f64)> = (0..1000).map(|b| (1, b, 600.0)).collect();
        for bin in [100, 300, 500, 700, 900] {
            detections.push((2, bin, 601.0));
        }
        let mut store = store_from(&detections, 1300);

        let merges = resolve_overlaps(&mut store, &CleanupConfig::default());

        assert_eq!(merges, 1);
        // The interloper's contested detections are gone, the dense track is
        // intact under its own id.
        assert!(store.track_indices(TrackId(2)).is_empty());
        assert_eq!(store.track_indices(TrackId(1)).len(), 1000);
        for i in store.track_indices(TrackId(1)) {
            assert!(store.is_valid(i));
        }
    }

    #[test]
    fn test_repeated_interloper_bins_do_not_mask_the_candidate() {
        // Seven detections stacked on one bin amount to a single shared
        // bin; the duplicate-share test must not reject the pair over them.
        let mut detections: Vec<(u32, usize, f64)> =
            (0..7).map(|_| (1, 100, 601.0)).collect();
        for bin in [300, 500, 700, 900] {
            detections.push((1, bin, 601.0));
        }
        detections.extend((0..1000).map(|b| (2, b, 600.0)));
        let mut store = store_from(&detections, 1300);

        let merges = resolve_overlaps(&mut store, &CleanupConfig::default());

        assert_eq!(merges, 1);
        assert!(store.track_indices(TrackId(1)).is_empty());
        assert_eq!(store.track_indices(TrackId(2)).len(), 1000);
    }

    #[test]
    fn test_distinct_frequencies_not_candidates() {
        let mut detections: Vec<(u32, usize, f64)> = (0..500).map(|b| (1, b, 600.0)).collect();
        detections.extend((0..500).map(|b| (2, b, 700.0)));
        let mut store = store_from(&detections, 600);

        let merges = resolve_overlaps(&mut store, &CleanupConfig::default());
        assert_eq!(merges, 0);
    }
}
