//! Pipeline driver.
//!
//! Runs the full cleanup sequence over a [`DetectionStore`]: the overlapping
//! window sweep (density validation plus similarity merging), the lifetime
//! power-density filter, the global overlap resolver, and the final top-N
//! selection of the strongest surviving tracks.

use std::collections::BTreeSet;

use log::info;
use serde::Serialize;

use crate::config::CleanupConfig;
use crate::density::validate_window;
use crate::overlap::resolve_overlaps;
use crate::power::power_density_filter;
use crate::similarity::merge_by_similarity;
use crate::store::{DetectionStore, TrackId};
use crate::Result;

/// Final metrics of one surviving track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackSummary {
    pub id: TrackId,
    pub detections: usize,
    /// Fraction of time bins within the track's span that hold a detection.
    pub density: f64,
    /// Mean peak-channel power over the track, dB.
    pub mean_power_db: f64,
}

/// What a pipeline run did, stage by stage.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupSummary {
    /// Number of windows swept.
    pub windows: usize,
    /// Distinct valid ids after the window sweep.
    pub ids_after_sweep: usize,
    /// Distinct valid ids after the power-density filter.
    pub ids_after_power_filter: usize,
    /// Merges applied by the overlap resolver.
    pub overlap_merges: usize,
    /// Surviving tracks, strongest first.
    pub tracks: Vec<TrackSummary>,
}

/// The cleanup engine.
///
/// Construction validates the configuration once; `run` may then be applied
/// to any number of recordings.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: CleanupConfig,
}

impl Pipeline {
    /// Build a pipeline, failing on an unusable configuration.
    pub fn new(config: CleanupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The configuration this pipeline runs with.
    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Run every cleanup stage over `store` in place.
    pub fn run(&self, store: &mut DetectionStore) -> Result<CleanupSummary> {
        let config = &self.config;

        // Overlapping window sweep: validate candidates per window, then
        // merge fragments among them. An empty window keeps the previous
        // window's valid-id set alive for hysteresis.
        let mut kde_threshold = None;
        let mut previously_valid: BTreeSet<TrackId> = BTreeSet::new();
        let mut windows = 0;
        let last = store.last_time();
        let step = config.window_step();
        let mut window_start = 0.0;
        while window_start < last {
            let (threshold, candidates) =
                validate_window(store, config, window_start, kde_threshold, &previously_valid);
            kde_threshold = threshold;
            if let Some(mut candidates) = candidates {
                previously_valid =
                    merge_by_similarity(store, config, &mut candidates, window_start);
            }
            windows += 1;
            window_start += step;
        }
        let ids_after_sweep = store.valid_track_ids().len();

        power_density_filter(store, config);
        let ids_after_power_filter = store.valid_track_ids().len();

        let overlap_merges = resolve_overlaps(store, config);

        let tracks = self.select_top_n(store);

        info!(
            "cleanup: {} windows, {} valid ids after sweep, {} after power filter, {} overlap merges, {} tracks kept",
            windows,
            ids_after_sweep,
            ids_after_power_filter,
            overlap_merges,
            tracks.len()
        );

        Ok(CleanupSummary {
            windows,
            ids_after_sweep,
            ids_after_power_filter,
            overlap_merges,
            tracks,
        })
    }

    /// Keep the `n_fish` most populous valid tracks and unassign the rest.
    fn select_top_n(&self, store: &mut DetectionStore) -> Vec<TrackSummary> {
        let mut ranked: Vec<(TrackId, usize)> = store
            .valid_track_ids()
            .into_iter()
            .map(|id| (id, store.track_indices(id).len()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let kept: Vec<TrackId> = ranked
            .into_iter()
            .take(self.config.n_fish)
            .map(|(id, _)| id)
            .collect();

        // Everything outside the kept set loses its id, including tracks
        // already invalidated by the earlier stages.
        for id in store.assigned_track_ids() {
            if kept.contains(&id) {
                store.set_track_valid(id, true);
            } else {
                for i in store.track_indices(id) {
                    store.set_track_id(i, None);
                }
            }
        }

        kept.iter()
            .filter_map(|&id| {
                store.track_stats(id).map(|stats| TrackSummary {
                    id,
                    detections: stats.detections,
                    density: stats.density,
                    mean_power_db: stats.mean_power_db,
                })
            })
            .collect()
    }
}
