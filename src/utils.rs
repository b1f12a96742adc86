//! Shared numeric helpers for the cleanup stages.

/// Convert a linear power value to decibel scale (re 1.0).
pub fn decibel(power: f64) -> f64 {
    10.0 * power.log10()
}

/// Median of a slice. Returns NaN for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Piecewise-linear interpolation of `(xs, ys)` samples at integer bin
/// positions `query`. Queries outside the sample range are clamped to the
/// endpoint values.
///
/// `xs` must be sorted ascending; `xs` and `ys` have equal length > 0.
pub fn interp_bins(query: &[usize], xs: &[usize], ys: &[f64]) -> Vec<f64> {
    debug_assert_eq!(xs.len(), ys.len());
    debug_assert!(!xs.is_empty());

    query
        .iter()
        .map(|&q| {
            if q <= xs[0] {
                return ys[0];
            }
            if q >= xs[xs.len() - 1] {
                return ys[ys.len() - 1];
            }
            // First sample position >= q; q is strictly inside the range here.
            let hi = xs.partition_point(|&x| x < q);
            let lo = hi - 1;
            if xs[hi] == xs[lo] {
                return ys[lo];
            }
            let t = (q - xs[lo]) as f64 / (xs[hi] - xs[lo]) as f64;
            ys[lo] + t * (ys[hi] - ys[lo])
        })
        .collect()
}

/// Centered moving average of length `window`, normalized at the edges so
/// that positions near the boundaries average only the samples actually
/// inside the slice.
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    if n == 0 || window <= 1 {
        return values.to_vec();
    }
    let left = (window - 1) / 2;
    let right = window / 2;

    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let lo = i.saturating_sub(left);
        let hi = (i + right).min(n - 1);
        let count = (hi - lo + 1) as f64;
        let sum: f64 = values[lo..=hi].iter().sum();
        out.push(sum / count);
    }
    out
}

/// Minimum absolute distance from `x` to any element of an ascending-sorted
/// slice. Returns infinity for an empty slice.
pub fn min_distance_to_sorted(sorted: &[f64], x: f64) -> f64 {
    if sorted.is_empty() {
        return f64::INFINITY;
    }
    let hi = sorted.partition_point(|&v| v < x);
    let mut best = f64::INFINITY;
    if hi < sorted.len() {
        best = best.min((sorted[hi] - x).abs());
    }
    if hi > 0 {
        best = best.min((x - sorted[hi - 1]).abs());
    }
    best
}
