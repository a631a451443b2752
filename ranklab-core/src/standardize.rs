//! Cross-sectional standardization of raw factor values.
//!
//! Operates on one group at a time — all entities sharing one timestamp.
//! Fixed pipeline order: sign alignment, winsorize, fill, scale. NaN marks
//! a missing value throughout.
//!
//! Degenerate groups never propagate NaN silently: a zero-spread or
//! single-member group scales to 0.0 under the z-score family and to the
//! 0.5 midpoint under `rank`/`minmax`.

use serde::{Deserialize, Serialize};

/// Direction metadata on a factor definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
    /// No sign preference; values pass through unaligned.
    Ambivalent,
}

/// Missing-value policy, applied after winsorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Replace missing with the group median (default).
    Median,
    /// Replace missing with zero.
    Zero,
    /// Leave missing out of the group entirely.
    Drop,
}

/// The closed set of scaling methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMethod {
    ZScore,
    RobustZScore,
    /// Percentile in [0, 1]; ties get their average rank.
    Rank,
    MinMax,
}

/// Full standardization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardizeConfig {
    /// Lower/upper quantile clip bounds; None disables winsorization.
    pub winsorize: Option<(f64, f64)>,
    pub fill: FillPolicy,
    pub method: ScaleMethod,
}

impl Default for StandardizeConfig {
    fn default() -> Self {
        Self {
            winsorize: Some((0.01, 0.99)),
            fill: FillPolicy::Median,
            method: ScaleMethod::ZScore,
        }
    }
}

/// Per-group diagnostics: moments of what the scaler saw, plus pipeline
/// counters. This is the `test_run` diagnostics payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDiagnostics {
    pub group_size: usize,
    pub valid: usize,
    pub mean: f64,
    pub std: f64,
    pub skewness: f64,
    pub kurtosis: f64,
    pub clipped_low: usize,
    pub clipped_high: usize,
    pub filled: usize,
    pub dropped: usize,
}

/// Standardize one cross-sectional group.
///
/// Input and output are parallel to the group's entity order; dropped
/// members come back as NaN and are excluded from all statistics.
pub fn standardize_group(
    values: &[f64],
    direction: Direction,
    config: &StandardizeConfig,
) -> (Vec<f64>, GroupDiagnostics) {
    // 1. Sign alignment — "higher is better" holds everywhere downstream.
    let mut work: Vec<f64> = match direction {
        Direction::LowerIsBetter => values.iter().map(|v| -v).collect(),
        Direction::HigherIsBetter | Direction::Ambivalent => values.to_vec(),
    };

    // 2. Winsorize at quantile bounds (linear interpolation).
    let mut clipped_low = 0;
    let mut clipped_high = 0;
    if let Some((lo_q, hi_q)) = config.winsorize {
        let valid: Vec<f64> = work.iter().copied().filter(|v| !v.is_nan()).collect();
        if !valid.is_empty() {
            let lo = quantile(&valid, lo_q);
            let hi = quantile(&valid, hi_q);
            for v in work.iter_mut() {
                if v.is_nan() {
                    continue;
                }
                if *v < lo {
                    *v = lo;
                    clipped_low += 1;
                } else if *v > hi {
                    *v = hi;
                    clipped_high += 1;
                }
            }
        }
    }

    // 3. Fill.
    let missing = work.iter().filter(|v| v.is_nan()).count();
    let mut filled = 0;
    let mut dropped = 0;
    match config.fill {
        FillPolicy::Median => {
            let m = median(&work);
            if !m.is_nan() {
                for v in work.iter_mut().filter(|v| v.is_nan()) {
                    *v = m;
                    filled += 1;
                }
            } else {
                dropped = missing;
            }
        }
        FillPolicy::Zero => {
            for v in work.iter_mut().filter(|v| v.is_nan()) {
                *v = 0.0;
                filled += 1;
            }
        }
        FillPolicy::Drop => dropped = missing,
    }

    // Diagnostics describe what the scaler sees.
    let seen: Vec<f64> = work.iter().copied().filter(|v| !v.is_nan()).collect();
    let diagnostics = GroupDiagnostics {
        group_size: values.len(),
        valid: seen.len(),
        mean: mean(&seen),
        std: std_dev(&seen),
        skewness: skewness(&seen),
        kurtosis: excess_kurtosis(&seen),
        clipped_low,
        clipped_high,
        filled,
        dropped,
    };

    // 4. Scale — one match over the closed method set.
    let scaled = match config.method {
        ScaleMethod::ZScore => zscore(&work),
        ScaleMethod::RobustZScore => robust_zscore(&work),
        ScaleMethod::Rank => rank_percentile(&work),
        ScaleMethod::MinMax => minmax(&work),
    };

    (scaled, diagnostics)
}

// ── scaling methods ─────────────────────────────────────────────────

fn zscore(values: &[f64]) -> Vec<f64> {
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    let m = mean(&valid);
    let s = std_dev(&valid);
    values
        .iter()
        .map(|v| {
            if v.is_nan() {
                f64::NAN
            } else if valid.len() <= 1 || s == 0.0 || s.is_nan() {
                0.0
            } else {
                (v - m) / s
            }
        })
        .collect()
}

/// MAD scaling factor for consistency with a normal distribution.
const MAD_SCALE: f64 = 1.4826;

fn robust_zscore(values: &[f64]) -> Vec<f64> {
    let med = median(values);
    let deviations: Vec<f64> = values
        .iter()
        .map(|v| if v.is_nan() { f64::NAN } else { (v - med).abs() })
        .collect();
    let mad = median(&deviations);
    let valid = values.iter().filter(|v| !v.is_nan()).count();
    values
        .iter()
        .map(|v| {
            if v.is_nan() {
                f64::NAN
            } else if valid <= 1 || mad == 0.0 || mad.is_nan() {
                0.0
            } else {
                (v - med) / (mad * MAD_SCALE)
            }
        })
        .collect()
}

fn rank_percentile(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).filter(|&i| !values[i].is_nan()).collect();
    let n = order.len();
    if n == 0 {
        return values.to_vec();
    }
    if n == 1 {
        // Single member: documented midpoint.
        let mut out = vec![f64::NAN; values.len()];
        out[order[0]] = 0.5;
        return out;
    }
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap());

    // Average rank for ties, then scale to [0, 1].
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg_rank;
        }
        i = j + 1;
    }

    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            if v.is_nan() {
                f64::NAN
            } else {
                (ranks[i] - 1.0) / (n as f64 - 1.0)
            }
        })
        .collect()
}

fn minmax(values: &[f64]) -> Vec<f64> {
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    let lo = valid.iter().copied().fold(f64::NAN, f64::min);
    let hi = valid.iter().copied().fold(f64::NAN, f64::max);
    let range = hi - lo;
    values
        .iter()
        .map(|v| {
            if v.is_nan() {
                f64::NAN
            } else if valid.len() <= 1 || range == 0.0 {
                0.5
            } else {
                (v - lo) / range
            }
        })
        .collect()
}

// ── moments & order statistics ──────────────────────────────────────

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n−1); NaN below two points.
fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn central_moment(values: &[f64], m: f64, k: i32) -> f64 {
    values.iter().map(|v| (v - m).powi(k)).sum::<f64>() / values.len() as f64
}

fn skewness(values: &[f64]) -> f64 {
    if values.len() < 3 {
        return f64::NAN;
    }
    let m = mean(values);
    let m2 = central_moment(values, m, 2);
    if m2 == 0.0 {
        return f64::NAN;
    }
    central_moment(values, m, 3) / m2.powf(1.5)
}

fn excess_kurtosis(values: &[f64]) -> f64 {
    if values.len() < 4 {
        return f64::NAN;
    }
    let m = mean(values);
    let m2 = central_moment(values, m, 2);
    if m2 == 0.0 {
        return f64::NAN;
    }
    central_moment(values, m, 4) / (m2 * m2) - 3.0
}

/// Median over non-NaN values; NaN for an empty set.
fn median(values: &[f64]) -> f64 {
    let mut v: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if v.is_empty() {
        return f64::NAN;
    }
    v.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        (v[mid - 1] + v[mid]) / 2.0
    } else {
        v[mid]
    }
}

/// Quantile with linear interpolation between order statistics
/// (h = q·(n−1), interpolated between floor and ceil).
fn quantile(values: &[f64], q: f64) -> f64 {
    let mut v = values.to_vec();
    if v.is_empty() {
        return f64::NAN;
    }
    v.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let q = q.clamp(0.0, 1.0);
    let h = q * (v.len() - 1) as f64;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    if lo == hi {
        v[lo]
    } else {
        v[lo] + (h - lo as f64) * (v[hi] - v[lo])
    }
}
