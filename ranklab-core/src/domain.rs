//! Factor and strategy definitions, plus the read-only store trait the
//! orchestrator consumes.
//!
//! The record-management layer (create/list/update/delete) lives outside
//! this workspace; here definitions are opaque reads. The one invariant
//! enforced at construction is weight normalization: a persisted strategy
//! always carries an L1-normalized weight vector, never the raw weights as
//! entered.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::catalog::SelectionSpec;
use crate::standardize::{Direction, StandardizeConfig};
use crate::universe::UniverseFilter;

/// A validated, persisted factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorDefinition {
    pub id: String,
    pub name: String,
    pub code: String,
    /// Statically extracted at validation time; always ⊆ the selection's
    /// fields.
    pub fields_used: Vec<String>,
    pub direction: Direction,
    pub selection: SelectionSpec,
    /// Numeric parameters handed to the factor code as its second mapping.
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

/// One factor's slot in a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorSlot {
    pub factor_id: String,
    /// L1-normalized weight (see [`StrategyDefinition::new`]).
    pub weight: f64,
    pub enabled: bool,
}

/// A persisted strategy: ordered factor slots, a normalization policy, and
/// a universe filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub id: String,
    pub name: String,
    pub factors: Vec<FactorSlot>,
    pub standardize: StandardizeConfig,
    pub universe: UniverseFilter,
    /// How many entities the ranked output keeps.
    pub top_n: usize,
}

/// Weight vector failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WeightError {
    #[error("strategy has no factors")]
    Empty,
    #[error("all weights are zero; cannot normalize")]
    AllZero,
    #[error("weight for '{factor_id}' is not finite")]
    NotFinite { factor_id: String },
}

impl StrategyDefinition {
    /// Build a strategy from raw weights, normalizing to Σ|w| = 1.
    ///
    /// Raw weights are never persisted as entered; an all-zero or
    /// non-finite vector fails here instead of producing NaN weights
    /// downstream.
    pub fn new(
        id: &str,
        name: &str,
        raw: Vec<(String, f64, bool)>,
        standardize: StandardizeConfig,
        universe: UniverseFilter,
        top_n: usize,
    ) -> Result<Self, WeightError> {
        if raw.is_empty() {
            return Err(WeightError::Empty);
        }
        for (factor_id, weight, _) in &raw {
            if !weight.is_finite() {
                return Err(WeightError::NotFinite {
                    factor_id: factor_id.clone(),
                });
            }
        }

        let weights: Vec<f64> = raw.iter().map(|(_, w, _)| *w).collect();
        let normalized = normalize_l1(&weights)?;

        let factors = raw
            .into_iter()
            .zip(normalized)
            .map(|((factor_id, _, enabled), weight)| FactorSlot {
                factor_id,
                weight,
                enabled,
            })
            .collect();

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            factors,
            standardize,
            universe,
            top_n,
        })
    }

    /// Enabled slots in definition order.
    pub fn enabled_factors(&self) -> Vec<&FactorSlot> {
        self.factors.iter().filter(|f| f.enabled).collect()
    }
}

/// L1-normalize a weight vector: Σ|w| = 1. Signs are preserved so a
/// negative weight stays a hedge.
pub fn normalize_l1(weights: &[f64]) -> Result<Vec<f64>, WeightError> {
    if weights.is_empty() {
        return Err(WeightError::Empty);
    }
    let total: f64 = weights.iter().map(|w| w.abs()).sum();
    if total == 0.0 {
        return Err(WeightError::AllZero);
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

/// Read-only definition lookup.
pub trait DefinitionStore: Send + Sync {
    fn factor(&self, id: &str) -> Option<Arc<FactorDefinition>>;
    fn strategy(&self, id: &str) -> Option<Arc<StrategyDefinition>>;
}

/// In-memory store for tests, demos, and embedding callers.
#[derive(Debug, Default)]
pub struct InMemoryDefinitions {
    factors: BTreeMap<String, Arc<FactorDefinition>>,
    strategies: BTreeMap<String, Arc<StrategyDefinition>>,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_factor(&mut self, factor: FactorDefinition) {
        self.factors.insert(factor.id.clone(), Arc::new(factor));
    }

    pub fn insert_strategy(&mut self, strategy: StrategyDefinition) {
        self.strategies
            .insert(strategy.id.clone(), Arc::new(strategy));
    }
}

impl DefinitionStore for InMemoryDefinitions {
    fn factor(&self, id: &str) -> Option<Arc<FactorDefinition>> {
        self.factors.get(id).cloned()
    }

    fn strategy(&self, id: &str) -> Option<Arc<StrategyDefinition>> {
        self.strategies.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l1_normalization_sums_to_one() {
        let w = normalize_l1(&[2.0, 1.0, 1.0]).unwrap();
        assert!((w.iter().map(|x| x.abs()).sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((w[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn l1_preserves_signs() {
        let w = normalize_l1(&[3.0, -1.0]).unwrap();
        assert!((w[0] - 0.75).abs() < 1e-12);
        assert!((w[1] + 0.25).abs() < 1e-12);
        assert!((w.iter().map(|x| x.abs()).sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn all_zero_weights_fail_explicitly() {
        assert_eq!(normalize_l1(&[0.0, 0.0]).unwrap_err(), WeightError::AllZero);
        assert_eq!(normalize_l1(&[]).unwrap_err(), WeightError::Empty);
    }

    #[test]
    fn strategy_persists_normalized_weights() {
        let strategy = StrategyDefinition::new(
            "s1",
            "demo",
            vec![
                ("f1".into(), 3.0, true),
                ("f2".into(), 1.0, true),
                ("f3".into(), 4.0, false),
            ],
            StandardizeConfig::default(),
            UniverseFilter::All,
            10,
        )
        .unwrap();

        let total: f64 = strategy.factors.iter().map(|f| f.weight.abs()).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(strategy.enabled_factors().len(), 2);
    }

    #[test]
    fn non_finite_weight_is_rejected() {
        let err = StrategyDefinition::new(
            "s1",
            "demo",
            vec![("f1".into(), f64::NAN, true)],
            StandardizeConfig::default(),
            UniverseFilter::All,
            10,
        )
        .unwrap_err();
        assert!(matches!(err, WeightError::NotFinite { .. }));
    }

    #[test]
    fn store_roundtrip() {
        let mut store = InMemoryDefinitions::new();
        store.insert_factor(FactorDefinition {
            id: "f1".into(),
            name: "cheap".into(),
            code: "fn f(data, params) { -data[\"pe\"] }".into(),
            fields_used: vec!["pe".into()],
            direction: Direction::HigherIsBetter,
            selection: SelectionSpec::single("valuation", &["pe"]),
            params: BTreeMap::new(),
        });

        assert!(store.factor("f1").is_some());
        assert!(store.factor("f2").is_none());
        assert!(store.strategy("s1").is_none());
    }
}
