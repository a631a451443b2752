//! Composite scoring and ranking.
//!
//! A composite score is the weighted sum of standardized factor values for
//! one entity at one timestamp. When a factor failed for an entity, the
//! surviving factors' weights renormalize (L1) over the surviving subset
//! for that entity only. Ranking is descending by score with ties broken
//! by entity id ascending, so output order is deterministic.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use ranklab_core::frame::EntityId;

/// One factor's standardized cross-section at the scoring timestamp.
#[derive(Debug, Clone)]
pub struct StandardizedFactor {
    pub factor_id: String,
    /// The strategy-level normalized weight.
    pub weight: f64,
    /// Standardized value per entity; entities the factor failed for are
    /// simply absent (or NaN, treated the same).
    pub values: BTreeMap<EntityId, f64>,
}

/// One ranked output row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeScoreRow {
    pub entity_id: EntityId,
    pub date: NaiveDate,
    pub score: f64,
    /// 1-based, assigned after the descending sort.
    pub rank: usize,
    /// Per-factor contribution: renormalized weight × standardized value.
    pub contributions: BTreeMap<String, f64>,
}

/// Terminal payload of a completed run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutcome {
    pub as_of: Option<NaiveDate>,
    pub top_n: Vec<CompositeScoreRow>,
    pub entities_scored: usize,
    pub entities_excluded: usize,
    pub factor_failures: usize,
}

/// Score every entity that has at least one surviving factor.
///
/// Entities with zero surviving factors are excluded entirely — the caller
/// counts them via the difference against its universe.
pub fn composite_scores(
    factors: &[StandardizedFactor],
    entities: &[EntityId],
    date: NaiveDate,
) -> Vec<CompositeScoreRow> {
    let mut rows = Vec::new();

    for entity in entities {
        let surviving: Vec<(&StandardizedFactor, f64)> = factors
            .iter()
            .filter_map(|f| {
                f.values
                    .get(entity)
                    .copied()
                    .filter(|v| v.is_finite())
                    .map(|v| (f, v))
            })
            .collect();

        if surviving.is_empty() {
            continue;
        }

        // Renormalize the surviving weights for this entity only.
        let weight_total: f64 = surviving.iter().map(|(f, _)| f.weight.abs()).sum();
        if weight_total == 0.0 {
            continue;
        }

        let mut score = 0.0;
        let mut contributions = BTreeMap::new();
        for (factor, value) in &surviving {
            let weight = factor.weight / weight_total;
            let contribution = weight * value;
            score += contribution;
            contributions.insert(factor.factor_id.clone(), contribution);
        }

        rows.push(CompositeScoreRow {
            entity_id: entity.clone(),
            date,
            score,
            rank: 0,
            contributions,
        });
    }

    rows
}

/// Sort descending by score (ties: entity id ascending) and assign 1-based
/// ranks.
pub fn rank_rows(mut rows: Vec<CompositeScoreRow>) -> Vec<CompositeScoreRow> {
    rows.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = i + 1;
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    fn factor(id: &str, weight: f64, values: &[(&str, f64)]) -> StandardizedFactor {
        StandardizedFactor {
            factor_id: id.into(),
            weight,
            values: values
                .iter()
                .map(|(e, v)| (e.to_string(), *v))
                .collect(),
        }
    }

    fn entities(ids: &[&str]) -> Vec<EntityId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_factor_score_equals_standardized_value() {
        let factors = vec![factor("f1", 1.0, &[("AAA", 0.7)])];
        let rows = composite_scores(&factors, &entities(&["AAA"]), date());
        assert_eq!(rows.len(), 1);
        assert!((rows[0].score - 0.7).abs() < 1e-12);
    }

    #[test]
    fn weights_renormalize_over_surviving_subset() {
        // Factor f2 failed for AAA: its score comes from f1 alone at
        // renormalized weight 1.0. BBB uses both at 0.5 each.
        let factors = vec![
            factor("f1", 0.5, &[("AAA", 2.0), ("BBB", 1.0)]),
            factor("f2", 0.5, &[("BBB", 3.0)]),
        ];
        let rows = composite_scores(&factors, &entities(&["AAA", "BBB"]), date());

        let aaa = rows.iter().find(|r| r.entity_id == "AAA").unwrap();
        assert!((aaa.score - 2.0).abs() < 1e-12);
        assert_eq!(aaa.contributions.len(), 1);

        let bbb = rows.iter().find(|r| r.entity_id == "BBB").unwrap();
        assert!((bbb.score - 2.0).abs() < 1e-12);
        assert!((bbb.contributions["f1"] - 0.5).abs() < 1e-12);
        assert!((bbb.contributions["f2"] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn entity_with_no_surviving_factors_is_excluded() {
        let factors = vec![factor("f1", 1.0, &[("AAA", 1.0), ("BBB", f64::NAN)])];
        let rows = composite_scores(&factors, &entities(&["AAA", "BBB", "CCC"]), date());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, "AAA");
    }

    #[test]
    fn contributions_sum_to_score() {
        let factors = vec![
            factor("f1", 0.6, &[("AAA", 1.5)]),
            factor("f2", -0.4, &[("AAA", 2.0)]),
        ];
        let rows = composite_scores(&factors, &entities(&["AAA"]), date());
        let total: f64 = rows[0].contributions.values().sum();
        assert!((total - rows[0].score).abs() < 1e-12);
    }

    #[test]
    fn ranking_descends_with_entity_tiebreak() {
        let rows = vec![
            CompositeScoreRow {
                entity_id: "ZED".into(),
                date: date(),
                score: 1.0,
                rank: 0,
                contributions: BTreeMap::new(),
            },
            CompositeScoreRow {
                entity_id: "ALF".into(),
                date: date(),
                score: 1.0,
                rank: 0,
                contributions: BTreeMap::new(),
            },
            CompositeScoreRow {
                entity_id: "MID".into(),
                date: date(),
                score: 2.0,
                rank: 0,
                contributions: BTreeMap::new(),
            },
        ];
        let ranked = rank_rows(rows);
        let order: Vec<&str> = ranked.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(order, vec!["MID", "ALF", "ZED"]);
        assert_eq!(
            ranked.iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }
}
