//! Columnar factor frame — the tabular currency of the fetch layer,
//! executor, and standardizer.
//!
//! A frame is a set of rows keyed by (entity, date) with named f64 columns.
//! Missing cells are strict NaN (no forward-fill of fetched data). Frames
//! from different sources are merged on the join keys with a union of rows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Entity identifier (ticker/security id). Ordered so tie-breaks are
/// deterministic everywhere.
pub type EntityId = String;

/// A columnar table: parallel row-key vectors plus named value columns.
///
/// Invariant: every column has exactly `len()` values, aligned with
/// `entities` and `dates`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactorFrame {
    pub entities: Vec<EntityId>,
    pub dates: Vec<NaiveDate>,
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl FactorFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Column names in deterministic order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(|s| s.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    /// Append one row. Columns absent from `values` get NaN.
    pub fn push_row(&mut self, entity: &str, date: NaiveDate, values: &BTreeMap<String, f64>) {
        self.entities.push(entity.to_string());
        self.dates.push(date);
        for (name, col) in &mut self.columns {
            col.push(values.get(name).copied().unwrap_or(f64::NAN));
        }
        for (name, value) in values {
            if !self.columns.contains_key(name) {
                let mut col = vec![f64::NAN; self.entities.len() - 1];
                col.push(*value);
                self.columns.insert(name.clone(), col);
            }
        }
    }

    /// Distinct entities, sorted ascending.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        let set: BTreeSet<&EntityId> = self.entities.iter().collect();
        set.into_iter().cloned().collect()
    }

    /// Distinct dates, sorted ascending.
    pub fn date_axis(&self) -> Vec<NaiveDate> {
        let set: BTreeSet<NaiveDate> = self.dates.iter().copied().collect();
        set.into_iter().collect()
    }

    /// Extract one entity's rows as date-sorted per-field column vectors,
    /// aligned to the given date axis (NaN where the entity has no row).
    ///
    /// This is the view the sandboxed executor sees: one column vector per
    /// field, all the same length as `axis`.
    pub fn entity_view(&self, entity: &str, axis: &[NaiveDate]) -> EntityView {
        let mut row_for_date: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for (i, (e, d)) in self.entities.iter().zip(&self.dates).enumerate() {
            if e == entity {
                row_for_date.insert(*d, i);
            }
        }

        let mut fields = BTreeMap::new();
        for (name, col) in &self.columns {
            let series: Vec<f64> = axis
                .iter()
                .map(|d| row_for_date.get(d).map(|&i| col[i]).unwrap_or(f64::NAN))
                .collect();
            fields.insert(name.clone(), series);
        }

        EntityView {
            entity: entity.to_string(),
            dates: axis.to_vec(),
            fields,
        }
    }

    /// Merge another frame into this one on (entity, date).
    ///
    /// Rows present in either side survive; columns are unioned. Where both
    /// sides define the same column for the same row, `other` wins (later
    /// sources overwrite — the resolver rejects overlapping field sets, so
    /// this only matters for the join keys themselves).
    pub fn merge(&mut self, other: &FactorFrame) {
        let mut index: BTreeMap<(EntityId, NaiveDate), usize> = BTreeMap::new();
        for (i, (e, d)) in self.entities.iter().zip(&self.dates).enumerate() {
            index.insert((e.clone(), *d), i);
        }

        for name in other.columns.keys() {
            if !self.columns.contains_key(name) {
                self.columns
                    .insert(name.clone(), vec![f64::NAN; self.entities.len()]);
            }
        }

        for (j, (e, d)) in other.entities.iter().zip(&other.dates).enumerate() {
            let row = match index.get(&(e.clone(), *d)) {
                Some(&i) => i,
                None => {
                    self.entities.push(e.clone());
                    self.dates.push(*d);
                    for col in self.columns.values_mut() {
                        col.push(f64::NAN);
                    }
                    let i = self.entities.len() - 1;
                    index.insert((e.clone(), *d), i);
                    i
                }
            };
            for (name, col) in &other.columns {
                let dst = self.columns.get_mut(name).unwrap();
                dst[row] = col[j];
            }
        }
    }

    /// Sort rows by (entity, date) ascending for deterministic output.
    pub fn sort_rows(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| {
            (&self.entities[a], self.dates[a]).cmp(&(&self.entities[b], self.dates[b]))
        });

        self.entities = order.iter().map(|&i| self.entities[i].clone()).collect();
        self.dates = order.iter().map(|&i| self.dates[i]).collect();
        for col in self.columns.values_mut() {
            *col = order.iter().map(|&i| col[i]).collect();
        }
    }
}

/// One entity's rows as aligned per-field series.
#[derive(Debug, Clone)]
pub struct EntityView {
    pub entity: EntityId,
    pub dates: Vec<NaiveDate>,
    pub fields: BTreeMap<String, Vec<f64>>,
}

impl EntityView {
    pub fn field(&self, name: &str) -> Option<&[f64]> {
        self.fields.get(name).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// True when every cell of every field is NaN — the entity fetched
    /// nothing usable.
    pub fn is_all_missing(&self) -> bool {
        self.fields
            .values()
            .all(|col| col.iter().all(|v| v.is_nan()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn row(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn push_row_backfills_new_columns_with_nan() {
        let mut f = FactorFrame::new();
        f.push_row("AAA", d("2024-01-02"), &row(&[("pe", 10.0)]));
        f.push_row("BBB", d("2024-01-02"), &row(&[("pe", 20.0), ("mcap", 5.0)]));

        assert_eq!(f.len(), 2);
        assert_eq!(f.column("pe").unwrap(), &[10.0, 20.0]);
        assert!(f.column("mcap").unwrap()[0].is_nan());
        assert_eq!(f.column("mcap").unwrap()[1], 5.0);
    }

    #[test]
    fn entity_view_aligns_to_axis_with_nan_gaps() {
        let mut f = FactorFrame::new();
        f.push_row("AAA", d("2024-01-02"), &row(&[("pe", 10.0)]));
        f.push_row("AAA", d("2024-01-04"), &row(&[("pe", 12.0)]));

        let axis = vec![d("2024-01-02"), d("2024-01-03"), d("2024-01-04")];
        let view = f.entity_view("AAA", &axis);

        let pe = view.field("pe").unwrap();
        assert_eq!(pe[0], 10.0);
        assert!(pe[1].is_nan());
        assert_eq!(pe[2], 12.0);
    }

    #[test]
    fn merge_unions_rows_and_columns() {
        let mut left = FactorFrame::new();
        left.push_row("AAA", d("2024-01-02"), &row(&[("pe", 10.0)]));
        left.push_row("BBB", d("2024-01-02"), &row(&[("pe", 20.0)]));

        let mut right = FactorFrame::new();
        right.push_row("AAA", d("2024-01-02"), &row(&[("momentum", 0.5)]));
        right.push_row("CCC", d("2024-01-02"), &row(&[("momentum", -0.1)]));

        left.merge(&right);
        left.sort_rows();

        assert_eq!(left.len(), 3);
        assert_eq!(left.entity_ids(), vec!["AAA", "BBB", "CCC"]);
        assert_eq!(left.column("momentum").unwrap()[0], 0.5);
        // BBB never appeared on the right — momentum stays NaN
        assert!(left.column("momentum").unwrap()[1].is_nan());
        // CCC never appeared on the left — pe stays NaN
        assert!(left.column("pe").unwrap()[2].is_nan());
    }

    #[test]
    fn all_missing_view_detected() {
        let mut f = FactorFrame::new();
        f.push_row("AAA", d("2024-01-02"), &row(&[("pe", 10.0)]));

        let axis = vec![d("2024-01-02")];
        let view = f.entity_view("ZZZ", &axis);
        assert!(view.is_all_missing());
    }
}
