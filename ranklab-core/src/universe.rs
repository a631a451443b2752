//! Universe configuration — category-organized entity lists.
//!
//! The universe is stored as a TOML config mapping categories (industries)
//! to their member entities. A run narrows it through a [`UniverseFilter`]
//! with fixed precedence: an explicit id list beats a category filter,
//! which beats "all entities". Exactly one of the three applies per run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::frame::EntityId;

/// The complete universe: category name → member entity ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Universe {
    pub categories: BTreeMap<String, Vec<EntityId>>,
}

/// How a run narrows the universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UniverseFilter {
    /// Explicit entity-id list (highest precedence).
    Explicit { ids: Vec<EntityId> },
    /// All members of one category.
    Category { name: String },
    /// Every known entity (lowest precedence).
    All,
}

impl Universe {
    /// Load a universe from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("read universe file: {e}"))?;
        Self::from_toml(&content)
    }

    /// Parse a universe from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("parse universe TOML: {e}"))
    }

    /// All entity ids across all categories, sorted and deduplicated.
    pub fn all_entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.categories.values().flatten().cloned().collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn category_entities(&self, category: &str) -> Option<&[EntityId]> {
        self.categories.get(category).map(|v| v.as_slice())
    }

    pub fn entity_count(&self) -> usize {
        self.categories.values().map(|v| v.len()).sum()
    }

    /// Apply a filter, returning the selected entities sorted ascending.
    ///
    /// Explicit ids are intersected with the known universe — unknown ids
    /// do not survive into a run. An unknown category yields an empty set
    /// (the orchestrator turns that into a fatal empty-universe error).
    pub fn apply_filter(&self, filter: &UniverseFilter) -> Vec<EntityId> {
        match filter {
            UniverseFilter::Explicit { ids } => {
                let known = self.all_entities();
                let mut selected: Vec<EntityId> = ids
                    .iter()
                    .filter(|id| known.binary_search(id).is_ok())
                    .cloned()
                    .collect();
                selected.sort();
                selected.dedup();
                selected
            }
            UniverseFilter::Category { name } => {
                let mut selected: Vec<EntityId> = self
                    .category_entities(name)
                    .map(|ids| ids.to_vec())
                    .unwrap_or_default();
                selected.sort();
                selected.dedup();
                selected
            }
            UniverseFilter::All => self.all_entities(),
        }
    }

    /// A small built-in universe used by the CLI demo and tests.
    pub fn default_demo() -> Self {
        let mut categories = BTreeMap::new();
        categories.insert(
            "technology".into(),
            vec!["AAPL", "MSFT", "NVDA", "CRM", "ORCL"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        categories.insert(
            "energy".into(),
            vec!["XOM", "CVX", "COP", "SLB"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        categories.insert(
            "finance".into(),
            vec!["JPM", "BAC", "GS", "MS", "BLK"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        Self { categories }
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("serialize universe: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_entities_sorted_dedup() {
        let u = Universe::default_demo();
        let all = u.all_entities();
        assert!(all.windows(2).all(|w| w[0] < w[1]));
        assert!(all.contains(&"AAPL".to_string()));
        assert_eq!(all.len(), u.entity_count());
    }

    #[test]
    fn explicit_filter_intersects_with_known() {
        let u = Universe::default_demo();
        let filter = UniverseFilter::Explicit {
            ids: vec!["AAPL".into(), "UNKNOWN".into(), "XOM".into()],
        };
        assert_eq!(u.apply_filter(&filter), vec!["AAPL", "XOM"]);
    }

    #[test]
    fn category_filter_selects_members() {
        let u = Universe::default_demo();
        let filter = UniverseFilter::Category {
            name: "energy".into(),
        };
        let got = u.apply_filter(&filter);
        assert_eq!(got, vec!["COP", "CVX", "SLB", "XOM"]);
    }

    #[test]
    fn unknown_category_yields_empty() {
        let u = Universe::default_demo();
        let filter = UniverseFilter::Category {
            name: "utilities".into(),
        };
        assert!(u.apply_filter(&filter).is_empty());
    }

    #[test]
    fn toml_roundtrip() {
        let u = Universe::default_demo();
        let doc = u.to_toml().unwrap();
        let parsed = Universe::from_toml(&doc).unwrap();
        assert_eq!(u.all_entities(), parsed.all_entities());
    }
}
