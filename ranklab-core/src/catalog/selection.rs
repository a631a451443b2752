//! Selection specs — the declarative binding between a factor's data needs
//! and the catalog.
//!
//! A selection lists, per source, which declared fields it wants and how
//! each declared parameter is bound: a fixed literal, supplied by the run
//! request, or derived from another binding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a source parameter gets its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamBinding {
    /// Bound at selection-authoring time to a literal.
    Fixed { value: String },
    /// Supplied by the caller's request args at resolution time.
    Request { arg: String },
    /// Derived from another request arg by a named rule
    /// (e.g. `prev_quarter_end` of the request date).
    Derived { arg: String, rule: String },
}

/// Arguments supplied with a run/test request, consumed by `Request` and
/// `Derived` bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestArgs {
    pub values: BTreeMap<String, String>,
}

impl RequestArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }
}

/// One source's slice of a selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSelection {
    pub source: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, ParamBinding>,
}

/// A full selection: one or more sources joined on the common keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSpec {
    pub sources: Vec<SourceSelection>,
    /// Join keys shared by every fetched table. Always entity + date here;
    /// kept explicit so the executor's output contract can name them.
    pub join_keys: Vec<String>,
}

impl SelectionSpec {
    /// A single-source selection with the default join keys.
    pub fn single(source: &str, fields: &[&str]) -> Self {
        Self {
            sources: vec![SourceSelection {
                source: source.to_string(),
                fields: fields.iter().map(|f| f.to_string()).collect(),
                params: BTreeMap::new(),
            }],
            join_keys: vec!["entity_id".into(), "date".into()],
        }
    }

    pub fn with_param(mut self, source: &str, name: &str, binding: ParamBinding) -> Self {
        if let Some(sel) = self.sources.iter_mut().find(|s| s.source == source) {
            sel.params.insert(name.to_string(), binding);
        }
        self
    }

    /// Union of requested fields across all sources, sorted.
    pub fn all_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .sources
            .iter()
            .flat_map(|s| s.fields.iter().cloned())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.sources.iter().any(|s| s.fields.iter().any(|f| f == field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_fields_unions_and_sorts() {
        let mut spec = SelectionSpec::single("valuation", &["pe", "pb"]);
        spec.sources.push(SourceSelection {
            source: "price_history".into(),
            fields: vec!["close".into(), "pe".into()],
            params: BTreeMap::new(),
        });

        assert_eq!(spec.all_fields(), vec!["close", "pb", "pe"]);
        assert!(spec.contains_field("close"));
        assert!(!spec.contains_field("volume"));
    }

    #[test]
    fn request_args_lookup() {
        let args = RequestArgs::new().with("date", "2024-01-01");
        assert_eq!(args.get("date"), Some("2024-01-01"));
        assert_eq!(args.get("missing"), None);
    }
}
