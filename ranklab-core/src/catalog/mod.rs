//! Data-source catalog — declarative descriptors of what can be fetched.
//!
//! A [`DataSourceDescriptor`] names a source, its time axis, the fields it
//! declares, its parameter schema, and its rate-limit policy. Descriptors
//! are immutable once registered. The catalog itself is read-only from this
//! crate's point of view — registration happens at bootstrap, lookups
//! happen everywhere else.

mod resolve;
mod selection;

pub use resolve::{resolve, FetchPlan, ResolveError, SourceFetch};
pub use selection::{ParamBinding, RequestArgs, SelectionSpec, SourceSelection};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Primary time dimension of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// One row per entity per calendar date.
    Daily,
    /// One row per entity per fiscal quarter (keyed by report date).
    Quarterly,
}

/// Schema of one declared parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSchema {
    pub name: String,
    pub required: bool,
    /// Default applied when the param is optional and unbound.
    pub default: Option<String>,
}

/// Rate-limit policy for a source: sustained queries/sec plus burst room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatePolicy {
    pub qps: f64,
    pub burst: f64,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            qps: 4.0,
            burst: 8.0,
        }
    }
}

/// Immutable description of one fetchable data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub name: String,
    pub axis: Axis,
    /// Declared field set. Selections may only request fields from this set.
    pub fields: Vec<String>,
    #[serde(default)]
    pub params: Vec<ParamSchema>,
    #[serde(default)]
    pub rate: RatePolicy,
    /// Maximum entity ids per provider call.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

fn default_max_batch() -> usize {
    50
}

impl DataSourceDescriptor {
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    pub fn param(&self, name: &str) -> Option<&ParamSchema> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Read-only descriptor lookup. The record-management layer that registers
/// and edits descriptors lives outside this crate.
pub trait CatalogStore: Send + Sync {
    fn get(&self, source: &str) -> Option<Arc<DataSourceDescriptor>>;
    fn source_names(&self) -> Vec<String>;
}

/// In-memory catalog, seeded programmatically or from TOML.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    sources: BTreeMap<String, Arc<DataSourceDescriptor>>,
}

/// TOML document shape: `[[source]]` tables.
#[derive(Debug, Deserialize)]
struct CatalogDoc {
    #[serde(rename = "source")]
    sources: Vec<DataSourceDescriptor>,
}

impl InMemoryCatalog {
    pub fn new(descriptors: Vec<DataSourceDescriptor>) -> Self {
        let sources = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect();
        Self { sources }
    }

    /// Parse a catalog from a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, String> {
        let doc: CatalogDoc =
            toml::from_str(content).map_err(|e| format!("parse catalog TOML: {e}"))?;
        Ok(Self::new(doc.sources))
    }

    /// A small built-in catalog used by the CLI demo and tests.
    pub fn default_demo() -> Self {
        Self::new(vec![
            DataSourceDescriptor {
                name: "valuation".into(),
                axis: Axis::Daily,
                fields: vec![
                    "pe".into(),
                    "pb".into(),
                    "dividend_yield".into(),
                    "market_cap".into(),
                ],
                params: vec![ParamSchema {
                    name: "date".into(),
                    required: true,
                    default: None,
                }],
                rate: RatePolicy::default(),
                max_batch: 50,
            },
            DataSourceDescriptor {
                name: "price_history".into(),
                axis: Axis::Daily,
                fields: vec!["close".into(), "volume".into(), "turnover".into()],
                params: vec![
                    ParamSchema {
                        name: "date".into(),
                        required: true,
                        default: None,
                    },
                    ParamSchema {
                        name: "lookback_days".into(),
                        required: false,
                        default: Some("20".into()),
                    },
                ],
                rate: RatePolicy {
                    qps: 8.0,
                    burst: 16.0,
                },
                max_batch: 100,
            },
        ])
    }
}

impl CatalogStore for InMemoryCatalog {
    fn get(&self, source: &str) -> Option<Arc<DataSourceDescriptor>> {
        self.sources.get(source).cloned()
    }

    fn source_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }
}
