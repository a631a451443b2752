//! Selection resolution — binds a declarative selection against the catalog
//! into a concrete fetch plan.
//!
//! Resolution is all-or-nothing: any unknown field or unbound required
//! parameter rejects the whole selection with the offending name. Nothing
//! is auto-corrected or silently dropped.

use super::selection::{ParamBinding, RequestArgs, SelectionSpec};
use super::{CatalogStore, DataSourceDescriptor};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Resolution failures, each naming the offender.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown source '{source_name}'")]
    UnknownSource { source_name: String },

    #[error("unknown field '{field}' on source '{source_name}'")]
    UnknownField { source_name: String, field: String },

    #[error("missing required param '{param}' on source '{source_name}'")]
    MissingRequiredParam { source_name: String, param: String },

    #[error("param '{param}' on source '{source_name}' is bound to request arg '{arg}' which was not supplied")]
    UnboundRequestParam {
        source_name: String,
        param: String,
        arg: String,
    },

    #[error("unknown derive rule '{rule}' for param '{param}' on source '{source_name}'")]
    UnknownDeriveRule {
        source_name: String,
        param: String,
        rule: String,
    },

    #[error("selection requests no fields")]
    EmptySelection,
}

/// One source's resolved fetch: descriptor plus canonical param map.
#[derive(Debug, Clone)]
pub struct SourceFetch {
    pub descriptor: Arc<DataSourceDescriptor>,
    pub fields: Vec<String>,
    /// Sorted canonical params — the cache-key input.
    pub params: BTreeMap<String, String>,
}

/// A resolved, catalog-checked plan ready for the fetcher.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub fetches: Vec<SourceFetch>,
    pub join_keys: Vec<String>,
}

impl FetchPlan {
    /// Union of fields across all fetches, sorted.
    pub fn all_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .fetches
            .iter()
            .flat_map(|f| f.fields.iter().cloned())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

/// Resolve a selection against the catalog.
pub fn resolve(
    catalog: &dyn CatalogStore,
    selection: &SelectionSpec,
    args: &RequestArgs,
) -> Result<FetchPlan, ResolveError> {
    if selection.sources.iter().all(|s| s.fields.is_empty()) {
        return Err(ResolveError::EmptySelection);
    }

    let mut fetches = Vec::with_capacity(selection.sources.len());

    for sel in &selection.sources {
        let descriptor =
            catalog
                .get(&sel.source)
                .ok_or_else(|| ResolveError::UnknownSource {
                    source_name: sel.source.clone(),
                })?;

        for field in &sel.fields {
            if !descriptor.has_field(field) {
                return Err(ResolveError::UnknownField {
                    source_name: sel.source.clone(),
                    field: field.clone(),
                });
            }
        }

        let mut params = BTreeMap::new();
        for schema in &descriptor.params {
            match sel.params.get(&schema.name) {
                Some(binding) => {
                    let value = bind_param(&sel.source, &schema.name, binding, args)?;
                    params.insert(schema.name.clone(), value);
                }
                None => {
                    if let Some(default) = &schema.default {
                        params.insert(schema.name.clone(), default.clone());
                    } else if schema.required {
                        return Err(ResolveError::MissingRequiredParam {
                            source_name: sel.source.clone(),
                            param: schema.name.clone(),
                        });
                    }
                }
            }
        }

        fetches.push(SourceFetch {
            descriptor,
            fields: sel.fields.clone(),
            params,
        });
    }

    Ok(FetchPlan {
        fetches,
        join_keys: selection.join_keys.clone(),
    })
}

fn bind_param(
    source: &str,
    param: &str,
    binding: &ParamBinding,
    args: &RequestArgs,
) -> Result<String, ResolveError> {
    match binding {
        ParamBinding::Fixed { value } => Ok(value.clone()),
        ParamBinding::Request { arg } => {
            args.get(arg)
                .map(str::to_string)
                .ok_or_else(|| ResolveError::UnboundRequestParam {
                    source_name: source.to_string(),
                    param: param.to_string(),
                    arg: arg.clone(),
                })
        }
        ParamBinding::Derived { arg, rule } => {
            let base = args
                .get(arg)
                .ok_or_else(|| ResolveError::UnboundRequestParam {
                    source_name: source.to_string(),
                    param: param.to_string(),
                    arg: arg.clone(),
                })?;
            apply_derive_rule(rule, base).ok_or_else(|| ResolveError::UnknownDeriveRule {
                source_name: source.to_string(),
                param: param.to_string(),
                rule: rule.clone(),
            })
        }
    }
}

/// The closed set of derive rules. `identity` passes through; the calendar
/// rules reshape an ISO date arg.
fn apply_derive_rule(rule: &str, base: &str) -> Option<String> {
    match rule {
        "identity" => Some(base.to_string()),
        "year_of" => base.split('-').next().map(str::to_string),
        "prev_year" => {
            let year: i64 = base.split('-').next()?.parse().ok()?;
            Some((year - 1).to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;

    fn demo_selection() -> SelectionSpec {
        SelectionSpec::single("valuation", &["pe", "pb"]).with_param(
            "valuation",
            "date",
            ParamBinding::Request { arg: "date".into() },
        )
    }

    #[test]
    fn resolves_known_fields_and_params() {
        let cat = InMemoryCatalog::default_demo();
        let args = RequestArgs::new().with("date", "2024-01-01");

        let plan = resolve(&cat, &demo_selection(), &args).unwrap();
        assert_eq!(plan.fetches.len(), 1);
        assert_eq!(plan.fetches[0].params.get("date").unwrap(), "2024-01-01");
        assert_eq!(plan.all_fields(), vec!["pb", "pe"]);
    }

    #[test]
    fn unknown_field_is_rejected_by_name() {
        let cat = InMemoryCatalog::default_demo();
        let spec = SelectionSpec::single("valuation", &["pe", "ebitda"]);
        let err = resolve(&cat, &spec, &RequestArgs::new()).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownField {
                source_name: "valuation".into(),
                field: "ebitda".into()
            }
        );
    }

    #[test]
    fn unknown_source_is_rejected() {
        let cat = InMemoryCatalog::default_demo();
        let spec = SelectionSpec::single("fundamentals", &["roe"]);
        let err = resolve(&cat, &spec, &RequestArgs::new()).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownSource { .. }));
    }

    #[test]
    fn missing_required_param_is_rejected() {
        let cat = InMemoryCatalog::default_demo();
        // No binding for the required "date" param.
        let spec = SelectionSpec::single("valuation", &["pe"]);
        let err = resolve(&cat, &spec, &RequestArgs::new()).unwrap_err();
        assert_eq!(
            err,
            ResolveError::MissingRequiredParam {
                source_name: "valuation".into(),
                param: "date".into()
            }
        );
    }

    #[test]
    fn unbound_request_arg_is_rejected() {
        let cat = InMemoryCatalog::default_demo();
        let err = resolve(&cat, &demo_selection(), &RequestArgs::new()).unwrap_err();
        assert!(matches!(err, ResolveError::UnboundRequestParam { .. }));
    }

    #[test]
    fn optional_param_default_applies() {
        let cat = InMemoryCatalog::default_demo();
        let spec = SelectionSpec::single("price_history", &["close"]).with_param(
            "price_history",
            "date",
            ParamBinding::Fixed {
                value: "2024-01-01".into(),
            },
        );
        let plan = resolve(&cat, &spec, &RequestArgs::new()).unwrap();
        assert_eq!(plan.fetches[0].params.get("lookback_days").unwrap(), "20");
    }

    #[test]
    fn derived_binding_applies_rule() {
        let cat = InMemoryCatalog::default_demo();
        let spec = SelectionSpec::single("valuation", &["pe"]).with_param(
            "valuation",
            "date",
            ParamBinding::Derived {
                arg: "date".into(),
                rule: "identity".into(),
            },
        );
        let args = RequestArgs::new().with("date", "2024-06-30");
        let plan = resolve(&cat, &spec, &args).unwrap();
        assert_eq!(plan.fetches[0].params.get("date").unwrap(), "2024-06-30");
    }
}
