//! Static safety analysis of submitted factor code.
//!
//! Validation is all-or-nothing: every violation found is reported, and a
//! report with any violation carries `ok = false` and an empty `fields_used`
//! (never a partially-valid result). The checks:
//!
//! - exactly one function, taking exactly two parameters (the data mapping
//!   and the parameters mapping)
//! - imports restricted to the two-item allow-list (`series`, `math`)
//! - no namespace access implying filesystem, network, subprocess,
//!   reflection, or dynamic-import capability — deny by default
//! - every call target exists in the imported library with the right arity
//! - every key indexing the data mapping is a field of the selection
//! - identifiers resolve to `let` bindings or the two parameters

use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

use super::ast::{Expr, FnDef, Program};
use super::interp::Builtin;
use super::parser::parse_program;
use crate::catalog::SelectionSpec;

/// The two importable libraries. Everything else is denied.
pub const ALLOWED_MODULES: [&str; 2] = ["series", "math"];

/// Namespace roots that imply an ambient capability. Named individually in
/// errors so a rejected submission says *why*, not just "unknown module".
const CAPABILITY_ROOTS: [(&str, &str); 16] = [
    ("fs", "filesystem"),
    ("file", "filesystem"),
    ("io", "filesystem"),
    ("path", "filesystem"),
    ("net", "network"),
    ("http", "network"),
    ("socket", "network"),
    ("url", "network"),
    ("proc", "subprocess"),
    ("process", "subprocess"),
    ("cmd", "subprocess"),
    ("shell", "subprocess"),
    ("sys", "process environment"),
    ("env", "process environment"),
    ("reflect", "reflection"),
    ("eval", "dynamic import"),
];

/// One validation violation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    #[error("syntax error at line {line}, column {column}: {message}")]
    Parse {
        message: String,
        line: usize,
        column: usize,
    },

    #[error("no function definition found; exactly one is required")]
    NoFunction,

    #[error("{count} function definitions found; exactly one is required")]
    MultipleFunctions { count: usize },

    #[error("function '{function}' takes {found} parameters; the contract is (data, params)")]
    ParamContract { function: String, found: usize },

    #[error("import of '{module}' is not allowed; importable libraries are 'series' and 'math'")]
    ForbiddenImport { module: String },

    #[error("access to '{path}' denied: implies {capability} capability")]
    CapabilityDenied { path: String, capability: String },

    #[error("unknown module '{module}'")]
    UnknownModule { module: String },

    #[error("module '{module}' is used but not imported")]
    ModuleNotImported { module: String },

    #[error("unknown function '{module}::{name}'")]
    UnknownFunction { module: String, name: String },

    #[error("'{module}::{name}' takes {expected} arguments, found {found}")]
    WrongArgCount {
        module: String,
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("field '{field}' is not part of the selection")]
    FieldNotInSelection { field: String },

    #[error("'{target}' is not a mapping and cannot be indexed")]
    IndexTargetNotMapping { target: String },

    #[error("unbound identifier '{name}'")]
    UnboundIdentifier { name: String },
}

/// The validator's verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    /// Exact set of data-mapping keys statically referenced, sorted.
    /// Empty whenever `ok` is false.
    pub fields_used: Vec<String>,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn rejected(errors: Vec<ValidationIssue>) -> Self {
        Self {
            ok: false,
            fields_used: Vec::new(),
            errors,
        }
    }
}

/// Validate submitted factor code against a selection.
pub fn validate(code: &str, selection: &SelectionSpec) -> ValidationReport {
    let program = match parse_program(code) {
        Ok(p) => p,
        Err(e) => {
            return ValidationReport::rejected(vec![ValidationIssue::Parse {
                message: e.message,
                line: e.line,
                column: e.column,
            }])
        }
    };

    let mut errors = Vec::new();
    check_imports(&program, &mut errors);

    let function = match single_function(&program, &mut errors) {
        Some(f) => f,
        None => return ValidationReport::rejected(errors),
    };

    let mut checker = Checker {
        program: &program,
        selection,
        data_param: function.params.first().map(String::as_str),
        params_param: function.params.get(1).map(String::as_str),
        scope: BTreeSet::new(),
        fields_used: BTreeSet::new(),
        errors,
    };

    if function.params.len() != 2 {
        checker.errors.push(ValidationIssue::ParamContract {
            function: function.name.clone(),
            found: function.params.len(),
        });
    }

    for stmt in &function.lets {
        checker.check_expr(&stmt.expr);
        checker.scope.insert(stmt.name.clone());
    }
    checker.check_expr(&function.body);

    if checker.errors.is_empty() {
        ValidationReport {
            ok: true,
            fields_used: checker.fields_used.into_iter().collect(),
            errors: Vec::new(),
        }
    } else {
        ValidationReport::rejected(checker.errors)
    }
}

fn check_imports(program: &Program, errors: &mut Vec<ValidationIssue>) {
    for module in &program.uses {
        if !ALLOWED_MODULES.contains(&module.as_str()) {
            errors.push(ValidationIssue::ForbiddenImport {
                module: module.clone(),
            });
        }
    }
}

fn single_function<'a>(
    program: &'a Program,
    errors: &mut Vec<ValidationIssue>,
) -> Option<&'a FnDef> {
    match program.functions.len() {
        0 => {
            errors.push(ValidationIssue::NoFunction);
            None
        }
        1 => Some(&program.functions[0]),
        n => {
            errors.push(ValidationIssue::MultipleFunctions { count: n });
            None
        }
    }
}

struct Checker<'a> {
    program: &'a Program,
    selection: &'a SelectionSpec,
    data_param: Option<&'a str>,
    params_param: Option<&'a str>,
    scope: BTreeSet<String>,
    fields_used: BTreeSet<String>,
    errors: Vec<ValidationIssue>,
}

impl Checker<'_> {
    fn check_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Number(_) | Expr::Str(_) => {}
            Expr::Ident(name) => self.check_ident(name),
            Expr::Index { target, key } => self.check_index(target, key),
            Expr::Call { module, name, args } => {
                self.check_call(module, name, args.len());
                for arg in args {
                    self.check_expr(arg);
                }
            }
            Expr::Unary { operand, .. } => self.check_expr(operand),
            Expr::Binary { left, right, .. } => {
                self.check_expr(left);
                self.check_expr(right);
            }
        }
    }

    fn check_ident(&mut self, name: &str) {
        let is_param = Some(name) == self.data_param || Some(name) == self.params_param;
        if !is_param && !self.scope.contains(name) {
            self.errors.push(ValidationIssue::UnboundIdentifier {
                name: name.to_string(),
            });
        }
    }

    fn check_index(&mut self, target: &str, key: &str) {
        if Some(target) == self.data_param {
            if self.selection.contains_field(key) {
                self.fields_used.insert(key.to_string());
            } else {
                self.errors.push(ValidationIssue::FieldNotInSelection {
                    field: key.to_string(),
                });
            }
        } else if Some(target) == self.params_param {
            // Param keys are runtime data; nothing to check statically.
        } else {
            self.errors.push(ValidationIssue::IndexTargetNotMapping {
                target: target.to_string(),
            });
        }
    }

    fn check_call(&mut self, module: &str, name: &str, found_args: usize) {
        if !ALLOWED_MODULES.contains(&module) {
            if let Some((_, capability)) = CAPABILITY_ROOTS.iter().find(|(root, _)| *root == module)
            {
                self.errors.push(ValidationIssue::CapabilityDenied {
                    path: format!("{module}::{name}"),
                    capability: (*capability).to_string(),
                });
            } else {
                self.errors.push(ValidationIssue::UnknownModule {
                    module: module.to_string(),
                });
            }
            return;
        }

        if !self.program.uses.iter().any(|u| u == module) {
            self.errors.push(ValidationIssue::ModuleNotImported {
                module: module.to_string(),
            });
        }

        match Builtin::lookup(module, name) {
            Some(builtin) => {
                let expected = builtin.arity();
                if expected != found_args {
                    self.errors.push(ValidationIssue::WrongArgCount {
                        module: module.to_string(),
                        name: name.to_string(),
                        expected,
                        found: found_args,
                    });
                }
            }
            None => self.errors.push(ValidationIssue::UnknownFunction {
                module: module.to_string(),
                name: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection() -> SelectionSpec {
        SelectionSpec::single("valuation", &["pe", "pb", "market_cap"])
    }

    #[test]
    fn allowed_code_validates_with_exact_fields_used() {
        let code = r#"
            use series;
            use math;

            fn value_score(data, params) {
                let cheap = -data["pe"];
                let quality = math::sqrt(data["market_cap"]);
                cheap + quality * params["quality_weight"]
            }
        "#;
        let report = validate(code, &selection());
        assert!(report.ok, "errors: {:?}", report.errors);
        assert_eq!(report.fields_used, vec!["market_cap", "pe"]);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn scenario_negated_pe_uses_only_pe() {
        let report = validate("fn f(data, params) { -data[\"pe\"] }", &selection());
        assert!(report.ok);
        assert_eq!(report.fields_used, vec!["pe"]);
    }

    #[test]
    fn field_outside_selection_is_rejected() {
        let report = validate("fn f(data, params) { data[\"ebitda\"] }", &selection());
        assert!(!report.ok);
        assert!(report.fields_used.is_empty());
        assert_eq!(
            report.errors,
            vec![ValidationIssue::FieldNotInSelection {
                field: "ebitda".into()
            }]
        );
    }

    #[test]
    fn capability_namespaces_are_denied_by_name() {
        let code = r#"
            fn f(data, params) {
                fs::read("/etc/passwd") + net::get("api") + proc::spawn("sh")
            }
        "#;
        let report = validate(code, &selection());
        assert!(!report.ok);
        let capabilities: Vec<&str> = report
            .errors
            .iter()
            .filter_map(|e| match e {
                ValidationIssue::CapabilityDenied { capability, .. } => Some(capability.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(capabilities, vec!["filesystem", "network", "subprocess"]);
    }

    #[test]
    fn forbidden_import_is_rejected() {
        let code = "use os;\nfn f(data, params) { 1 }";
        let report = validate(code, &selection());
        assert!(!report.ok);
        assert!(report
            .errors
            .contains(&ValidationIssue::ForbiddenImport { module: "os".into() }));
    }

    #[test]
    fn unimported_allowed_module_is_flagged() {
        let code = "fn f(data, params) { math::sqrt(4) }";
        let report = validate(code, &selection());
        assert!(!report.ok);
        assert!(report
            .errors
            .contains(&ValidationIssue::ModuleNotImported {
                module: "math".into()
            }));
    }

    #[test]
    fn wrong_function_count_is_rejected() {
        let report = validate("use math;", &selection());
        assert_eq!(report.errors, vec![ValidationIssue::NoFunction]);

        let report = validate("fn a(d, p) { 1 } fn b(d, p) { 2 }", &selection());
        assert_eq!(
            report.errors,
            vec![ValidationIssue::MultipleFunctions { count: 2 }]
        );
    }

    #[test]
    fn wrong_param_count_is_rejected() {
        let report = validate("fn f(data) { 1 }", &selection());
        assert!(report.errors.contains(&ValidationIssue::ParamContract {
            function: "f".into(),
            found: 1
        }));
    }

    #[test]
    fn unknown_function_and_arity_are_checked() {
        let code = r#"
            use math;
            fn f(data, params) { math::median(1) + math::pow(2) }
        "#;
        let report = validate(code, &selection());
        assert!(report.errors.contains(&ValidationIssue::UnknownFunction {
            module: "math".into(),
            name: "median".into()
        }));
        assert!(report.errors.contains(&ValidationIssue::WrongArgCount {
            module: "math".into(),
            name: "pow".into(),
            expected: 2,
            found: 1
        }));
    }

    #[test]
    fn unbound_identifier_is_rejected() {
        let report = validate("fn f(data, params) { close }", &selection());
        assert_eq!(
            report.errors,
            vec![ValidationIssue::UnboundIdentifier {
                name: "close".into()
            }]
        );
    }

    #[test]
    fn let_bindings_resolve_in_order() {
        let code = r#"
            fn f(data, params) {
                let a = data["pe"];
                let b = a + later;
                b
            }
        "#;
        let report = validate(code, &selection());
        // `later` is never bound; `a` and `b` are fine.
        assert_eq!(
            report.errors,
            vec![ValidationIssue::UnboundIdentifier {
                name: "later".into()
            }]
        );
    }

    #[test]
    fn indexing_a_local_is_rejected() {
        let code = r#"
            fn f(data, params) {
                let x = data["pe"];
                x["pe"]
            }
        "#;
        let report = validate(code, &selection());
        assert_eq!(
            report.errors,
            vec![ValidationIssue::IndexTargetNotMapping { target: "x".into() }]
        );
    }

    #[test]
    fn syntax_error_reports_position_only() {
        let report = validate("fn f(data, params { 1 }", &selection());
        assert!(!report.ok);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], ValidationIssue::Parse { .. }));
    }
}
