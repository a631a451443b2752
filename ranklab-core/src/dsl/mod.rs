//! Factor DSL: parsing, static validation, and sandboxed execution.
//!
//! User-authored factor code is a small expression language — imports from
//! a two-item library allow-list, one function of (data, params), `let`
//! bindings, and a final expression. [`validate`] performs the full static
//! safety analysis; [`CompiledFactor`] pairs the parsed AST with its
//! `fields_used` so the orchestrator can execute it repeatedly without
//! re-parsing.

pub mod ast;
mod interp;
mod parser;
mod validate;

pub use interp::{execute, Builtin, ExecError, ExecLimits};
pub use parser::{parse_program, ParseError};
pub use validate::{validate, ValidationIssue, ValidationReport, ALLOWED_MODULES};

use std::collections::BTreeMap;

use crate::catalog::SelectionSpec;
use crate::frame::EntityView;

/// A validated factor ready for repeated execution.
#[derive(Debug, Clone)]
pub struct CompiledFactor {
    function: ast::FnDef,
    pub fields_used: Vec<String>,
}

impl CompiledFactor {
    /// Validate and compile in one step. Any validation failure returns the
    /// full report.
    pub fn compile(code: &str, selection: &SelectionSpec) -> Result<Self, ValidationReport> {
        let report = validate(code, selection);
        if !report.ok {
            return Err(report);
        }
        // Validation already parsed successfully.
        let program = parse_program(code).expect("validated code parses");
        let function = program
            .functions
            .into_iter()
            .next()
            .expect("validated code has one function");

        Ok(Self {
            function,
            fields_used: report.fields_used,
        })
    }

    /// Execute against one entity's view under the given ceilings.
    pub fn execute(
        &self,
        view: &EntityView,
        params: &BTreeMap<String, f64>,
        limits: &ExecLimits,
    ) -> Result<Vec<f64>, ExecError> {
        execute(&self.function, view, params, limits)
    }
}
