//! Pest-based parser for the factor DSL.
//!
//! Parsing produces a raw [`Program`]; all semantic rules (single function,
//! import allow-list, field boundary) are enforced afterwards by the
//! validator so each violation can be reported individually.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use super::ast::{BinOp, Expr, FnDef, LetStmt, Program, UnaryOp};

#[derive(Parser)]
#[grammar = "dsl/grammar.pest"]
struct FactorParser;

/// Syntax error with source position.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("parse error at line {line}, column {column}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    fn at(pair: &Pair<'_, Rule>, message: impl Into<String>) -> Self {
        let (line, column) = pair.as_span().start_pos().line_col();
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parse a full factor submission.
pub fn parse_program(input: &str) -> ParseResult<Program> {
    let mut pairs = FactorParser::parse(Rule::program, input).map_err(|e| {
        let (line, column) = match e.line_col {
            pest::error::LineColLocation::Pos((l, c)) => (l, c),
            pest::error::LineColLocation::Span((l, c), _) => (l, c),
        };
        ParseError {
            message: e.variant.message().to_string(),
            line,
            column,
        }
    })?;

    let program = pairs.next().expect("program rule always present");

    let mut uses = Vec::new();
    let mut functions = Vec::new();

    for item in program.into_inner() {
        match item.as_rule() {
            Rule::use_decl => {
                let name = item
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::identifier)
                    .map(|p| p.as_str().to_string())
                    .expect("use_decl contains identifier");
                uses.push(name);
            }
            Rule::fn_def => functions.push(build_fn_def(item)?),
            Rule::EOI => {}
            _ => {}
        }
    }

    Ok(Program { uses, functions })
}

fn build_fn_def(pair: Pair<'_, Rule>) -> ParseResult<FnDef> {
    let mut name = String::new();
    let mut params = Vec::new();
    let mut lets = Vec::new();
    let mut body = None;

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::identifier => name = part.as_str().to_string(),
            Rule::param_list => {
                params = part
                    .into_inner()
                    .map(|p| p.as_str().to_string())
                    .collect();
            }
            Rule::block => {
                for stmt in part.into_inner() {
                    match stmt.as_rule() {
                        Rule::let_stmt => lets.push(build_let(stmt)?),
                        Rule::expression => body = Some(build_expression(stmt)?),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let body = body.ok_or(ParseError {
        message: "function body must end with an expression".into(),
        line: 0,
        column: 0,
    })?;

    Ok(FnDef {
        name,
        params,
        lets,
        body,
    })
}

fn build_let(pair: Pair<'_, Rule>) -> ParseResult<LetStmt> {
    let mut inner = pair.into_inner();
    let name = inner
        .find(|p| p.as_rule() == Rule::identifier)
        .map(|p| p.as_str().to_string())
        .expect("let_stmt contains identifier");
    let expr_pair = inner
        .find(|p| p.as_rule() == Rule::expression)
        .expect("let_stmt contains expression");
    Ok(LetStmt {
        name,
        expr: build_expression(expr_pair)?,
    })
}

fn build_expression(pair: Pair<'_, Rule>) -> ParseResult<Expr> {
    let mut inner = pair.into_inner();

    let first = inner.next().expect("expression has a first term");
    let first = build_term(first)?;

    let mut rest: Vec<(BinOp, Expr)> = Vec::new();
    while let Some(op_pair) = inner.next() {
        let op = BinOp::from_str(op_pair.as_str())
            .ok_or_else(|| ParseError::at(&op_pair, "unknown operator"))?;
        let term_pair = inner
            .next()
            .ok_or_else(|| ParseError::at(&op_pair, "operator missing right operand"))?;
        rest.push((op, build_term(term_pair)?));
    }

    Ok(fold_precedence(first, rest))
}

/// Precedence climbing over the flat `term (op term)*` sequence.
fn fold_precedence(first: Expr, rest: Vec<(BinOp, Expr)>) -> Expr {
    fn climb(
        tokens: &mut std::iter::Peekable<std::vec::IntoIter<(BinOp, Expr)>>,
        mut lhs: Expr,
        min_prec: u8,
    ) -> Expr {
        while let Some((op, _)) = tokens.peek() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            let (op, mut rhs) = tokens.next().unwrap();
            while let Some((next, _)) = tokens.peek() {
                let next_prec = next.precedence();
                let climbs = next_prec > prec || (next.is_right_assoc() && next_prec == prec);
                if !climbs {
                    break;
                }
                let threshold = if next_prec > prec { prec + 1 } else { prec };
                rhs = climb(tokens, rhs, threshold);
            }
            lhs = Expr::binary(op, lhs, rhs);
        }
        lhs
    }

    climb(&mut rest.into_iter().peekable(), first, 0)
}

fn build_term(pair: Pair<'_, Rule>) -> ParseResult<Expr> {
    let mut negate = false;
    let mut expr = None;

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::unary_op => negate = true,
            Rule::path_call => expr = Some(build_call(part)?),
            Rule::index_access => expr = Some(build_index(part)?),
            Rule::parenthesized => {
                let inner = part
                    .into_inner()
                    .next()
                    .expect("parenthesized contains expression");
                expr = Some(build_expression(inner)?);
            }
            Rule::number => {
                let value: f64 = part
                    .as_str()
                    .parse()
                    .map_err(|_| ParseError::at(&part, "invalid number"))?;
                expr = Some(Expr::Number(value));
            }
            Rule::string => {
                let quoted = part.as_str();
                expr = Some(Expr::Str(quoted[1..quoted.len() - 1].to_string()));
            }
            Rule::identifier => expr = Some(Expr::Ident(part.as_str().to_string())),
            _ => {}
        }
    }

    let expr = expr.ok_or(ParseError {
        message: "empty term".into(),
        line: 0,
        column: 0,
    })?;

    Ok(if negate {
        Expr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(expr),
        }
    } else {
        expr
    })
}

fn build_call(pair: Pair<'_, Rule>) -> ParseResult<Expr> {
    let mut inner = pair.into_inner();
    let module = inner
        .next()
        .expect("path_call has module")
        .as_str()
        .to_string();
    let name = inner
        .next()
        .expect("path_call has function name")
        .as_str()
        .to_string();

    let mut args = Vec::new();
    if let Some(arg_list) = inner.next() {
        for arg in arg_list.into_inner() {
            args.push(build_expression(arg)?);
        }
    }

    Ok(Expr::Call { module, name, args })
}

fn build_index(pair: Pair<'_, Rule>) -> ParseResult<Expr> {
    let mut inner = pair.into_inner();
    let target = inner
        .next()
        .expect("index_access has target")
        .as_str()
        .to_string();
    let quoted = inner.next().expect("index_access has key").as_str();
    let key = quoted[1..quoted.len() - 1].to_string();

    Ok(Expr::Index { target, key })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_factor() {
        let code = r#"
            use math;

            fn factor(data, params) {
                -data["pe"]
            }
        "#;
        let program = parse_program(code).unwrap();
        assert_eq!(program.uses, vec!["math"]);
        assert_eq!(program.functions.len(), 1);

        let f = &program.functions[0];
        assert_eq!(f.name, "factor");
        assert_eq!(f.params, vec!["data", "params"]);
        assert!(matches!(f.body, Expr::Unary { .. }));
    }

    #[test]
    fn parses_lets_and_calls() {
        let code = r#"
            use series;
            use math;

            fn momentum(data, params) {
                let px = data["close"];
                let trend = series::delta(px, 20);
                trend / series::rolling_std(px, 20)
            }
        "#;
        let program = parse_program(code).unwrap();
        let f = &program.functions[0];
        assert_eq!(f.lets.len(), 2);
        assert!(matches!(f.body, Expr::Binary { op: BinOp::Div, .. }));
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let code = "fn f(d, p) { 1 + 2 * 3 }";
        let program = parse_program(code).unwrap();
        match &program.functions[0].body {
            Expr::Binary { op: BinOp::Add, right, .. } => {
                assert!(matches!(**right, Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("expected addition at the root, got {other:?}"),
        }
    }

    #[test]
    fn pow_is_right_associative() {
        let code = "fn f(d, p) { 2 ** 3 ** 2 }";
        let program = parse_program(code).unwrap();
        match &program.functions[0].body {
            Expr::Binary { op: BinOp::Pow, left, right } => {
                assert!(matches!(**left, Expr::Number(_)));
                assert!(matches!(**right, Expr::Binary { op: BinOp::Pow, .. }));
            }
            other => panic!("expected pow at the root, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_carries_position() {
        let err = parse_program("fn f(d, p) { let ; }").unwrap_err();
        assert!(err.line >= 1);
        assert!(!err.message.is_empty());
    }

    #[test]
    fn comments_are_skipped() {
        let code = r#"
            # value factor
            fn f(d, p) {
                d["pe"]  # cheapest first
            }
        "#;
        assert!(parse_program(code).is_ok());
    }

    #[test]
    fn multiple_functions_parse_for_the_validator_to_reject() {
        let code = "fn a(d, p) { 1 } fn b(d, p) { 2 }";
        let program = parse_program(code).unwrap();
        assert_eq!(program.functions.len(), 2);
    }
}
