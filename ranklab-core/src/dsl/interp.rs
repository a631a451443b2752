//! Sandboxed AST interpreter for validated factor code.
//!
//! The evaluation environment contains exactly three things: the entity's
//! data columns, the factor's parameter map, and the `series`/`math`
//! builtin registries. There is no other surface — no filesystem, network,
//! process, or reflection capability exists to reach.
//!
//! Resource ceilings: a wall-clock deadline checked at every evaluation
//! step, an op-fuel budget, and a cell budget bounding peak series
//! allocation. The language has no loops or recursion, so each deadline
//! check bounds overrun to a single builtin call.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::ast::{BinOp, Expr, FnDef, UnaryOp};
use crate::frame::EntityView;

/// Execution resource ceilings.
#[derive(Debug, Clone)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub max_ops: u64,
    pub max_cells: usize,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_ops: 1_000_000,
            max_cells: 10_000_000,
        }
    }
}

/// Structured execution failures — returned, never panicked.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("execution timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("output contract violation: {0}")]
    ContractViolation(String),
}

/// Interpreter values.
#[derive(Debug, Clone)]
enum Value {
    Scalar(f64),
    Series(Vec<f64>),
    /// One of the two mapping parameters referenced bare.
    Mapping(&'static str),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Series(_) => "series",
            Value::Mapping(kind) => kind,
        }
    }
}

/// The closed builtin registry — a tagged variant dispatched through one
/// match, shared with the validator for existence/arity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    // math — elementwise with scalar/series broadcast
    Abs,
    Sqrt,
    Ln,
    Exp,
    Floor,
    Ceil,
    Pow,
    MathMin,
    MathMax,
    // series — time-series operators over the entity's date axis
    Mean,
    Median,
    Std,
    Sum,
    SeriesMin,
    SeriesMax,
    Lag,
    Delta,
    RollingMean,
    RollingStd,
    Fillna,
    Clip,
}

impl Builtin {
    pub fn lookup(module: &str, name: &str) -> Option<Self> {
        match (module, name) {
            ("math", "abs") => Some(Self::Abs),
            ("math", "sqrt") => Some(Self::Sqrt),
            ("math", "ln") => Some(Self::Ln),
            ("math", "exp") => Some(Self::Exp),
            ("math", "floor") => Some(Self::Floor),
            ("math", "ceil") => Some(Self::Ceil),
            ("math", "pow") => Some(Self::Pow),
            ("math", "min") => Some(Self::MathMin),
            ("math", "max") => Some(Self::MathMax),
            ("series", "mean") => Some(Self::Mean),
            ("series", "median") => Some(Self::Median),
            ("series", "std") => Some(Self::Std),
            ("series", "sum") => Some(Self::Sum),
            ("series", "min") => Some(Self::SeriesMin),
            ("series", "max") => Some(Self::SeriesMax),
            ("series", "lag") => Some(Self::Lag),
            ("series", "delta") => Some(Self::Delta),
            ("series", "rolling_mean") => Some(Self::RollingMean),
            ("series", "rolling_std") => Some(Self::RollingStd),
            ("series", "fillna") => Some(Self::Fillna),
            ("series", "clip") => Some(Self::Clip),
            _ => None,
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Self::Abs
            | Self::Sqrt
            | Self::Ln
            | Self::Exp
            | Self::Floor
            | Self::Ceil
            | Self::Mean
            | Self::Median
            | Self::Std
            | Self::Sum
            | Self::SeriesMin
            | Self::SeriesMax => 1,
            Self::Pow
            | Self::MathMin
            | Self::MathMax
            | Self::Lag
            | Self::Delta
            | Self::RollingMean
            | Self::RollingStd
            | Self::Fillna => 2,
            Self::Clip => 3,
        }
    }
}

/// Execute a validated function against one entity's view.
///
/// Returns the factor series aligned to the view's date axis. Scalar
/// results broadcast; anything else that does not align is a
/// [`ExecError::ContractViolation`].
pub fn execute(
    function: &FnDef,
    view: &EntityView,
    params: &BTreeMap<String, f64>,
    limits: &ExecLimits,
) -> Result<Vec<f64>, ExecError> {
    let mut interp = Interpreter {
        data: &view.fields,
        params,
        data_name: function.params.first().map(String::as_str).unwrap_or(""),
        params_name: function.params.get(1).map(String::as_str).unwrap_or(""),
        locals: HashMap::new(),
        deadline: Instant::now() + limits.timeout,
        timeout_ms: limits.timeout.as_millis() as u64,
        ops_left: limits.max_ops,
        cells_left: limits.max_cells,
    };

    for stmt in &function.lets {
        let value = interp.eval(&stmt.expr)?;
        interp.locals.insert(stmt.name.clone(), value);
    }
    let result = interp.eval(&function.body)?;

    let n = view.len();
    match result {
        Value::Scalar(v) => Ok(vec![v; n]),
        Value::Series(s) if s.len() == n => Ok(s),
        Value::Series(s) => Err(ExecError::ContractViolation(format!(
            "factor series has {} values but the date axis has {n}",
            s.len()
        ))),
        Value::Mapping(kind) => Err(ExecError::ContractViolation(format!(
            "factor body produced the {kind} mapping, expected a numeric series"
        ))),
    }
}

struct Interpreter<'a> {
    data: &'a BTreeMap<String, Vec<f64>>,
    params: &'a BTreeMap<String, f64>,
    data_name: &'a str,
    params_name: &'a str,
    locals: HashMap<String, Value>,
    deadline: Instant,
    timeout_ms: u64,
    ops_left: u64,
    cells_left: usize,
}

impl Interpreter<'_> {
    /// One evaluation step: deadline first, then fuel.
    fn tick(&mut self) -> Result<(), ExecError> {
        if Instant::now() > self.deadline {
            return Err(ExecError::Timeout {
                limit_ms: self.timeout_ms,
            });
        }
        if self.ops_left == 0 {
            return Err(ExecError::Runtime("operation budget exhausted".into()));
        }
        self.ops_left -= 1;
        Ok(())
    }

    /// Charge the cell budget before materializing a series.
    fn alloc(&mut self, cells: usize) -> Result<(), ExecError> {
        if cells > self.cells_left {
            return Err(ExecError::Runtime(
                "memory ceiling exceeded (series cell budget)".into(),
            ));
        }
        self.cells_left -= cells;
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ExecError> {
        self.tick()?;
        match expr {
            Expr::Number(v) => Ok(Value::Scalar(*v)),
            Expr::Str(_) => Err(ExecError::Runtime(
                "string literal has no numeric value".into(),
            )),
            Expr::Ident(name) => self.eval_ident(name),
            Expr::Index { target, key } => self.eval_index(target, key),
            Expr::Call { module, name, args } => self.eval_call(module, name, args),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => self.map_unary(value, |v| -v),
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.eval_binary(*op, left, right)
            }
        }
    }

    fn eval_ident(&mut self, name: &str) -> Result<Value, ExecError> {
        if name == self.data_name {
            return Ok(Value::Mapping("data"));
        }
        if name == self.params_name {
            return Ok(Value::Mapping("params"));
        }
        match self.locals.get(name) {
            Some(Value::Series(s)) => {
                let s = s.clone();
                self.alloc(s.len())?;
                Ok(Value::Series(s))
            }
            Some(v) => Ok(v.clone()),
            None => Err(ExecError::Runtime(format!("unbound identifier '{name}'"))),
        }
    }

    fn eval_index(&mut self, target: &str, key: &str) -> Result<Value, ExecError> {
        if target == self.data_name {
            let column = self
                .data
                .get(key)
                .ok_or_else(|| ExecError::Runtime(format!("field '{key}' not in data")))?;
            self.alloc(column.len())?;
            return Ok(Value::Series(column.clone()));
        }
        if target == self.params_name {
            return self
                .params
                .get(key)
                .map(|v| Value::Scalar(*v))
                .ok_or_else(|| ExecError::Runtime(format!("unknown param '{key}'")));
        }
        Err(ExecError::Runtime(format!(
            "'{target}' is not a mapping and cannot be indexed"
        )))
    }

    // ── operators ───────────────────────────────────────────────────

    fn map_unary(&mut self, value: Value, f: impl Fn(f64) -> f64) -> Result<Value, ExecError> {
        match value {
            Value::Scalar(v) => Ok(Value::Scalar(f(v))),
            Value::Series(s) => {
                self.alloc(s.len())?;
                Ok(Value::Series(s.into_iter().map(f).collect()))
            }
            Value::Mapping(kind) => Err(ExecError::Runtime(format!(
                "cannot operate on the {kind} mapping"
            ))),
        }
    }

    fn eval_binary(&mut self, op: BinOp, left: Value, right: Value) -> Result<Value, ExecError> {
        // Scalar division by zero is an error; elementwise zeros degrade to
        // NaN so one bad denominator does not void a whole series.
        if op == BinOp::Div {
            if let (Value::Scalar(_), Value::Scalar(r)) = (&left, &right) {
                if *r == 0.0 {
                    return Err(ExecError::Runtime("division by zero".into()));
                }
            }
        }

        let f = |a: f64, b: f64| -> f64 {
            match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        f64::NAN
                    } else {
                        a / b
                    }
                }
                BinOp::Pow => a.powf(b),
            }
        };

        match (left, right) {
            (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(f(a, b))),
            (Value::Scalar(a), Value::Series(s)) => {
                self.alloc(s.len())?;
                Ok(Value::Series(s.into_iter().map(|b| f(a, b)).collect()))
            }
            (Value::Series(s), Value::Scalar(b)) => {
                self.alloc(s.len())?;
                Ok(Value::Series(s.into_iter().map(|a| f(a, b)).collect()))
            }
            (Value::Series(a), Value::Series(b)) => {
                if a.len() != b.len() {
                    return Err(ExecError::Runtime(format!(
                        "series length mismatch: {} vs {}",
                        a.len(),
                        b.len()
                    )));
                }
                self.alloc(a.len())?;
                Ok(Value::Series(
                    a.into_iter().zip(b).map(|(x, y)| f(x, y)).collect(),
                ))
            }
            (l, r) => Err(ExecError::Runtime(format!(
                "cannot combine {} with {}",
                l.type_name(),
                r.type_name()
            ))),
        }
    }

    // ── builtins ────────────────────────────────────────────────────

    fn eval_call(&mut self, module: &str, name: &str, args: &[Expr]) -> Result<Value, ExecError> {
        let builtin = Builtin::lookup(module, name)
            .ok_or_else(|| ExecError::Runtime(format!("unknown function '{module}::{name}'")))?;
        if builtin.arity() != args.len() {
            return Err(ExecError::Runtime(format!(
                "'{module}::{name}' takes {} arguments, found {}",
                builtin.arity(),
                args.len()
            )));
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }

        match builtin {
            Builtin::Abs => self.elementwise1(values, f64::abs),
            Builtin::Sqrt => self.elementwise1(values, f64::sqrt),
            Builtin::Ln => self.elementwise1(values, f64::ln),
            Builtin::Exp => self.elementwise1(values, f64::exp),
            Builtin::Floor => self.elementwise1(values, f64::floor),
            Builtin::Ceil => self.elementwise1(values, f64::ceil),
            Builtin::Pow => self.elementwise2(values, f64::powf),
            Builtin::MathMin => self.elementwise2(values, f64::min),
            Builtin::MathMax => self.elementwise2(values, f64::max),
            Builtin::Mean => self.aggregate(values, stats::mean),
            Builtin::Median => self.aggregate(values, stats::median),
            Builtin::Std => self.aggregate(values, stats::std),
            Builtin::Sum => self.aggregate(values, stats::sum),
            Builtin::SeriesMin => self.aggregate(values, stats::min),
            Builtin::SeriesMax => self.aggregate(values, stats::max),
            Builtin::Lag => self.shift(values, "series::lag", false),
            Builtin::Delta => self.shift(values, "series::delta", true),
            Builtin::RollingMean => self.rolling(values, stats::mean),
            Builtin::RollingStd => self.rolling(values, stats::std),
            Builtin::Fillna => self.fillna(values),
            Builtin::Clip => self.clip(values),
        }
    }

    fn elementwise1(
        &mut self,
        mut values: Vec<Value>,
        f: impl Fn(f64) -> f64,
    ) -> Result<Value, ExecError> {
        self.map_unary(values.remove(0), f)
    }

    fn elementwise2(
        &mut self,
        mut values: Vec<Value>,
        f: impl Fn(f64, f64) -> f64 + Copy,
    ) -> Result<Value, ExecError> {
        let right = values.remove(1);
        let left = values.remove(0);
        match (left, right) {
            (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(f(a, b))),
            (Value::Scalar(a), Value::Series(s)) => {
                self.alloc(s.len())?;
                Ok(Value::Series(s.into_iter().map(|b| f(a, b)).collect()))
            }
            (Value::Series(s), Value::Scalar(b)) => {
                self.alloc(s.len())?;
                Ok(Value::Series(s.into_iter().map(|a| f(a, b)).collect()))
            }
            (Value::Series(a), Value::Series(b)) => {
                if a.len() != b.len() {
                    return Err(ExecError::Runtime(format!(
                        "series length mismatch: {} vs {}",
                        a.len(),
                        b.len()
                    )));
                }
                self.alloc(a.len())?;
                Ok(Value::Series(
                    a.into_iter().zip(b).map(|(x, y)| f(x, y)).collect(),
                ))
            }
            (l, r) => Err(ExecError::Runtime(format!(
                "cannot combine {} with {}",
                l.type_name(),
                r.type_name()
            ))),
        }
    }

    fn aggregate(
        &mut self,
        mut values: Vec<Value>,
        f: impl Fn(&[f64]) -> f64,
    ) -> Result<Value, ExecError> {
        let s = expect_series(values.remove(0), "series aggregate")?;
        Ok(Value::Scalar(f(&s)))
    }

    fn shift(
        &mut self,
        mut values: Vec<Value>,
        name: &str,
        difference: bool,
    ) -> Result<Value, ExecError> {
        let k_value = values.remove(1);
        let s = expect_series(values.remove(0), name)?;
        let k = expect_window(k_value, name)?;

        self.alloc(s.len())?;
        let out: Vec<f64> = (0..s.len())
            .map(|i| {
                if i < k {
                    f64::NAN
                } else if difference {
                    s[i] - s[i - k]
                } else {
                    s[i - k]
                }
            })
            .collect();
        Ok(Value::Series(out))
    }

    fn rolling(
        &mut self,
        mut values: Vec<Value>,
        f: impl Fn(&[f64]) -> f64,
    ) -> Result<Value, ExecError> {
        let w_value = values.remove(1);
        let s = expect_series(values.remove(0), "series rolling")?;
        let w = expect_window(w_value, "series rolling")?;

        self.alloc(s.len())?;
        let out: Vec<f64> = (0..s.len())
            .map(|i| {
                if i + 1 < w {
                    return f64::NAN;
                }
                let window = &s[i + 1 - w..=i];
                if window.iter().any(|v| v.is_nan()) {
                    f64::NAN
                } else {
                    f(window)
                }
            })
            .collect();
        Ok(Value::Series(out))
    }

    fn fillna(&mut self, mut values: Vec<Value>) -> Result<Value, ExecError> {
        let fill = expect_scalar(values.remove(1), "series::fillna")?;
        let s = expect_series(values.remove(0), "series::fillna")?;
        self.alloc(s.len())?;
        Ok(Value::Series(
            s.into_iter()
                .map(|v| if v.is_nan() { fill } else { v })
                .collect(),
        ))
    }

    fn clip(&mut self, mut values: Vec<Value>) -> Result<Value, ExecError> {
        let hi = expect_scalar(values.remove(2), "series::clip")?;
        let lo = expect_scalar(values.remove(1), "series::clip")?;
        let s = expect_series(values.remove(0), "series::clip")?;
        if lo > hi {
            return Err(ExecError::Runtime(format!(
                "clip bounds inverted: {lo} > {hi}"
            )));
        }
        self.alloc(s.len())?;
        Ok(Value::Series(
            s.into_iter().map(|v| v.clamp(lo, hi)).collect(),
        ))
    }
}

fn expect_series(value: Value, function: &str) -> Result<Vec<f64>, ExecError> {
    match value {
        Value::Series(s) => Ok(s),
        other => Err(ExecError::Runtime(format!(
            "'{function}' expects a series, found {}",
            other.type_name()
        ))),
    }
}

fn expect_scalar(value: Value, function: &str) -> Result<f64, ExecError> {
    match value {
        Value::Scalar(v) => Ok(v),
        other => Err(ExecError::Runtime(format!(
            "'{function}' expects a scalar, found {}",
            other.type_name()
        ))),
    }
}

fn expect_window(value: Value, function: &str) -> Result<usize, ExecError> {
    let v = expect_scalar(value, function)?;
    if v < 1.0 || v.fract() != 0.0 {
        return Err(ExecError::Runtime(format!(
            "'{function}' window must be a positive integer, found {v}"
        )));
    }
    Ok(v as usize)
}

/// NaN-skipping reductions shared by aggregates and rolling windows.
mod stats {
    fn valid(values: &[f64]) -> impl Iterator<Item = f64> + '_ {
        values.iter().copied().filter(|v| !v.is_nan())
    }

    pub fn sum(values: &[f64]) -> f64 {
        let mut any = false;
        let mut total = 0.0;
        for v in valid(values) {
            any = true;
            total += v;
        }
        if any {
            total
        } else {
            f64::NAN
        }
    }

    pub fn mean(values: &[f64]) -> f64 {
        let n = valid(values).count();
        if n == 0 {
            f64::NAN
        } else {
            valid(values).sum::<f64>() / n as f64
        }
    }

    pub fn median(values: &[f64]) -> f64 {
        let mut v: Vec<f64> = valid(values).collect();
        if v.is_empty() {
            return f64::NAN;
        }
        v.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = v.len() / 2;
        if v.len() % 2 == 0 {
            (v[mid - 1] + v[mid]) / 2.0
        } else {
            v[mid]
        }
    }

    /// Sample standard deviation; NaN below two valid points.
    pub fn std(values: &[f64]) -> f64 {
        let v: Vec<f64> = valid(values).collect();
        if v.len() < 2 {
            return f64::NAN;
        }
        let m = v.iter().sum::<f64>() / v.len() as f64;
        let var = v.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (v.len() - 1) as f64;
        var.sqrt()
    }

    pub fn min(values: &[f64]) -> f64 {
        valid(values).fold(f64::NAN, f64::min)
    }

    pub fn max(values: &[f64]) -> f64 {
        valid(values).fold(f64::NAN, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parser::parse_program;
    use chrono::NaiveDate;

    fn view(fields: &[(&str, &[f64])]) -> EntityView {
        let n = fields.first().map(|(_, v)| v.len()).unwrap_or(0);
        let dates: Vec<NaiveDate> = (0..n)
            .map(|i| NaiveDate::from_ymd_opt(2024, 1, 1 + i as u32).unwrap())
            .collect();
        EntityView {
            entity: "AAA".into(),
            dates,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        }
    }

    fn run(code: &str, view: &EntityView, params: &[(&str, f64)]) -> Result<Vec<f64>, ExecError> {
        let program = parse_program(code).unwrap();
        let params: BTreeMap<String, f64> =
            params.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        execute(&program.functions[0], view, &params, &ExecLimits::default())
    }

    #[test]
    fn negated_field_executes_elementwise() {
        let v = view(&[("pe", &[10.0, 20.0, 5.0])]);
        let out = run("fn f(data, params) { -data[\"pe\"] }", &v, &[]).unwrap();
        assert_eq!(out, vec![-10.0, -20.0, -5.0]);
    }

    #[test]
    fn scalar_result_broadcasts() {
        let v = view(&[("pe", &[10.0, 20.0, 5.0])]);
        let out = run("fn f(data, params) { 1.5 }", &v, &[]).unwrap();
        assert_eq!(out, vec![1.5, 1.5, 1.5]);
    }

    #[test]
    fn lets_params_and_builtins_compose() {
        let v = view(&[("close", &[100.0, 102.0, 104.0, 103.0])]);
        let code = r#"
            use series;
            fn f(data, params) {
                let px = data["close"];
                series::delta(px, 2) * params["scale"]
            }
        "#;
        let out = run(code, &v, &[("scale", 0.5)]).unwrap();
        assert!(out[0].is_nan() && out[1].is_nan());
        assert_eq!(out[2], 2.0);
        assert_eq!(out[3], 0.5);
    }

    #[test]
    fn rolling_mean_has_nan_warmup() {
        let v = view(&[("close", &[1.0, 2.0, 3.0, 4.0])]);
        let out = run(
            "use series;\nfn f(d, p) { series::rolling_mean(d[\"close\"], 2) }",
            &v,
            &[],
        )
        .unwrap();
        assert!(out[0].is_nan());
        assert_eq!(&out[1..], &[1.5, 2.5, 3.5]);
    }

    #[test]
    fn scalar_division_by_zero_is_runtime() {
        let v = view(&[("pe", &[1.0])]);
        let err = run("fn f(d, p) { 1 / 0 }", &v, &[]).unwrap_err();
        assert_eq!(err, ExecError::Runtime("division by zero".into()));
    }

    #[test]
    fn elementwise_zero_denominator_degrades_to_nan() {
        let v = view(&[("x", &[1.0, 2.0]), ("y", &[0.0, 4.0])]);
        let out = run("fn f(d, p) { d[\"x\"] / d[\"y\"] }", &v, &[]).unwrap();
        assert!(out[0].is_nan());
        assert_eq!(out[1], 0.5);
    }

    #[test]
    fn mapping_result_is_contract_violation() {
        let v = view(&[("pe", &[1.0])]);
        let err = run("fn f(data, params) { data }", &v, &[]).unwrap_err();
        assert!(matches!(err, ExecError::ContractViolation(_)));
    }

    #[test]
    fn expired_deadline_times_out() {
        let v = view(&[("pe", &[1.0])]);
        let program = parse_program("fn f(d, p) { d[\"pe\"] }").unwrap();
        let limits = ExecLimits {
            timeout: Duration::ZERO,
            ..ExecLimits::default()
        };
        std::thread::sleep(Duration::from_millis(2));
        let err = execute(&program.functions[0], &v, &BTreeMap::new(), &limits).unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[test]
    fn fuel_exhaustion_is_runtime() {
        let v = view(&[("pe", &[1.0])]);
        let program = parse_program("fn f(d, p) { d[\"pe\"] + d[\"pe\"] }").unwrap();
        let limits = ExecLimits {
            max_ops: 2,
            ..ExecLimits::default()
        };
        let err = execute(&program.functions[0], &v, &BTreeMap::new(), &limits).unwrap_err();
        assert_eq!(err, ExecError::Runtime("operation budget exhausted".into()));
    }

    #[test]
    fn cell_budget_bounds_allocation() {
        let v = view(&[("pe", &[1.0, 2.0, 3.0, 4.0])]);
        let program = parse_program("fn f(d, p) { d[\"pe\"] + d[\"pe\"] }").unwrap();
        let limits = ExecLimits {
            max_cells: 5,
            ..ExecLimits::default()
        };
        let err = execute(&program.functions[0], &v, &BTreeMap::new(), &limits).unwrap_err();
        assert!(matches!(err, ExecError::Runtime(_)));
    }

    #[test]
    fn unknown_param_is_runtime() {
        let v = view(&[("pe", &[1.0])]);
        let err = run("fn f(d, p) { p[\"missing\"] }", &v, &[]).unwrap_err();
        assert_eq!(err, ExecError::Runtime("unknown param 'missing'".into()));
    }

    #[test]
    fn aggregates_skip_nan() {
        let v = view(&[("x", &[1.0, f64::NAN, 3.0])]);
        let out = run(
            "use series;\nfn f(d, p) { series::mean(d[\"x\"]) }",
            &v,
            &[],
        )
        .unwrap();
        assert_eq!(out, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn fillna_replaces_missing_only() {
        let v = view(&[("x", &[1.0, f64::NAN, 3.0])]);
        let out = run(
            "use series;\nfn f(d, p) { series::fillna(d[\"x\"], 0) }",
            &v,
            &[],
        )
        .unwrap();
        assert_eq!(out, vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn fractional_window_is_rejected() {
        let v = view(&[("x", &[1.0, 2.0])]);
        let err = run(
            "use series;\nfn f(d, p) { series::lag(d[\"x\"], 1.5) }",
            &v,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::Runtime(_)));
    }
}
