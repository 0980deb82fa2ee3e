//! Frozen AST node types for the Play expression language. §4.D.

use backtest_types::Timeframe;
use serde::{Deserialize, Serialize};

/// A reference to a declared feature's output field, offset some number
/// of exec bars into the past. `offset=0` is the current bar;
/// `offset=k>0` is "k exec bars ago" and contributes `k` to warmup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRef {
    pub feature_id: String,
    pub field: Option<String>,
    pub offset: usize,
}

impl FeatureRef {
    pub fn new(feature_id: impl Into<String>, field: Option<String>, offset: usize) -> Self {
        Self { feature_id: feature_id.into(), field, offset }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
}

impl ScalarValue {
    /// Numeric coercion for arithmetic/comparison; `None` for `Str`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Float(v) => Some(*v),
            ScalarValue::Int(v) => Some(*v as f64),
            ScalarValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            ScalarValue::Str(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeValue {
    pub lo: f64,
    pub hi: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListValue(pub Vec<ScalarValue>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Operands of `Cond` and `ArithmeticExpr`: a feature lookup, a literal,
/// or a nested arithmetic expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Feature(FeatureRef),
    Scalar(ScalarValue),
    Arith(Box<ArithmeticExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArithmeticExpr {
    pub left: Operand,
    pub op: ArithOp,
    pub right: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossOp {
    Above,
    Below,
}

/// The right-hand shape of a `Cond`: a single operand for
/// comparison/crossover/proximity, or a range/list for `between`/`in`.
#[derive(Debug, Clone, PartialEq)]
pub enum Rhs {
    Operand(Operand),
    Range(RangeValue),
    List(ListValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Compare(CompareOp),
    Cross(CrossOp),
    Between,
    In,
    NearAbs,
    NearPct,
}

/// `Cond(lhs, op, rhs, tolerance?)`. `tolerance` is only meaningful for
/// `NearAbs`/`NearPct`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cond {
    pub lhs: Operand,
    pub op: CondOp,
    pub rhs: Rhs,
    pub tolerance: Option<f64>,
}

/// A full boolean expression tree. `SetupRef` nodes are inlined away by
/// `SetupRegistry::resolve` before an `Expr` ever reaches the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Cond(Cond),
    All(Vec<Expr>),
    Any(Vec<Expr>),
    Not(Box<Expr>),
    HoldsFor { bars: usize, anchor_tf: Timeframe, expr: Box<Expr> },
    HoldsForDuration { duration: String, anchor_tf: Timeframe, expr: Box<Expr> },
    OccurredWithin { bars: usize, anchor_tf: Timeframe, expr: Box<Expr> },
    CountTrue { bars: usize, min_true: usize, anchor_tf: Timeframe, expr: Box<Expr> },
    SetupRef(String),
}
