//! Play expression language: AST, tri-valued evaluator, setup inlining,
//! duration normalization, and warmup analysis. §4.D.

pub mod ast;
pub mod eval;
pub mod json;
pub mod setup;
pub mod tri;
pub mod warmup;

pub use ast::*;
pub use eval::{eval_expr, EvalContext};
pub use setup::SetupRegistry;
pub use tri::Tri;
pub use warmup::{analyze as analyze_warmup, WarmupAnalysis};

use backtest_types::{duration_to_bars, BacktestError, FeatureOutputType, WINDOW_BARS_CEILING};

use crate::feature_registry::{output_key, FeatureRegistry};

/// Replaces every `HoldsForDuration` with an equivalent `HoldsFor` at its
/// `anchor_tf`'s bar granularity. Must run before `analyze_warmup` and
/// before the evaluator ever sees the tree.
pub fn normalize_durations(expr: &Expr) -> Result<Expr, BacktestError> {
    Ok(match expr {
        Expr::Cond(c) => Expr::Cond(c.clone()),
        Expr::All(children) => {
            Expr::All(children.iter().map(normalize_durations).collect::<Result<_, _>>()?)
        }
        Expr::Any(children) => {
            Expr::Any(children.iter().map(normalize_durations).collect::<Result<_, _>>()?)
        }
        Expr::Not(inner) => Expr::Not(Box::new(normalize_durations(inner)?)),
        Expr::HoldsFor { bars, anchor_tf, expr: inner } => {
            Expr::HoldsFor { bars: *bars, anchor_tf: *anchor_tf, expr: Box::new(normalize_durations(inner)?) }
        }
        Expr::HoldsForDuration { duration, anchor_tf, expr: inner } => {
            let bars = duration_to_bars(duration, *anchor_tf)
                .map_err(|msg| BacktestError::dsl_type(format!("holds_for_duration[{duration}]"), msg))?;
            Expr::HoldsFor { bars, anchor_tf: *anchor_tf, expr: Box::new(normalize_durations(inner)?) }
        }
        Expr::OccurredWithin { bars, anchor_tf, expr: inner } => {
            Expr::OccurredWithin { bars: *bars, anchor_tf: *anchor_tf, expr: Box::new(normalize_durations(inner)?) }
        }
        Expr::CountTrue { bars, min_true, anchor_tf, expr: inner } => Expr::CountTrue {
            bars: *bars,
            min_true: *min_true,
            anchor_tf: *anchor_tf,
            expr: Box::new(normalize_durations(inner)?),
        },
        Expr::SetupRef(id) => Expr::SetupRef(id.clone()),
    })
}

fn check_window_bounds(bars: usize, location: &str) -> Result<(), BacktestError> {
    if bars == 0 || bars > WINDOW_BARS_CEILING {
        return Err(BacktestError::dsl_type(
            location.to_string(),
            format!("window bar count {bars} outside [1, {WINDOW_BARS_CEILING}]"),
        ));
    }
    Ok(())
}

fn operand_output_type(operand: &Operand, registry: &FeatureRegistry) -> Option<FeatureOutputType> {
    match operand {
        Operand::Feature(r) => registry.get_output_type(&r.feature_id, &output_key(&r.feature_id, r.field.as_deref())),
        Operand::Scalar(_) => None,
        Operand::Arith(_) => Some(FeatureOutputType::Float),
    }
}

/// Validates operator/type compatibility against the Feature Registry.
/// `eq`/`neq` are restricted to discrete output types; `near_abs`/
/// `near_pct` to numeric types. Feature refs whose output type isn't on
/// record (expansion not yet run, or single-output indicator with no
/// declared key) are treated as compatible — the registry is the source
/// of truth and silence from it is not a validation failure.
pub fn validate_types(expr: &Expr, registry: &FeatureRegistry) -> Result<(), BacktestError> {
    match expr {
        Expr::Cond(c) => {
            let lhs_ty = operand_output_type(&c.lhs, registry);
            match c.op {
                CondOp::Compare(CompareOp::Eq) | CondOp::Compare(CompareOp::Neq) => {
                    if let Some(ty) = lhs_ty {
                        if !ty.is_discrete() {
                            return Err(BacktestError::dsl_type(
                                "cond.eq",
                                format!("eq/neq requires a discrete output type, got {ty:?}"),
                            ));
                        }
                    }
                }
                CondOp::NearAbs | CondOp::NearPct | CondOp::Between | CondOp::In => {
                    if let Some(ty) = lhs_ty {
                        if !ty.is_numeric() {
                            return Err(BacktestError::dsl_type(
                                "cond.proximity",
                                format!("near_abs/near_pct/between/in require a numeric output type, got {ty:?}"),
                            ));
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        }
        Expr::All(children) | Expr::Any(children) => {
            children.iter().try_for_each(|c| validate_types(c, registry))
        }
        Expr::Not(inner) => validate_types(inner, registry),
        Expr::HoldsFor { bars, expr: inner, .. } | Expr::OccurredWithin { bars, expr: inner, .. } => {
            check_window_bounds(*bars, "window")?;
            validate_types(inner, registry)
        }
        Expr::CountTrue { bars, min_true, expr: inner, .. } => {
            check_window_bounds(*bars, "count_true")?;
            if *min_true == 0 || *min_true > *bars {
                return Err(BacktestError::dsl_type("count_true", format!("min_true {min_true} outside [1, {bars}]")));
            }
            validate_types(inner, registry)
        }
        Expr::HoldsForDuration { expr: inner, .. } => validate_types(inner, registry),
        Expr::SetupRef(id) => {
            Err(BacktestError::dsl_type(format!("setup[{id}]"), "SetupRef must be resolved before type validation"))
        }
    }
}
