//! Tri-valued evaluator over the Play expression tree. §4.D/§4.E.

use backtest_types::{FeatureOutputType, Timeframe};

use super::ast::{ArithOp, Cond, CondOp, CrossOp, Expr, FeatureRef, Operand, Rhs};
use super::tri::Tri;

/// The consumed contract a Snapshot View implements to let the evaluator
/// resolve feature values without knowing anything about feed stores,
/// forward-fill, or multi-timeframe indices.
///
/// `anchor_tf` is `None` outside any window operator, meaning "use the
/// view's own default anchor" (the exec bar it was built for); a window
/// operator sets it to its declared timeframe for every lookup inside its
/// body, so `anchor_bars_ago` walks back bars of *that* timeframe rather
/// than always the exec TF's. The implementation combines the resolved
/// anchor with the feature's own declared `offset` to produce the right
/// array index, returning `None` when the combined lookback exceeds
/// available history (never panics, never fabricates).
pub trait EvalContext {
    fn feature_value(
        &self,
        feature_id: &str,
        field: Option<&str>,
        offset: usize,
        anchor_tf: Option<Timeframe>,
        anchor_bars_ago: usize,
    ) -> Option<f64>;

    fn feature_type(&self, feature_id: &str, field: Option<&str>) -> Option<FeatureOutputType>;
}

fn eval_feature_ref(
    r: &FeatureRef,
    ctx: &dyn EvalContext,
    anchor_tf: Option<Timeframe>,
    anchor_bars_ago: usize,
    extra_offset: usize,
) -> Option<f64> {
    ctx.feature_value(&r.feature_id, r.field.as_deref(), r.offset + extra_offset, anchor_tf, anchor_bars_ago)
}

fn eval_arith(
    expr: &super::ast::ArithmeticExpr,
    ctx: &dyn EvalContext,
    anchor_tf: Option<Timeframe>,
    anchor_bars_ago: usize,
    extra_offset: usize,
) -> Option<f64> {
    let l = eval_operand_at(&expr.left, ctx, anchor_tf, anchor_bars_ago, extra_offset)?;
    let r = eval_operand_at(&expr.right, ctx, anchor_tf, anchor_bars_ago, extra_offset)?;
    let v = match expr.op {
        ArithOp::Add => l + r,
        ArithOp::Sub => l - r,
        ArithOp::Mul => l * r,
        ArithOp::Div => {
            if r == 0.0 {
                return None;
            }
            l / r
        }
        ArithOp::Mod => {
            if r == 0.0 {
                return None;
            }
            l % r
        }
    };
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

/// Resolves any operand to a numeric value, shifting every embedded
/// `FeatureRef`'s offset by `extra_offset` (used by crossover evaluation
/// to additionally read "one bar ago").
fn eval_operand_at(
    operand: &Operand,
    ctx: &dyn EvalContext,
    anchor_tf: Option<Timeframe>,
    anchor_bars_ago: usize,
    extra_offset: usize,
) -> Option<f64> {
    match operand {
        Operand::Feature(r) => eval_feature_ref(r, ctx, anchor_tf, anchor_bars_ago, extra_offset),
        Operand::Scalar(s) => s.as_f64(),
        Operand::Arith(a) => eval_arith(a, ctx, anchor_tf, anchor_bars_ago, extra_offset),
    }
}

fn eval_operand(operand: &Operand, ctx: &dyn EvalContext, anchor_tf: Option<Timeframe>, anchor_bars_ago: usize) -> Option<f64> {
    eval_operand_at(operand, ctx, anchor_tf, anchor_bars_ago, 0)
}

fn near(lhs: f64, rhs: f64, tolerance: f64, pct: bool) -> bool {
    if pct {
        if rhs == 0.0 {
            return lhs == 0.0;
        }
        ((lhs - rhs) / rhs).abs() * 100.0 <= tolerance
    } else {
        (lhs - rhs).abs() <= tolerance
    }
}

fn eval_cond(cond: &Cond, ctx: &dyn EvalContext, anchor_tf: Option<Timeframe>, anchor_bars_ago: usize) -> Tri {
    match cond.op {
        CondOp::Compare(op) => {
            let Rhs::Operand(rhs) = &cond.rhs else {
                return Tri::Indeterminate;
            };
            let Some(lhs_v) = eval_operand(&cond.lhs, ctx, anchor_tf, anchor_bars_ago) else {
                return Tri::Indeterminate;
            };
            let Some(rhs_v) = eval_operand(rhs, ctx, anchor_tf, anchor_bars_ago) else {
                return Tri::Indeterminate;
            };
            let result = match op {
                super::ast::CompareOp::Gt => lhs_v > rhs_v,
                super::ast::CompareOp::Lt => lhs_v < rhs_v,
                super::ast::CompareOp::Gte => lhs_v >= rhs_v,
                super::ast::CompareOp::Lte => lhs_v <= rhs_v,
                super::ast::CompareOp::Eq => lhs_v == rhs_v,
                super::ast::CompareOp::Neq => lhs_v != rhs_v,
            };
            Tri::from_bool(result)
        }
        CondOp::Cross(dir) => {
            let Rhs::Operand(rhs) = &cond.rhs else {
                return Tri::Indeterminate;
            };
            let (Some(cur_l), Some(cur_r), Some(prev_l), Some(prev_r)) = (
                eval_operand_at(&cond.lhs, ctx, anchor_tf, anchor_bars_ago, 0),
                eval_operand_at(rhs, ctx, anchor_tf, anchor_bars_ago, 0),
                eval_operand_at(&cond.lhs, ctx, anchor_tf, anchor_bars_ago, 1),
                eval_operand_at(rhs, ctx, anchor_tf, anchor_bars_ago, 1),
            ) else {
                return Tri::Indeterminate;
            };
            let result = match dir {
                CrossOp::Above => prev_l <= prev_r && cur_l > cur_r,
                CrossOp::Below => prev_l >= prev_r && cur_l < cur_r,
            };
            Tri::from_bool(result)
        }
        CondOp::Between => {
            let Rhs::Range(range) = &cond.rhs else {
                return Tri::Indeterminate;
            };
            let Some(v) = eval_operand(&cond.lhs, ctx, anchor_tf, anchor_bars_ago) else {
                return Tri::Indeterminate;
            };
            Tri::from_bool(v >= range.lo && v <= range.hi)
        }
        CondOp::In => {
            let Rhs::List(list) = &cond.rhs else {
                return Tri::Indeterminate;
            };
            let Some(v) = eval_operand(&cond.lhs, ctx, anchor_tf, anchor_bars_ago) else {
                return Tri::Indeterminate;
            };
            Tri::from_bool(list.0.iter().any(|s| s.as_f64() == Some(v)))
        }
        CondOp::NearAbs | CondOp::NearPct => {
            let Rhs::Operand(rhs) = &cond.rhs else {
                return Tri::Indeterminate;
            };
            let (Some(lhs_v), Some(rhs_v)) =
                (eval_operand(&cond.lhs, ctx, anchor_tf, anchor_bars_ago), eval_operand(rhs, ctx, anchor_tf, anchor_bars_ago))
            else {
                return Tri::Indeterminate;
            };
            let Some(tol) = cond.tolerance else {
                return Tri::Indeterminate;
            };
            Tri::from_bool(near(lhs_v, rhs_v, tol, matches!(cond.op, CondOp::NearPct)))
        }
    }
}

/// Evaluates an `Expr` at the current anchor bar. `SetupRef` must already
/// be inlined away (see `super::setup::SetupRegistry::resolve`).
pub fn eval_expr(expr: &Expr, ctx: &dyn EvalContext) -> Tri {
    eval_expr_at(expr, ctx, None, 0)
}

fn eval_expr_at(expr: &Expr, ctx: &dyn EvalContext, anchor_tf: Option<Timeframe>, anchor_bars_ago: usize) -> Tri {
    match expr {
        Expr::Cond(c) => eval_cond(c, ctx, anchor_tf, anchor_bars_ago),
        Expr::All(children) => Tri::all(children.iter().map(|c| eval_expr_at(c, ctx, anchor_tf, anchor_bars_ago))),
        Expr::Any(children) => Tri::any(children.iter().map(|c| eval_expr_at(c, ctx, anchor_tf, anchor_bars_ago))),
        Expr::Not(child) => eval_expr_at(child, ctx, anchor_tf, anchor_bars_ago).not(),
        Expr::HoldsFor { bars, anchor_tf: window_tf, expr: inner } => {
            let results: Vec<Tri> =
                (anchor_bars_ago..anchor_bars_ago + bars).map(|k| eval_expr_at(inner, ctx, Some(*window_tf), k)).collect();
            Tri::all(results)
        }
        Expr::HoldsForDuration { .. } => Tri::Indeterminate, // resolved to HoldsFor before evaluation
        Expr::OccurredWithin { bars, anchor_tf: window_tf, expr: inner } => {
            let results: Vec<Tri> =
                (anchor_bars_ago..anchor_bars_ago + bars).map(|k| eval_expr_at(inner, ctx, Some(*window_tf), k)).collect();
            Tri::any(results)
        }
        Expr::CountTrue { bars, min_true, anchor_tf: window_tf, expr: inner } => {
            let results: Vec<Tri> =
                (anchor_bars_ago..anchor_bars_ago + bars).map(|k| eval_expr_at(inner, ctx, Some(*window_tf), k)).collect();
            let true_count = results.iter().filter(|t| t.is_true()).count();
            let indeterminate_count = results.iter().filter(|t| matches!(t, Tri::Indeterminate)).count();
            if true_count >= *min_true {
                Tri::True
            } else if true_count + indeterminate_count < *min_true {
                Tri::False
            } else {
                Tri::Indeterminate
            }
        }
        Expr::SetupRef(id) => {
            tracing::error!(setup_id = %id, "unresolved SetupRef reached the evaluator");
            Tri::Indeterminate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::ast::{CompareOp, ScalarValue};
    use std::collections::HashMap;

    struct FakeCtx {
        series: HashMap<String, Vec<f64>>,
    }

    impl EvalContext for FakeCtx {
        fn feature_value(
            &self,
            feature_id: &str,
            _field: Option<&str>,
            offset: usize,
            _anchor_tf: Option<Timeframe>,
            anchor_bars_ago: usize,
        ) -> Option<f64> {
            let series = self.series.get(feature_id)?;
            let idx = series.len().checked_sub(1)?.checked_sub(offset + anchor_bars_ago)?;
            series.get(idx).copied().filter(|v| v.is_finite())
        }

        fn feature_type(&self, _feature_id: &str, _field: Option<&str>) -> Option<FeatureOutputType> {
            Some(FeatureOutputType::Float)
        }
    }

    fn ctx_with(series: &[(&str, Vec<f64>)]) -> FakeCtx {
        FakeCtx { series: series.iter().map(|(k, v)| (k.to_string(), v.clone())).collect() }
    }

    #[test]
    fn gt_comparison_true_when_feature_exceeds_scalar() {
        let ctx = ctx_with(&[("rsi", vec![10.0, 20.0, 75.0])]);
        let cond = Cond {
            lhs: Operand::Feature(FeatureRef::new("rsi", None, 0)),
            op: CondOp::Compare(CompareOp::Gt),
            rhs: Rhs::Operand(Operand::Scalar(ScalarValue::Float(70.0))),
            tolerance: None,
        };
        assert_eq!(eval_expr(&Expr::Cond(cond), &ctx), Tri::True);
    }

    #[test]
    fn missing_value_is_indeterminate() {
        let ctx = ctx_with(&[("rsi", vec![f64::NAN])]);
        let cond = Cond {
            lhs: Operand::Feature(FeatureRef::new("rsi", None, 0)),
            op: CondOp::Compare(CompareOp::Gt),
            rhs: Rhs::Operand(Operand::Scalar(ScalarValue::Float(70.0))),
            tolerance: None,
        };
        assert_eq!(eval_expr(&Expr::Cond(cond), &ctx), Tri::Indeterminate);
    }

    #[test]
    fn cross_above_requires_prior_bar_on_other_side() {
        let ctx = ctx_with(&[("fast", vec![9.0, 11.0]), ("slow", vec![10.0, 10.0])]);
        let cond = Cond {
            lhs: Operand::Feature(FeatureRef::new("fast", None, 0)),
            op: CondOp::Cross(CrossOp::Above),
            rhs: Rhs::Operand(Operand::Feature(FeatureRef::new("slow", None, 0))),
            tolerance: None,
        };
        assert_eq!(eval_expr(&Expr::Cond(cond), &ctx), Tri::True);
    }

    #[test]
    fn holds_for_requires_every_bar_true() {
        let ctx = ctx_with(&[("rsi", vec![80.0, 75.0, 60.0])]);
        let inner = Expr::Cond(Cond {
            lhs: Operand::Feature(FeatureRef::new("rsi", None, 0)),
            op: CondOp::Compare(CompareOp::Gt),
            rhs: Rhs::Operand(Operand::Scalar(ScalarValue::Float(70.0))),
            tolerance: None,
        });
        let window = Expr::HoldsFor { bars: 2, anchor_tf: backtest_types::Timeframe::Minute1, expr: Box::new(inner) };
        assert_eq!(eval_expr(&window, &ctx), Tri::False);
    }

    #[test]
    fn holds_for_passes_its_declared_anchor_tf_down_to_feature_lookups() {
        struct AnchorSpyCtx;
        impl EvalContext for AnchorSpyCtx {
            fn feature_value(
                &self,
                _feature_id: &str,
                _field: Option<&str>,
                _offset: usize,
                anchor_tf: Option<Timeframe>,
                _anchor_bars_ago: usize,
            ) -> Option<f64> {
                // Only resolves once the window's anchor_tf reaches the leaf lookup.
                if anchor_tf == Some(Timeframe::Minute15) {
                    Some(1.0)
                } else {
                    None
                }
            }
            fn feature_type(&self, _feature_id: &str, _field: Option<&str>) -> Option<FeatureOutputType> {
                Some(FeatureOutputType::Float)
            }
        }
        let inner = Expr::Cond(Cond {
            lhs: Operand::Feature(FeatureRef::new("rsi", None, 0)),
            op: CondOp::Compare(CompareOp::Gt),
            rhs: Rhs::Operand(Operand::Scalar(ScalarValue::Float(0.0))),
            tolerance: None,
        });
        let window = Expr::HoldsFor { bars: 2, anchor_tf: Timeframe::Minute15, expr: Box::new(inner) };
        assert_eq!(eval_expr(&window, &AnchorSpyCtx), Tri::True);
    }

    #[test]
    fn indeterminate_and_false_propagates_to_false_in_all() {
        let ctx = ctx_with(&[("rsi", vec![f64::NAN])]);
        let indeterminate = Expr::Cond(Cond {
            lhs: Operand::Feature(FeatureRef::new("rsi", None, 0)),
            op: CondOp::Compare(CompareOp::Gt),
            rhs: Rhs::Operand(Operand::Scalar(ScalarValue::Float(70.0))),
            tolerance: None,
        });
        let always_false = Expr::Cond(Cond {
            lhs: Operand::Scalar(ScalarValue::Float(1.0)),
            op: CondOp::Compare(CompareOp::Gt),
            rhs: Rhs::Operand(Operand::Scalar(ScalarValue::Float(2.0))),
            tolerance: None,
        });
        let all = Expr::All(vec![indeterminate, always_false]);
        assert_eq!(eval_expr(&all, &ctx), Tri::False);
    }
}
