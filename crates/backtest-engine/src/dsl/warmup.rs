//! Warmup analysis over a resolved expression tree. §4.D: "Warmup
//! analysis over a block tree returns `{max_offset, max_window_bars,
//! crossover_requires_one}`."

use super::ast::{CondOp, Expr, Operand};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupAnalysis {
    pub max_offset: usize,
    pub max_window_bars: usize,
    pub crossover_requires_one: bool,
}

impl WarmupAnalysis {
    fn merge(self, other: Self) -> Self {
        Self {
            max_offset: self.max_offset.max(other.max_offset),
            max_window_bars: self.max_window_bars.max(other.max_window_bars),
            crossover_requires_one: self.crossover_requires_one || other.crossover_requires_one,
        }
    }

    /// Minimum number of exec bars that must have closed before this
    /// expression can ever evaluate to a non-indeterminate result.
    pub fn required_bars(&self) -> usize {
        let cross = if self.crossover_requires_one { 1 } else { 0 };
        self.max_offset.max(cross) + self.max_window_bars
    }
}

fn operand_max_offset(operand: &Operand) -> usize {
    match operand {
        Operand::Feature(r) => r.offset,
        Operand::Scalar(_) => 0,
        Operand::Arith(a) => operand_max_offset(&a.left).max(operand_max_offset(&a.right)),
    }
}

pub fn analyze(expr: &Expr) -> WarmupAnalysis {
    match expr {
        Expr::Cond(c) => {
            let mut offset = operand_max_offset(&c.lhs);
            let crossover = matches!(c.op, CondOp::Cross(_));
            if let super::ast::Rhs::Operand(rhs) = &c.rhs {
                offset = offset.max(operand_max_offset(rhs));
            }
            WarmupAnalysis { max_offset: offset, max_window_bars: 0, crossover_requires_one: crossover }
        }
        Expr::All(children) | Expr::Any(children) => {
            children.iter().map(analyze).fold(WarmupAnalysis::default(), WarmupAnalysis::merge)
        }
        Expr::Not(inner) => analyze(inner),
        Expr::HoldsFor { bars, expr: inner, .. } | Expr::OccurredWithin { bars, expr: inner, .. } => {
            let inner_analysis = analyze(inner);
            WarmupAnalysis {
                max_offset: inner_analysis.max_offset,
                max_window_bars: inner_analysis.max_window_bars + bars.saturating_sub(1),
                crossover_requires_one: inner_analysis.crossover_requires_one,
            }
        }
        Expr::CountTrue { bars, expr: inner, .. } => {
            let inner_analysis = analyze(inner);
            WarmupAnalysis {
                max_offset: inner_analysis.max_offset,
                max_window_bars: inner_analysis.max_window_bars + bars.saturating_sub(1),
                crossover_requires_one: inner_analysis.crossover_requires_one,
            }
        }
        // Duration variants are normalized into bar-count variants before
        // warmup analysis ever runs (see `normalize_durations`).
        Expr::HoldsForDuration { expr: inner, .. } => analyze(inner),
        Expr::SetupRef(_) => WarmupAnalysis::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::ast::{Cond, CondOp, CompareOp, CrossOp, FeatureRef, Rhs, ScalarValue};
    use backtest_types::Timeframe;

    fn cmp_cond(offset: usize) -> Expr {
        Expr::Cond(Cond {
            lhs: Operand::Feature(FeatureRef::new("rsi", None, offset)),
            op: CondOp::Compare(CompareOp::Gt),
            rhs: Rhs::Operand(Operand::Scalar(ScalarValue::Float(70.0))),
            tolerance: None,
        })
    }

    #[test]
    fn plain_comparison_has_zero_window_contribution() {
        let analysis = analyze(&cmp_cond(0));
        assert_eq!(analysis, WarmupAnalysis { max_offset: 0, max_window_bars: 0, crossover_requires_one: false });
        assert_eq!(analysis.required_bars(), 0);
    }

    #[test]
    fn offset_propagates_as_max_offset() {
        let analysis = analyze(&cmp_cond(5));
        assert_eq!(analysis.max_offset, 5);
        assert_eq!(analysis.required_bars(), 5);
    }

    #[test]
    fn crossover_requires_at_least_one_bar() {
        let cond = Cond {
            lhs: Operand::Feature(FeatureRef::new("fast", None, 0)),
            op: CondOp::Cross(CrossOp::Above),
            rhs: Rhs::Operand(Operand::Feature(FeatureRef::new("slow", None, 0))),
            tolerance: None,
        };
        let analysis = analyze(&Expr::Cond(cond));
        assert!(analysis.crossover_requires_one);
        assert_eq!(analysis.required_bars(), 1);
    }

    #[test]
    fn holds_for_adds_bars_minus_one_to_window() {
        let window = Expr::HoldsFor { bars: 10, anchor_tf: Timeframe::Minute1, expr: Box::new(cmp_cond(0)) };
        let analysis = analyze(&window);
        assert_eq!(analysis.max_window_bars, 9);
        assert_eq!(analysis.required_bars(), 9);
    }

    #[test]
    fn nested_window_and_offset_combine_in_all() {
        let window = Expr::HoldsFor { bars: 3, anchor_tf: Timeframe::Minute1, expr: Box::new(cmp_cond(2)) };
        let all = Expr::All(vec![window, cmp_cond(7)]);
        let analysis = analyze(&all);
        assert_eq!(analysis.max_offset, 7);
        assert_eq!(analysis.max_window_bars, 2);
    }
}
