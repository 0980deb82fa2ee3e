//! Named reusable sub-expressions (Setups), resolved at parse time.
//! §4.D: "Setup references must be declared; circular references among
//! Setups are detected via DFS and rejected."

use std::collections::HashMap;

use backtest_types::BacktestError;

use super::ast::Expr;

pub struct SetupRegistry {
    setups: HashMap<String, Expr>,
}

impl SetupRegistry {
    pub fn new(setups: HashMap<String, Expr>) -> Self {
        Self { setups }
    }

    /// Inlines every `SetupRef` in `expr` with its registered definition,
    /// recursively, failing on an undeclared id or a cycle.
    pub fn resolve(&self, expr: &Expr) -> Result<Expr, BacktestError> {
        let mut stack = Vec::new();
        self.resolve_inner(expr, &mut stack)
    }

    fn resolve_inner(&self, expr: &Expr, stack: &mut Vec<String>) -> Result<Expr, BacktestError> {
        Ok(match expr {
            Expr::Cond(c) => Expr::Cond(c.clone()),
            Expr::All(children) => {
                Expr::All(children.iter().map(|c| self.resolve_inner(c, stack)).collect::<Result<_, _>>()?)
            }
            Expr::Any(children) => {
                Expr::Any(children.iter().map(|c| self.resolve_inner(c, stack)).collect::<Result<_, _>>()?)
            }
            Expr::Not(child) => Expr::Not(Box::new(self.resolve_inner(child, stack)?)),
            Expr::HoldsFor { bars, anchor_tf, expr: inner } => Expr::HoldsFor {
                bars: *bars,
                anchor_tf: *anchor_tf,
                expr: Box::new(self.resolve_inner(inner, stack)?),
            },
            Expr::HoldsForDuration { duration, anchor_tf, expr: inner } => Expr::HoldsForDuration {
                duration: duration.clone(),
                anchor_tf: *anchor_tf,
                expr: Box::new(self.resolve_inner(inner, stack)?),
            },
            Expr::OccurredWithin { bars, anchor_tf, expr: inner } => Expr::OccurredWithin {
                bars: *bars,
                anchor_tf: *anchor_tf,
                expr: Box::new(self.resolve_inner(inner, stack)?),
            },
            Expr::CountTrue { bars, min_true, anchor_tf, expr: inner } => Expr::CountTrue {
                bars: *bars,
                min_true: *min_true,
                anchor_tf: *anchor_tf,
                expr: Box::new(self.resolve_inner(inner, stack)?),
            },
            Expr::SetupRef(id) => {
                if stack.contains(id) {
                    return Err(BacktestError::dsl_type(
                        format!("setup[{id}]"),
                        format!("circular setup reference: {} -> {id}", stack.join(" -> ")),
                    ));
                }
                let definition = self
                    .setups
                    .get(id)
                    .ok_or_else(|| BacktestError::dsl_type(format!("setup[{id}]"), "undeclared setup reference"))?;
                stack.push(id.clone());
                let resolved = self.resolve_inner(definition, stack)?;
                stack.pop();
                resolved
            }
        })
    }
}
