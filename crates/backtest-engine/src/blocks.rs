//! Case/When/Emit control flow blocks. §4.E.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dsl::{eval_expr, EvalContext, Expr, Tri};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    EntryLong,
    EntryShort,
    ExitLong,
    ExitShort,
    ExitAll,
    NoAction,
}

/// A metadata value attached to an Intent: either a literal or a feature
/// lookup resolved at emit time (e.g. sizing the order off a feature
/// value).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    Feature(crate::dsl::FeatureRef),
    Literal(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub action: Action,
    #[serde(default)]
    pub metadata: HashMap<String, MetadataValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Case {
    pub when: Expr,
    pub emit: Vec<Intent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElseBranch {
    pub emit: Vec<Intent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub id: String,
    pub cases: Vec<Case>,
    #[serde(default, rename = "else")]
    pub else_branch: Option<ElseBranch>,
}

impl Block {
    /// First-match evaluation: the first case whose `when` is `True`
    /// emits; an indeterminate `when` does not match. Falls through to
    /// `else` when present, otherwise emits nothing.
    pub fn evaluate(&self, ctx: &dyn EvalContext) -> &[Intent] {
        for case in &self.cases {
            if matches!(eval_expr(&case.when, ctx), Tri::True) {
                return &case.emit;
            }
        }
        self.else_branch.as_ref().map(|e| e.emit.as_slice()).unwrap_or(&[])
    }
}

/// Evaluates every block in declaration order and concatenates their
/// emitted intents in block order, per §4.E.
pub fn evaluate_all(blocks: &[Block], ctx: &dyn EvalContext) -> Vec<Intent> {
    blocks.iter().flat_map(|b| b.evaluate(ctx).to_vec()).collect()
}
