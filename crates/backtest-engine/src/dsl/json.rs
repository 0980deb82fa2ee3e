//! JSON encoding for the expression tree, used by Play document loading
//! (§6.3: Play structs derive `Deserialize` for an external YAML/JSON
//! loader to populate). A condition document is a single-key tagged
//! union; see the module tests for the exact shapes accepted.

use backtest_types::Timeframe;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::ast::{
    ArithOp, ArithmeticExpr, CompareOp, Cond, CondOp, CrossOp, Expr, FeatureRef, ListValue, Operand, RangeValue, Rhs,
    ScalarValue,
};

fn err(msg: impl Into<String>) -> String {
    msg.into()
}

fn scalar_from_value(v: &Value) -> Result<ScalarValue, String> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(ScalarValue::Int(i))
            } else {
                n.as_f64().map(ScalarValue::Float).ok_or_else(|| err("non-finite scalar number"))
            }
        }
        Value::Bool(b) => Ok(ScalarValue::Bool(*b)),
        Value::String(s) => Ok(ScalarValue::Str(s.clone())),
        other => Err(err(format!("expected a scalar literal, got {other}"))),
    }
}

fn operand_from_value(v: &Value) -> Result<Operand, String> {
    match v {
        Value::Object(map) if map.contains_key("feature") => {
            let feature_id = map["feature"].as_str().ok_or_else(|| err("feature ref id must be a string"))?.to_string();
            let field = map.get("field").and_then(|f| f.as_str()).map(|s| s.to_string());
            let offset = map.get("offset").and_then(|o| o.as_u64()).unwrap_or(0) as usize;
            Ok(Operand::Feature(FeatureRef::new(feature_id, field, offset)))
        }
        Value::Object(map) if map.contains_key("op") => {
            let op_str = map["op"].as_str().ok_or_else(|| err("arithmetic op must be a string"))?;
            let op = match op_str {
                "+" => ArithOp::Add,
                "-" => ArithOp::Sub,
                "*" => ArithOp::Mul,
                "/" => ArithOp::Div,
                "%" => ArithOp::Mod,
                other => return Err(err(format!("unknown arithmetic op '{other}'"))),
            };
            let left = operand_from_value(map.get("left").ok_or_else(|| err("arithmetic expr missing 'left'"))?)?;
            let right = operand_from_value(map.get("right").ok_or_else(|| err("arithmetic expr missing 'right'"))?)?;
            Ok(Operand::Arith(Box::new(ArithmeticExpr { left, op, right })))
        }
        other => scalar_from_value(other).map(Operand::Scalar),
    }
}

fn compare_op_from_str(s: &str) -> Option<CondOp> {
    Some(match s {
        "gt" => CondOp::Compare(CompareOp::Gt),
        "lt" => CondOp::Compare(CompareOp::Lt),
        "gte" => CondOp::Compare(CompareOp::Gte),
        "lte" => CondOp::Compare(CompareOp::Lte),
        "eq" => CondOp::Compare(CompareOp::Eq),
        "neq" => CondOp::Compare(CompareOp::Neq),
        "cross_above" => CondOp::Cross(CrossOp::Above),
        "cross_below" => CondOp::Cross(CrossOp::Below),
        "between" => CondOp::Between,
        "in" => CondOp::In,
        "near_abs" => CondOp::NearAbs,
        "near_pct" => CondOp::NearPct,
        _ => return None,
    })
}

fn cond_from_value(v: &Value) -> Result<Cond, String> {
    let map = v.as_object().ok_or_else(|| err("'cond' body must be an object"))?;
    let lhs = operand_from_value(map.get("lhs").ok_or_else(|| err("cond missing 'lhs'"))?)?;
    let op_str = map.get("op").and_then(|o| o.as_str()).ok_or_else(|| err("cond missing string 'op'"))?;
    let op = compare_op_from_str(op_str).ok_or_else(|| err(format!("unknown cond op '{op_str}'")))?;
    let tolerance = map.get("tolerance").and_then(|t| t.as_f64());

    let rhs = match op {
        CondOp::Between => {
            let arr = map
                .get("rhs")
                .and_then(|r| r.as_array())
                .filter(|a| a.len() == 2)
                .ok_or_else(|| err("'between' requires rhs=[lo, hi]"))?;
            let lo = arr[0].as_f64().ok_or_else(|| err("'between' lo must be numeric"))?;
            let hi = arr[1].as_f64().ok_or_else(|| err("'between' hi must be numeric"))?;
            Rhs::Range(RangeValue { lo, hi })
        }
        CondOp::In => {
            let arr = map.get("rhs").and_then(|r| r.as_array()).ok_or_else(|| err("'in' requires rhs=[...]"))?;
            let values = arr.iter().map(scalar_from_value).collect::<Result<Vec<_>, _>>()?;
            Rhs::List(ListValue(values))
        }
        _ => {
            let rhs_value = map.get("rhs").ok_or_else(|| err("cond missing 'rhs'"))?;
            Rhs::Operand(operand_from_value(rhs_value)?)
        }
    };

    if matches!(op, CondOp::NearAbs | CondOp::NearPct) && tolerance.is_none() {
        return Err(err("near_abs/near_pct require a numeric 'tolerance'"));
    }

    Ok(Cond { lhs, op, rhs, tolerance })
}

fn anchor_tf_from_map(map: &serde_json::Map<String, Value>) -> Result<Timeframe, String> {
    match map.get("anchor_tf").and_then(|t| t.as_str()) {
        Some(s) => Timeframe::parse(s).ok_or_else(|| err(format!("unknown anchor_tf '{s}'"))),
        None => Ok(backtest_types::ACTION_TIMEFRAME),
    }
}

pub fn expr_from_value(v: &Value) -> Result<Expr, String> {
    let map = v.as_object().ok_or_else(|| err("expression node must be a JSON object"))?;
    if map.len() != 1 {
        return Err(err("expression node must have exactly one tag key"));
    }
    let (tag, body) = map.iter().next().unwrap();
    Ok(match tag.as_str() {
        "cond" => Expr::Cond(cond_from_value(body)?),
        "all" => {
            let items = body.as_array().ok_or_else(|| err("'all' body must be an array"))?;
            Expr::All(items.iter().map(expr_from_value).collect::<Result<_, _>>()?)
        }
        "any" => {
            let items = body.as_array().ok_or_else(|| err("'any' body must be an array"))?;
            Expr::Any(items.iter().map(expr_from_value).collect::<Result<_, _>>()?)
        }
        "not" => Expr::Not(Box::new(expr_from_value(body)?)),
        "holds_for" => {
            let map = body.as_object().ok_or_else(|| err("'holds_for' body must be an object"))?;
            let bars = map.get("bars").and_then(|b| b.as_u64()).ok_or_else(|| err("'holds_for' missing 'bars'"))? as usize;
            let anchor_tf = anchor_tf_from_map(map)?;
            let inner = expr_from_value(map.get("expr").ok_or_else(|| err("'holds_for' missing 'expr'"))?)?;
            Expr::HoldsFor { bars, anchor_tf, expr: Box::new(inner) }
        }
        "holds_for_duration" => {
            let map = body.as_object().ok_or_else(|| err("'holds_for_duration' body must be an object"))?;
            let duration = map
                .get("duration")
                .and_then(|d| d.as_str())
                .ok_or_else(|| err("'holds_for_duration' missing 'duration'"))?
                .to_string();
            let anchor_tf = anchor_tf_from_map(map)?;
            let inner = expr_from_value(map.get("expr").ok_or_else(|| err("'holds_for_duration' missing 'expr'"))?)?;
            Expr::HoldsForDuration { duration, anchor_tf, expr: Box::new(inner) }
        }
        "occurred_within" => {
            let map = body.as_object().ok_or_else(|| err("'occurred_within' body must be an object"))?;
            let bars =
                map.get("bars").and_then(|b| b.as_u64()).ok_or_else(|| err("'occurred_within' missing 'bars'"))? as usize;
            let anchor_tf = anchor_tf_from_map(map)?;
            let inner = expr_from_value(map.get("expr").ok_or_else(|| err("'occurred_within' missing 'expr'"))?)?;
            Expr::OccurredWithin { bars, anchor_tf, expr: Box::new(inner) }
        }
        "count_true" => {
            let map = body.as_object().ok_or_else(|| err("'count_true' body must be an object"))?;
            let bars = map.get("bars").and_then(|b| b.as_u64()).ok_or_else(|| err("'count_true' missing 'bars'"))? as usize;
            let min_true =
                map.get("min_true").and_then(|m| m.as_u64()).ok_or_else(|| err("'count_true' missing 'min_true'"))? as usize;
            let anchor_tf = anchor_tf_from_map(map)?;
            let inner = expr_from_value(map.get("expr").ok_or_else(|| err("'count_true' missing 'expr'"))?)?;
            Expr::CountTrue { bars, min_true, anchor_tf, expr: Box::new(inner) }
        }
        "setup_ref" => Expr::SetupRef(body.as_str().ok_or_else(|| err("'setup_ref' body must be a string id"))?.to_string()),
        other => return Err(err(format!("unknown expression tag '{other}'"))),
    })
}

fn operand_to_value(op: &Operand) -> Value {
    match op {
        Operand::Feature(r) => {
            let mut m = serde_json::Map::new();
            m.insert("feature".into(), Value::String(r.feature_id.clone()));
            if let Some(field) = &r.field {
                m.insert("field".into(), Value::String(field.clone()));
            }
            if r.offset != 0 {
                m.insert("offset".into(), Value::from(r.offset));
            }
            Value::Object(m)
        }
        Operand::Scalar(s) => match s {
            ScalarValue::Float(v) => Value::from(*v),
            ScalarValue::Int(v) => Value::from(*v),
            ScalarValue::Bool(v) => Value::from(*v),
            ScalarValue::Str(v) => Value::String(v.clone()),
        },
        Operand::Arith(a) => {
            let op_str = match a.op {
                ArithOp::Add => "+",
                ArithOp::Sub => "-",
                ArithOp::Mul => "*",
                ArithOp::Div => "/",
                ArithOp::Mod => "%",
            };
            serde_json::json!({"op": op_str, "left": operand_to_value(&a.left), "right": operand_to_value(&a.right)})
        }
    }
}

pub fn expr_to_value(expr: &Expr) -> Value {
    match expr {
        Expr::Cond(c) => {
            let op_str = match c.op {
                CondOp::Compare(CompareOp::Gt) => "gt",
                CondOp::Compare(CompareOp::Lt) => "lt",
                CondOp::Compare(CompareOp::Gte) => "gte",
                CondOp::Compare(CompareOp::Lte) => "lte",
                CondOp::Compare(CompareOp::Eq) => "eq",
                CondOp::Compare(CompareOp::Neq) => "neq",
                CondOp::Cross(CrossOp::Above) => "cross_above",
                CondOp::Cross(CrossOp::Below) => "cross_below",
                CondOp::Between => "between",
                CondOp::In => "in",
                CondOp::NearAbs => "near_abs",
                CondOp::NearPct => "near_pct",
            };
            let rhs_value = match &c.rhs {
                Rhs::Operand(o) => operand_to_value(o),
                Rhs::Range(r) => serde_json::json!([r.lo, r.hi]),
                Rhs::List(l) => Value::Array(l.0.iter().map(|s| operand_to_value(&Operand::Scalar(s.clone()))).collect()),
            };
            let mut body = serde_json::json!({"lhs": operand_to_value(&c.lhs), "op": op_str, "rhs": rhs_value});
            if let Some(tol) = c.tolerance {
                body["tolerance"] = Value::from(tol);
            }
            serde_json::json!({"cond": body})
        }
        Expr::All(children) => serde_json::json!({"all": children.iter().map(expr_to_value).collect::<Vec<_>>()}),
        Expr::Any(children) => serde_json::json!({"any": children.iter().map(expr_to_value).collect::<Vec<_>>()}),
        Expr::Not(inner) => serde_json::json!({"not": expr_to_value(inner)}),
        Expr::HoldsFor { bars, anchor_tf, expr: inner } => {
            serde_json::json!({"holds_for": {"bars": bars, "anchor_tf": anchor_tf.as_str(), "expr": expr_to_value(inner)}})
        }
        Expr::HoldsForDuration { duration, anchor_tf, expr: inner } => {
            serde_json::json!({"holds_for_duration": {"duration": duration, "anchor_tf": anchor_tf.as_str(), "expr": expr_to_value(inner)}})
        }
        Expr::OccurredWithin { bars, anchor_tf, expr: inner } => {
            serde_json::json!({"occurred_within": {"bars": bars, "anchor_tf": anchor_tf.as_str(), "expr": expr_to_value(inner)}})
        }
        Expr::CountTrue { bars, min_true, anchor_tf, expr: inner } => {
            serde_json::json!({"count_true": {"bars": bars, "min_true": min_true, "anchor_tf": anchor_tf.as_str(), "expr": expr_to_value(inner)}})
        }
        Expr::SetupRef(id) => serde_json::json!({"setup_ref": id}),
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        expr_to_value(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        expr_from_value(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_crossover_condition() {
        let json = serde_json::json!({
            "cond": {
                "lhs": {"feature": "ema_fast"},
                "op": "cross_above",
                "rhs": {"feature": "ema_slow"}
            }
        });
        let expr = expr_from_value(&json).unwrap();
        assert!(matches!(expr, Expr::Cond(_)));
        let back = expr_to_value(&expr);
        let reparsed = expr_from_value(&back).unwrap();
        assert_eq!(expr, reparsed);
    }

    #[test]
    fn parses_nested_all_with_holds_for_and_window() {
        let json = serde_json::json!({
            "all": [
                {"cond": {"lhs": {"feature": "rsi"}, "op": "gt", "rhs": 70.0}},
                {"holds_for": {"bars": 3, "expr": {"cond": {"lhs": {"feature": "rsi"}, "op": "gt", "rhs": 60.0}}}}
            ]
        });
        let expr = expr_from_value(&json).unwrap();
        match expr {
            Expr::All(children) => assert_eq!(children.len(), 2),
            _ => panic!("expected All"),
        }
    }

    #[test]
    fn near_abs_without_tolerance_is_rejected() {
        let json = serde_json::json!({"cond": {"lhs": {"feature": "close"}, "op": "near_abs", "rhs": 100.0}});
        assert!(expr_from_value(&json).is_err());
    }

    #[test]
    fn between_requires_two_element_array() {
        let json = serde_json::json!({"cond": {"lhs": {"feature": "rsi"}, "op": "between", "rhs": [30.0, 70.0]}});
        let expr = expr_from_value(&json).unwrap();
        match expr {
            Expr::Cond(c) => assert_eq!(c.rhs, Rhs::Range(RangeValue { lo: 30.0, hi: 70.0 })),
            _ => panic!("expected Cond"),
        }
    }
}
