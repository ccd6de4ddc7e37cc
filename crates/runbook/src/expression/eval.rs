//! AST evaluation against a variable context.
//!
//! Evaluation is total: it cannot fail. Unknown identifiers resolve to
//! "undefined" (modeled as `None`), which is falsy and compares equal
//! only to `null`/`undefined`, the same forgiving behavior workflow
//! authors get from browser-side condition checks.

use super::parser::{CompareOp, Expr};
use serde_json::{Map, Value};

/// `None` plays the role of JavaScript's `undefined`; `Some(Value::Null)`
/// is an explicit null stored in the context.
pub(crate) type Operand = Option<Value>;

pub(crate) fn eval(expr: &Expr, ctx: &Map<String, Value>) -> Operand {
    match expr {
        Expr::Literal(value) => Some(value.clone()),
        Expr::Identifier(path) => resolve_path(path, ctx),
        Expr::Not(operand) => Some(Value::Bool(!truthy(&eval(operand, ctx)))),
        // Logical operators short-circuit and yield the deciding operand,
        // so `a || fallback` keeps its value through parenthesized comparisons.
        Expr::And(left, right) => {
            let l = eval(left, ctx);
            if !truthy(&l) {
                l
            } else {
                eval(right, ctx)
            }
        }
        Expr::Or(left, right) => {
            let l = eval(left, ctx);
            if truthy(&l) {
                l
            } else {
                eval(right, ctx)
            }
        }
        Expr::Compare(op, left, right) => {
            let l = eval(left, ctx);
            let r = eval(right, ctx);
            let outcome = match op {
                CompareOp::LooseEq => loose_eq(&l, &r),
                CompareOp::LooseNe => !loose_eq(&l, &r),
                CompareOp::StrictEq => strict_eq(&l, &r),
                CompareOp::StrictNe => !strict_eq(&l, &r),
                CompareOp::Lt => ordering(&l, &r, |o| o == std::cmp::Ordering::Less),
                CompareOp::Le => ordering(&l, &r, |o| o != std::cmp::Ordering::Greater),
                CompareOp::Gt => ordering(&l, &r, |o| o == std::cmp::Ordering::Greater),
                CompareOp::Ge => ordering(&l, &r, |o| o != std::cmp::Ordering::Less),
            };
            Some(Value::Bool(outcome))
        }
    }
}

/// Walk a dotted property path into the context. Any missing hop yields
/// undefined rather than an error.
fn resolve_path(path: &[String], ctx: &Map<String, Value>) -> Operand {
    let mut current = ctx.get(path.first()?)?;
    for segment in &path[1..] {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// JavaScript-style truthiness: `false`, `0`, `NaN`, `""`, `null` and
/// `undefined` are falsy; everything else (including empty arrays and
/// objects) is truthy.
pub(crate) fn truthy(operand: &Operand) -> bool {
    match operand {
        None => false,
        Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Numeric coercion for ordering and loose equality, mirroring
/// JavaScript's `Number()`: `null` is 0, booleans are 0/1, blank strings
/// are 0, non-numeric strings and `undefined` are NaN (`None` here).
fn to_number(operand: &Operand) -> Option<f64> {
    match operand {
        None => None,
        Some(Value::Null) => Some(0.0),
        Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse().ok()
            }
        }
        Some(Value::Array(_)) | Some(Value::Object(_)) => None,
    }
}

/// Designed loose-equality coercion (`==`), replicating the source
/// system's host-language rules for the value kinds the engine produces:
///
/// - `null` and `undefined` equal each other and nothing else;
/// - number ↔ numeric-string comparison goes through [`to_number`];
/// - booleans coerce to 0/1 before comparing against numbers/strings;
/// - strings compare by content;
/// - arrays/objects compare structurally against each other and are
///   never loosely equal to primitives (a documented simplification of
///   ToPrimitive, which the workflow value model does not need).
pub(crate) fn loose_eq(left: &Operand, right: &Operand) -> bool {
    let left_absent = matches!(left, None | Some(Value::Null));
    let right_absent = matches!(right, None | Some(Value::Null));
    if left_absent || right_absent {
        return left_absent && right_absent;
    }

    match (left, right) {
        (Some(Value::String(l)), Some(Value::String(r))) => l == r,
        (Some(Value::Array(l)), Some(Value::Array(r))) => l == r,
        (Some(Value::Object(l)), Some(Value::Object(r))) => l == r,
        (Some(Value::Array(_) | Value::Object(_)), _)
        | (_, Some(Value::Array(_) | Value::Object(_))) => false,
        // Remaining mixes of number/string/bool all compare numerically.
        _ => match (to_number(left), to_number(right)) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        },
    }
}

/// Strict equality (`===`): identical kind and value, no coercion.
/// `undefined === undefined` and `null === null` hold; `null === undefined`
/// does not.
pub(crate) fn strict_eq(left: &Operand, right: &Operand) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(Value::Number(l)), Some(Value::Number(r))) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        },
        (Some(l), Some(r)) => {
            std::mem::discriminant(l) == std::mem::discriminant(r) && l == r
        }
        _ => false,
    }
}

/// Ordering comparison: numeric when both sides coerce to numbers,
/// lexicographic when both sides are strings, otherwise false (never an
/// error; incomparable operands simply fail the test).
fn ordering(left: &Operand, right: &Operand, test: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    if let (Some(Value::String(l)), Some(Value::String(r))) = (left, right) {
        return test(l.cmp(r));
    }
    match (to_number(left), to_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r).map(&test).unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn val(v: Value) -> Operand {
        Some(v)
    }

    #[test]
    fn test_truthiness_table() {
        assert!(!truthy(&None));
        assert!(!truthy(&val(json!(null))));
        assert!(!truthy(&val(json!(false))));
        assert!(!truthy(&val(json!(0))));
        assert!(!truthy(&val(json!(""))));
        assert!(truthy(&val(json!(1))));
        assert!(truthy(&val(json!("no"))));
        assert!(truthy(&val(json!([]))));
        assert!(truthy(&val(json!({}))));
    }

    #[test]
    fn test_loose_eq_coercions() {
        assert!(loose_eq(&val(json!(5)), &val(json!("5"))));
        assert!(loose_eq(&val(json!("5.0")), &val(json!(5))));
        assert!(loose_eq(&val(json!(true)), &val(json!(1))));
        assert!(loose_eq(&val(json!(false)), &val(json!(""))));
        assert!(loose_eq(&None, &val(json!(null))));
        assert!(!loose_eq(&None, &val(json!(0))));
        assert!(!loose_eq(&val(json!("abc")), &val(json!(0))));
    }

    #[test]
    fn test_strict_eq_no_coercion() {
        assert!(!strict_eq(&val(json!(5)), &val(json!("5"))));
        assert!(strict_eq(&val(json!(5)), &val(json!(5.0))));
        assert!(strict_eq(&val(json!("a")), &val(json!("a"))));
        assert!(!strict_eq(&None, &val(json!(null))));
        assert!(strict_eq(&None, &None));
    }

    #[test]
    fn test_ordering_mixed() {
        assert!(ordering(&val(json!("10")), &val(json!(9)), |o| {
            o == std::cmp::Ordering::Greater
        }));
        // Both strings: lexicographic, so "10" < "9".
        assert!(ordering(&val(json!("10")), &val(json!("9")), |o| {
            o == std::cmp::Ordering::Less
        }));
        // Undefined is incomparable.
        assert!(!ordering(&None, &val(json!(1)), |_| true));
    }
}
