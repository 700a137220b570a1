//! Compile-time evaluation of configuration constants.
//!
//! A small pure sublanguage (literals, const references, unary/binary
//! arithmetic, vector initializers) is folded to a [`Value`]. This is
//! deliberately independent of any runtime path; anything outside the
//! sublanguage is rejected as non-constant.
use std::collections::HashMap;

use super::{AnalysisError, Value};
use crate::parser::ast::{BinaryOp, Expression, ExpressionKind, UnaryOp};

type EResult = Result<Value, AnalysisError>;

/// Fold a constant expression, resolving identifiers through `consts`.
pub fn eval(expr: &Expression, consts: &HashMap<String, Value>) -> EResult {
    let err = |message: String| AnalysisError {
        message,
        span: expr.span,
    };

    match &expr.kind {
        ExpressionKind::BoolLit(value) => Ok(Value::Bool(*value)),
        ExpressionKind::IntLit(value) => Ok(Value::Int(*value)),
        ExpressionKind::FloatLit(value) => Ok(Value::Float(*value)),
        ExpressionKind::StrLit(value) => Ok(Value::Str(value.clone())),
        ExpressionKind::Var(var) => consts
            .get(&var.name)
            .cloned()
            .ok_or_else(|| err(format!("'{}' is not a compile-time constant", var.name))),
        ExpressionKind::Unary { op, expr: inner } => {
            let value = eval(inner, consts)?;
            eval_unary(*op, value).map_err(err)
        }
        ExpressionKind::Binary { op, left, right } => {
            let left = eval(left, consts)?;
            let right = eval(right, consts)?;
            eval_binary(*op, left, right).map_err(err)
        }
        ExpressionKind::ArrayInit { exprs } => {
            let mut components = vec![];
            for component in exprs {
                let value = eval(component, consts)?;
                components.push(value.as_float().ok_or_else(|| {
                    err("vector components must be numeric constants".into())
                })?);
            }
            match components.as_slice() {
                [x, y] => Ok(Value::Vec2(*x, *y)),
                [x, y, z] => Ok(Value::Vec3(*x, *y, *z)),
                _ => Err(err("vector literals have two or three components".into())),
            }
        }
        _ => Err(err("expression is not a compile-time constant".into())),
    }
}

fn eval_unary(op: UnaryOp, value: Value) -> Result<Value, String> {
    match (op, &value) {
        (UnaryOp::Plus, Value::Int(_) | Value::Float(_)) => Ok(value),
        (UnaryOp::Minus, Value::Int(v)) => Ok(Value::Int(-v)),
        (UnaryOp::Minus, Value::Float(v)) => Ok(Value::Float(-v)),
        (UnaryOp::LogicalNot, Value::Bool(v)) => Ok(Value::Bool(!v)),
        _ => Err(format!(
            "unary '{}' cannot be applied to a {} constant",
            op.sigil(),
            value.type_of()
        )),
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, String> {
    use BinaryOp::*;

    let type_error = || {
        format!(
            "binary '{}' cannot be applied to {} and {} constants",
            op.sigil(),
            left.type_of(),
            right.type_of()
        )
    };

    match op {
        Add | Sub | Mul | Div | Mod => {}
        _ => return Err(type_error()),
    }

    match (&left, &right) {
        (Value::Int(l), Value::Int(r)) => match op {
            Add => Ok(Value::Int(l + r)),
            Sub => Ok(Value::Int(l - r)),
            Mul => Ok(Value::Int(l * r)),
            Div => {
                if *r == 0 {
                    Err("division by zero in constant expression".into())
                } else {
                    Ok(Value::Int(l / r))
                }
            }
            Mod => {
                if *r == 0 {
                    Err("division by zero in constant expression".into())
                } else {
                    Ok(Value::Int(l % r))
                }
            }
            _ => unreachable!(),
        },
        _ if left.is_numeric() && right.is_numeric() => {
            let l = left.as_float().unwrap();
            let r = right.as_float().unwrap();
            match op {
                Add => Ok(Value::Float(l + r)),
                Sub => Ok(Value::Float(l - r)),
                Mul => Ok(Value::Float(l * r)),
                Div => {
                    if r == 0.0 {
                        Err("division by zero in constant expression".into())
                    } else {
                        Ok(Value::Float(l / r))
                    }
                }
                Mod => Err(type_error()),
                _ => unreachable!(),
            }
        }
        _ => {
            // Componentwise vector arithmetic, with scalar broadcast.
            let lv = left.extend_to_vec3();
            let rv = right.extend_to_vec3();
            let combine = |l: [f64; 3], r: [f64; 3]| -> Result<[f64; 3], String> {
                let mut out = [0.0; 3];
                for i in 0..3 {
                    out[i] = match op {
                        Add => l[i] + r[i],
                        Sub => l[i] - r[i],
                        Mul => l[i] * r[i],
                        Div => {
                            if r[i] == 0.0 {
                                return Err("division by zero in constant expression".into());
                            }
                            l[i] / r[i]
                        }
                        _ => return Err(type_error()),
                    };
                }
                Ok(out)
            };

            let (result, is_vec3) = match (lv, rv) {
                (Some(l), Some(r)) => {
                    if left.type_of() != right.type_of() {
                        return Err(type_error());
                    }
                    (combine(l, r)?, left.type_of() == super::Type::Vec3)
                }
                (Some(l), None) => {
                    let s = right.as_float().ok_or_else(|| type_error())?;
                    (combine(l, [s, s, s])?, left.type_of() == super::Type::Vec3)
                }
                (None, Some(r)) => {
                    let s = left.as_float().ok_or_else(|| type_error())?;
                    (combine([s, s, s], r)?, right.type_of() == super::Type::Vec3)
                }
                (None, None) => return Err(type_error()),
            };

            if is_vec3 {
                Ok(Value::Vec3(result[0], result[1], result[2]))
            } else {
                Ok(Value::Vec2(result[0], result[1]))
            }
        }
    }
}

/// Parse a `-P name=value` override against the type of the folded default.
pub fn parse_override(raw: &str, like: &Value) -> Option<Value> {
    match like {
        Value::Bool(_) => raw.parse::<bool>().ok().map(Value::Bool),
        Value::Int(_) => raw.parse::<i64>().ok().map(Value::Int),
        Value::Float(_) => raw.parse::<f64>().ok().map(Value::Float),
        Value::Str(_) => Some(Value::Str(raw.to_owned())),
        Value::Vec2(..) | Value::Vec3(..) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::ast::{Declaration, Script};

    fn fold(input: &str) -> EResult {
        let source = format!("const it = {input};");
        let tokens = Lexer::new(&source).lex().expect("should lex");
        let script: Script = crate::parser::parse(tokens).expect("should parse");
        let Declaration::Const(decl) = &script.decls[0] else {
            unreachable!()
        };
        eval(&decl.expr, &HashMap::default())
    }

    #[test]
    fn test_eval_arithmetic() {
        assert_eq!(fold("2 * 3 + 4"), Ok(Value::Int(10)));
    }

    #[test]
    fn test_eval_promotes_to_float() {
        assert_eq!(fold("1 + 0.5"), Ok(Value::Float(1.5)));
    }

    #[test]
    fn test_eval_vector_literal() {
        assert_eq!(fold("[1, 2.5]"), Ok(Value::Vec2(1.0, 2.5)));
    }

    #[test]
    fn test_eval_vector_broadcast() {
        assert_eq!(fold("[1, 2, 3] * 2"), Ok(Value::Vec3(2.0, 4.0, 6.0)));
    }

    #[test]
    fn test_eval_division_by_zero() {
        assert!(fold("1 / 0").is_err());
    }

    #[test]
    fn test_eval_rejects_non_constant() {
        assert!(fold("foo(1)").is_err());
        assert!(fold("missing").is_err());
    }
}
