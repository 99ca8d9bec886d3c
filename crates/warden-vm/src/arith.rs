//! Arithmetic with the widen-to-64-then-demote integer policy.
//!
//! Integer ⊕ Integer is computed in i64 and folded back: 32-bit-representable
//! results stay Integer, anything wider promotes to Number. Division and
//! exponentiation always produce Number; modulo follows floored division.
//! Strings that parse as numbers participate as Numbers.

use crate::coerce;
use warden_core::error::LuaError;
use warden_core::value::{value_of_i64, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl ArithOp {
    /// Metamethod slot name.
    pub fn metamethod(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
        }
    }
}

/// Result of a raw arithmetic attempt.
pub enum ArithResult {
    Ok(Value),
    /// Operand types need a metamethod.
    NeedMetamethod,
    Error(LuaError),
}

pub fn arith_op(op: ArithOp, a: &Value, b: &Value) -> ArithResult {
    if !matches!(op, ArithOp::Div | ArithOp::Pow) {
        if let (Value::Integer(ia), Value::Integer(ib)) = (a, b) {
            return match int_arith(op, *ia as i64, *ib as i64) {
                Ok(v) => ArithResult::Ok(v),
                Err(e) => ArithResult::Error(e),
            };
        }
    }
    match (coerce::to_number(a), coerce::to_number(b)) {
        (Some(fa), Some(fb)) => ArithResult::Ok(Value::Number(float_arith(op, fa, fb))),
        _ => {
            // A string operand that failed to parse is an arithmetic error,
            // not a metamethod case.
            if a.is_string() || b.is_string() {
                let side = if coerce::to_number(a).is_none() { a } else { b };
                if side.is_string() {
                    return ArithResult::Error(LuaError::msg(
                        "attempt to perform arithmetic on a string value",
                    ));
                }
            }
            ArithResult::NeedMetamethod
        }
    }
}

fn int_arith(op: ArithOp, a: i64, b: i64) -> Result<Value, LuaError> {
    let wide = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Mod => {
            if b == 0 {
                return Err(LuaError::msg("attempt to perform 'n%0'"));
            }
            let mut r = a % b;
            if r != 0 && (r ^ b) < 0 {
                r += b;
            }
            r
        }
        ArithOp::Div | ArithOp::Pow => unreachable!("always computed as floats"),
    };
    Ok(value_of_i64(wide))
}

fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Pow => a.powf(b),
        ArithOp::Mod => a - b * (a / b).floor(),
    }
}

/// Unary minus.
pub fn arith_unm(v: &Value) -> ArithResult {
    match v {
        Value::Integer(i) => ArithResult::Ok(value_of_i64(-(*i as i64))),
        Value::Number(f) => ArithResult::Ok(Value::Number(-f)),
        Value::Str(s) => match coerce::str_to_number(s.as_bytes()) {
            Some(f) => ArithResult::Ok(Value::Number(-f)),
            None => ArithResult::Error(LuaError::msg(
                "attempt to perform arithmetic on a string value",
            )),
        },
        _ => ArithResult::NeedMetamethod,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(r: ArithResult) -> Value {
        match r {
            ArithResult::Ok(v) => v,
            ArithResult::NeedMetamethod => panic!("unexpected metamethod request"),
            ArithResult::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_int_add_stays_int() {
        let v = ok(arith_op(ArithOp::Add, &Value::Integer(2), &Value::Integer(3)));
        assert!(matches!(v, Value::Integer(5)));
    }

    #[test]
    fn test_int_overflow_promotes() {
        let v = ok(arith_op(
            ArithOp::Add,
            &Value::Integer(i32::MAX),
            &Value::Integer(1),
        ));
        assert!(matches!(v, Value::Number(f) if f == i32::MAX as f64 + 1.0));
    }

    #[test]
    fn test_mul_overflow_promotes() {
        let v = ok(arith_op(
            ArithOp::Mul,
            &Value::Integer(100_000),
            &Value::Integer(100_000),
        ));
        assert!(matches!(v, Value::Number(f) if f == 1e10));
    }

    #[test]
    fn test_division_always_number() {
        let v = ok(arith_op(ArithOp::Div, &Value::Integer(6), &Value::Integer(3)));
        assert!(matches!(v, Value::Number(f) if f == 2.0));
    }

    #[test]
    fn test_pow_always_number() {
        let v = ok(arith_op(ArithOp::Pow, &Value::Integer(2), &Value::Integer(10)));
        assert!(matches!(v, Value::Number(f) if f == 1024.0));
    }

    #[test]
    fn test_floored_mod() {
        assert!(matches!(
            ok(arith_op(ArithOp::Mod, &Value::Integer(7), &Value::Integer(3))),
            Value::Integer(1)
        ));
        assert!(matches!(
            ok(arith_op(ArithOp::Mod, &Value::Integer(-7), &Value::Integer(3))),
            Value::Integer(2)
        ));
        assert!(matches!(
            ok(arith_op(ArithOp::Mod, &Value::Integer(7), &Value::Integer(-3))),
            Value::Integer(-2)
        ));
        let v = ok(arith_op(
            ArithOp::Mod,
            &Value::Number(5.5),
            &Value::Number(2.0),
        ));
        assert!(matches!(v, Value::Number(f) if f == 1.5));
    }

    #[test]
    fn test_mod_zero_errors() {
        assert!(matches!(
            arith_op(ArithOp::Mod, &Value::Integer(1), &Value::Integer(0)),
            ArithResult::Error(_)
        ));
    }

    #[test]
    fn test_numeric_string_participates() {
        let v = ok(arith_op(ArithOp::Add, &Value::from("10"), &Value::Integer(5)));
        assert!(matches!(v, Value::Number(f) if f == 15.0));
    }

    #[test]
    fn test_bad_string_is_error_not_metamethod() {
        assert!(matches!(
            arith_op(ArithOp::Add, &Value::from("x"), &Value::Integer(1)),
            ArithResult::Error(_)
        ));
    }

    #[test]
    fn test_table_needs_metamethod() {
        use warden_core::table::Table;
        assert!(matches!(
            arith_op(ArithOp::Add, &Value::table(Table::new(0, 0)), &Value::Integer(1)),
            ArithResult::NeedMetamethod
        ));
    }

    #[test]
    fn test_unm() {
        assert!(matches!(ok(arith_unm(&Value::Integer(5))), Value::Integer(-5)));
        assert!(matches!(
            ok(arith_unm(&Value::Integer(i32::MIN))),
            Value::Number(_)
        ));
    }
}
