//! Equality and ordering with metamethod fallbacks.

use crate::metamethod::{get_metamethod, MM_EQ, MM_LE, MM_LT};
use crate::vm::Vm;
use warden_core::error::{LuaError, LuaResult};
use warden_core::value::Value;

/// Lua `==`: raw equality first; `__eq` only when both operands are tables
/// or both are userdata.
pub fn lua_eq(vm: &mut Vm, a: &Value, b: &Value) -> LuaResult<bool> {
    if a.raw_eq(b) {
        return Ok(true);
    }
    let comparable = matches!((a, b), (Value::Table(_), Value::Table(_)))
        || matches!((a, b), (Value::Userdata(_), Value::Userdata(_)));
    if !comparable {
        return Ok(false);
    }
    let mm = get_metamethod(a, MM_EQ).or_else(|| get_metamethod(b, MM_EQ));
    match mm {
        Some(f) => {
            let r = vm.call_value(&f, &[a.clone(), b.clone()])?;
            Ok(r.first().map(|v| v.is_truthy()).unwrap_or(false))
        }
        None => Ok(false),
    }
}

/// Lua `<`.
pub fn lua_lt(vm: &mut Vm, a: &Value, b: &Value) -> LuaResult<bool> {
    if let (Some(fa), Some(fb)) = (numeric(a), numeric(b)) {
        return Ok(fa < fb);
    }
    if let (Value::Str(sa), Value::Str(sb)) = (a, b) {
        return Ok(sa < sb);
    }
    let mm = get_metamethod(a, MM_LT).or_else(|| get_metamethod(b, MM_LT));
    match mm {
        Some(f) => {
            let r = vm.call_value(&f, &[a.clone(), b.clone()])?;
            Ok(r.first().map(|v| v.is_truthy()).unwrap_or(false))
        }
        None => Err(compare_error(a, b)),
    }
}

/// Lua `<=`: `__le`, falling back to `not (b < a)`.
pub fn lua_le(vm: &mut Vm, a: &Value, b: &Value) -> LuaResult<bool> {
    if let (Some(fa), Some(fb)) = (numeric(a), numeric(b)) {
        return Ok(fa <= fb);
    }
    if let (Value::Str(sa), Value::Str(sb)) = (a, b) {
        return Ok(sa <= sb);
    }
    let mm = get_metamethod(a, MM_LE).or_else(|| get_metamethod(b, MM_LE));
    if let Some(f) = mm {
        let r = vm.call_value(&f, &[a.clone(), b.clone()])?;
        return Ok(r.first().map(|v| v.is_truthy()).unwrap_or(false));
    }
    let lt = get_metamethod(a, MM_LT).or_else(|| get_metamethod(b, MM_LT));
    match lt {
        Some(f) => {
            let r = vm.call_value(&f, &[b.clone(), a.clone()])?;
            Ok(!r.first().map(|v| v.is_truthy()).unwrap_or(false))
        }
        None => Err(compare_error(a, b)),
    }
}

/// Only genuine numbers order numerically; strings never coerce here.
fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Integer(i) => Some(*i as f64),
        Value::Number(f) => Some(*f),
        _ => None,
    }
}

fn compare_error(a: &Value, b: &Value) -> LuaError {
    if a.type_name() == b.type_name() {
        LuaError::msg(format!("attempt to compare two {} values", a.type_name()))
    } else {
        LuaError::msg(format!(
            "attempt to compare {} with {}",
            a.type_name(),
            b.type_name()
        ))
    }
}
