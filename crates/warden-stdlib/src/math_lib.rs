//! Math library (Lua 5.2 surface).

use crate::{check_number, opt_int, register_fn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use warden_core::error::{LuaError, LuaResult};
use warden_core::native::NativeCallScope;
use warden_core::table::{Table, TableRef};
use warden_core::value::{value_of_i64, Value};
use warden_vm::{coerce, Globals};

static RNG: Mutex<Option<StdRng>> = Mutex::new(None);

fn with_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    let mut guard = RNG.lock();
    let rng = guard.get_or_insert_with(|| StdRng::seed_from_u64(0x5eed));
    f(rng)
}

pub fn register(globals: &Arc<Globals>) {
    let t = TableRef::new(Table::new(0, 24));
    t.set_str("pi", Value::Number(std::f64::consts::PI));
    t.set_str("huge", Value::Number(f64::INFINITY));
    t.set_str("maxinteger", Value::Integer(i32::MAX));
    t.set_str("mininteger", Value::Integer(i32::MIN));

    register_fn(&t, "abs", native_abs);
    register_fn(&t, "ceil", native_ceil);
    register_fn(&t, "floor", native_floor);
    register_fn(&t, "sqrt", native_sqrt);
    register_fn(&t, "exp", native_exp);
    register_fn(&t, "log", native_log);
    register_fn(&t, "sin", native_sin);
    register_fn(&t, "cos", native_cos);
    register_fn(&t, "tan", native_tan);
    register_fn(&t, "asin", native_asin);
    register_fn(&t, "acos", native_acos);
    register_fn(&t, "atan", native_atan);
    register_fn(&t, "fmod", native_fmod);
    register_fn(&t, "modf", native_modf);
    register_fn(&t, "max", native_max);
    register_fn(&t, "min", native_min);
    register_fn(&t, "random", native_random);
    register_fn(&t, "randomseed", native_randomseed);
    globals.env().set_str("math", Value::Table(t));
}

fn num_result(f: f64) -> Vec<Value> {
    vec![Value::Number(f)]
}

fn native_abs(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    match args.first() {
        Some(Value::Integer(i)) => Ok(vec![value_of_i64((*i as i64).abs())]),
        _ => Ok(num_result(check_number(args, 0, "abs")?.abs())),
    }
}

fn native_floor(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    match args.first() {
        Some(Value::Integer(i)) => Ok(vec![Value::Integer(*i)]),
        _ => {
            let f = check_number(args, 0, "floor")?.floor();
            Ok(vec![value_of_i64_or_number(f)])
        }
    }
}

fn native_ceil(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    match args.first() {
        Some(Value::Integer(i)) => Ok(vec![Value::Integer(*i)]),
        _ => {
            let f = check_number(args, 0, "ceil")?.ceil();
            Ok(vec![value_of_i64_or_number(f)])
        }
    }
}

/// Integral results come back on the integer tag when they fit.
fn value_of_i64_or_number(f: f64) -> Value {
    if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        value_of_i64(f as i64)
    } else {
        Value::Number(f)
    }
}

fn native_sqrt(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(num_result(check_number(args, 0, "sqrt")?.sqrt()))
}

fn native_exp(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(num_result(check_number(args, 0, "exp")?.exp()))
}

fn native_log(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let x = check_number(args, 0, "log")?;
    match args.get(1) {
        None | Some(Value::Nil) => Ok(num_result(x.ln())),
        Some(b) => {
            let base = coerce::to_number(b)
                .ok_or_else(|| crate::arg_error(1, "log", "number", b))?;
            Ok(num_result(x.log(base)))
        }
    }
}

fn native_sin(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(num_result(check_number(args, 0, "sin")?.sin()))
}

fn native_cos(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(num_result(check_number(args, 0, "cos")?.cos()))
}

fn native_tan(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(num_result(check_number(args, 0, "tan")?.tan()))
}

fn native_asin(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(num_result(check_number(args, 0, "asin")?.asin()))
}

fn native_acos(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(num_result(check_number(args, 0, "acos")?.acos()))
}

fn native_atan(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(num_result(check_number(args, 0, "atan")?.atan()))
}

fn native_fmod(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let a = check_number(args, 0, "fmod")?;
    let b = check_number(args, 1, "fmod")?;
    Ok(num_result(a % b))
}

fn native_modf(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let f = check_number(args, 0, "modf")?;
    let int_part = f.trunc();
    Ok(vec![value_of_i64_or_number(int_part), Value::Number(f - int_part)])
}

fn native_max(s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    fold_extreme(s, args, "max", |a, b| a < b)
}

fn native_min(s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    fold_extreme(s, args, "min", |a, b| a > b)
}

fn fold_extreme(
    _s: &mut dyn NativeCallScope,
    args: &[Value],
    fname: &str,
    replace: fn(f64, f64) -> bool,
) -> LuaResult<Vec<Value>> {
    if args.is_empty() {
        return Err(LuaError::msg(format!(
            "bad argument #1 to '{fname}' (value expected)"
        )));
    }
    let mut best = args[0].clone();
    let mut best_n = check_number(args, 0, fname)?;
    for i in 1..args.len() {
        let n = check_number(args, i, fname)?;
        if replace(best_n, n) {
            best = args[i].clone();
            best_n = n;
        }
    }
    Ok(vec![best])
}

fn native_random(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    match args.len() {
        0 => Ok(vec![Value::Number(with_rng(|r| r.gen::<f64>()))]),
        1 => {
            let m = opt_int(args, 0, "random", 1)?;
            if m < 1 {
                return Err(LuaError::msg("bad argument #1 to 'random' (interval is empty)"));
            }
            Ok(vec![value_of_i64(with_rng(|r| r.gen_range(1..=m)))])
        }
        _ => {
            let lo = opt_int(args, 0, "random", 1)?;
            let hi = opt_int(args, 1, "random", 1)?;
            if lo > hi {
                return Err(LuaError::msg("bad argument #2 to 'random' (interval is empty)"));
            }
            Ok(vec![value_of_i64(with_rng(|r| r.gen_range(lo..=hi)))])
        }
    }
}

fn native_randomseed(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let seed = check_number(args, 0, "randomseed")?;
    *RNG.lock() = Some(StdRng::seed_from_u64(seed.to_bits()));
    Ok(vec![])
}
