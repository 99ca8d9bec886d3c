//! Base library: the curated subset of the Lua 5.2 basic functions.
//!
//! Deliberately absent: `load`, `loadstring`, `dofile`, `loadfile`,
//! `collectgarbage` — scripts get no compiler, no bytecode loader and no
//! collector control. `print` goes to the bounded host console queue, never
//! to a real stream.

use crate::{arg_error, check_function, check_table, opt_int};
use std::sync::Arc;
use warden_core::error::{LuaError, LuaResult};
use warden_core::native::NativeCallScope;
use warden_core::string::LuaStr;
use warden_core::table::TableRef;
use warden_core::value::{value_of_i64, NativeFunction, Value};
use warden_vm::metamethod::{MM_METATABLE, MM_MODE};
use warden_vm::{coerce, Globals};

pub fn register(globals: &Arc<Globals>) {
    let env = globals.env();
    env.set_str("_G", Value::Table(env.clone()));
    env.set_str("_VERSION", Value::from("Lua 5.2"));

    for (name, f) in [
        ("assert", native_assert as crate::NativeFnPtr),
        ("error", native_error),
        ("getmetatable", native_getmetatable),
        ("ipairs", native_ipairs),
        ("next", native_next),
        ("pcall", native_pcall),
        ("print", native_print),
        ("rawequal", native_rawequal),
        ("rawget", native_rawget),
        ("rawlen", native_rawlen),
        ("rawset", native_rawset),
        ("select", native_select),
        ("setmetatable", native_setmetatable),
        ("tonumber", native_tonumber),
        ("tostring", native_tostring),
        ("type", native_type),
        ("xpcall", native_xpcall),
    ] {
        env.set_str(name, Value::native(NativeFunction::new(name, f)));
    }

    // pairs closes over the registered next function.
    let next_fn = env.get_str("next");
    env.set_str(
        "pairs",
        Value::native(NativeFunction::new("pairs", move |scope, args| {
            native_pairs(scope, args, &next_fn)
        })),
    );
}

fn native_print(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let mut line = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        line.push_str(&scope.tostring_value(arg)?.to_lossy());
    }
    scope.console(line)?;
    Ok(vec![])
}

fn native_type(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let v = args.first().cloned().unwrap_or(Value::Nil);
    Ok(vec![Value::from(v.type_name())])
}

fn native_tostring(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let v = args.first().cloned().unwrap_or(Value::Nil);
    Ok(vec![Value::Str(scope.tostring_value(&v)?)])
}

fn native_tonumber(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let v = args.first().cloned().unwrap_or(Value::Nil);
    match args.get(1) {
        None | Some(Value::Nil) => Ok(vec![match &v {
            Value::Integer(_) | Value::Number(_) => v.clone(),
            Value::Str(s) => match coerce::str_to_number(s.as_bytes()) {
                Some(f) if f.fract() == 0.0 && f >= i32::MIN as f64 && f <= i32::MAX as f64 => {
                    Value::Integer(f as i32)
                }
                Some(f) => Value::Number(f),
                None => Value::Nil,
            },
            _ => Value::Nil,
        }]),
        Some(base_v) => {
            let base = coerce::to_integer(base_v)
                .filter(|b| (2..=36).contains(b))
                .ok_or_else(|| arg_error(1, "tonumber", "base out of range", base_v))?;
            let s = match &v {
                Value::Str(s) => s.clone(),
                other => return Err(arg_error(0, "tonumber", "string", other)),
            };
            let text = s.to_lossy();
            let text = text.trim();
            match i64::from_str_radix(text, base as u32) {
                Ok(i) => Ok(vec![value_of_i64(i)]),
                Err(_) => Ok(vec![Value::Nil]),
            }
        }
    }
}

fn native_error(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let v = args.first().cloned().unwrap_or(Value::Nil);
    let level = opt_int(args, 1, "error", 1)?;
    let value = match (&v, level) {
        (Value::Str(s), l) if l > 0 => {
            let pos = scope.current_position().unwrap_or_default();
            if pos.is_empty() {
                v.clone()
            } else {
                Value::Str(LuaStr::from(format!("{}: {}", pos, s)))
            }
        }
        _ => v,
    };
    Err(LuaError::raise(value))
}

fn native_assert(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let v = args.first().cloned().unwrap_or(Value::Nil);
    if v.is_truthy() {
        return Ok(args.to_vec());
    }
    match args.get(1) {
        Some(msg) => Err(LuaError::raise(msg.clone())),
        None => Err(LuaError::msg("assertion failed!")),
    }
}

fn native_pcall(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let f = args.first().cloned().unwrap_or(Value::Nil);
    match scope.call_value(&f, args.get(1..).unwrap_or(&[])) {
        Ok(mut vals) => {
            let mut out = Vec::with_capacity(vals.len() + 1);
            out.push(Value::Boolean(true));
            out.append(&mut vals);
            Ok(out)
        }
        Err(e) if e.is_protectable() => Ok(vec![Value::Boolean(false), e.to_value()]),
        // Limit, string-cap and orphan signals pass straight through: the
        // budget is not negotiable from inside the script.
        Err(e) => Err(e),
    }
}

fn native_xpcall(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let f = args.first().cloned().unwrap_or(Value::Nil);
    let handler = check_function(args, 1, "xpcall")?;
    match scope.call_value(&f, args.get(2..).unwrap_or(&[])) {
        Ok(mut vals) => {
            let mut out = Vec::with_capacity(vals.len() + 1);
            out.push(Value::Boolean(true));
            out.append(&mut vals);
            Ok(out)
        }
        Err(e) if e.is_protectable() => {
            // The handler itself runs unprotected; a second failure becomes
            // the canonical message.
            let handled = scope.call_value(&handler, &[e.to_value()]);
            match handled {
                Ok(vals) => Ok(vec![
                    Value::Boolean(false),
                    vals.into_iter().next().unwrap_or(Value::Nil),
                ]),
                Err(inner) if inner.is_protectable() => Ok(vec![
                    Value::Boolean(false),
                    Value::from("error in error handling"),
                ]),
                Err(inner) => Err(inner),
            }
        }
        Err(e) => Err(e),
    }
}

fn native_rawget(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "rawget")?;
    let k = args.get(1).cloned().unwrap_or(Value::Nil);
    Ok(vec![t.get(&k)])
}

fn native_rawset(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "rawset")?;
    let k = args.get(1).cloned().unwrap_or(Value::Nil);
    let v = args.get(2).cloned().unwrap_or(Value::Nil);
    t.set(k, v)?;
    Ok(vec![Value::Table(t)])
}

fn native_rawequal(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let a = args.first().cloned().unwrap_or(Value::Nil);
    let b = args.get(1).cloned().unwrap_or(Value::Nil);
    Ok(vec![Value::Boolean(a.raw_eq(&b))])
}

fn native_rawlen(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let v = args.first().cloned().unwrap_or(Value::Nil);
    match &v {
        Value::Str(s) => Ok(vec![value_of_i64(s.len() as i64)]),
        Value::Table(t) => Ok(vec![value_of_i64(t.length())]),
        other => Err(arg_error(0, "rawlen", "table or string", other)),
    }
}

fn native_select(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let selector = args.first().cloned().unwrap_or(Value::Nil);
    if let Value::Str(s) = &selector {
        if s.as_bytes() == b"#" {
            return Ok(vec![value_of_i64(args.len() as i64 - 1)]);
        }
    }
    let n = coerce::to_integer(&selector)
        .ok_or_else(|| arg_error(0, "select", "number", &selector))?;
    let rest = args.len() as i64 - 1;
    let start = if n < 0 { rest + n } else { n - 1 };
    if start < 0 {
        return Err(arg_error(0, "select", "index out of range", &selector));
    }
    Ok(args
        .get((start + 1) as usize..)
        .map(|s| s.to_vec())
        .unwrap_or_default())
}

fn native_next(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "next")?;
    let k = args.get(1).cloned().unwrap_or(Value::Nil);
    match t.next(&k)? {
        Some((nk, nv)) => Ok(vec![nk, nv]),
        None => Ok(vec![Value::Nil]),
    }
}

fn native_pairs(
    scope: &mut dyn NativeCallScope,
    args: &[Value],
    next_fn: &Value,
) -> LuaResult<Vec<Value>> {
    let v = args.first().cloned().unwrap_or(Value::Nil);
    if let Some(mm) = scope
        .metatable_of(&v)
        .map(|mt| mt.get_str("__pairs"))
        .filter(|m| !m.is_nil())
    {
        let mut r = scope.call_value(&mm, &[v])?;
        r.resize(3, Value::Nil);
        return Ok(r);
    }
    check_table(args, 0, "pairs")?;
    Ok(vec![next_fn.clone(), v, Value::Nil])
}

fn native_ipairs(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "ipairs")?;
    let iter = NativeFunction::new("ipairs_iterator", |scope, args: &[Value]| {
        let t = args.first().cloned().unwrap_or(Value::Nil);
        let i = args.get(1).and_then(|v| coerce::to_integer(v)).unwrap_or(0) + 1;
        let v = scope.index(&t, &value_of_i64(i))?;
        if v.is_nil() {
            Ok(vec![Value::Nil])
        } else {
            Ok(vec![value_of_i64(i), v])
        }
    });
    Ok(vec![Value::native(iter), Value::Table(t), Value::Integer(0)])
}

fn native_setmetatable(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "setmetatable")?;
    let mt_arg = args.get(1).cloned().unwrap_or(Value::Nil);
    if let Some(existing) = t.metatable() {
        if !existing.get_str(MM_METATABLE).is_nil() {
            return Err(LuaError::msg("cannot change a protected metatable"));
        }
    }
    let mt: Option<TableRef> = match &mt_arg {
        Value::Nil => None,
        Value::Table(m) => Some(m.clone()),
        other => return Err(arg_error(1, "setmetatable", "nil or table", other)),
    };
    apply_weak_mode(&t, mt.as_ref());
    t.set_metatable(mt);
    Ok(vec![Value::Table(t)])
}

/// Honour `__mode`: 'k' and/or 'v' switch the table's weak modes; entries
/// whose weak side dies are dropped at the next rehash.
fn apply_weak_mode(t: &TableRef, mt: Option<&TableRef>) {
    let mode = mt.map(|m| m.get_str(MM_MODE)).unwrap_or(Value::Nil);
    let (wk, wv) = match &mode {
        Value::Str(s) => {
            let bytes = s.as_bytes();
            (bytes.contains(&b'k'), bytes.contains(&b'v'))
        }
        _ => (false, false),
    };
    t.set_mode(wk, wv);
}

fn native_getmetatable(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let v = args.first().cloned().unwrap_or(Value::Nil);
    match scope.metatable_of(&v) {
        None => Ok(vec![Value::Nil]),
        Some(mt) => {
            let protected = mt.get_str(MM_METATABLE);
            if protected.is_nil() {
                Ok(vec![Value::Table(mt)])
            } else {
                Ok(vec![protected])
            }
        }
    }
}
