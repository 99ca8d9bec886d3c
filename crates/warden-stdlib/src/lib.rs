//! Curated Lua 5.2 standard library surface.
//!
//! Registration follows one pattern: each module builds its table and hangs
//! it off the globals. The surface is hardened by construction — no `io`, no
//! process or filesystem reach from `os`, no `load`/`loadstring`/`dofile`,
//! and `require` only ever sees source text through the installed searchers.

pub mod base_lib;
pub mod coroutine_lib;
pub mod debug_lib;
pub mod math_lib;
pub mod os_lib;
pub mod package_lib;
pub mod pattern;
pub mod string_lib;
pub mod table_lib;

use std::sync::Arc;
use warden_core::error::{LuaError, LuaResult};
use warden_core::native::NativeCallScope;
use warden_core::string::LuaStr;
use warden_core::table::TableRef;
use warden_core::value::{NativeFunction, NativeResult, Value};
use warden_vm::Globals;

/// Register every library into the environment of `globals`.
pub fn install(globals: &Arc<Globals>) {
    base_lib::register(globals);
    package_lib::register(globals);
    table_lib::register(globals);
    string_lib::register(globals);
    math_lib::register(globals);
    os_lib::register(globals);
    coroutine_lib::register(globals);
    debug_lib::register(globals);
}

pub(crate) type NativeFnPtr = fn(&mut dyn NativeCallScope, &[Value]) -> NativeResult;

pub(crate) fn register_fn(table: &TableRef, name: &'static str, func: NativeFnPtr) {
    table.set_str(name, Value::native(NativeFunction::new(name, func)));
}

// ---- Argument checking helpers ----

pub(crate) fn arg_error(idx: usize, fname: &str, expected: &str, got: &Value) -> LuaError {
    LuaError::msg(format!(
        "bad argument #{} to '{}' ({} expected, got {})",
        idx + 1,
        fname,
        expected,
        got.type_name()
    ))
}

pub(crate) fn check_table(args: &[Value], idx: usize, fname: &str) -> LuaResult<TableRef> {
    let v = args.get(idx).cloned().unwrap_or(Value::Nil);
    v.as_table()
        .cloned()
        .ok_or_else(|| arg_error(idx, fname, "table", &v))
}

pub(crate) fn check_str(args: &[Value], idx: usize, fname: &str) -> LuaResult<LuaStr> {
    let v = args.get(idx).cloned().unwrap_or(Value::Nil);
    match &v {
        Value::Str(s) => Ok(s.clone()),
        // Numbers coerce to strings for the string library.
        Value::Integer(_) | Value::Number(_) => Ok(warden_vm::coerce::tostring_basic(&v)),
        _ => Err(arg_error(idx, fname, "string", &v)),
    }
}

pub(crate) fn check_int(args: &[Value], idx: usize, fname: &str) -> LuaResult<i64> {
    let v = args.get(idx).cloned().unwrap_or(Value::Nil);
    warden_vm::coerce::to_integer(&v).ok_or_else(|| arg_error(idx, fname, "number", &v))
}

pub(crate) fn check_number(args: &[Value], idx: usize, fname: &str) -> LuaResult<f64> {
    let v = args.get(idx).cloned().unwrap_or(Value::Nil);
    warden_vm::coerce::to_number(&v).ok_or_else(|| arg_error(idx, fname, "number", &v))
}

pub(crate) fn check_function(args: &[Value], idx: usize, fname: &str) -> LuaResult<Value> {
    let v = args.get(idx).cloned().unwrap_or(Value::Nil);
    if v.is_function() {
        Ok(v)
    } else {
        Err(arg_error(idx, fname, "function", &v))
    }
}

pub(crate) fn opt_int(args: &[Value], idx: usize, fname: &str, default: i64) -> LuaResult<i64> {
    match args.get(idx) {
        None | Some(Value::Nil) => Ok(default),
        Some(_) => check_int(args, idx, fname),
    }
}
