//! Table library, including the accounting-aware `contains`.

use crate::{check_int, check_str, check_table, opt_int, register_fn};
use std::sync::Arc;
use warden_core::error::{LuaError, LuaResult};
use warden_core::native::NativeCallScope;
use warden_core::string::LuaStr;
use warden_core::table::Table;
use warden_core::value::{value_of_i64, Value};
use warden_vm::{coerce, Globals};

/// Flat instruction cost of a native `table.contains` scan. Charging a fixed
/// price makes the cost visible to scripts without paying the ~3·|t| opcodes
/// an equivalent loop would burn.
const CONTAINS_COST: u64 = 10;

pub fn register(globals: &Arc<Globals>) {
    let t = warden_core::table::TableRef::new(Table::new(0, 12));
    register_fn(&t, "insert", native_insert);
    register_fn(&t, "remove", native_remove);
    register_fn(&t, "concat", native_concat);
    register_fn(&t, "pack", native_pack);
    register_fn(&t, "unpack", native_unpack);
    register_fn(&t, "sort", native_sort);
    register_fn(&t, "contains", native_contains);
    register_fn(&t, "clear", native_clear);
    globals.env().set_str("table", Value::Table(t));
}

/// table.contains(t, v) — native membership scan at a fixed instruction
/// price.
fn native_contains(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    scope.charge(CONTAINS_COST)?;
    let t = check_table(args, 0, "contains")?;
    let needle = args.get(1).cloned().unwrap_or(Value::Nil);
    let mut cursor = Value::Nil;
    while let Some((k, v)) = t.next(&cursor)? {
        if v.raw_eq(&needle) {
            return Ok(vec![Value::Boolean(true)]);
        }
        cursor = k;
    }
    Ok(vec![Value::Boolean(false)])
}

/// table.clear(t) — remove every entry.
fn native_clear(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "clear")?;
    let mut keys = Vec::new();
    let mut cursor = Value::Nil;
    while let Some((k, _)) = t.next(&cursor)? {
        scope.charge(1)?;
        keys.push(k.clone());
        cursor = k;
    }
    for k in keys {
        t.set(k, Value::Nil)?;
    }
    Ok(vec![])
}

fn native_insert(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "insert")?;
    let len = t.length();
    match args.len() {
        2 => {
            t.set_int(len + 1, args[1].clone());
        }
        n if n >= 3 => {
            let pos = check_int(args, 1, "insert")?;
            if pos < 1 || pos > len + 1 {
                return Err(LuaError::msg("bad argument #2 to 'insert' (position out of bounds)"));
            }
            let mut i = len;
            while i >= pos {
                let v = t.get_int(i);
                t.set_int(i + 1, v);
                i -= 1;
            }
            t.set_int(pos, args[2].clone());
        }
        _ => return Err(LuaError::msg("wrong number of arguments to 'insert'")),
    }
    Ok(vec![])
}

fn native_remove(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "remove")?;
    let len = t.length();
    let pos = opt_int(args, 1, "remove", len)?;
    if len == 0 && args.len() < 2 {
        return Ok(vec![Value::Nil]);
    }
    let removed = t.get_int(pos);
    let mut i = pos;
    while i < len {
        let v = t.get_int(i + 1);
        t.set_int(i, v);
        i += 1;
    }
    t.set_int(len, Value::Nil);
    Ok(vec![removed])
}

fn native_concat(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "concat")?;
    let sep = match args.get(1) {
        None | Some(Value::Nil) => LuaStr::from(""),
        Some(_) => check_str(args, 1, "concat")?,
    };
    let i = opt_int(args, 2, "concat", 1)?;
    let j = opt_int(args, 3, "concat", t.length())?;

    let mut buf: Vec<u8> = Vec::new();
    let mut k = i;
    while k <= j {
        let v = t.get_int(k);
        match coerce::to_concat_bytes(&v) {
            Some(bytes) => {
                // The cap guards every intermediate, same as CONCAT.
                scope.check_string_len(buf.len() + bytes.len())?;
                buf.extend_from_slice(&bytes);
            }
            None => {
                return Err(LuaError::msg(format!(
                    "invalid value (at index {}) in table for 'concat'",
                    k
                )))
            }
        }
        if k < j && !sep.is_empty() {
            scope.check_string_len(buf.len() + sep.len())?;
            buf.extend_from_slice(sep.as_bytes());
        }
        k += 1;
    }
    Ok(vec![Value::Str(LuaStr::from_vec(buf))])
}

fn native_pack(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = warden_core::table::TableRef::new(Table::new(args.len(), 1));
    for (i, v) in args.iter().enumerate() {
        t.set_int((i + 1) as i64, v.clone());
    }
    t.set_str("n", value_of_i64(args.len() as i64));
    Ok(vec![Value::Table(t)])
}

fn native_unpack(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "unpack")?;
    let i = opt_int(args, 1, "unpack", 1)?;
    let j = opt_int(args, 2, "unpack", t.length())?;
    if j - i >= 1_000_000 {
        return Err(LuaError::msg("too many results to unpack"));
    }
    let mut out = Vec::new();
    let mut k = i;
    while k <= j {
        out.push(t.get_int(k));
        k += 1;
    }
    Ok(out)
}

fn native_sort(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t = check_table(args, 0, "sort")?;
    let comparator = args.get(1).cloned().filter(|v| !v.is_nil());
    let len = t.length();
    let mut items: Vec<Value> = (1..=len).map(|i| t.get_int(i)).collect();

    // Insertion sort: a comparator is script code, so every probe must run
    // through the interpreter (and its budget) and errors must propagate.
    let mut i = 1;
    while i < items.len() {
        let mut j = i;
        while j > 0 {
            let earlier = sort_lt(scope, &comparator, &items[j], &items[j - 1])?;
            if !earlier {
                break;
            }
            items.swap(j, j - 1);
            j -= 1;
        }
        i += 1;
    }

    for (idx, v) in items.into_iter().enumerate() {
        t.set_int(idx as i64 + 1, v);
    }
    Ok(vec![])
}

fn sort_lt(
    scope: &mut dyn NativeCallScope,
    comparator: &Option<Value>,
    a: &Value,
    b: &Value,
) -> LuaResult<bool> {
    scope.charge(1)?;
    match comparator {
        Some(f) => {
            let r = scope.call_value(f, &[a.clone(), b.clone()])?;
            Ok(r.first().map(|v| v.is_truthy()).unwrap_or(false))
        }
        None => scope.lua_lt(a, b),
    }
}
