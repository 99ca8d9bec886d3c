//! Module system: `require`, `package.loaded`, `package.preload` and the
//! searcher list.
//!
//! The bundled searchers resolve preloaded module factories only; hosts may
//! append searchers that return source text compiled through the installed
//! compiler. No searcher anywhere accepts a precompiled chunk.

use crate::check_str;
use std::sync::Arc;
use warden_core::error::{LuaError, LuaResult};
use warden_core::native::NativeCallScope;
use warden_core::table::{Table, TableRef};
use warden_core::value::{NativeFunction, Value};
use warden_vm::Globals;

pub fn register(globals: &Arc<Globals>) {
    let env = globals.env();
    let package = TableRef::new(Table::new(0, 4));
    let loaded = TableRef::new(Table::new(0, 8));
    let preload = TableRef::new(Table::new(0, 8));
    let searchers = TableRef::new(Table::new(2, 0));

    // Searcher 1: package.preload[name].
    let preload_for_searcher = preload.clone();
    searchers.set_int(
        1,
        Value::native(NativeFunction::new(
            "preload_searcher",
            move |_scope, args: &[Value]| {
                let name = check_str(args, 0, "require")?;
                let factory = preload_for_searcher.get_lstr(&name);
                if factory.is_nil() {
                    Ok(vec![Value::from(format!(
                        "no field package.preload['{name}']"
                    ))])
                } else {
                    Ok(vec![factory])
                }
            },
        )),
    );

    package.set_str("loaded", Value::Table(loaded.clone()));
    package.set_str("preload", Value::Table(preload));
    package.set_str("searchers", Value::Table(searchers.clone()));
    env.set_str("package", Value::Table(package));

    let require = NativeFunction::new("require", move |scope, args: &[Value]| {
        native_require(scope, args, &loaded, &searchers)
    });
    env.set_str("require", Value::native(require));
}

fn native_require(
    scope: &mut dyn NativeCallScope,
    args: &[Value],
    loaded: &TableRef,
    searchers: &TableRef,
) -> LuaResult<Vec<Value>> {
    let name = check_str(args, 0, "require")?;
    let cached = loaded.get_lstr(&name);
    if !cached.is_nil() {
        return Ok(vec![cached]);
    }

    let mut failures = String::new();
    let count = searchers.length();
    for i in 1..=count {
        let searcher = searchers.get_int(i);
        if searcher.is_nil() {
            continue;
        }
        let found = scope.call_value(&searcher, &[Value::Str(name.clone())])?;
        match found.first() {
            Some(loader @ Value::Function(_)) => {
                let extra = found.get(1).cloned().unwrap_or(Value::Nil);
                let results =
                    scope.call_value(loader, &[Value::Str(name.clone()), extra])?;
                let module = match results.into_iter().next() {
                    Some(Value::Nil) | None => Value::Boolean(true),
                    Some(v) => v,
                };
                loaded.set_lstr(&name, module.clone());
                return Ok(vec![module]);
            }
            Some(Value::Str(msg)) => {
                failures.push_str("\n\t");
                failures.push_str(&msg.to_lossy());
            }
            _ => {}
        }
    }
    Err(LuaError::msg(format!(
        "module '{name}' not found:{failures}"
    )))
}
