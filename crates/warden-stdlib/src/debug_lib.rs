//! Debug library: diagnostics only, never a security boundary.
//!
//! `sethook` is accepted for compatibility but cannot observe or weaken the
//! instruction budget — the limiter runs outside anything a hook can touch.

use crate::{check_str, register_fn};
use std::sync::Arc;
use warden_core::error::LuaResult;
use warden_core::native::NativeCallScope;
use warden_core::string::LuaStr;
use warden_core::table::{Table, TableRef};
use warden_core::value::{Function, Value};
use warden_vm::Globals;

pub fn register(globals: &Arc<Globals>) {
    let t = TableRef::new(Table::new(0, 4));
    register_fn(&t, "traceback", native_traceback);
    register_fn(&t, "getinfo", native_getinfo);
    register_fn(&t, "sethook", native_sethook);
    register_fn(&t, "gethook", native_gethook);
    globals.env().set_str("debug", Value::Table(t));
}

fn native_traceback(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let trace = scope.traceback();
    let text = match args.first() {
        Some(Value::Str(_)) => {
            let msg = check_str(args, 0, "traceback")?;
            format!("{}\n{}", msg.to_lossy(), trace)
        }
        _ => trace,
    };
    Ok(vec![Value::Str(LuaStr::from(text))])
}

fn native_getinfo(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let info = TableRef::new(Table::new(0, 6));
    match args.first() {
        Some(Value::Function(Function::Lua(closure))) => {
            let proto = &closure.proto;
            info.set_str("source", Value::Str(proto.source.clone()));
            info.set_str("short_src", Value::Str(proto.source.clone()));
            info.set_str("linedefined", Value::Integer(proto.line_defined as i32));
            info.set_str(
                "lastlinedefined",
                Value::Integer(proto.last_line_defined as i32),
            );
            info.set_str("what", Value::from("Lua"));
            info.set_str("nparams", Value::Integer(proto.num_params as i32));
        }
        Some(Value::Function(Function::Native(n))) => {
            info.set_str("source", Value::from("=[C]"));
            info.set_str("short_src", Value::from("[C]"));
            info.set_str("what", Value::from("C"));
            info.set_str("name", Value::from(n.name.as_str()));
        }
        _ => {
            // Level-based lookup: report the current position.
            if let Some(pos) = scope.current_position() {
                info.set_str("short_src", Value::from(pos.as_str()));
            }
            info.set_str("what", Value::from("Lua"));
        }
    }
    Ok(vec![Value::Table(info)])
}

fn native_sethook(_scope: &mut dyn NativeCallScope, _args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(vec![])
}

fn native_gethook(_scope: &mut dyn NativeCallScope, _args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Nil])
}
