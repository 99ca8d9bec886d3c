//! Coroutine library over the worker scheduler.
//!
//! `coroutine.create` packages a function as an OS-thread-backed worker.
//! Script-created workers inherit the creating context's instruction-limit
//! record, so spawning coroutines can never escape the budget; host-spawned
//! workers carry their own per-worker record.

use crate::{check_function, register_fn};
use std::sync::Arc;
use warden_core::error::{LuaError, LuaResult};
use warden_core::native::NativeCallScope;
use warden_core::table::{Table, TableRef};
use warden_core::thread::LuaThread;
use warden_core::value::{NativeFunction, Value};
use warden_vm::Globals;

pub fn register(globals: &Arc<Globals>) {
    let t = TableRef::new(Table::new(0, 8));
    register_fn(&t, "create", native_create);
    register_fn(&t, "resume", native_resume);
    register_fn(&t, "yield", native_yield);
    register_fn(&t, "status", native_status);
    register_fn(&t, "running", native_running);
    register_fn(&t, "isyieldable", native_isyieldable);
    register_fn(&t, "wrap", native_wrap);
    globals.env().set_str("coroutine", Value::Table(t));
}

fn native_create(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let f = check_function(args, 0, "create")?;
    let thread = LuaThread::new(f);
    if let Some(limit) = scope.current_limit() {
        thread.state.adopt_limit(limit);
    }
    Ok(vec![Value::Thread(thread)])
}

fn native_resume(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let co = match args.first() {
        Some(Value::Thread(t)) => t.clone(),
        other => {
            return Err(crate::arg_error(
                0,
                "resume",
                "coroutine",
                other.unwrap_or(&Value::Nil),
            ))
        }
    };
    scope.resume_thread(&co, args.get(1..).unwrap_or(&[]).to_vec())
}

fn native_yield(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    scope.do_yield(args.to_vec())
}

fn native_status(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let co = match args.first() {
        Some(Value::Thread(t)) => t.clone(),
        other => {
            return Err(crate::arg_error(
                0,
                "status",
                "coroutine",
                other.unwrap_or(&Value::Nil),
            ))
        }
    };
    // The worker we are running inside reads as "running" even though its
    // state word says so too; everything else reports its state name.
    if let Some(current) = scope.current_thread() {
        if Arc::ptr_eq(&current, &co) {
            return Ok(vec![Value::from("running")]);
        }
    }
    Ok(vec![Value::from(co.status_name())])
}

fn native_running(scope: &mut dyn NativeCallScope, _args: &[Value]) -> LuaResult<Vec<Value>> {
    match scope.current_thread() {
        Some(t) => Ok(vec![Value::Thread(t), Value::Boolean(false)]),
        None => Ok(vec![Value::Nil, Value::Boolean(true)]),
    }
}

fn native_isyieldable(scope: &mut dyn NativeCallScope, _args: &[Value]) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Boolean(scope.in_worker())])
}

fn native_wrap(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let f = check_function(args, 0, "wrap")?;
    let thread = LuaThread::new(f);
    if let Some(limit) = scope.current_limit() {
        thread.state.adopt_limit(limit);
    }
    let wrapped = NativeFunction::new("wrapped_coroutine", move |scope, args: &[Value]| {
        let mut tuple = scope.resume_thread(&thread, args.to_vec())?;
        match tuple.first() {
            Some(Value::Boolean(true)) => {
                tuple.remove(0);
                Ok(tuple)
            }
            Some(Value::Boolean(false)) => {
                let msg = tuple.into_iter().nth(1).unwrap_or(Value::Nil);
                Err(LuaError::raise(msg))
            }
            // Resume-at-limit: pass the bare Nil through.
            _ => Ok(tuple),
        }
    });
    Ok(vec![Value::native(wrapped)])
}
