//! Host embedding surface: source caps, registered callables, the console
//! queue, memory accounting.

use crate::helpers::*;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use warden::globals::LoadError;
use warden::value::Value;
use warden::{NativeCallScope as _, Sandbox};

#[test]
fn test_source_length_cap_boundary() {
    let sandbox = Sandbox::with_max_source_len(100);
    let at_cap = format!("return 1 --{}", "x".repeat(100 - 11));
    assert_eq!(at_cap.len(), 100);
    assert!(sandbox.load(at_cap.as_bytes(), "exact").is_ok());

    let over = format!("{at_cap}y");
    match sandbox.load(over.as_bytes(), "over") {
        Err(LoadError::ScriptTooLong { len: 101, limit: 100 }) => {}
        other => panic!("expected ScriptTooLong, got {other:?}"),
    }
}

#[test]
fn test_compile_error_surfaces() {
    let s = Sandbox::new();
    match s.load(b"local = = =", "bad") {
        Err(LoadError::Compile(_)) => {}
        other => panic!("expected compile error, got {other:?}"),
    }
}

#[test]
fn test_registered_callable_crosses_the_boundary() {
    let s = sandbox();
    let calls = Arc::new(AtomicI32::new(0));
    let seen = calls.clone();
    s.globals().register("host_double", move |_scope, args| {
        seen.fetch_add(1, Ordering::Relaxed);
        let n = args.first().and_then(|v| v.as_integer()).unwrap_or(0);
        Ok(vec![Value::Integer(n * 2)])
    });
    let vals = eval_ok(&s, "return host_double(21)");
    assert_eq!(first_int(&vals), 42);
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn test_registered_callable_can_charge_instructions() {
    let s = Sandbox::new();
    s.install_limit(100, 1024);
    s.globals().register("expensive", |scope, _args| {
        scope.charge(90)?;
        Ok(vec![])
    });
    // One call fits; the second must blow the budget.
    let e = eval_err(&s, "expensive() expensive()");
    assert!(matches!(e, warden::LuaError::Limit { max: 100 }));
}

#[test]
fn test_print_reaches_console_queue() {
    let s = sandbox();
    eval_ok(&s, "print('hello', 42, true)");
    assert_eq!(s.try_dequeue().as_deref(), Some("hello\t42\ttrue"));
    assert!(s.try_dequeue().is_none());
}

#[test]
fn test_console_queue_full_on_main_thread_errors() {
    let s = sandbox();
    // 32 lines fill the queue; the 33rd cannot yield the main thread.
    let vals = eval_ok(
        &s,
        r#"
        for i = 1, 32 do print(i) end
        local ok, err = pcall(print, 'overflow')
        return ok, err
        "#,
    );
    assert!(!first_bool(&vals));
    let mut drained = 0;
    while s.try_dequeue().is_some() {
        drained += 1;
    }
    assert_eq!(drained, 32);
}

#[test]
fn test_console_backpressure_suspends_worker() {
    let s = Sandbox::new();
    let chunk = s
        .load(
            b"return function() for i = 1, 40 do print(i) end return 'flushed' end",
            "writer",
        )
        .unwrap();
    let f = s.call(&chunk, &[]).unwrap().remove(0);
    let worker = s.spawn(f);
    s.install_worker_limit(&worker, 1_000_000, 1024);

    // First resume fills the 32-slot queue and parks on back-pressure.
    let r = s.resume(&worker, vec![]).unwrap();
    assert!(matches!(r[0], Value::Boolean(true)));
    let mut total = 0;
    while s.try_dequeue().is_some() {
        total += 1;
    }
    assert_eq!(total, 32);

    // With the queue drained the worker finishes on the next resume.
    let r = s.resume(&worker, vec![]).unwrap();
    assert!(matches!(r[0], Value::Boolean(true)));
    assert!(matches!(&r[1], Value::Str(m) if m.to_lossy() == "flushed"));
    while s.try_dequeue().is_some() {
        total += 1;
    }
    assert_eq!(total, 40);
}

#[test]
fn test_used_memory_grows_with_reachable_data() {
    let s = sandbox();
    let before = s.used_memory();
    eval_ok(&s, "blob = string.rep('x', 10000)");
    let after = s.used_memory();
    assert!(
        after >= before + 10_000,
        "memory went {before} -> {after}"
    );
    eval_ok(&s, "blob = nil");
    let released = s.used_memory();
    assert!(released < after);
}

#[test]
fn test_used_memory_handles_cycles() {
    let s = sandbox();
    eval_ok(&s, "a = {} b = { back = a } a.fwd = b a.self = a");
    // Termination is the assertion.
    let _ = s.used_memory();
}

#[test]
fn test_call_results_cross_back() {
    let s = sandbox();
    let chunk = s
        .load(b"return function(a, b) return a + b, a * b end", "ops")
        .unwrap();
    let f = s.call(&chunk, &[]).unwrap().remove(0);
    let vals = s
        .call(&f, &[Value::Integer(6), Value::Integer(7)])
        .unwrap();
    assert_eq!(vals[0].as_integer(), Some(13));
    assert_eq!(vals[1].as_integer(), Some(42));
}

#[test]
fn test_no_binary_chunk_path() {
    // Precompiled chunks are refused at the only entry point: the compiler
    // rejects anything that is not source text, starting with the classic
    // binary signature.
    let s = Sandbox::new();
    assert!(matches!(
        s.load(b"\x1bLua\x52\x00", "binary"),
        Err(LoadError::Compile(_))
    ));
}
