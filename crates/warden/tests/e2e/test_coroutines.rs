//! Worker scheduling: yield/resume handoff, resume-at-limit, budget-driven
//! suspension, and the host-driven tick pattern.

use crate::helpers::*;
use warden::value::Value;
use warden::Sandbox;

#[test]
fn test_long_running_tick_worker() {
    // Configure a tiny budget, watch the first resume get parked,
    // reconfigure, then drive progress with reset+resume ticks.
    let s = Sandbox::new();
    let chunk = s
        .load(
            b"tick = function() local n = 0 while true do n = n + 1 coroutine.yield(n) end end",
            "ticker",
        )
        .unwrap();
    s.call(&chunk, &[]).unwrap();

    let tick_fn = s.globals().env().get_str("tick");
    assert!(tick_fn.is_function());
    let worker = s.spawn(tick_fn);
    s.install_worker_limit(&worker, 1, 100);

    // One instruction of budget: the worker parks almost immediately and
    // the resume comes back successfully with no payload.
    let r = s.resume(&worker, vec![Value::Nil]).unwrap();
    assert!(matches!(r[0], Value::Boolean(true)));

    // Reconfigure (same record, preserved counter), then tick.
    s.install_worker_limit(&worker, 500, 100);
    let mut expected = 1;
    for _ in 0..5 {
        s.reset_worker_limit(&worker);
        let r = s.resume(&worker, vec![Value::Nil]).unwrap();
        assert!(matches!(r[0], Value::Boolean(true)), "resume failed: {r:?}");
        assert_eq!(
            r.get(1).and_then(|v| v.as_integer()),
            Some(expected),
            "ticks must increase by exactly one"
        );
        expected += 1;
    }
}

#[test]
fn test_resume_at_limit_returns_nil_without_executing() {
    let s = Sandbox::new();
    let chunk = s
        .load(b"return function() while true do coroutine.yield(1) end end", "g")
        .unwrap();
    let g = s.call(&chunk, &[]).unwrap().remove(0);
    let worker = s.spawn(g);
    let limit = s.install_worker_limit(&worker, 100, 100);
    let r = s.resume(&worker, vec![]).unwrap();
    assert!(matches!(r[0], Value::Boolean(true)));

    // Force the counter to the max: the next resume must not execute one
    // opcode.
    while limit.try_charge(1).is_ok() {}
    let before = limit.current();
    let r = s.resume(&worker, vec![]).unwrap();
    assert_eq!(r.len(), 1);
    assert!(r[0].is_nil(), "expected bare nil, got {r:?}");
    assert_eq!(limit.current(), before);
}

#[test]
fn test_worker_error_reports_false_and_message() {
    let s = Sandbox::new();
    let chunk = s
        .load(b"return function() error('worker exploded') end", "w")
        .unwrap();
    let f = s.call(&chunk, &[]).unwrap().remove(0);
    let worker = s.spawn(f);
    s.install_worker_limit(&worker, 1000, 100);
    let r = s.resume(&worker, vec![]).unwrap();
    assert!(matches!(r[0], Value::Boolean(false)));
    assert!(matches!(&r[1], Value::Str(m) if m.to_lossy().contains("worker exploded")));
    assert_eq!(worker.status_name(), "dead");
}

#[test]
fn test_dead_worker_cannot_resume() {
    let s = Sandbox::new();
    let chunk = s.load(b"return function() return 42 end", "w").unwrap();
    let f = s.call(&chunk, &[]).unwrap().remove(0);
    let worker = s.spawn(f);
    s.install_worker_limit(&worker, 1000, 100);
    let r = s.resume(&worker, vec![]).unwrap();
    assert!(matches!(r[0], Value::Boolean(true)));
    assert_eq!(r.get(1).and_then(|v| v.as_integer()), Some(42));

    let r = s.resume(&worker, vec![]).unwrap();
    assert!(matches!(r[0], Value::Boolean(false)));
    assert!(matches!(&r[1], Value::Str(m) if m.to_lossy().contains("cannot resume dead")));
}

#[test]
fn test_resume_arguments_flow_into_yield_results() {
    let s = Sandbox::new();
    let chunk = s
        .load(
            b"return function(a) local b = coroutine.yield(a + 1) return b * 2 end",
            "w",
        )
        .unwrap();
    let f = s.call(&chunk, &[]).unwrap().remove(0);
    let worker = s.spawn(f);
    s.install_worker_limit(&worker, 1000, 100);

    let r = s.resume(&worker, vec![Value::Integer(10)]).unwrap();
    assert_eq!(r.get(1).and_then(|v| v.as_integer()), Some(11));
    let r = s.resume(&worker, vec![Value::Integer(7)]).unwrap();
    assert_eq!(r.get(1).and_then(|v| v.as_integer()), Some(14));
    assert_eq!(worker.status_name(), "dead");
}

#[test]
fn test_script_level_coroutines_share_the_budget() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local co = coroutine.create(function(x)
            local y = coroutine.yield(x + 1)
            return x + y
        end)
        local ok1, v1 = coroutine.resume(co, 10)
        local ok2, v2 = coroutine.resume(co, 5)
        return ok1 and ok2, v1, v2, coroutine.status(co)
        "#,
    );
    assert!(first_bool(&vals));
    assert_eq!(vals[1].as_integer(), Some(11));
    assert_eq!(vals[2].as_integer(), Some(15));
    assert!(matches!(&vals[3], Value::Str(st) if st.to_lossy() == "dead"));
}

#[test]
fn test_coroutine_wrap() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local gen = coroutine.wrap(function()
            for i = 1, 3 do coroutine.yield(i) end
        end)
        return gen() + gen() + gen()
        "#,
    );
    assert_eq!(first_int(&vals), 6);
}

#[test]
fn test_yield_outside_worker_errors() {
    let s = sandbox();
    let vals = eval_ok(&s, "local ok, err = pcall(coroutine.yield, 1) return ok, err");
    assert!(!first_bool(&vals));
}

#[test]
fn test_status_names() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local co = coroutine.create(function() coroutine.yield() end)
        local before = coroutine.status(co)
        coroutine.resume(co)
        local mid = coroutine.status(co)
        coroutine.resume(co)
        return before, mid, coroutine.status(co)
        "#,
    );
    assert_eq!(first_str(&vals), "suspended");
    assert!(matches!(&vals[1], Value::Str(m) if m.to_lossy() == "suspended"));
    assert!(matches!(&vals[2], Value::Str(m) if m.to_lossy() == "dead"));
}
