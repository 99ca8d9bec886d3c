//! The resource-accounting contracts: instruction budgets, the string cap,
//! and their interaction with protected calls.

use crate::helpers::*;
use warden::{LuaError, Sandbox};

#[test]
fn test_runaway_loop_hits_limit_exactly() {
    let s = Sandbox::new();
    s.install_limit(50, 1024);
    let e = eval_err(&s, "x=0 for i=1,1e9 do x=x+1 end return x");
    assert!(matches!(e, LuaError::Limit { max: 50 }), "got {e:?}");
    // The check precedes the addition: a failed charge never moves the
    // counter past max.
    assert_eq!(s.limit().unwrap().current(), 50);
}

#[test]
fn test_counter_matches_dispatched_opcodes() {
    let s = Sandbox::new();
    s.install_limit(1_000_000, 1024);
    eval_ok(&s, "return 1");
    let after_first = s.limit().unwrap().current();
    assert!(after_first > 0);
    // The same chunk costs the same number of instructions again.
    eval_ok(&s, "return 1");
    assert_eq!(s.limit().unwrap().current(), after_first * 2);
}

#[test]
fn test_counter_boundary() {
    let s = Sandbox::new();
    // Measure the cost of the chunk, then pin the budget exactly there.
    s.install_limit(1_000_000, 1024);
    eval_ok(&s, "return 1 + 1");
    let cost = s.limit().unwrap().current();

    let exact = Sandbox::new();
    exact.install_limit(cost, 1024);
    eval_ok(&exact, "return 1 + 1");

    let starved = Sandbox::new();
    starved.install_limit(cost - 1, 1024);
    let e = eval_err(&starved, "return 1 + 1");
    assert!(matches!(e, LuaError::Limit { .. }));
}

#[test]
fn test_concat_loop_hits_string_cap_not_instruction_limit() {
    let s = Sandbox::new();
    s.install_limit(10_000, 100);
    let e = eval_err(
        &s,
        r#"local s="" for i=1,100 do s=s..s.."a" end return #s"#,
    );
    assert!(matches!(e, LuaError::StringLimit { max: 100 }), "got {e:?}");
    // The failure arrives from the cap, far below the instruction budget.
    assert!(s.limit().unwrap().current() < 10_000);
}

#[test]
fn test_concat_exact_cap_boundary() {
    let s = Sandbox::new();
    s.install_limit(100_000, 10);
    // Exactly at the cap is fine…
    let vals = eval_ok(&s, "return ('aaaaa') .. ('bbbbb')");
    assert_eq!(first_str(&vals).len(), 10);
    // …one byte more is not.
    let e = eval_err(&s, "return ('aaaaa') .. ('bbbbbb')");
    assert!(matches!(e, LuaError::StringLimit { max: 10 }));
}

#[test]
fn test_pcall_does_not_shield_the_budget() {
    let s = Sandbox::new();
    s.install_limit(100, 1024);
    let e = eval_err(&s, "pcall(function() while true do end end) return 1");
    assert!(matches!(e, LuaError::Limit { max: 100 }), "got {e:?}");
}

#[test]
fn test_pcall_does_not_shield_the_string_cap() {
    let s = Sandbox::new();
    s.install_limit(100_000, 50);
    let e = eval_err(
        &s,
        r#"local ok, err = pcall(function()
            local t = ""
            for i = 1, 100 do t = t .. "0123456789" end
        end)
        return ok, err"#,
    );
    assert!(matches!(e, LuaError::StringLimit { .. }), "got {e:?}");
}

#[test]
fn test_pcall_catches_script_errors() {
    let s = sandbox();
    let vals = eval_ok(&s, "local ok, err = pcall(function() error('boom') end) return ok, err");
    assert!(!first_bool(&vals));
    assert!(matches!(&vals[1], warden::value::Value::Str(m) if m.to_lossy().contains("boom")));
}

#[test]
fn test_reset_preserves_max_and_zeroes_counter() {
    let s = Sandbox::new();
    let limit = s.install_limit(500, 100);
    eval_ok(&s, "return 1");
    assert!(limit.current() > 0);
    s.reset_limit();
    assert_eq!(limit.current(), 0);
    assert_eq!(limit.max(), 500);
}

#[test]
fn test_counter_monotone_within_a_run() {
    let s = Sandbox::new();
    let limit = s.install_limit(100_000, 1024);
    let mut last = 0;
    for _ in 0..5 {
        eval_ok(&s, "local x = 1 + 1");
        let cur = limit.current();
        assert!(cur > last);
        last = cur;
    }
}

#[test]
fn test_string_rep_checks_cap() {
    let s = Sandbox::new();
    s.install_limit(100_000, 100);
    eval_ok(&s, "return ('ab'):rep(50)");
    let e = eval_err(&s, "return ('ab'):rep(51)");
    assert!(matches!(e, LuaError::StringLimit { max: 100 }));
}

#[test]
fn test_table_concat_checks_cap() {
    let s = Sandbox::new();
    s.install_limit(100_000, 10);
    let e = eval_err(&s, "return table.concat({'aaaa','bbbb','cccc'})");
    assert!(matches!(e, LuaError::StringLimit { max: 10 }));
}

#[test]
fn test_unlimited_main_thread_runs_without_limit() {
    let s = Sandbox::new();
    // No limit installed: the main caller is unlimited.
    let vals = eval_ok(&s, "local n = 0 for i = 1, 100000 do n = n + 1 end return n");
    assert_eq!(first_int(&vals), 100_000);
}
