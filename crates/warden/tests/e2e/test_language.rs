//! Core language semantics through the full pipeline.

use crate::helpers::*;
use warden::value::Value;

#[test]
fn test_arithmetic_and_precedence() {
    let s = sandbox();
    assert_eq!(first_int(&eval_ok(&s, "return 1 + 2 * 3")), 7);
    assert_eq!(first_num(&eval_ok(&s, "return 2 ^ 10")), 1024.0);
    assert_eq!(first_num(&eval_ok(&s, "return 7 / 2")), 3.5);
    assert_eq!(first_int(&eval_ok(&s, "return 7 % 3")), 1);
    assert_eq!(first_int(&eval_ok(&s, "return -7 % 3")), 2);
    assert_eq!(first_num(&eval_ok(&s, "return 2 ^ 3 ^ 2")), 512.0);
    assert_eq!(first_int(&eval_ok(&s, "return -(3) + 1")), -2);
}

#[test]
fn test_integer_division_always_number() {
    let s = sandbox();
    let vals = eval_ok(&s, "return 6 / 3");
    assert!(matches!(vals[0], Value::Number(f) if f == 2.0));
}

#[test]
fn test_integer_overflow_promotes_to_number() {
    let s = sandbox();
    let vals = eval_ok(&s, "return 2147483647 + 1");
    assert!(matches!(vals[0], Value::Number(f) if f == 2147483648.0));
}

#[test]
fn test_numeric_strings_in_arithmetic() {
    let s = sandbox();
    assert_eq!(first_num(&eval_ok(&s, "return '10' + 5")), 15.0);
    let vals = eval_ok(&s, "local ok = pcall(function() return 'x' + 1 end) return ok");
    assert!(!first_bool(&vals));
}

#[test]
fn test_comparisons() {
    let s = sandbox();
    assert!(first_bool(&eval_ok(&s, "return 1 < 2")));
    assert!(first_bool(&eval_ok(&s, "return 2 <= 2")));
    assert!(first_bool(&eval_ok(&s, "return 3 > 2")));
    assert!(first_bool(&eval_ok(&s, "return 'abc' < 'abd'")));
    assert!(first_bool(&eval_ok(&s, "return 1 == 1.0")));
    assert!(first_bool(&eval_ok(&s, "return 'a' ~= 'b'")));
    assert!(!first_bool(&eval_ok(&s, "return 0/0 == 0/0")));
}

#[test]
fn test_comparing_mixed_types_errors() {
    let s = sandbox();
    let vals = eval_ok(&s, "local ok = pcall(function() return 1 < 'x' end) return ok");
    assert!(!first_bool(&vals));
}

#[test]
fn test_short_circuit() {
    let s = sandbox();
    assert_eq!(first_int(&eval_ok(&s, "return false or 5")), 5);
    assert_eq!(first_int(&eval_ok(&s, "return nil and 1 or 2")), 2);
    let vals = eval_ok(&s, "local n = 0 local function f() n = n + 1 return true end local _ = true or f() return n");
    assert_eq!(first_int(&vals), 0);
}

#[test]
fn test_while_repeat_for() {
    let s = sandbox();
    assert_eq!(
        first_int(&eval_ok(&s, "local n = 0 while n < 10 do n = n + 1 end return n")),
        10
    );
    assert_eq!(
        first_int(&eval_ok(&s, "local n = 0 repeat n = n + 1 until n >= 5 return n")),
        5
    );
    assert_eq!(
        first_int(&eval_ok(&s, "local s = 0 for i = 1, 10 do s = s + i end return s")),
        55
    );
    assert_eq!(
        first_int(&eval_ok(&s, "local s = 0 for i = 10, 1, -2 do s = s + i end return s")),
        30
    );
    assert_eq!(
        first_int(&eval_ok(&s, "local n = 0 for i = 1, 0 do n = n + 1 end return n")),
        0
    );
}

#[test]
fn test_break_and_goto() {
    let s = sandbox();
    assert_eq!(
        first_int(&eval_ok(
            &s,
            "local n = 0 while true do n = n + 1 if n == 3 then break end end return n"
        )),
        3
    );
    assert_eq!(
        first_int(&eval_ok(
            &s,
            r#"
            local n = 0
            ::again::
            n = n + 1
            if n < 4 then goto again end
            return n
            "#
        )),
        4
    );
}

#[test]
fn test_functions_and_recursion() {
    let s = sandbox();
    assert_eq!(
        first_int(&eval_ok(
            &s,
            r#"
            local function fib(n)
                if n < 2 then return n end
                return fib(n - 1) + fib(n - 2)
            end
            return fib(15)
            "#
        )),
        610
    );
}

#[test]
fn test_multiple_returns_and_adjustment() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local function three() return 1, 2, 3 end
        local a, b = three()
        local c, d, e, f = three()
        return a, b, c, d, e, f
        "#,
    );
    assert_eq!(vals.iter().filter_map(|v| v.as_integer()).collect::<Vec<_>>(), vec![1, 2, 1, 2, 3]);
    assert!(vals[5].is_nil());
}

#[test]
fn test_parenthesised_call_truncates() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "local function two() return 1, 2 end return (two())",
    );
    assert_eq!(vals.len(), 1);
    assert_eq!(first_int(&vals), 1);
}

#[test]
fn test_varargs() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local function count(...) return select('#', ...) end
        local function tail(...) return ... end
        return count(1, nil, 3), tail('a', 'b')
        "#,
    );
    assert_eq!(first_int(&vals), 3);
    assert_eq!(vals.len(), 3);
}

#[test]
fn test_closures_and_upvalues() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local function counter()
            local n = 0
            return function() n = n + 1 return n end
        end
        local c1, c2 = counter(), counter()
        c1() c1()
        return c1(), c2()
        "#,
    );
    assert_eq!(first_int(&vals), 3);
    assert_eq!(vals[1].as_integer(), Some(1));
}

#[test]
fn test_upvalues_close_per_iteration() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local fs = {}
        for i = 1, 3 do
            local x = i * 10
            fs[i] = function() return x end
        end
        return fs[1]() + fs[2]() + fs[3]()
        "#,
    );
    assert_eq!(first_int(&vals), 60);
}

#[test]
fn test_method_calls_and_self() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local account = { balance = 100 }
        function account:deposit(n) self.balance = self.balance + n end
        account:deposit(50)
        return account.balance
        "#,
    );
    assert_eq!(first_int(&vals), 150);
}

#[test]
fn test_string_concat_and_length() {
    let s = sandbox();
    assert_eq!(first_str(&eval_ok(&s, "return 'a' .. 'b' .. 'c'")), "abc");
    assert_eq!(first_int(&eval_ok(&s, "return #'hello'")), 5);
    assert_eq!(first_str(&eval_ok(&s, "return 'n=' .. 42")), "n=42");
}

#[test]
fn test_error_message_carries_position() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "local ok, err = pcall(function() error('kaboom') end) return err",
    );
    let msg = first_str(&vals);
    assert!(msg.contains("kaboom"));
    assert!(msg.contains(':'), "no position prefix in {msg:?}");
}

#[test]
fn test_error_with_table_value() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "local ok, err = pcall(function() error({ code = 7 }) end) return err.code",
    );
    assert_eq!(first_int(&vals), 7);
}

#[test]
fn test_xpcall_handler() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local ok, res = xpcall(function() error('inner') end, function(m) return 'handled: ' .. m end)
        return ok, res
        "#,
    );
    assert!(!first_bool(&vals));
    assert!(matches!(&vals[1], Value::Str(m) if m.to_lossy().starts_with("handled: ")));
}

#[test]
fn test_xpcall_failing_handler() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local ok, res = xpcall(function() error('inner') end, function() error('handler') end)
        return ok, res
        "#,
    );
    assert!(!first_bool(&vals));
    assert!(matches!(&vals[1], Value::Str(m) if m.to_lossy() == "error in error handling"));
}

#[test]
fn test_generic_for_over_pairs() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local sum = 0
        for _, v in pairs({ 5, 10, 15 }) do sum = sum + v end
        return sum
        "#,
    );
    assert_eq!(first_int(&vals), 30);
}

#[test]
fn test_tail_call_recursion_is_bounded_by_budget_not_stack() {
    let s = sandbox();
    // Deep tail recursion must not overflow the native stack.
    let vals = eval_ok(
        &s,
        r#"
        local function loop(n)
            if n == 0 then return 'done' end
            return loop(n - 1)
        end
        return loop(5000)
        "#,
    );
    assert_eq!(first_str(&vals), "done");
}
