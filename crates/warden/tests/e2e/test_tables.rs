//! Table semantics: borders, deletion visibility, iteration, metatables.

use crate::helpers::*;
use warden::value::Value;

#[test]
fn test_border_after_hole_is_one_or_three() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "local t={}; t[1]=10; t[2]=20; t[3]=30; t[2]=nil; return #t",
    );
    let n = first_int(&vals);
    assert!(n == 1 || n == 3, "border was {n}");
}

#[test]
fn test_length_dense_array() {
    let s = sandbox();
    let vals = eval_ok(&s, "local t = {} for i = 1, 50 do t[i] = i end return #t");
    assert_eq!(first_int(&vals), 50);
}

#[test]
fn test_deleted_key_never_iterated() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local t = { a = 1, b = 2, c = 3 }
        t.b = nil
        local seen_b, count = false, 0
        for k, v in pairs(t) do
            count = count + 1
            if k == 'b' then seen_b = true end
        end
        return seen_b, count
        "#,
    );
    assert!(!first_bool(&vals));
    assert_eq!(vals[1].as_integer(), Some(2));
}

#[test]
fn test_pairs_visits_each_pair_once() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local t = { 10, 20, 30, x = 1, y = 2 }
        local keys, sum = 0, 0
        for k, v in pairs(t) do keys = keys + 1 sum = sum + v end
        return keys, sum
        "#,
    );
    assert_eq!(first_int(&vals), 5);
    assert_eq!(vals[1].as_integer(), Some(63));
}

#[test]
fn test_ipairs_stops_at_first_hole() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local t = { 1, 2, nil, 4 }
        local n = 0
        for i, v in ipairs(t) do n = n + 1 end
        return n
        "#,
    );
    assert_eq!(first_int(&vals), 2);
}

#[test]
fn test_integral_float_keys_collapse() {
    let s = sandbox();
    let vals = eval_ok(&s, "local t = {} t[2] = 'a' t[2.0] = 'b' return t[2]");
    assert_eq!(first_str(&vals), "b");
}

#[test]
fn test_nil_key_errors() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "local ok = pcall(function() local t = {} t[nil] = 1 end) return ok",
    );
    assert!(!first_bool(&vals));
}

#[test]
fn test_nan_key_errors() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "local ok = pcall(function() local t = {} t[0/0] = 1 end) return ok",
    );
    assert!(!first_bool(&vals));
}

#[test]
fn test_index_metamethod_table() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local defaults = { colour = 'red' }
        local t = setmetatable({}, { __index = defaults })
        return t.colour, rawget(t, 'colour')
        "#,
    );
    assert_eq!(first_str(&vals), "red");
    assert!(vals[1].is_nil());
}

#[test]
fn test_index_metamethod_function() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local t = setmetatable({}, { __index = function(_, k) return k .. '!' end })
        return t.ping
        "#,
    );
    assert_eq!(first_str(&vals), "ping!");
}

#[test]
fn test_newindex_metamethod() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local log = {}
        local t = setmetatable({}, { __newindex = function(_, k, v) log[#log + 1] = k end })
        t.a = 1
        t.b = 2
        return #log, rawget(t, 'a')
        "#,
    );
    assert_eq!(first_int(&vals), 2);
    assert!(vals[1].is_nil());
}

#[test]
fn test_arith_metamethods() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local mt = { __add = function(a, b) return a.v + b.v end }
        local x = setmetatable({ v = 3 }, mt)
        local y = setmetatable({ v = 4 }, mt)
        return x + y
        "#,
    );
    assert_eq!(first_int(&vals), 7);
}

#[test]
fn test_eq_metamethod_applies_to_distinct_tables() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local mt = { __eq = function() return true end }
        local a = setmetatable({}, mt)
        local b = setmetatable({}, mt)
        return a == b, a ~= b
        "#,
    );
    assert!(first_bool(&vals));
    assert!(!matches!(vals[1], Value::Boolean(true)));
}

#[test]
fn test_len_metamethod() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "return #setmetatable({}, { __len = function() return 99 end })",
    );
    assert_eq!(first_int(&vals), 99);
}

#[test]
fn test_call_metamethod() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local callable = setmetatable({}, { __call = function(self, x) return x * 2 end })
        return callable(21)
        "#,
    );
    assert_eq!(first_int(&vals), 42);
}

#[test]
fn test_protected_metatable() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local t = setmetatable({}, { __metatable = 'locked' })
        local ok = pcall(setmetatable, t, {})
        return ok, getmetatable(t)
        "#,
    );
    assert!(!first_bool(&vals));
    assert_eq!(vals[1].as_str().map(|v| v.to_lossy()).as_deref(), Some("locked"));
}

#[test]
fn test_tostring_metamethod() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "return tostring(setmetatable({}, { __tostring = function() return 'boxed' end }))",
    );
    assert_eq!(first_str(&vals), "boxed");
}

#[test]
fn test_concat_metamethod() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local mt = { __concat = function(a, b) return 'joined' end }
        local t = setmetatable({}, mt)
        return t .. 'x', 'x' .. t
        "#,
    );
    assert_eq!(first_str(&vals), "joined");
}

#[test]
fn test_next_observes_deletion() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local t = { k1 = 1, k2 = 2 }
        t.k1 = nil
        local k, v = next(t)
        return k, v
        "#,
    );
    assert_eq!(first_str(&vals), "k2");
}

#[test]
fn debug_probe_eq() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local mt = { __eq = function() return true end }
        local a = setmetatable({}, mt)
        local b = setmetatable({}, mt)
        return a == b, a == b
        "#,
    );
    panic!("{:?}", vals);
}
