//! The curated standard surface, including the accounting-aware builtins
//! and the hardening holes that must stay holes.

use crate::helpers::*;
use warden::{Sandbox, value::Value};

#[test]
fn test_table_contains_charges_flat_cost() {
    let s = Sandbox::new();
    s.install_limit(30, 1024);
    let vals = eval_ok(&s, "return table.contains({1,2,3,4,5}, 4)");
    assert!(first_bool(&vals));
    // Construction opcodes plus the flat charge of 10 stay under the
    // 30-instruction budget.
    let used = s.limit().unwrap().current();
    assert!(used > 10 && used < 30, "counter was {used}");
}

#[test]
fn test_table_contains_misses() {
    let s = sandbox();
    let vals = eval_ok(&s, "return table.contains({1,2,3}, 99)");
    assert!(!first_bool(&vals));
}

#[test]
fn test_table_insert_remove() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local t = { 1, 3 }
        table.insert(t, 2, 2)
        table.insert(t, 4)
        local removed = table.remove(t, 1)
        return removed, t[1], t[2], t[3], #t
        "#,
    );
    assert_eq!(first_int(&vals), 1);
    assert_eq!(vals[1].as_integer(), Some(2));
    assert_eq!(vals[2].as_integer(), Some(3));
    assert_eq!(vals[3].as_integer(), Some(4));
    assert_eq!(vals[4].as_integer(), Some(3));
}

#[test]
fn test_table_sort() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local t = { 5, 2, 8, 1, 9 }
        table.sort(t)
        local asc = table.concat(t, ',')
        table.sort(t, function(a, b) return a > b end)
        return asc, table.concat(t, ',')
        "#,
    );
    assert_eq!(first_str(&vals), "1,2,5,8,9");
    assert!(matches!(&vals[1], Value::Str(m) if m.to_lossy() == "9,8,5,2,1"));
}

#[test]
fn test_table_pack_unpack() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "local t = table.pack(7, 8, 9) return t.n, table.unpack(t, 1, t.n)",
    );
    assert_eq!(first_int(&vals), 3);
    assert_eq!(vals[3].as_integer(), Some(9));
}

#[test]
fn test_table_clear() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "local t = { 1, 2, x = 3 } table.clear(t) return next(t) == nil",
    );
    assert!(first_bool(&vals));
}

#[test]
fn test_string_basics() {
    let s = sandbox();
    assert_eq!(first_str(&eval_ok(&s, "return ('hello'):upper()")), "HELLO");
    assert_eq!(first_str(&eval_ok(&s, "return ('HeLLo'):lower()")), "hello");
    assert_eq!(first_str(&eval_ok(&s, "return ('hello'):sub(2, 4)")), "ell");
    assert_eq!(first_str(&eval_ok(&s, "return ('hello'):sub(-3)")), "llo");
    assert_eq!(first_str(&eval_ok(&s, "return ('ab'):rep(3)")), "ababab");
    assert_eq!(first_str(&eval_ok(&s, "return ('abc'):reverse()")), "cba");
    assert_eq!(first_int(&eval_ok(&s, "return string.len('1234')")), 4);
    assert_eq!(first_int(&eval_ok(&s, "return ('A'):byte()")), 65);
    assert_eq!(first_str(&eval_ok(&s, "return string.char(104, 105)")), "hi");
}

#[test]
fn test_string_format() {
    let s = sandbox();
    assert_eq!(
        first_str(&eval_ok(&s, "return string.format('%d-%s', 7, 'x')")),
        "7-x"
    );
    assert_eq!(
        first_str(&eval_ok(&s, "return string.format('%05d', 42)")),
        "00042"
    );
    assert_eq!(
        first_str(&eval_ok(&s, "return string.format('%.2f', 1.005)")),
        "1.00"
    );
    assert_eq!(
        first_str(&eval_ok(&s, "return string.format('%x', 255)")),
        "ff"
    );
}

#[test]
fn test_string_find_and_match() {
    let s = sandbox();
    let vals = eval_ok(&s, "return string.find('hello world', 'wor')");
    assert_eq!(first_int(&vals), 7);
    assert_eq!(vals[1].as_integer(), Some(9));

    assert_eq!(
        first_str(&eval_ok(&s, "return string.match('key=value', '(%w+)=')")),
        "key"
    );
    let vals = eval_ok(&s, "return string.match('abc', '%d+')");
    assert!(vals[0].is_nil());
    assert_eq!(
        first_str(&eval_ok(&s, "return ('x42y'):match('%d+')")),
        "42"
    );
}

#[test]
fn test_string_gmatch() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        local words = {}
        for w in string.gmatch('one two three', '%a+') do words[#words + 1] = w end
        return #words, words[2]
        "#,
    );
    assert_eq!(first_int(&vals), 3);
    assert!(matches!(&vals[1], Value::Str(m) if m.to_lossy() == "two"));
}

#[test]
fn test_string_gsub() {
    let s = sandbox();
    let vals = eval_ok(&s, "return string.gsub('hello world', 'o', '0')");
    assert_eq!(first_str(&vals), "hell0 w0rld");
    assert_eq!(vals[1].as_integer(), Some(2));

    let vals = eval_ok(&s, "return ('abc'):gsub('%a', function(c) return c:upper() end)");
    assert_eq!(first_str(&vals), "ABC");

    let vals = eval_ok(&s, "return ('a-b'):gsub('(%a)-(%a)', '%2-%1')");
    assert_eq!(first_str(&vals), "b-a");
}

#[test]
fn test_math_surface() {
    let s = sandbox();
    assert_eq!(first_int(&eval_ok(&s, "return math.floor(3.7)")), 3);
    assert_eq!(first_int(&eval_ok(&s, "return math.ceil(3.2)")), 4);
    assert_eq!(first_int(&eval_ok(&s, "return math.abs(-5)")), 5);
    assert_eq!(first_num(&eval_ok(&s, "return math.sqrt(16)")), 4.0);
    assert_eq!(first_int(&eval_ok(&s, "return math.max(3, 9, 1)")), 9);
    assert_eq!(first_int(&eval_ok(&s, "return math.min(3, 9, 1)")), 1);
    assert!(first_bool(&eval_ok(&s, "return math.huge > 1e300")));
    let vals = eval_ok(&s, "local r = math.random(5, 10) return r >= 5 and r <= 10");
    assert!(first_bool(&vals));
}

#[test]
fn test_os_surface_is_restricted() {
    let s = sandbox();
    // Present and read-only.
    assert!(first_num(&eval_ok(&s, "return os.time()")) > 1.0e9);
    assert_eq!(first_num(&eval_ok(&s, "return os.difftime(10, 4)")), 6.0);
    let vals = eval_ok(&s, "return os.date('%Y-%m-%d', 0)");
    assert_eq!(first_str(&vals), "1970-01-01");
    let vals = eval_ok(&s, "local t = os.date('*t', 0) return t.year, t.wday");
    assert_eq!(first_int(&vals), 1970);
    assert_eq!(vals[1].as_integer(), Some(5));

    // Absent by policy.
    for name in ["execute", "remove", "rename", "tmpname", "getenv", "exit"] {
        let vals = eval_ok(&s, &format!("return os.{name} == nil"));
        assert!(first_bool(&vals), "os.{name} must be absent");
    }
}

#[test]
fn test_no_io_no_loaders() {
    let s = sandbox();
    for global in ["io", "load", "loadstring", "dofile", "loadfile", "collectgarbage"] {
        let vals = eval_ok(&s, &format!("return {global} == nil"));
        assert!(first_bool(&vals), "{global} must be absent");
    }
}

#[test]
fn test_require_preload() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        r#"
        package.preload['answer'] = function() return { value = 42 } end
        local m1 = require('answer')
        local m2 = require('answer')
        return m1.value, m1 == m2
        "#,
    );
    assert_eq!(first_int(&vals), 42);
    assert!(matches!(vals[1], Value::Boolean(true)));
}

#[test]
fn test_require_missing_module() {
    let s = sandbox();
    let vals = eval_ok(
        &s,
        "local ok, err = pcall(require, 'no_such_module') return ok, err",
    );
    assert!(!first_bool(&vals));
    assert!(matches!(&vals[1], Value::Str(m) if m.to_lossy().contains("not found")));
}

#[test]
fn test_tostring_tonumber() {
    let s = sandbox();
    assert_eq!(first_str(&eval_ok(&s, "return tostring(12)")), "12");
    assert_eq!(first_str(&eval_ok(&s, "return tostring(nil)")), "nil");
    assert_eq!(first_str(&eval_ok(&s, "return tostring(true)")), "true");
    assert_eq!(first_int(&eval_ok(&s, "return tonumber('42')")), 42);
    assert_eq!(first_num(&eval_ok(&s, "return tonumber('2.5')")), 2.5);
    assert_eq!(first_int(&eval_ok(&s, "return tonumber('ff', 16)")), 255);
    assert!(eval_ok(&s, "return tonumber('zebra')")[0].is_nil());
}

#[test]
fn test_type_and_select() {
    let s = sandbox();
    assert_eq!(first_str(&eval_ok(&s, "return type({})")), "table");
    assert_eq!(first_str(&eval_ok(&s, "return type('')")), "string");
    assert_eq!(first_str(&eval_ok(&s, "return type(1)")), "number");
    assert_eq!(first_str(&eval_ok(&s, "return type(print)")), "function");
    assert_eq!(first_int(&eval_ok(&s, "return select('#', 'a', 'b', 'c')")), 3);
    assert_eq!(first_str(&eval_ok(&s, "return select(2, 'a', 'b', 'c')")), "b");
}

#[test]
fn test_debug_is_diagnostics_only() {
    let s = sandbox();
    let vals = eval_ok(&s, "return debug.traceback('top')");
    assert!(first_str(&vals).starts_with("top"));
    // sethook is accepted but cannot weaken the budget.
    let strict = Sandbox::new();
    strict.install_limit(100, 1024);
    let e = eval_err(
        &strict,
        "debug.sethook(function() end, 'l') while true do end",
    );
    assert!(matches!(e, warden::LuaError::Limit { .. }));
}
