use warden::value::Value;
use warden::{LuaError, Sandbox};

/// A sandbox with a generous default budget, enough for any test script.
pub fn sandbox() -> Sandbox {
    let s = Sandbox::new();
    s.install_limit(1_000_000, 1_048_576);
    s
}

/// Run a source string, panicking on any failure.
pub fn eval_ok(s: &Sandbox, source: &str) -> Vec<Value> {
    s.eval(source).unwrap_or_else(|e| {
        panic!("script failed: {e}\nsource:\n{source}");
    })
}

/// Run a source string, expecting an error.
pub fn eval_err(s: &Sandbox, source: &str) -> LuaError {
    match s.eval(source) {
        Err(e) => e,
        Ok(vals) => panic!("expected error, got {vals:?}\nsource:\n{source}"),
    }
}

pub fn first_int(vals: &[Value]) -> i32 {
    match vals.first() {
        Some(Value::Integer(i)) => *i,
        other => panic!("expected integer result, got {other:?}"),
    }
}

pub fn first_num(vals: &[Value]) -> f64 {
    match vals.first() {
        Some(Value::Integer(i)) => *i as f64,
        Some(Value::Number(f)) => *f,
        other => panic!("expected numeric result, got {other:?}"),
    }
}

pub fn first_bool(vals: &[Value]) -> bool {
    match vals.first() {
        Some(Value::Boolean(b)) => *b,
        other => panic!("expected boolean result, got {other:?}"),
    }
}

pub fn first_str(vals: &[Value]) -> String {
    match vals.first() {
        Some(Value::Str(s)) => s.to_lossy(),
        other => panic!("expected string result, got {other:?}"),
    }
}
