//! Runtime error type shared by the interpreter, builtins and the scheduler.

use crate::string::LuaStr;
use crate::value::Value;
use std::fmt;

/// A runtime error travelling up the Lua call stack.
///
/// Only `Script` is catchable by `pcall`/`xpcall`; every other variant
/// bypasses protected-call frames — the sandbox depends on that.
#[derive(Clone, Debug)]
pub enum LuaError {
    /// Script-level raise: `error(v)`, arithmetic/type/index errors. The
    /// carried value is what a protecting `pcall` returns as its message.
    /// `positioned` records whether a `source:line:` prefix was already
    /// attached, so unwinding never stacks prefixes.
    Script { value: Value, positioned: bool },
    /// Instruction budget exhausted; carries the effective max.
    Limit { max: u64 },
    /// An intermediate string exceeded the configured cap.
    StringLimit { max: usize },
    /// The worker observed that its external owner has gone away.
    Orphaned,
    /// VM invariant violation. A bug, not a script-visible condition.
    Internal(String),
}

pub type LuaResult<T> = Result<T, LuaError>;

impl LuaError {
    /// Script-level error with a plain, not-yet-positioned message.
    pub fn msg(m: impl Into<String>) -> Self {
        LuaError::Script {
            value: Value::Str(LuaStr::from(m.into())),
            positioned: false,
        }
    }

    /// Script-level raise of an arbitrary value (`error(v)`); the raiser is
    /// responsible for any position prefix.
    pub fn raise(value: Value) -> Self {
        LuaError::Script {
            value,
            positioned: true,
        }
    }

    /// Attach a `source:line:` prefix to a fresh string message; errors that
    /// already carry a position (or are not script errors) pass unchanged.
    pub fn positioned(self, position: impl FnOnce() -> String) -> Self {
        match self {
            LuaError::Script {
                value: Value::Str(s),
                positioned: false,
            } => LuaError::Script {
                value: Value::Str(LuaStr::from(format!("{}: {}", position(), s))),
                positioned: true,
            },
            other => other,
        }
    }

    /// True if a protected call may convert this into `(false, message)`.
    pub fn is_protectable(&self) -> bool {
        matches!(self, LuaError::Script { .. })
    }

    /// The value handed to a protected caller or error handler.
    pub fn to_value(&self) -> Value {
        match self {
            LuaError::Script { value, .. } => value.clone(),
            other => Value::Str(LuaStr::from(other.message())),
        }
    }

    /// Human-readable message for host surfaces and worker death reports.
    pub fn message(&self) -> String {
        match self {
            LuaError::Script {
                value: Value::Str(s),
                ..
            } => s.to_lossy(),
            LuaError::Script { value, .. } => format!("{value:?}"),
            LuaError::Limit { max } => format!("instruction limit exceeded ({max})"),
            LuaError::StringLimit { max } => format!("string length limit exceeded ({max})"),
            LuaError::Orphaned => "worker orphaned".to_string(),
            LuaError::Internal(m) => format!("internal error: {m}"),
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for LuaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_script_errors_are_protectable() {
        assert!(LuaError::msg("boom").is_protectable());
        assert!(!LuaError::Limit { max: 50 }.is_protectable());
        assert!(!LuaError::StringLimit { max: 100 }.is_protectable());
        assert!(!LuaError::Orphaned.is_protectable());
        assert!(!LuaError::Internal("bad".into()).is_protectable());
    }

    #[test]
    fn test_limit_message_carries_max() {
        let e = LuaError::Limit { max: 50 };
        assert!(e.message().contains("50"));
    }

    #[test]
    fn test_script_value_roundtrip() {
        let e = LuaError::raise(Value::Integer(7));
        assert!(matches!(e.to_value(), Value::Integer(7)));
    }

    #[test]
    fn test_position_attaches_once() {
        let e = LuaError::msg("boom").positioned(|| "chunk:3".into());
        assert_eq!(e.message(), "chunk:3: boom");
        let e = e.positioned(|| "other:9".into());
        assert_eq!(e.message(), "chunk:3: boom");
    }

    #[test]
    fn test_position_skips_limit_errors() {
        let e = LuaError::Limit { max: 10 }.positioned(|| "chunk:1".into());
        assert!(matches!(e, LuaError::Limit { max: 10 }));
    }
}
