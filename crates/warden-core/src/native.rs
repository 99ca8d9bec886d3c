/// The seam between builtins and the interpreter.
///
/// Registered callables receive a `NativeCallScope` instead of raw VM
/// internals: it re-enters the interpreter for call-backs (`pcall`,
/// comparators, metamethods), charges the instruction budget, and reaches the
/// console queue and coroutine machinery. The VM crate provides the only real
/// implementation; keeping the trait here lets the stdlib depend on the core
/// crate alone.
use crate::error::LuaResult;
use crate::limit::InstructionLimit;
use crate::string::LuaStr;
use crate::table::TableRef;
use crate::value::{ThreadRef, Value};
use std::sync::Arc;

pub trait NativeCallScope {
    /// Call a Lua or native function value with `args`.
    fn call_value(&mut self, func: &Value, args: &[Value]) -> LuaResult<Vec<Value>>;

    /// `obj[key]` honouring `__index` chains.
    fn index(&mut self, obj: &Value, key: &Value) -> LuaResult<Value>;

    /// The budget record of this execution context, if one is installed.
    fn current_limit(&self) -> Option<Arc<InstructionLimit>>;

    /// `source:line` of the innermost executing chunk, for `error` levels.
    fn current_position(&self) -> Option<String>;

    /// Charge `n` instructions against the current budget. In a worker this
    /// may suspend cooperatively instead of failing.
    fn charge(&mut self, n: u64) -> LuaResult<()>;

    /// Fail if a string of `len` bytes would exceed the configured cap.
    fn check_string_len(&self, len: usize) -> LuaResult<()>;

    /// Yield `vals` to the resumer; errors on the main thread.
    fn do_yield(&mut self, vals: Vec<Value>) -> LuaResult<Vec<Value>>;

    /// Enqueue one line on the bounded host console queue; yields under
    /// back-pressure in a worker.
    fn console(&mut self, line: String) -> LuaResult<()>;

    /// The globals table of the running chunk.
    fn env(&self) -> TableRef;

    /// True when running inside a coroutine worker.
    fn in_worker(&self) -> bool;

    /// The worker being executed, if any.
    fn current_thread(&self) -> Option<ThreadRef>;

    /// Resume a worker; returns the `(ok, values…)` tuple shape of
    /// `coroutine.resume`, or `[Nil]` for a worker parked at its limit.
    fn resume_thread(&mut self, thread: &ThreadRef, args: Vec<Value>) -> LuaResult<Vec<Value>>;

    /// `tostring` semantics including the `__tostring` metamethod.
    fn tostring_value(&mut self, value: &Value) -> LuaResult<LuaStr>;

    /// Metatable of any value, including the per-class registry for
    /// non-table values.
    fn metatable_of(&self, value: &Value) -> Option<TableRef>;

    /// Lua `<` including metamethods, for comparator fallbacks.
    fn lua_lt(&mut self, a: &Value, b: &Value) -> LuaResult<bool>;

    /// Compile a source chunk through the installed compiler and bind it to
    /// the current globals. Source text only; there is no bytecode path.
    fn load_chunk(&mut self, source: &[u8], chunk_name: &str) -> LuaResult<Value>;

    /// Call-stack description for diagnostics.
    fn traceback(&self) -> String;
}
