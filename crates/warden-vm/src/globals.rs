//! The host facade: globals table, compiler slot, console queue, limits.

use crate::thread as sched;
use crate::vm::Vm;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use warden_core::error::LuaResult;
use warden_core::limit::InstructionLimit;
use warden_core::memory;
use warden_core::proto::Prototype;
use warden_core::table::{Table, TableRef};
use warden_core::thread::LuaThread;
use warden_core::value::{Closure, NativeFunction, NativeResult, ThreadRef, Upvalue, Value};

/// Capacity of the bounded host console queue.
pub const CONSOLE_CAPACITY: usize = 32;

/// Source-to-prototype compiler, installed by the embedder. Source text is
/// the only input shape; there is no precompiled-chunk path by policy.
pub trait ChunkCompiler: Send + Sync {
    fn compile(&self, source: &[u8], chunk_name: &str) -> Result<Arc<Prototype>, String>;
}

/// Errors surfaced by `Globals::load`.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("script too long ({len}/{limit})")]
    ScriptTooLong { len: usize, limit: usize },
    #[error("{0}")]
    Compile(String),
    #[error("no compiler installed")]
    NoCompiler,
}

/// Top-level environment shared by every chunk and worker the host creates
/// from it. Owns the running-thread slot, the installed compiler, the
/// bounded console queue and the main caller's instruction limit.
pub struct Globals {
    env: TableRef,
    compiler: RwLock<Option<Box<dyn ChunkCompiler>>>,
    console: Mutex<VecDeque<String>>,
    main_limit: Mutex<Option<Arc<InstructionLimit>>>,
    running: Mutex<Option<ThreadRef>>,
}

impl Globals {
    pub fn new() -> Arc<Globals> {
        Arc::new(Globals {
            env: TableRef::new(Table::new(0, 32)),
            compiler: RwLock::new(None),
            console: Mutex::new(VecDeque::with_capacity(CONSOLE_CAPACITY)),
            main_limit: Mutex::new(None),
            running: Mutex::new(None),
        })
    }

    /// The globals table (`_ENV` of every loaded chunk).
    pub fn env(&self) -> TableRef {
        self.env.clone()
    }

    pub fn set_compiler(&self, compiler: Box<dyn ChunkCompiler>) {
        *self.compiler.write() = Some(compiler);
    }

    /// Validate and compile `source`, producing a closure bound to this
    /// environment. `max_len` is the source-text cap.
    pub fn load(&self, source: &[u8], chunk_name: &str, max_len: usize) -> Result<Value, LoadError> {
        if source.len() > max_len {
            return Err(LoadError::ScriptTooLong {
                len: source.len(),
                limit: max_len,
            });
        }
        debug!(target: "warden::load", chunk = chunk_name, len = source.len(), "compiling chunk");
        let compiler = self.compiler.read();
        let compiler = compiler.as_ref().ok_or(LoadError::NoCompiler)?;
        let proto = compiler
            .compile(source, chunk_name)
            .map_err(LoadError::Compile)?;
        Ok(self.closure_of(proto))
    }

    /// Bind a prototype to this environment: the chunk's single upvalue is a
    /// closed cell holding the globals table.
    pub fn closure_of(&self, proto: Arc<Prototype>) -> Value {
        let env_cell = Arc::new(parking_lot::Mutex::new(Upvalue::Closed(Value::Table(
            self.env.clone(),
        ))));
        Value::closure(Closure {
            proto,
            upvalues: vec![env_cell],
            globals: self.env.clone(),
        })
    }

    /// Synchronous invocation on the caller's thread, charged against the
    /// main limit (unlimited when none is installed).
    pub fn call(self: &Arc<Self>, func: &Value, args: &[Value]) -> LuaResult<Vec<Value>> {
        let limit = self.main_limit.lock().clone();
        let mut vm = Vm::new(self.clone(), limit, None);
        vm.call_value(func, args)
    }

    /// Register a host callable under a global name. The host charges the
    /// budget itself (through the scope) when the operation is expensive.
    pub fn register<F>(&self, name: &str, func: F)
    where
        F: Fn(&mut dyn warden_core::native::NativeCallScope, &[Value]) -> NativeResult
            + Send
            + Sync
            + 'static,
    {
        self.env
            .set_str(name, Value::native(NativeFunction::new(name, func)));
    }

    // ---- Limits ----

    /// Install (or reconfigure) the main caller's instruction limit.
    pub fn install_limit(&self, max_instructions: u64, max_string_size: usize) -> Arc<InstructionLimit> {
        let mut slot = self.main_limit.lock();
        match &*slot {
            Some(existing) => {
                existing.configure(max_instructions, max_string_size);
                existing.clone()
            }
            None => {
                let fresh = InstructionLimit::new(max_instructions, max_string_size);
                *slot = Some(fresh.clone());
                fresh
            }
        }
    }

    pub fn limit(&self) -> Option<Arc<InstructionLimit>> {
        self.main_limit.lock().clone()
    }

    pub fn reset_limit(&self) {
        if let Some(limit) = &*self.main_limit.lock() {
            limit.reset();
        }
    }

    // ---- Workers ----

    /// Package a closure as a coroutine worker. The OS thread spawns on
    /// first resume.
    pub fn spawn(&self, func: Value) -> ThreadRef {
        LuaThread::new(func)
    }

    pub fn resume(self: &Arc<Self>, thread: &ThreadRef, args: Vec<Value>) -> LuaResult<Vec<Value>> {
        sched::resume(self, thread, args)
    }

    pub fn running_thread(&self) -> Option<ThreadRef> {
        self.running.lock().clone()
    }

    pub(crate) fn swap_running(&self, next: Option<ThreadRef>) -> Option<ThreadRef> {
        std::mem::replace(&mut *self.running.lock(), next)
    }

    // ---- Memory ----

    /// Bytes reachable from the globals table. Advisory; the host decides
    /// what to do with the number.
    pub fn used_memory(&self) -> usize {
        memory::reachable_bytes(&Value::Table(self.env.clone()))
    }

    // ---- Console queue ----

    /// Non-blocking enqueue; false when the queue is full (the script side
    /// then yields and retries).
    pub(crate) fn console_offer(&self, line: String) -> bool {
        let mut q = self.console.lock();
        if q.len() >= CONSOLE_CAPACITY {
            return false;
        }
        q.push_back(line);
        true
    }

    /// Non-blocking host-side dequeue.
    pub fn try_dequeue(&self) -> Option<String> {
        self.console.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_capacity() {
        let g = Globals::new();
        for i in 0..CONSOLE_CAPACITY {
            assert!(g.console_offer(format!("line {i}")));
        }
        assert!(!g.console_offer("overflow".into()));
        assert_eq!(g.try_dequeue().as_deref(), Some("line 0"));
        assert!(g.console_offer("fits again".into()));
    }

    #[test]
    fn test_load_respects_source_cap() {
        let g = Globals::new();
        let src = vec![b'x'; 100];
        match g.load(&src, "chunk", 99) {
            Err(LoadError::ScriptTooLong { len: 100, limit: 99 }) => {}
            other => panic!("expected ScriptTooLong, got {other:?}"),
        }
    }

    #[test]
    fn test_load_without_compiler() {
        let g = Globals::new();
        assert!(matches!(
            g.load(b"return 1", "chunk", 1000),
            Err(LoadError::NoCompiler)
        ));
    }

    #[test]
    fn test_install_limit_upsert() {
        let g = Globals::new();
        let first = g.install_limit(10, 100);
        first.try_charge(3).unwrap();
        let second = g.install_limit(50, 200);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.current(), 3);
        assert_eq!(second.max(), 50);
    }

    #[test]
    fn test_register_appears_in_env() {
        let g = Globals::new();
        g.register("probe", |_scope, _args| Ok(vec![Value::Integer(1)]));
        assert!(g.env().get_str("probe").is_function());
    }
}
