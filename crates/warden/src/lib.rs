//! warden — a hardened, embeddable Lua 5.2 interpreter for untrusted
//! scripts.
//!
//! Every invocation is bounded by a per-context instruction budget, a
//! string-size cap and a source-length cap; reachable memory is measurable on
//! demand; long-running scripts become coroutine workers that suspend at
//! their budget and resume after a host reset. The built-in surface is
//! curated: no filesystem, no process access, no bytecode loading, no host
//! object bridging beyond explicitly registered callables.
//!
//! ```no_run
//! use warden::Sandbox;
//!
//! let sandbox = Sandbox::new();
//! sandbox.install_limit(10_000, 4096);
//! let chunk = sandbox.load(b"return 1 + 2", "demo").unwrap();
//! let results = sandbox.call(&chunk, &[]).unwrap();
//! assert_eq!(results[0].as_integer(), Some(3));
//! ```

use std::sync::Arc;
use warden_core::error::LuaResult;
use warden_core::limit::InstructionLimit;
use warden_core::proto::Prototype;
use warden_core::value::{ThreadRef, Value};
use warden_vm::{ChunkCompiler, Globals, LoadError};

pub use warden_core::error::LuaError;
pub use warden_core::native::NativeCallScope;
pub use warden_core::value;
pub use warden_vm::globals;

/// Default cap on accepted source text.
pub const DEFAULT_MAX_SOURCE_LEN: usize = 256 * 1024;

/// The bundled source-text compiler. The VM consumes compilers only through
/// the `ChunkCompiler` trait, so embedders can substitute their own.
pub struct BundledCompiler;

impl ChunkCompiler for BundledCompiler {
    fn compile(&self, source: &[u8], chunk_name: &str) -> Result<Arc<Prototype>, String> {
        warden_compiler::compile(source, chunk_name).map_err(|e| e.to_string())
    }
}

/// A ready-to-use sandbox: globals with the curated standard libraries and
/// the bundled compiler installed.
pub struct Sandbox {
    globals: Arc<Globals>,
    max_source_len: usize,
}

impl Sandbox {
    pub fn new() -> Sandbox {
        Self::with_max_source_len(DEFAULT_MAX_SOURCE_LEN)
    }

    pub fn with_max_source_len(max_source_len: usize) -> Sandbox {
        let globals = Globals::new();
        warden_stdlib::install(&globals);
        globals.set_compiler(Box::new(BundledCompiler));
        Sandbox {
            globals,
            max_source_len,
        }
    }

    pub fn globals(&self) -> &Arc<Globals> {
        &self.globals
    }

    /// Compile a chunk under the source-length cap.
    pub fn load(&self, source: &[u8], chunk_name: &str) -> Result<Value, LoadError> {
        self.globals.load(source, chunk_name, self.max_source_len)
    }

    /// Run a callable synchronously on this thread under the main limit.
    pub fn call(&self, func: &Value, args: &[Value]) -> LuaResult<Vec<Value>> {
        self.globals.call(func, args)
    }

    /// Load-and-run convenience for scripts and tests.
    pub fn eval(&self, source: &str) -> LuaResult<Vec<Value>> {
        let chunk = self
            .load(source.as_bytes(), source_name(source))
            .map_err(|e| LuaError::msg(e.to_string()))?;
        self.call(&chunk, &[])
    }

    /// Install (or reconfigure) the main caller's instruction budget.
    pub fn install_limit(&self, max_instructions: u64, max_string_size: usize) -> Arc<InstructionLimit> {
        self.globals.install_limit(max_instructions, max_string_size)
    }

    pub fn reset_limit(&self) {
        self.globals.reset_limit();
    }

    pub fn limit(&self) -> Option<Arc<InstructionLimit>> {
        self.globals.limit()
    }

    /// Package a closure as a schedulable worker.
    pub fn spawn(&self, func: Value) -> ThreadRef {
        self.globals.spawn(func)
    }

    /// Install (or reconfigure) a worker's budget; required before its first
    /// resume.
    pub fn install_worker_limit(
        &self,
        worker: &ThreadRef,
        max_instructions: u64,
        max_string_size: usize,
    ) -> Arc<InstructionLimit> {
        worker.install_limit(max_instructions, max_string_size)
    }

    pub fn reset_worker_limit(&self, worker: &ThreadRef) {
        if let Some(limit) = worker.limit() {
            limit.reset();
        }
    }

    /// Resume a worker. `[true, …]` on yield/return, `[false, msg]` on
    /// death, `[nil]` when the worker is already at its limit.
    pub fn resume(&self, worker: &ThreadRef, args: Vec<Value>) -> LuaResult<Vec<Value>> {
        self.globals.resume(worker, args)
    }

    /// Bytes reachable from the globals table.
    pub fn used_memory(&self) -> usize {
        self.globals.used_memory()
    }

    /// Drain one line from the bounded console queue.
    pub fn try_dequeue(&self) -> Option<String> {
        self.globals.try_dequeue()
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Short chunk name for ad-hoc sources.
fn source_name(source: &str) -> &str {
    if source.len() <= 24 {
        source
    } else {
        "=(eval)"
    }
}
