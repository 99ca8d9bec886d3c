//! Register VM, instruction limiter binding, coroutine scheduler and host
//! facade for the warden sandbox.

pub mod arith;
pub mod callinfo;
pub mod coerce;
pub mod compare;
pub mod dispatch;
pub mod globals;
pub mod metamethod;
pub mod thread;
pub mod vm;

pub use globals::{ChunkCompiler, Globals, LoadError, CONSOLE_CAPACITY};
pub use vm::Vm;
