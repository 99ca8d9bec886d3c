//! One activation record of the interpreter.

use std::sync::Arc;
use warden_core::value::{Closure, Value};

pub struct CallInfo {
    pub closure: Arc<Closure>,
    /// First register of this frame in the shared stack.
    pub base: usize,
    /// Next instruction to fetch.
    pub pc: usize,
    /// Stack slot the function value occupied; results land here.
    pub func_idx: usize,
    /// Wanted result count; -1 means all.
    pub num_results: i32,
    /// Trailing arguments of a vararg function.
    pub varargs: Vec<Value>,
    /// Consecutive tail calls through this frame (runaway guard).
    pub tail_calls: u32,
}

impl CallInfo {
    pub fn new(closure: Arc<Closure>, base: usize, func_idx: usize) -> Self {
        CallInfo {
            closure,
            base,
            pc: 0,
            func_idx,
            num_results: -1,
            varargs: Vec::new(),
            tail_calls: 0,
        }
    }
}
