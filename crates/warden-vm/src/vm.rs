//! Interpreter state: register stack, frames, open upvalues and the
//! per-context budget binding.

use crate::callinfo::CallInfo;
use crate::coerce;
use crate::compare;
use crate::dispatch;
use crate::globals::Globals;
use crate::metamethod::{self, MM_CALL, MM_INDEX, MM_NEWINDEX, MM_TOSTRING};
use crate::thread as sched;
use std::sync::Arc;
use warden_core::error::{LuaError, LuaResult};
use warden_core::limit::InstructionLimit;
use warden_core::native::NativeCallScope;
use warden_core::string::LuaStr;
use warden_core::table::TableRef;
use warden_core::thread::ThreadState;
use warden_core::value::{Closure, Function, ThreadRef, Upvalue, UpvalueRef, Value};

/// Deepest allowed call nesting.
const MAX_CALL_DEPTH: usize = 200;

/// `__index`/`__newindex` chains longer than this are treated as loops.
const MAX_TAG_LOOP: usize = 100;

pub struct Vm {
    pub globals: Arc<Globals>,
    pub stack: Vec<Value>,
    pub frames: Vec<CallInfo>,
    /// Open upvalue cells keyed by absolute stack index.
    pub open_upvals: Vec<(usize, UpvalueRef)>,
    /// Budget of this execution context; None only for an unlimited main
    /// caller.
    pub limit: Option<Arc<InstructionLimit>>,
    /// Worker handoff state when executing inside a coroutine.
    pub worker: Option<Arc<ThreadState>>,
    /// One past the last meaningful stack slot (multret tracking).
    pub stack_top: usize,
}

impl Vm {
    pub fn new(
        globals: Arc<Globals>,
        limit: Option<Arc<InstructionLimit>>,
        worker: Option<Arc<ThreadState>>,
    ) -> Self {
        Vm {
            globals,
            stack: vec![Value::Nil; 64],
            frames: Vec::new(),
            open_upvals: Vec::new(),
            limit,
            worker,
            stack_top: 0,
        }
    }

    pub fn ensure_stack(&mut self, needed: usize) {
        if needed > self.stack.len() {
            self.stack.resize(needed.next_power_of_two(), Value::Nil);
        }
    }

    // ---- Budget ----

    /// Charge `n` instructions. Main-thread exhaustion raises `Limit`; a
    /// worker yields Nil cooperatively and retries after every resume, so the
    /// host can reset the counter between ticks.
    pub fn charge(&mut self, n: u64) -> LuaResult<()> {
        let Some(limit) = self.limit.clone() else {
            if self.worker.is_some() {
                return Err(LuaError::Internal(
                    "worker reached the interpreter without an installed instruction limit".into(),
                ));
            }
            return Ok(());
        };
        loop {
            match limit.try_charge(n) {
                Ok(()) => return Ok(()),
                Err(max) => match self.worker.clone() {
                    Some(state) => {
                        state.lua_yield(vec![Value::Nil])?;
                    }
                    None => return Err(LuaError::Limit { max }),
                },
            }
        }
    }

    pub fn check_string_len(&self, len: usize) -> LuaResult<()> {
        if let Some(limit) = &self.limit {
            limit.check_string(len).map_err(|max| LuaError::StringLimit { max })?;
        }
        Ok(())
    }

    // ---- Calls ----

    /// Call any callable value and run it to completion.
    pub fn call_value(&mut self, func: &Value, args: &[Value]) -> LuaResult<Vec<Value>> {
        match func {
            Value::Function(Function::Lua(closure)) => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(LuaError::msg("stack overflow"));
                }
                let entry_depth = self.frames.len();
                self.push_entry_frame(closure.clone(), args);
                match dispatch::execute(self, entry_depth) {
                    Ok(vals) => Ok(vals),
                    Err(e) => {
                        self.unwind_to(entry_depth);
                        Err(e)
                    }
                }
            }
            Value::Function(Function::Native(native)) => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(LuaError::msg("stack overflow"));
                }
                native.invoke(self, args)
            }
            other => match metamethod::get_metamethod(other, MM_CALL) {
                Some(mm) => {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(other.clone());
                    full.extend_from_slice(args);
                    self.call_value(&mm, &full)
                }
                None => Err(LuaError::msg(format!(
                    "attempt to call a {} value",
                    other.type_name()
                ))),
            },
        }
    }

    /// Set up a frame for an outermost (host- or native-initiated) call. The
    /// function value is copied above the current top so recursive entries
    /// never clobber live registers.
    fn push_entry_frame(&mut self, closure: Arc<Closure>, args: &[Value]) {
        let func_idx = self.stack_top;
        eprintln!("DEBUG push_entry_frame func_idx={} frames_len={}", func_idx, self.frames.len());
        let base = func_idx + 1;
        let proto = closure.proto.clone();
        let max_stack = proto.max_stack_size as usize;
        self.ensure_stack(base + max_stack.max(args.len()) + 1);
        self.stack[func_idx] = Value::Function(Function::Lua(closure.clone()));
        for (i, a) in args.iter().enumerate() {
            self.stack[base + i] = a.clone();
        }
        let nparams = proto.num_params as usize;
        let varargs = if proto.is_vararg && args.len() > nparams {
            args[nparams..].to_vec()
        } else {
            Vec::new()
        };
        for i in nparams..max_stack {
            self.stack[base + i] = Value::Nil;
        }
        self.stack_top = base + max_stack;
        let mut ci = CallInfo::new(closure, base, func_idx);
        ci.varargs = varargs;
        self.frames.push(ci);
    }

    /// Pop frames above `depth`, closing their upvalues (error unwinding).
    pub fn unwind_to(&mut self, depth: usize) {
        while self.frames.len() > depth {
            let frame = self.frames.pop().unwrap();
            self.close_upvalues(frame.base);
            self.stack_top = frame.func_idx;
        }
    }

    // ---- Upvalues ----

    pub fn read_upvalue(&self, cell: &UpvalueRef) -> Value {
        match &*cell.lock() {
            Upvalue::Open(idx) => self.stack.get(*idx).cloned().unwrap_or(Value::Nil),
            Upvalue::Closed(v) => v.clone(),
        }
    }

    pub fn write_upvalue(&mut self, cell: &UpvalueRef, value: Value) {
        let open_at = {
            let mut guard = cell.lock();
            match &mut *guard {
                Upvalue::Open(idx) => Some(*idx),
                Upvalue::Closed(slot) => {
                    *slot = value;
                    return;
                }
            }
        };
        if let Some(idx) = open_at {
            self.ensure_stack(idx + 1);
            self.stack[idx] = value;
        }
    }

    pub fn find_or_create_open_upval(&mut self, stack_idx: usize) -> UpvalueRef {
        for (idx, cell) in &self.open_upvals {
            if *idx == stack_idx {
                return cell.clone();
            }
        }
        let cell: UpvalueRef = Arc::new(parking_lot::Mutex::new(Upvalue::Open(stack_idx)));
        self.open_upvals.push((stack_idx, cell.clone()));
        cell
    }

    /// Close every open upvalue at or above `level`: copy the live stack
    /// value into the cell and sever the stack link.
    pub fn close_upvalues(&mut self, level: usize) {
        let mut i = 0;
        while i < self.open_upvals.len() {
            let (stack_idx, cell) = self.open_upvals[i].clone();
            if stack_idx >= level {
                let value = self.stack.get(stack_idx).cloned().unwrap_or(Value::Nil);
                *cell.lock() = Upvalue::Closed(value);
                self.open_upvals.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    // ---- Indexing with metamethods ----

    pub fn index_value(&mut self, obj: &Value, key: &Value) -> LuaResult<Value> {
        let mut target = obj.clone();
        for _ in 0..MAX_TAG_LOOP {
            if let Value::Table(t) = &target {
                let raw = t.get(key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                match metamethod::get_metamethod(&target, MM_INDEX) {
                    None => return Ok(Value::Nil),
                    Some(Value::Function(f)) => {
                        let r = self
                            .call_value(&Value::Function(f), &[target.clone(), key.clone()])?;
                        return Ok(r.into_iter().next().unwrap_or(Value::Nil));
                    }
                    Some(next) => {
                        target = next;
                        continue;
                    }
                }
            }
            match metamethod::get_metamethod(&target, MM_INDEX) {
                Some(Value::Function(f)) => {
                    let r =
                        self.call_value(&Value::Function(f), &[target.clone(), key.clone()])?;
                    return Ok(r.into_iter().next().unwrap_or(Value::Nil));
                }
                Some(next) => {
                    target = next;
                    continue;
                }
                None => {
                    return Err(LuaError::msg(format!(
                        "attempt to index a {} value",
                        target.type_name()
                    )))
                }
            }
        }
        Err(LuaError::msg("'__index' chain too long; possible loop"))
    }

    pub fn newindex_value(&mut self, obj: &Value, key: Value, value: Value) -> LuaResult<()> {
        let mut target = obj.clone();
        for _ in 0..MAX_TAG_LOOP {
            if let Value::Table(t) = &target {
                if !t.get(&key).is_nil() {
                    return t.set(key, value);
                }
                match metamethod::get_metamethod(&target, MM_NEWINDEX) {
                    None => return t.set(key, value),
                    Some(Value::Function(f)) => {
                        self.call_value(
                            &Value::Function(f),
                            &[target.clone(), key.clone(), value.clone()],
                        )?;
                        return Ok(());
                    }
                    Some(next) => {
                        target = next;
                        continue;
                    }
                }
            }
            match metamethod::get_metamethod(&target, MM_NEWINDEX) {
                Some(Value::Function(f)) => {
                    self.call_value(
                        &Value::Function(f),
                        &[target.clone(), key.clone(), value.clone()],
                    )?;
                    return Ok(());
                }
                Some(next) => {
                    target = next;
                    continue;
                }
                None => {
                    return Err(LuaError::msg(format!(
                        "attempt to index a {} value",
                        target.type_name()
                    )))
                }
            }
        }
        Err(LuaError::msg("'__newindex' chain too long; possible loop"))
    }

    // ---- tostring with __tostring ----

    pub fn tostring(&mut self, v: &Value) -> LuaResult<LuaStr> {
        if let Some(mm) = metamethod::get_metamethod(v, MM_TOSTRING) {
            let r = self.call_value(&mm, &[v.clone()])?;
            return match r.into_iter().next() {
                Some(Value::Str(s)) => Ok(s),
                Some(other) => Ok(coerce::tostring_basic(&other)),
                None => Ok(LuaStr::from("nil")),
            };
        }
        Ok(coerce::tostring_basic(v))
    }
}

impl NativeCallScope for Vm {
    fn call_value(&mut self, func: &Value, args: &[Value]) -> LuaResult<Vec<Value>> {
        Vm::call_value(self, func, args)
    }

    fn index(&mut self, obj: &Value, key: &Value) -> LuaResult<Value> {
        self.index_value(obj, key)
    }

    fn current_limit(&self) -> Option<Arc<InstructionLimit>> {
        self.limit.clone()
    }

    fn current_position(&self) -> Option<String> {
        self.frames.last().map(|f| {
            let pc = f.pc.saturating_sub(1);
            f.closure.proto.position(pc)
        })
    }

    fn charge(&mut self, n: u64) -> LuaResult<()> {
        Vm::charge(self, n)
    }

    fn check_string_len(&self, len: usize) -> LuaResult<()> {
        Vm::check_string_len(self, len)
    }

    fn do_yield(&mut self, vals: Vec<Value>) -> LuaResult<Vec<Value>> {
        match self.worker.clone() {
            Some(state) => state.lua_yield(vals),
            None => Err(LuaError::msg("attempt to yield from outside a coroutine")),
        }
    }

    fn console(&mut self, line: String) -> LuaResult<()> {
        loop {
            if self.globals.console_offer(line.clone()) {
                return Ok(());
            }
            match self.worker.clone() {
                Some(state) => {
                    // Back-pressure: park until the host drains a slot.
                    state.lua_yield(vec![Value::Nil])?;
                }
                None => return Err(LuaError::msg("cannot yield main thread")),
            }
        }
    }

    fn env(&self) -> TableRef {
        self.globals.env()
    }

    fn in_worker(&self) -> bool {
        self.worker.is_some()
    }

    fn current_thread(&self) -> Option<ThreadRef> {
        self.worker.as_ref().and_then(|s| s.handle())
    }

    fn resume_thread(&mut self, thread: &ThreadRef, args: Vec<Value>) -> LuaResult<Vec<Value>> {
        sched::resume(&self.globals.clone(), thread, args)
    }

    fn tostring_value(&mut self, value: &Value) -> LuaResult<LuaStr> {
        self.tostring(value)
    }

    fn metatable_of(&self, value: &Value) -> Option<TableRef> {
        metamethod::metatable_of(value)
    }

    fn lua_lt(&mut self, a: &Value, b: &Value) -> LuaResult<bool> {
        compare::lua_lt(self, a, b)
    }

    fn load_chunk(&mut self, source: &[u8], chunk_name: &str) -> LuaResult<Value> {
        self.globals
            .load(source, chunk_name, usize::MAX)
            .map_err(|e| LuaError::msg(e.to_string()))
    }

    fn traceback(&self) -> String {
        let mut out = String::from("stack traceback:");
        for frame in self.frames.iter().rev() {
            let proto = &frame.closure.proto;
            let pc = frame.pc.saturating_sub(1);
            out.push_str(&format!(
                "\n\t{}: in function <{}:{}>",
                proto.position(pc),
                proto.source,
                proto.line_defined
            ));
        }
        out
    }
}
