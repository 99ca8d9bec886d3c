//! Main bytecode dispatch loop.
//!
//! One instruction is charged against the context's budget before every
//! fetch; in a worker the charge suspends cooperatively instead of failing.
//! Errors raised directly by an instruction are prefixed with `source:line`
//! from the prototype's line table; errors propagating out of nested frames
//! arrive already positioned and pass through untouched.

use crate::arith::{self, ArithOp, ArithResult};
use crate::callinfo::CallInfo;
use crate::coerce;
use crate::compare;
use crate::metamethod::{self, MM_CONCAT, MM_LEN, MM_UNM};
use crate::vm::Vm;
use std::sync::Arc;
use warden_core::error::{LuaError, LuaResult};
use warden_core::opcode::{fb2int, Instruction, OpCode, FIELDS_PER_FLUSH};
use warden_core::proto::Prototype;
use warden_core::string::LuaStr;
use warden_core::table::{Table, TableRef};
use warden_core::value::{value_of_i64, Closure, Function, Value};

/// Deepest allowed call nesting, shared with `Vm::call_value`.
const MAX_CALL_DEPTH: usize = 200;

/// Consecutive frame-reusing tail calls before the runaway guard trips.
const MAX_TAIL_CALLS: u32 = 1_000_000;

/// Run until the frame at `entry_depth` returns, yielding its results.
pub fn execute(vm: &mut Vm, entry_depth: usize) -> LuaResult<Vec<Value>> {
    loop {
        vm.charge(1)?;

        let ci_idx = vm.frames.len() - 1;
        let base = vm.frames[ci_idx].base;
        let pc = vm.frames[ci_idx].pc;
        let closure = vm.frames[ci_idx].closure.clone();
        let proto = &closure.proto;

        if pc >= proto.code.len() {
            return Err(LuaError::Internal(format!(
                "pc {pc} out of range in {}",
                proto.source
            )));
        }
        let inst = proto.code[pc];
        vm.frames[ci_idx].pc = pc + 1;
        let op = inst
            .opcode()
            .ok_or_else(|| LuaError::Internal(format!("illegal opcode at {}", proto.position(pc))))?;
        let a = inst.a() as usize;

        // Attach this instruction's source position to fresh errors.
        macro_rules! positioned {
            ($r:expr) => {
                $r.map_err(|e: LuaError| e.positioned(|| proto.position(pc)))?
            };
        }

        match op {
            OpCode::Move => {
                let b = inst.b() as usize;
                vm.stack[base + a] = vm.stack[base + b].clone();
            }

            OpCode::LoadK => {
                let bx = inst.bx() as usize;
                vm.stack[base + a] = proto.constants[bx].to_value();
            }

            OpCode::LoadKX => {
                let next_pc = vm.frames[ci_idx].pc;
                let extra = proto.code[next_pc];
                vm.frames[ci_idx].pc += 1;
                vm.stack[base + a] = proto.constants[extra.ax_field() as usize].to_value();
            }

            OpCode::LoadBool => {
                vm.stack[base + a] = Value::Boolean(inst.b() != 0);
                if inst.c() != 0 {
                    vm.frames[ci_idx].pc += 1;
                }
            }

            OpCode::LoadNil => {
                let b = inst.b() as usize;
                for i in 0..=b {
                    vm.stack[base + a + i] = Value::Nil;
                }
            }

            OpCode::GetUpval => {
                let b = inst.b() as usize;
                let cell = closure.upvalues[b].clone();
                vm.stack[base + a] = vm.read_upvalue(&cell);
            }

            OpCode::SetUpval => {
                let b = inst.b() as usize;
                let cell = closure.upvalues[b].clone();
                let value = vm.stack[base + a].clone();
                vm.write_upvalue(&cell, value);
            }

            OpCode::GetTabUp => {
                let b = inst.b() as usize;
                let cell = closure.upvalues[b].clone();
                let obj = vm.read_upvalue(&cell);
                let key = rk(vm, proto, base, inst.c());
                vm.stack[base + a] = positioned!(vm.index_value(&obj, &key));
            }

            OpCode::GetTable => {
                let b = inst.b() as usize;
                let obj = vm.stack[base + b].clone();
                let key = rk(vm, proto, base, inst.c());
                vm.stack[base + a] = positioned!(vm.index_value(&obj, &key));
            }

            OpCode::SetTabUp => {
                let cell = closure.upvalues[a].clone();
                let obj = vm.read_upvalue(&cell);
                let key = rk(vm, proto, base, inst.b());
                let value = rk(vm, proto, base, inst.c());
                positioned!(vm.newindex_value(&obj, key, value));
            }

            OpCode::SetTable => {
                let obj = vm.stack[base + a].clone();
                let key = rk(vm, proto, base, inst.b());
                let value = rk(vm, proto, base, inst.c());
                positioned!(vm.newindex_value(&obj, key, value));
            }

            OpCode::NewTable => {
                let narray = fb2int(inst.b()) as usize;
                let nhash = fb2int(inst.c()) as usize;
                vm.stack[base + a] = Value::Table(TableRef::new(Table::new(narray, nhash)));
            }

            OpCode::Self_ => {
                let b = inst.b() as usize;
                let obj = vm.stack[base + b].clone();
                let key = rk(vm, proto, base, inst.c());
                vm.stack[base + a + 1] = obj.clone();
                vm.stack[base + a] = positioned!(vm.index_value(&obj, &key));
            }

            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                let bv = rk(vm, proto, base, inst.b());
                let cv = rk(vm, proto, base, inst.c());
                let aop = match op {
                    OpCode::Add => ArithOp::Add,
                    OpCode::Sub => ArithOp::Sub,
                    OpCode::Mul => ArithOp::Mul,
                    OpCode::Div => ArithOp::Div,
                    OpCode::Mod => ArithOp::Mod,
                    _ => ArithOp::Pow,
                };
                vm.stack[base + a] = positioned!(do_arith(vm, aop, &bv, &cv));
            }

            OpCode::Unm => {
                let b = inst.b() as usize;
                let v = vm.stack[base + b].clone();
                vm.stack[base + a] = positioned!(do_unm(vm, &v));
            }

            OpCode::Not => {
                let b = inst.b() as usize;
                vm.stack[base + a] = Value::Boolean(vm.stack[base + b].is_falsy());
            }

            OpCode::Len => {
                let b = inst.b() as usize;
                let v = vm.stack[base + b].clone();
                vm.stack[base + a] = positioned!(do_len(vm, &v));
            }

            OpCode::Concat => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                // Right-to-left pairwise folding: an intermediate over the
                // string cap fails exactly where sequential two-argument
                // concatenation would.
                let mut acc = vm.stack[base + c].clone();
                let mut i = c;
                while i > b {
                    i -= 1;
                    let left = vm.stack[base + i].clone();
                    acc = positioned!(concat_pair(vm, left, acc));
                }
                vm.stack[base + a] = acc;
            }

            OpCode::Jmp => {
                let sbx = inst.sbx();
                let new_pc = vm.frames[ci_idx].pc as i64 + sbx as i64;
                vm.frames[ci_idx].pc = new_pc as usize;
                if a > 0 {
                    vm.close_upvalues(base + a - 1);
                }
            }

            OpCode::Eq => {
                let bv = rk(vm, proto, base, inst.b());
                let cv = rk(vm, proto, base, inst.c());
                let eq = positioned!(compare::lua_eq(vm, &bv, &cv));
                if eq != (a != 0) {
                    vm.frames[ci_idx].pc += 1;
                }
            }

            OpCode::Lt => {
                let bv = rk(vm, proto, base, inst.b());
                let cv = rk(vm, proto, base, inst.c());
                let lt = positioned!(compare::lua_lt(vm, &bv, &cv));
                if lt != (a != 0) {
                    vm.frames[ci_idx].pc += 1;
                }
            }

            OpCode::Le => {
                let bv = rk(vm, proto, base, inst.b());
                let cv = rk(vm, proto, base, inst.c());
                let le = positioned!(compare::lua_le(vm, &bv, &cv));
                if le != (a != 0) {
                    vm.frames[ci_idx].pc += 1;
                }
            }

            OpCode::Test => {
                let c = inst.c();
                if vm.stack[base + a].is_truthy() != (c != 0) {
                    vm.frames[ci_idx].pc += 1;
                }
            }

            OpCode::TestSet => {
                let b = inst.b() as usize;
                let c = inst.c();
                let bv = vm.stack[base + b].clone();
                if bv.is_truthy() != (c != 0) {
                    vm.frames[ci_idx].pc += 1;
                } else {
                    vm.stack[base + a] = bv;
                }
            }

            OpCode::Call => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                let func_pos = base + a;
                let nargs = if b == 0 {
                    vm.stack_top.saturating_sub(func_pos + 1)
                } else {
                    b - 1
                };
                let num_results = c as i32 - 1;
                let func = vm.stack[func_pos].clone();
                if let Value::Function(Function::Lua(callee)) = &func {
                    if vm.frames.len() >= MAX_CALL_DEPTH {
                        return Err(LuaError::msg("stack overflow")
                            .positioned(|| proto.position(pc)));
                    }
                    push_call_frame(vm, callee.clone(), func_pos, nargs, num_results);
                } else {
                    let args: Vec<Value> = (0..nargs)
                        .map(|i| vm.stack[func_pos + 1 + i].clone())
                        .collect();
                    let results = positioned!(vm.call_value(&func, &args));
                    place_results(vm, func_pos, num_results, results);
                }
            }

            OpCode::TailCall => {
                let b = inst.b() as usize;
                let func_pos = base + a;
                let nargs = if b == 0 {
                    vm.stack_top.saturating_sub(func_pos + 1)
                } else {
                    b - 1
                };
                let func = vm.stack[func_pos].clone();
                if let Value::Function(Function::Lua(callee)) = &func {
                    let (ret_idx, num_results, tail_calls) = {
                        let f = &vm.frames[ci_idx];
                        (f.func_idx, f.num_results, f.tail_calls)
                    };
                    if tail_calls > MAX_TAIL_CALLS {
                        return Err(LuaError::msg("stack overflow")
                            .positioned(|| proto.position(pc)));
                    }
                    vm.close_upvalues(base);
                    vm.stack[ret_idx] = func.clone();
                    for i in 0..nargs {
                        let v = vm.stack[func_pos + 1 + i].clone();
                        vm.stack[ret_idx + 1 + i] = v;
                    }
                    vm.frames.pop();
                    push_call_frame(vm, callee.clone(), ret_idx, nargs, num_results);
                    vm.frames.last_mut().unwrap().tail_calls = tail_calls + 1;
                } else {
                    let args: Vec<Value> = (0..nargs)
                        .map(|i| vm.stack[func_pos + 1 + i].clone())
                        .collect();
                    let results = positioned!(vm.call_value(&func, &args));
                    vm.close_upvalues(base);
                    let frame = vm.frames.pop().unwrap();
                    if vm.frames.len() == entry_depth {
                        vm.stack_top = frame.func_idx;
                        return Ok(results);
                    }
                    place_results(vm, frame.func_idx, frame.num_results, results);
                }
            }

            OpCode::Return => {
                let b = inst.b() as usize;
                let results: Vec<Value> = if b == 0 {
                    vm.stack[base + a..vm.stack_top.max(base + a)].to_vec()
                } else {
                    vm.stack[base + a..base + a + b - 1].to_vec()
                };
                vm.close_upvalues(base);
                let frame = vm.frames.pop().unwrap();
                if vm.frames.len() == entry_depth {
                    vm.stack_top = frame.func_idx;
                    return Ok(results);
                }
                place_results(vm, frame.func_idx, frame.num_results, results);
            }

            OpCode::ForPrep => {
                let init = positioned!(for_number(
                    &vm.stack[base + a],
                    "'for' initial value must be a number"
                ));
                let limit = positioned!(for_number(
                    &vm.stack[base + a + 1],
                    "'for' limit must be a number"
                ));
                let step = positioned!(for_number(
                    &vm.stack[base + a + 2],
                    "'for' step must be a number"
                ));
                vm.stack[base + a] = positioned!(do_arith(vm, ArithOp::Sub, &init, &step));
                vm.stack[base + a + 1] = limit;
                vm.stack[base + a + 2] = step;
                let sbx = inst.sbx();
                let new_pc = vm.frames[ci_idx].pc as i64 + sbx as i64;
                vm.frames[ci_idx].pc = new_pc as usize;
            }

            OpCode::ForLoop => {
                let step = vm.stack[base + a + 2].clone();
                let counter = vm.stack[base + a].clone();
                let idx = positioned!(do_arith(vm, ArithOp::Add, &counter, &step));
                let limit = vm.stack[base + a + 1].clone();
                let step_n = step.as_number().unwrap_or(0.0);
                let idx_n = idx.as_number().unwrap_or(f64::NAN);
                let limit_n = limit.as_number().unwrap_or(f64::NAN);
                let cont = if step_n > 0.0 {
                    idx_n <= limit_n
                } else {
                    idx_n >= limit_n
                };
                if cont {
                    let sbx = inst.sbx();
                    let new_pc = vm.frames[ci_idx].pc as i64 + sbx as i64;
                    vm.frames[ci_idx].pc = new_pc as usize;
                    vm.stack[base + a] = idx.clone();
                    vm.stack[base + a + 3] = idx;
                }
            }

            OpCode::TForCall => {
                let c = inst.c() as usize;
                let f = vm.stack[base + a].clone();
                let args = [
                    vm.stack[base + a + 1].clone(),
                    vm.stack[base + a + 2].clone(),
                ];
                let results = positioned!(vm.call_value(&f, &args));
                vm.ensure_stack(base + a + 3 + c);
                for i in 0..c {
                    vm.stack[base + a + 3 + i] = results.get(i).cloned().unwrap_or(Value::Nil);
                }
            }

            OpCode::TForLoop => {
                let ctl = vm.stack[base + a + 1].clone();
                if !ctl.is_nil() {
                    vm.stack[base + a] = ctl;
                    let sbx = inst.sbx();
                    let new_pc = vm.frames[ci_idx].pc as i64 + sbx as i64;
                    vm.frames[ci_idx].pc = new_pc as usize;
                }
            }

            OpCode::SetList => {
                let b = inst.b() as usize;
                let mut c = inst.c() as usize;
                if c == 0 {
                    let next_pc = vm.frames[ci_idx].pc;
                    c = proto.code[next_pc].ax_field() as usize;
                    vm.frames[ci_idx].pc += 1;
                }
                let table = match vm.stack[base + a].clone() {
                    Value::Table(t) => t,
                    other => {
                        return Err(LuaError::Internal(format!(
                            "SETLIST on a {} value",
                            other.type_name()
                        )))
                    }
                };
                let count = if b == 0 {
                    vm.stack_top.saturating_sub(base + a + 1)
                } else {
                    b
                };
                let offset = (c - 1) * FIELDS_PER_FLUSH;
                for j in 1..=count {
                    let v = vm.stack[base + a + j].clone();
                    table.set_int((offset + j) as i64, v);
                }
            }

            OpCode::Closure => {
                let bx = inst.bx() as usize;
                let child = proto.protos[bx].clone();
                let mut upvalues = Vec::with_capacity(child.upvalues.len());
                for desc in &child.upvalues {
                    if desc.in_stack {
                        upvalues.push(vm.find_or_create_open_upval(base + desc.index as usize));
                    } else {
                        upvalues.push(closure.upvalues[desc.index as usize].clone());
                    }
                }
                vm.stack[base + a] = Value::closure(Closure {
                    proto: child,
                    upvalues,
                    globals: closure.globals.clone(),
                });
            }

            OpCode::VarArg => {
                let b = inst.b() as usize;
                let varargs = vm.frames[ci_idx].varargs.clone();
                if b == 0 {
                    vm.ensure_stack(base + a + varargs.len());
                    for (i, v) in varargs.iter().enumerate() {
                        vm.stack[base + a + i] = v.clone();
                    }
                    vm.stack_top = base + a + varargs.len();
                } else {
                    for i in 0..b - 1 {
                        vm.stack[base + a + i] = varargs.get(i).cloned().unwrap_or(Value::Nil);
                    }
                }
            }

            OpCode::ExtraArg => {
                return Err(LuaError::Internal(format!(
                    "unexecutable EXTRAARG at {}",
                    proto.position(pc)
                )));
            }
        }
    }
}

/// RK operand: the high bit selects between a register and a constant.
fn rk(vm: &Vm, proto: &Prototype, base: usize, operand: u32) -> Value {
    if Instruction::rk_is_const(operand) {
        proto.constants[Instruction::rk_index(operand)].to_value()
    } else {
        vm.stack[base + operand as usize].clone()
    }
}

/// Push an in-loop call frame above `func_pos`. Extra arguments of a vararg
/// callee are captured before the register window is cleared.
fn push_call_frame(
    vm: &mut Vm,
    closure: Arc<Closure>,
    func_pos: usize,
    nargs: usize,
    num_results: i32,
) {
    let proto = closure.proto.clone();
    let new_base = func_pos + 1;
    let nparams = proto.num_params as usize;
    let max_stack = proto.max_stack_size as usize;
    vm.ensure_stack(new_base + max_stack.max(nargs) + 1);
    let varargs = if proto.is_vararg && nargs > nparams {
        vm.stack[new_base + nparams..new_base + nargs].to_vec()
    } else {
        Vec::new()
    };
    for i in nargs..nparams {
        vm.stack[new_base + i] = Value::Nil;
    }
    for i in nparams..max_stack {
        vm.stack[new_base + i] = Value::Nil;
    }
    vm.stack_top = new_base + max_stack;
    let mut ci = CallInfo::new(closure, new_base, func_pos);
    ci.num_results = num_results;
    ci.varargs = varargs;
    vm.frames.push(ci);
}

/// Copy call results into the caller's frame at `func_idx`.
fn place_results(vm: &mut Vm, func_idx: usize, num_results: i32, results: Vec<Value>) {
    if num_results < 0 {
        vm.ensure_stack(func_idx + results.len());
        let n = results.len();
        for (i, v) in results.into_iter().enumerate() {
            vm.stack[func_idx + i] = v;
        }
        vm.stack_top = func_idx + n;
    } else {
        let n = num_results as usize;
        vm.ensure_stack(func_idx + n);
        for i in 0..n {
            vm.stack[func_idx + i] = results.get(i).cloned().unwrap_or(Value::Nil);
        }
        vm.stack_top = func_idx + n;
    }
}

/// Binary arithmetic with metamethod fallback.
pub fn do_arith(vm: &mut Vm, op: ArithOp, a: &Value, b: &Value) -> LuaResult<Value> {
    match arith::arith_op(op, a, b) {
        ArithResult::Ok(v) => Ok(v),
        ArithResult::Error(e) => Err(e),
        ArithResult::NeedMetamethod => {
            let mm = metamethod::get_metamethod(a, op.metamethod())
                .or_else(|| metamethod::get_metamethod(b, op.metamethod()));
            match mm {
                Some(f) => {
                    let r = vm.call_value(&f, &[a.clone(), b.clone()])?;
                    Ok(r.into_iter().next().unwrap_or(Value::Nil))
                }
                None => {
                    let offender = if a.is_number() { b } else { a };
                    Err(LuaError::msg(format!(
                        "attempt to perform arithmetic on a {} value",
                        offender.type_name()
                    )))
                }
            }
        }
    }
}

fn do_unm(vm: &mut Vm, v: &Value) -> LuaResult<Value> {
    match arith::arith_unm(v) {
        ArithResult::Ok(r) => Ok(r),
        ArithResult::Error(e) => Err(e),
        ArithResult::NeedMetamethod => match metamethod::get_metamethod(v, MM_UNM) {
            Some(f) => {
                let r = vm.call_value(&f, &[v.clone(), v.clone()])?;
                Ok(r.into_iter().next().unwrap_or(Value::Nil))
            }
            None => Err(LuaError::msg(format!(
                "attempt to perform arithmetic on a {} value",
                v.type_name()
            ))),
        },
    }
}

/// `#v`: byte length on strings, `__len` next, then any table border.
pub fn do_len(vm: &mut Vm, v: &Value) -> LuaResult<Value> {
    if let Value::Str(s) = v {
        return Ok(value_of_i64(s.len() as i64));
    }
    if let Some(f) = metamethod::get_metamethod(v, MM_LEN) {
        let r = vm.call_value(&f, &[v.clone()])?;
        return Ok(r.into_iter().next().unwrap_or(Value::Nil));
    }
    if let Value::Table(t) = v {
        return Ok(value_of_i64(t.length()));
    }
    Err(LuaError::msg(format!(
        "attempt to get length of a {} value",
        v.type_name()
    )))
}

/// Two-operand concatenation honouring the string-size cap.
pub fn concat_pair(vm: &mut Vm, left: Value, right: Value) -> LuaResult<Value> {
    match (
        coerce::to_concat_bytes(&left),
        coerce::to_concat_bytes(&right),
    ) {
        (Some(lb), Some(rb)) => {
            let total = lb.len() + rb.len();
            vm.check_string_len(total)?;
            let mut buf = Vec::with_capacity(total);
            buf.extend_from_slice(&lb);
            buf.extend_from_slice(&rb);
            Ok(Value::Str(LuaStr::from_vec(buf)))
        }
        _ => {
            let mm = metamethod::get_metamethod(&left, MM_CONCAT)
                .or_else(|| metamethod::get_metamethod(&right, MM_CONCAT));
            match mm {
                Some(f) => {
                    let r = vm.call_value(&f, &[left, right])?;
                    Ok(r.into_iter().next().unwrap_or(Value::Nil))
                }
                None => {
                    let offender = if matches!(left, Value::Str(_) | Value::Integer(_) | Value::Number(_))
                    {
                        right
                    } else {
                        left
                    };
                    Err(LuaError::msg(format!(
                        "attempt to concatenate a {} value",
                        offender.type_name()
                    )))
                }
            }
        }
    }
}

/// Numeric coercion for `for` control values, keeping the integer tag.
fn for_number(v: &Value, msg: &str) -> LuaResult<Value> {
    match v {
        Value::Integer(_) | Value::Number(_) => Ok(v.clone()),
        Value::Str(s) => match coerce::str_to_number(s.as_bytes()) {
            Some(f) => Ok(Value::Number(f)),
            None => Err(LuaError::msg(msg)),
        },
        _ => Err(LuaError::msg(msg)),
    }
}
