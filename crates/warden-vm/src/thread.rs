//! Coroutine scheduling: resume orchestration and the worker thread body.
//!
//! Each worker executes on its own OS thread; the resumer blocks on the
//! handoff state until the worker yields or dies. At most one context runs
//! bytecode per `Globals` at any moment — the blocking protocol provides the
//! serialisation, the running-thread slot records who holds it.

use crate::globals::Globals;
use crate::vm::Vm;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use warden_core::error::LuaResult;
use warden_core::string::LuaStr;
use warden_core::thread::{ResumeAction, ThreadState, ThreadStatus};
use warden_core::value::{ThreadRef, Value};

static COROUTINE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Resume a worker with `args`.
///
/// Returns the `coroutine.resume` tuple: `[true, values…]` on yield or
/// return, `[false, message]` on death or a non-resumable state. A worker
/// already at its instruction limit returns `[Nil]` without executing a
/// single opcode — the host resets the counter between ticks.
pub fn resume(globals: &Arc<Globals>, thread: &ThreadRef, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    if thread.status() != ThreadStatus::Initial {
        if let Some(limit) = thread.limit() {
            if limit.at_limit() {
                debug!(target: "warden::coroutine", "skipping resume, worker at instruction limit");
                return Ok(vec![Value::Nil]);
            }
        }
    }

    match thread.state.prepare_resume(args) {
        ResumeAction::CannotResume(word) => {
            return Ok(vec![
                Value::Boolean(false),
                Value::Str(LuaStr::from(format!("cannot resume {word} coroutine"))),
            ]);
        }
        ResumeAction::Spawn => {
            spawn_worker(globals.clone(), thread.state.clone());
        }
        ResumeAction::Notified => {}
    }

    let previous = globals.swap_running(Some(thread.clone()));
    if let Some(prev) = &previous {
        prev.state.mark_normal();
    }

    let outcome = thread.state.wait_outcome();

    globals.swap_running(previous.clone());
    if let Some(prev) = &previous {
        prev.state.mark_running();
    }

    Ok(match outcome {
        Ok(mut vals) => {
            let mut tuple = Vec::with_capacity(vals.len() + 1);
            tuple.push(Value::Boolean(true));
            tuple.append(&mut vals);
            tuple
        }
        Err(message) => vec![Value::Boolean(false), Value::Str(LuaStr::from(message))],
    })
}

/// First resume: spawn the backing OS thread running the interpreter over
/// the worker's entry function.
fn spawn_worker(globals: Arc<Globals>, state: Arc<ThreadState>) {
    let n = COROUTINE_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    let name = format!("coroutine-{n}");
    debug!(target: "warden::coroutine", worker = %name, "spawning worker thread");
    let body_state = state.clone();
    let spawned = std::thread::Builder::new().name(name).spawn(move || {
        let args = body_state.take_args();
        let limit = body_state.limit();
        let function = body_state.function.clone();
        let mut vm = Vm::new(globals, limit, Some(body_state.clone()));
        let outcome = vm.call_value(&function, &args);
        if let Err(e) = &outcome {
            debug!(target: "warden::coroutine", error = %e, "worker finished with error");
        }
        body_state.finish(outcome);
    });
    if let Err(e) = spawned {
        warn!(target: "warden::coroutine", error = %e, "failed to spawn worker thread");
        state.finish(Err(warden_core::error::LuaError::Internal(format!(
            "failed to spawn worker thread: {e}"
        ))));
    }
}
