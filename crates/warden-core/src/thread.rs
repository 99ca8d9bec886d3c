/// Coroutine thread object and its handoff state machine.
///
/// Each worker runs bytecode on its own OS thread; the resumer and the worker
/// exchange control through a mutex+condvar pair. The scheduler logic that
/// spawns threads and builds interpreters lives in the VM crate; this module
/// owns the states and the blocking transitions.
///
/// A parked worker wakes at `ORPHAN_CHECK_INTERVAL` and upgrades a weak
/// backreference to its own handle; when every external reference has been
/// dropped the upgrade fails and the worker terminates itself with the orphan
/// signal, which no protected call can absorb.
use crate::error::{LuaError, LuaResult};
use crate::limit::InstructionLimit;
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// How long a suspended worker sleeps between orphan checks.
pub const ORPHAN_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadStatus {
    Initial,
    Suspended,
    Running,
    /// Resumed another coroutine and is waiting for it.
    Normal,
    Dead,
}

impl ThreadStatus {
    /// Status string as seen by `coroutine.status`.
    pub fn name(self) -> &'static str {
        match self {
            ThreadStatus::Initial | ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
        }
    }
}

struct Transfer {
    status: ThreadStatus,
    /// Arguments travelling resumer -> worker.
    args: Vec<Value>,
    /// Values travelling worker -> resumer (yield or return).
    result: Vec<Value>,
    /// Error text of a dead worker.
    error: Option<String>,
}

/// Shared handoff state. The worker OS thread holds the state strongly but
/// the thread *handle* only weakly, so dropping every external handle orphans
/// the worker.
pub struct ThreadState {
    /// Entry function of the worker.
    pub function: Value,
    back: Weak<LuaThread>,
    limit: Mutex<Option<Arc<InstructionLimit>>>,
    transfer: Mutex<Transfer>,
    cv: Condvar,
}

/// What the resumer must do after handing over arguments.
#[derive(Debug, PartialEq, Eq)]
pub enum ResumeAction {
    /// First resume: the caller spawns the backing OS thread.
    Spawn,
    /// Worker exists and was woken.
    Notified,
    /// Not resumable; carries the status word for the error message.
    CannotResume(&'static str),
}

impl ThreadState {
    /// Record resume arguments and flip to Running. Never blocks.
    pub fn prepare_resume(&self, args: Vec<Value>) -> ResumeAction {
        let mut t = self.transfer.lock();
        match t.status {
            ThreadStatus::Initial => {
                t.args = args;
                t.status = ThreadStatus::Running;
                ResumeAction::Spawn
            }
            ThreadStatus::Suspended => {
                t.args = args;
                t.status = ThreadStatus::Running;
                self.cv.notify_all();
                ResumeAction::Notified
            }
            ThreadStatus::Dead => ResumeAction::CannotResume("dead"),
            ThreadStatus::Running | ThreadStatus::Normal => {
                ResumeAction::CannotResume("non-suspended")
            }
        }
    }

    /// Block the resumer until the worker yields or dies, then collect the
    /// transferred values (or the death message).
    pub fn wait_outcome(&self) -> Result<Vec<Value>, String> {
        let mut t = self.transfer.lock();
        while t.status == ThreadStatus::Running {
            self.cv.wait(&mut t);
        }
        t.args = Vec::new();
        if let Some(err) = t.error.take() {
            Err(err)
        } else {
            Ok(std::mem::take(&mut t.result))
        }
    }

    /// Worker side: collect the arguments of the pending resume.
    pub fn take_args(&self) -> Vec<Value> {
        std::mem::take(&mut self.transfer.lock().args)
    }

    /// Worker side: deliver `vals` to the resumer and park until the next
    /// resume, checking for orphanhood at every wakeup.
    pub fn lua_yield(&self, vals: Vec<Value>) -> LuaResult<Vec<Value>> {
        let mut t = self.transfer.lock();
        t.result = vals;
        t.status = ThreadStatus::Suspended;
        self.cv.notify_all();
        loop {
            self.cv.wait_for(&mut t, ORPHAN_CHECK_INTERVAL);
            if self.back.upgrade().is_none() {
                t.status = ThreadStatus::Dead;
                self.cv.notify_all();
                return Err(LuaError::Orphaned);
            }
            if t.status != ThreadStatus::Suspended {
                break;
            }
        }
        Ok(std::mem::take(&mut t.args))
    }

    /// Worker side: body finished (return or uncaught error).
    pub fn finish(&self, outcome: Result<Vec<Value>, LuaError>) {
        let mut t = self.transfer.lock();
        match outcome {
            Ok(vals) => t.result = vals,
            Err(e) => t.error = Some(e.message()),
        }
        t.status = ThreadStatus::Dead;
        self.cv.notify_all();
    }

    pub fn status(&self) -> ThreadStatus {
        self.transfer.lock().status
    }

    /// Resumer bookkeeping while it waits on another worker.
    pub fn mark_normal(&self) {
        let mut t = self.transfer.lock();
        if t.status == ThreadStatus::Running {
            t.status = ThreadStatus::Normal;
        }
    }

    pub fn mark_running(&self) {
        let mut t = self.transfer.lock();
        if t.status == ThreadStatus::Normal {
            t.status = ThreadStatus::Running;
        }
    }

    /// True once every external handle to the thread has been dropped.
    pub fn is_orphaned(&self) -> bool {
        self.back.upgrade().is_none()
    }

    /// The thread handle this state belongs to, while it is still alive.
    pub fn handle(&self) -> Option<Arc<LuaThread>> {
        self.back.upgrade()
    }

    pub fn limit(&self) -> Option<Arc<InstructionLimit>> {
        self.limit.lock().clone()
    }

    /// Share an existing limit record with this worker (script-created
    /// coroutines inherit the creating context's budget). A record installed
    /// earlier wins.
    pub fn adopt_limit(&self, limit: Arc<InstructionLimit>) {
        let mut slot = self.limit.lock();
        if slot.is_none() {
            *slot = Some(limit);
        }
    }

    /// Install the worker's limit, or reconfigure the existing record
    /// (preserving its counter) when one is already present.
    pub fn install_limit(
        &self,
        max_instructions: u64,
        max_string_size: usize,
    ) -> Arc<InstructionLimit> {
        let mut slot = self.limit.lock();
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

    /// Values currently parked in the transfer slots, for the memory walker.
    pub fn pending_values(&self) -> Vec<Value> {
        let t = self.transfer.lock();
        let mut out = t.args.clone();
        out.extend(t.result.iter().cloned());
        out
    }
}

/// A coroutine as seen by scripts and the host.
pub struct LuaThread {
    pub state: Arc<ThreadState>,
}

impl LuaThread {
    /// Package a function as a worker. The backing OS thread is spawned
    /// lazily on first resume.
    pub fn new(function: Value) -> Arc<LuaThread> {
        Arc::new_cyclic(|weak: &Weak<LuaThread>| LuaThread {
            state: Arc::new(ThreadState {
                function,
                back: weak.clone(),
                limit: Mutex::new(None),
                transfer: Mutex::new(Transfer {
                    status: ThreadStatus::Initial,
                    args: Vec::new(),
                    result: Vec::new(),
                    error: None,
                }),
                cv: Condvar::new(),
            }),
        })
    }

    pub fn status(&self) -> ThreadStatus {
        self.state.status()
    }

    pub fn status_name(&self) -> &'static str {
        self.status().name()
    }

    pub fn limit(&self) -> Option<Arc<InstructionLimit>> {
        self.state.limit()
    }

    pub fn install_limit(
        &self,
        max_instructions: u64,
        max_string_size: usize,
    ) -> Arc<InstructionLimit> {
        self.state.install_limit(max_instructions, max_string_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status_reads_suspended() {
        let t = LuaThread::new(Value::Nil);
        assert_eq!(t.status(), ThreadStatus::Initial);
        assert_eq!(t.status_name(), "suspended");
    }

    #[test]
    fn test_prepare_resume_transitions() {
        let t = LuaThread::new(Value::Nil);
        assert_eq!(
            t.state.prepare_resume(vec![Value::Integer(1)]),
            ResumeAction::Spawn
        );
        assert_eq!(t.status(), ThreadStatus::Running);
        assert_eq!(
            t.state.prepare_resume(vec![]),
            ResumeAction::CannotResume("non-suspended")
        );
    }

    #[test]
    fn test_dead_cannot_resume() {
        let t = LuaThread::new(Value::Nil);
        t.state.finish(Ok(vec![]));
        assert_eq!(t.status(), ThreadStatus::Dead);
        assert_eq!(
            t.state.prepare_resume(vec![]),
            ResumeAction::CannotResume("dead")
        );
    }

    #[test]
    fn test_finish_with_error_reports_message() {
        let t = LuaThread::new(Value::Nil);
        t.state.prepare_resume(vec![]);
        t.state.finish(Err(LuaError::msg("boom")));
        assert_eq!(t.state.wait_outcome(), Err("boom".to_string()));
    }

    #[test]
    fn test_yield_resume_handoff_across_threads() {
        let t = LuaThread::new(Value::Nil);
        assert_eq!(
            t.state.prepare_resume(vec![Value::Integer(5)]),
            ResumeAction::Spawn
        );
        let worker_state = t.state.clone();
        let handle = std::thread::spawn(move || {
            let args = worker_state.take_args();
            assert!(matches!(args[0], Value::Integer(5)));
            // Yield 7 back, expect 9 from the second resume.
            let resumed = worker_state.lua_yield(vec![Value::Integer(7)]).unwrap();
            assert!(matches!(resumed[0], Value::Integer(9)));
            worker_state.finish(Ok(vec![Value::Integer(10)]));
        });
        let yielded = t.state.wait_outcome().unwrap();
        assert!(matches!(yielded[0], Value::Integer(7)));
        assert_eq!(
            t.state.prepare_resume(vec![Value::Integer(9)]),
            ResumeAction::Notified
        );
        let returned = t.state.wait_outcome().unwrap();
        assert!(matches!(returned[0], Value::Integer(10)));
        assert_eq!(t.status(), ThreadStatus::Dead);
        handle.join().unwrap();
    }

    #[test]
    fn test_install_limit_upsert() {
        let t = LuaThread::new(Value::Nil);
        let first = t.install_limit(1, 100);
        first.try_charge(1).unwrap();
        let second = t.install_limit(500, 100);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.max(), 500);
        assert_eq!(second.current(), 1);
    }

    #[test]
    fn test_orphan_detection() {
        let t = LuaThread::new(Value::Nil);
        let state = t.state.clone();
        assert!(!state.is_orphaned());
        drop(t);
        assert!(state.is_orphaned());
    }
}
