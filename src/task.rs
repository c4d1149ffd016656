//! Tasks as seen by the monitoring code.
//!
//! Scheduling, signals and ptrace live elsewhere; this is only the slice
//! of task state the context manager reads or posts work to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::sync::WaitQueue;

pub type Pid = u32;
pub type CpuId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    User,
    /// Kernel-only thread, never monitorable per task.
    Kernel,
    /// The idle task of a CPU.
    Idle,
}

pub struct Task {
    pid: Pid,
    uid: u32,
    kind: TaskKind,
    cap_ptrace: bool,
    pub(crate) state: Mutex<TaskState>,
    signal: AtomicBool,
    pub(crate) signal_wq: WaitQueue,
}

#[derive(Default)]
pub(crate) struct TaskState {
    pub stopped: bool,
    /// Attached context, this is the task's ownership of it.
    pub ctx: Option<Arc<Context>>,
    /// Context work to do before returning to user level.
    pub work_pending: bool,
    /// Debug registers claimed through ptrace.
    pub ptrace_dbregs: bool,
}

impl Task {
    pub fn new(pid: Pid, uid: u32, kind: TaskKind) -> Self {
        Self {
            pid,
            uid,
            kind,
            cap_ptrace: false,
            state: Mutex::new(TaskState::default()),
            signal: AtomicBool::new(false),
            signal_wq: WaitQueue::new(),
        }
    }

    /// Grants the capability to attach to tasks of other users.
    pub fn with_ptrace_cap(mut self) -> Self {
        self.cap_ptrace = true;
        self
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn is_idle(&self) -> bool {
        self.kind == TaskKind::Idle
    }

    /// Marks the task as stopped (e.g. by a debugger) or resumed.
    pub fn set_stopped(&self, stopped: bool) {
        self.state.lock().stopped = stopped;
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn raise_signal(&self) {
        self.signal.store(true, Ordering::Release);
        self.signal_wq.wake_all();
    }

    pub fn clear_signal(&self) {
        self.signal.store(false, Ordering::Release);
    }

    pub fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::Acquire)
    }

    /// Whether [`Perfmon::handle_work`][crate::Perfmon::handle_work] must run
    /// before this task returns to user level.
    pub fn work_pending(&self) -> bool {
        self.state.lock().work_pending
    }

    pub fn has_context(&self) -> bool {
        self.state.lock().ctx.is_some()
    }

    pub fn has_ptrace_dbregs(&self) -> bool {
        self.state.lock().ptrace_dbregs
    }

    pub(crate) fn context(&self) -> Option<Arc<Context>> {
        self.state.lock().ctx.clone()
    }

    pub(crate) fn post_work(&self) {
        self.state.lock().work_pending = true;
    }

    /// Checks that `self` may attach a context to `target`.
    pub(crate) fn may_attach(&self, target: &Task) -> Result<()> {
        if target.kind != TaskKind::User {
            return Err(Error::PermissionDenied("kernel-only task"));
        }
        if self.uid != target.uid && !self.cap_ptrace {
            return Err(Error::PermissionDenied("task owned by another user"));
        }
        Ok(())
    }
}

/// The task issuing a command and the CPU it runs on.
#[derive(Clone, Copy)]
pub struct Caller<'a> {
    pub task: &'a Arc<Task>,
    pub cpu: CpuId,
}

impl<'a> Caller<'a> {
    pub fn new(task: &'a Arc<Task>, cpu: CpuId) -> Self {
        Self { task, cpu }
    }

    pub(crate) fn is(&self, task: &Task) -> bool {
        self.task.pid == task.pid
    }
}
