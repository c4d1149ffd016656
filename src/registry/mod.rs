//! Session registry.
//!
//! System-wide and per-task sessions exclude each other process-wide, and
//! the debug (range-restriction) registers are arbitrated between ptrace
//! and perfmon users. The registry lock is a leaf with respect to context
//! locks: it is taken before a context lock or without one, never after.

use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use spin::Mutex;

use crate::ctx::ContextId;
use crate::error::{Error, Result};
use crate::task::CpuId;


/// Session scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Task,
    System(CpuId),
}

/// Debug-register user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbregUser {
    Ptrace,
    Perfmon { system: bool },
}

/// Registry counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sessions {
    pub sys_sessions: usize,
    pub task_sessions: usize,
    pub sys_dbreg_users: usize,
    pub task_dbreg_users: usize,
    pub ptrace_dbreg_users: usize,
    /// Owner of the system-wide session of each CPU.
    pub sys_owner: Vec<Option<ContextId>>,
}

pub struct Registry {
    inner: Mutex<Sessions>,
    idle_fast_path: AtomicBool,
}

impl Registry {
    pub fn new(nr_cpus: usize) -> Self {
        let sessions = Sessions {
            sys_owner: vec![None; nr_cpus],
            ..Default::default()
        };
        Self {
            inner: Mutex::new(sessions),
            idle_fast_path: AtomicBool::new(true),
        }
    }

    /// Reserves a session, all or nothing.
    pub fn reserve(&self, id: ContextId, scope: Scope) -> Result<()> {
        let mut s = self.inner.lock();

        match scope {
            Scope::System(cpu) => {
                let Some(owner) = s.sys_owner.get(cpu).copied() else {
                    return Err(Error::InvalidArgument("no such CPU"));
                };
                if s.task_sessions > 0 {
                    return Err(Error::Busy("per-task sessions active"));
                }
                if let Some(owner) = owner {
                    debug!("CPU{} already owned by context {}", cpu, owner);
                    return Err(Error::Busy("CPU owned by another system-wide session"));
                }
                s.sys_owner[cpu] = Some(id);
                s.sys_sessions += 1;
            }
            Scope::Task => {
                if s.sys_sessions > 0 {
                    return Err(Error::Busy("system-wide sessions active"));
                }
                s.task_sessions += 1;
            }
        }

        // Low-power idle would stop the PMU and lose samples.
        self.idle_fast_path.store(false, Ordering::Release);

        debug!(
            "reserved {:?} for context {}: sys_sessions={} task_sessions={}",
            scope, id, s.sys_sessions, s.task_sessions
        );
        Ok(())
    }

    pub fn release(&self, id: ContextId, scope: Scope) {
        let mut s = self.inner.lock();

        match scope {
            Scope::System(cpu) => {
                if let Some(owner) = s.sys_owner.get_mut(cpu) {
                    if *owner == Some(id) {
                        *owner = None;
                        s.sys_sessions = s.sys_sessions.saturating_sub(1);
                    }
                }
            }
            Scope::Task => s.task_sessions = s.task_sessions.saturating_sub(1),
        }

        if s.sys_sessions == 0 && s.task_sessions == 0 {
            self.idle_fast_path.store(true, Ordering::Release);
        }

        debug!(
            "released {:?} for context {}: sys_sessions={} task_sessions={}",
            scope, id, s.sys_sessions, s.task_sessions
        );
    }

    /// Claims the debug registers for `user`.
    ///
    /// Perfmon users are refused while ptrace holds debug registers, ptrace
    /// is refused while a system-wide perfmon session uses them. Conflicts
    /// between ptrace and perfmon on the same task are checked against the
    /// task by the caller.
    pub fn claim_debug_registers(&self, user: DbregUser) -> Result<()> {
        let mut s = self.inner.lock();

        match user {
            DbregUser::Ptrace => {
                if s.sys_dbreg_users > 0 {
                    return Err(Error::Busy("debug registers used by system-wide session"));
                }
                s.ptrace_dbreg_users += 1;
            }
            DbregUser::Perfmon { system } => {
                if s.ptrace_dbreg_users > 0 {
                    return Err(Error::Busy("debug registers used by ptrace"));
                }
                if system {
                    s.sys_dbreg_users += 1;
                } else {
                    s.task_dbreg_users += 1;
                }
            }
        }
        Ok(())
    }

    pub fn release_debug_registers(&self, user: DbregUser) {
        let mut s = self.inner.lock();

        let count = match user {
            DbregUser::Ptrace => &mut s.ptrace_dbreg_users,
            DbregUser::Perfmon { system: true } => &mut s.sys_dbreg_users,
            DbregUser::Perfmon { system: false } => &mut s.task_dbreg_users,
        };
        match count.checked_sub(1) {
            Some(n) => *count = n,
            None => log::error!("{:?} released debug registers it never claimed", user),
        }
    }

    /// Whether the low-power idle path may be used.
    pub fn idle_fast_path(&self) -> bool {
        self.idle_fast_path.load(Ordering::Acquire)
    }

    pub fn sessions(&self) -> Sessions {
        self.inner.lock().clone()
    }
}
