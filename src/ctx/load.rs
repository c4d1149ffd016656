//! Creation, binding and run control.

use std::sync::Arc;

use super::{Context, CtxState, Owner, TrapReason};
use crate::cmd::{
    needs_stop, CtxArg, LoadArg, PFM_LOAD_CONTEXT, PFM_RESTART, PFM_START, PFM_STOP, PFM_UNLOAD_CONTEXT,
};
use crate::config::dprint;
use crate::error::{Error, Result};
use crate::fmt::SmplBuf;
use crate::registry::{DbregUser, Scope};
use crate::task::{Caller, Task};
use crate::{ContextHandle, Perfmon};

impl Perfmon {
    /// Creates an unloaded context.
    pub fn create_context(&self, caller: Caller<'_>, arg: &mut CtxArg) -> Result<ContextHandle> {
        let flags = arg.flags;
        if flags.system && flags.block {
            return Err(Error::InvalidArgument("system-wide sessions cannot block"));
        }
        if flags.excl_idle && !flags.system {
            return Err(Error::InvalidArgument("exclude-idle needs a system-wide session"));
        }

        let (fmt, smpl) = match arg.smpl_fmt {
            None => (None, None),
            Some(id) => {
                let fmt = self
                    .formats
                    .find(&id)
                    .ok_or(Error::InvalidArgument("unknown sampling format"))?;
                fmt.validate(&flags, &arg.smpl_arg)?;
                let size = fmt.get_size(&flags, &arg.smpl_arg)?;
                let mut buf = SmplBuf::alloc(size, self.config.max_smpl_buf_size)?;
                fmt.init(&mut buf, &flags, &arg.smpl_arg)?;
                (Some(fmt), Some(buf))
            }
        };

        let id = self.next_id();
        let ctx = Arc::new(Context::new(id, flags, &self.model, fmt, smpl));
        self.context_created();
        arg.ctx_id = id;

        dprint!(
            self,
            "context {} created by [{}] on CPU{}: {:?}",
            id,
            caller.task.pid(),
            caller.cpu,
            flags
        );
        Ok(ContextHandle::new(ctx))
    }

    /// Binds the context to a task, or to the caller's CPU for a
    /// system-wide context.
    pub fn load(&self, caller: Caller<'_>, h: &ContextHandle, arg: &LoadArg) -> Result<()> {
        let ctx = h.ctx();
        let system = ctx.is_system();

        let target = if system {
            if arg.load_pid != caller.task.pid() {
                return Err(Error::InvalidArgument("system-wide context is loaded by its own task"));
            }
            caller.task.clone()
        } else {
            let target = self.find_task(arg.load_pid)?;
            caller.task.may_attach(&target)?;
            let is_self = caller.is(&target);
            if is_self && ctx.flags().block {
                return Err(Error::InvalidArgument("blocking self-monitoring"));
            }
            if !is_self && needs_stop(PFM_LOAD_CONTEXT) && !target.is_stopped() {
                return Err(Error::Busy("target task not stopped"));
            }
            if target.has_context() {
                return Err(Error::Busy("task already monitored"));
            }
            target
        };

        let using_dbreg = {
            let inner = ctx.lock();
            if inner.state != CtxState::Unloaded {
                return Err(Error::Busy("context already loaded"));
            }
            inner.using_dbreg
        };

        let scope = if system {
            Scope::System(caller.cpu)
        } else {
            Scope::Task
        };
        self.registry.reserve(ctx.id(), scope)?;

        let dbreg = DbregUser::Perfmon { system };
        if using_dbreg {
            let claimed = if !system && target.has_ptrace_dbregs() {
                Err(Error::Busy("debug registers used by ptrace"))
            } else {
                self.registry.claim_debug_registers(dbreg)
            };
            if let Err(e) = claimed {
                self.registry.release(ctx.id(), scope);
                return Err(e);
            }
        }

        match self.load_locked(caller, ctx, &target, using_dbreg) {
            Ok(()) => {
                dprint!(self, "context {} loaded on [{}] CPU{}", ctx.id(), target.pid(), caller.cpu);
                Ok(())
            }
            Err(e) => {
                if using_dbreg {
                    self.registry.release_debug_registers(dbreg);
                }
                self.registry.release(ctx.id(), scope);
                Err(e)
            }
        }
    }

    fn load_locked(
        &self,
        caller: Caller<'_>,
        ctx: &Arc<Context>,
        target: &Arc<Task>,
        using_dbreg: bool,
    ) -> Result<()> {
        let mut slot = self.cpu(caller.cpu)?.lock();
        let mut inner = ctx.lock();

        if inner.state != CtxState::Unloaded {
            return Err(Error::Busy("context already loaded"));
        }
        if inner.using_dbreg != using_dbreg {
            return Err(Error::Busy("debug registers changed during load"));
        }

        if ctx.is_system() {
            inner.set_state(CtxState::Loaded)?;
            inner.cpu = Some(caller.cpu);
        } else {
            let mut ts = target.state.lock();
            if ts.ctx.is_some() {
                return Err(Error::Busy("task already monitored"));
            }
            inner.set_state(CtxState::Loaded)?;
            ts.ctx = Some(ctx.clone());
        }

        inner.task = Some(Arc::downgrade(target));
        inner.pid = Some(target.pid());
        inner.started = false;
        inner.going_zombie = false;
        inner.trap_reason = TrapReason::None;
        inner.can_restart = false;
        inner.pending_ovfl = 0;
        inner.last_cpu = None;
        ctx.acquire(Owner::Attachment);

        // The caller's CPU is where a self-monitored or system-wide
        // context runs; a stopped task gets its registers at switch-in.
        if ctx.is_system() || caller.is(target) {
            self.install(&mut slot, caller.cpu, ctx, &mut inner, true);
        }
        Ok(())
    }

    /// Unbinds the context. Unloading an unloaded context does nothing.
    pub fn unload(&self, caller: Caller<'_>, h: &ContextHandle) -> Result<()> {
        let ctx = h.ctx();
        let detached = {
            let mut slot = self.cpu(caller.cpu)?.lock();
            let mut inner = ctx.lock();
            self.check_state(caller, ctx, &inner, needs_stop(PFM_UNLOAD_CONTEXT))?;
            if inner.state == CtxState::Unloaded {
                return Ok(());
            }
            self.detach(&mut slot, ctx, &mut inner)
        };
        self.finish_detach(ctx, detached);

        dprint!(self, "context {} unloaded", ctx.id());
        Ok(())
    }

    pub fn start(&self, caller: Caller<'_>, h: &ContextHandle) -> Result<()> {
        self.set_started(caller, h, PFM_START)
    }

    pub fn stop(&self, caller: Caller<'_>, h: &ContextHandle) -> Result<()> {
        self.set_started(caller, h, PFM_STOP)
    }

    fn set_started(&self, caller: Caller<'_>, h: &ContextHandle, cmd: u32) -> Result<()> {
        let on = cmd == PFM_START;
        let ctx = h.ctx();
        let mut slot = self.cpu(caller.cpu)?.lock();
        let mut inner = ctx.lock();
        self.check_state(caller, ctx, &inner, needs_stop(cmd))?;
        if !inner.state.is_attached() {
            return Err(Error::InvalidArgument("context not loaded"));
        }

        inner.started = on;
        if slot.owns(ctx) {
            let idle_off = ctx.flags().excl_idle && slot.idle;
            slot.hw.set_monitoring(on && !idle_off);
        }

        dprint!(self, "context {} {}", ctx.id(), if on { "started" } else { "stopped" });
        Ok(())
    }

    /// Resumes monitoring after a notified overflow.
    ///
    /// The monitored task itself (or the bound CPU of a system-wide
    /// context) restarts synchronously. Otherwise the restart is handed
    /// to the task: a non-blocking one resets on its way back to user
    /// level, a blocked one is woken.
    pub fn restart(&self, caller: Caller<'_>, h: &ContextHandle) -> Result<()> {
        let ctx = h.ctx();
        let wake = {
            let mut slot = self.cpu(caller.cpu)?.lock();
            let mut inner = ctx.lock();
            self.check_state(caller, ctx, &inner, needs_stop(PFM_RESTART))?;

            match inner.state {
                CtxState::Unloaded => return Err(Error::InvalidArgument("context not loaded")),
                CtxState::Zombie => return Err(Error::Busy("zombie context")),
                CtxState::Loaded => {
                    if !inner.can_restart {
                        return Err(Error::Busy("context not masked"));
                    }
                    let hw = if slot.owns(ctx) { Some(&mut *slot.hw) } else { None };
                    self.restart_active(ctx, &mut inner, hw);
                    return Ok(());
                }
                CtxState::Masked => {}
            }

            let task = inner.task();
            let is_self = ctx.is_system() || task.as_ref().is_some_and(|t| caller.is(t));
            if is_self {
                let hw = if slot.owns(ctx) { Some(&mut *slot.hw) } else { None };
                self.resume(ctx, &mut inner, hw);
                false
            } else if !ctx.flags().block {
                inner.trap_reason = TrapReason::Reset;
                if let Some(task) = task {
                    task.post_work();
                }
                false
            } else {
                inner.restart_posted = true;
                true
            }
        };

        if wake {
            ctx.restart_wq.wake_all();
        }
        dprint!(self, "context {} restarted", ctx.id());
        Ok(())
    }
}
