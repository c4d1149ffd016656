//! Unbinding and teardown.

use std::sync::Arc;
use std::task::Poll;

use futures::executor::block_on;
use futures::future::poll_fn;
use log::error;

use super::{Context, CtxInner, CtxState, Message, MsgKind, Owner, TrapReason};
use crate::config::dprint;
use crate::error::Result;
use crate::manager::PerCpuState;
use crate::pmu::{RegMask, PMC0_FREEZE};
use crate::registry::{DbregUser, Scope};
use crate::task::{Caller, CpuId, Task};
use crate::{ContextHandle, Perfmon};

/// Registry state to give back once the context is unlocked.
pub(crate) struct Detached {
    scope: Scope,
    dbreg: Option<DbregUser>,
}

enum Closing {
    Unloaded,
    Detached(Detached),
    Zombie,
    /// The monitored task sleeps in `handle_work` and must let go itself.
    WaitTask,
}

impl Perfmon {
    /// Unbinds `ctx` from its task or CPU, flushing live registers into
    /// the context. `slot` is the CPU the context may be live on.
    pub(crate) fn detach(&self, slot: &mut PerCpuState, ctx: &Arc<Context>, inner: &mut CtxInner) -> Detached {
        let model = &self.model;

        let mut pmc0 = std::mem::take(&mut inner.pending_ovfl);
        if slot.owns(ctx) {
            let hw = &mut slot.hw;
            hw.set_monitoring(false);
            pmc0 |= hw.read_pmc(0);
            for i in inner.used_pmds.iter() {
                inner.th_pmds[i] = hw.read_pmd(i);
            }
            hw.write_pmc(0, PMC0_FREEZE);
            slot.owner = None;
        }
        // Latched but unhandled overflows still count.
        for i in model.ovfl_bits(pmc0).iter() {
            if inner.used_pmds.test(i) {
                inner.pmds[i].val = inner.pmds[i].val.wrapping_add(model.ovfl_val + 1);
            }
        }

        if inner.set_state(CtxState::Unloaded).is_err() {
            inner.state = CtxState::Unloaded;
        }

        let scope = match (ctx.is_system(), inner.cpu) {
            (true, Some(cpu)) => Scope::System(cpu),
            _ => Scope::Task,
        };
        let dbreg = inner.using_dbreg.then_some(DbregUser::Perfmon {
            system: ctx.is_system(),
        });

        if let Some(task) = inner.task.take().and_then(|t| t.upgrade()) {
            let mut ts = task.state.lock();
            if ts.ctx.as_ref().is_some_and(|c| Arc::ptr_eq(c, ctx)) {
                ts.ctx = None;
                ts.work_pending = false;
            }
        }

        inner.pid = None;
        inner.cpu = None;
        inner.last_cpu = None;
        inner.started = false;
        inner.trap_reason = TrapReason::None;
        inner.can_restart = false;
        inner.blocked = false;
        inner.restart_posted = false;
        inner.reload_pmcs = RegMask::EMPTY;
        inner.reload_pmds = RegMask::EMPTY;

        Detached { scope, dbreg }
    }

    /// Second half of [`detach`][Self::detach], with no lock held.
    pub(crate) fn finish_detach(&self, ctx: &Arc<Context>, detached: Detached) {
        if let Some(user) = detached.dbreg {
            self.registry.release_debug_registers(user);
        }
        self.registry.release(ctx.id(), detached.scope);
        self.release_owner(ctx, Owner::Attachment);
    }

    /// Closes the controlling handle.
    ///
    /// A context bound to another task that blocks on overflows cannot be
    /// torn down from here: it turns zombie and the task frees it the next
    /// time it is switched, returns to user level or exits. If that task
    /// is already waiting for a restart, it is woken and this call waits
    /// until it has let go.
    pub fn close(&self, caller: Caller<'_>, h: ContextHandle) -> Result<()> {
        let ctx = h.into_ctx();

        let cpu = {
            let inner = ctx.lock();
            match (inner.cpu, inner.last_cpu) {
                (Some(cpu), _) => cpu,
                (None, Some(cpu)) => cpu,
                (None, None) => caller.cpu,
            }
        };
        let slot = match self.cpu(cpu) {
            Ok(slot) => slot,
            Err(e) => {
                // The handle is gone either way.
                self.release_owner(&ctx, Owner::Handle);
                return Err(e);
            }
        };

        let closing = {
            let mut slot = slot.lock();
            let mut inner = ctx.lock();
            match inner.state {
                CtxState::Unloaded => Closing::Unloaded,
                CtxState::Zombie => {
                    error!("context {} closed twice", ctx.id());
                    Closing::Zombie
                }
                CtxState::Loaded | CtxState::Masked => {
                    let is_self = ctx.is_system() || inner.task().is_some_and(|t| caller.is(&t));
                    if is_self || !ctx.flags().block {
                        Closing::Detached(self.detach(&mut slot, &ctx, &mut inner))
                    } else if inner.blocked {
                        inner.going_zombie = true;
                        Closing::WaitTask
                    } else {
                        if inner.set_state(CtxState::Zombie).is_err() {
                            inner.state = CtxState::Zombie;
                        }
                        Closing::Zombie
                    }
                }
            }
        };

        match closing {
            Closing::Detached(detached) => self.finish_detach(&ctx, detached),
            Closing::WaitTask => {
                ctx.restart_wq.wake_all();
                block_on(poll_fn(|cx| {
                    let inner = ctx.lock();
                    if inner.state == CtxState::Unloaded && !inner.blocked {
                        return Poll::Ready(());
                    }
                    ctx.zombie_wq.register(cx.waker());
                    Poll::Pending
                }));
            }
            Closing::Unloaded | Closing::Zombie => {}
        }

        dprint!(self, "context {} closed by [{}]", ctx.id(), caller.task.pid());
        self.release_owner(&ctx, Owner::Handle);
        Ok(())
    }

    /// Task exit: unbinds the attached context, announcing the end of
    /// monitoring to its reader.
    pub fn exit_task(&self, cpu: CpuId, task: &Arc<Task>) {
        self.forget_task(task.pid());

        let Some(ctx) = task.context() else {
            return;
        };
        let Ok(slot) = self.cpu(cpu) else {
            error!("[{}] exits on unknown CPU{}", task.pid(), cpu);
            return;
        };

        let detached = {
            let mut slot = slot.lock();
            let mut inner = ctx.lock();
            match inner.state {
                CtxState::Unloaded => None,
                CtxState::Zombie => Some(self.detach(&mut slot, &ctx, &mut inner)),
                CtxState::Loaded | CtxState::Masked => {
                    if !ctx.flags().no_msg {
                        let msg = Message {
                            kind: MsgKind::End,
                            ctx: ctx.id(),
                            ovfl_pmds: RegMask::EMPTY,
                            eventid: 0,
                            tstamp: self.tstamp(),
                        };
                        if inner.msgq.push(msg).is_err() {
                            slot.stats.msgs_dropped += 1;
                        }
                    }
                    Some(self.detach(&mut slot, &ctx, &mut inner))
                }
            }
        };

        if let Some(detached) = detached {
            ctx.notify_readers();
            ctx.zombie_wq.wake_all();
            self.finish_detach(&ctx, detached);
            dprint!(self, "[{}] exited, context {} unloaded", task.pid(), ctx.id());
        }
    }
}
