//! Overflow interrupt handling.
//!
//! [`Perfmon::interrupt`] runs as the PMU interrupt handler of one CPU.
//! It never blocks: when the owning context is locked by someone else
//! the hardware is left frozen with its overflow bits latched, and the
//! interrupt is replayed later.

use std::sync::Arc;
use std::task::Poll;

use futures::executor::block_on;
use futures::future::poll_fn;
use log::{error, warn};

use crate::config::{dprint, dprint_ovfl};
use crate::ctx::{Context, CtxInner, CtxState, Message, MsgKind, TrapReason};
use crate::error::Result;
use crate::fmt::{OvflArg, OvflCtrl};
use crate::hw::LiveHw;
use crate::manager::PerCpuState;
use crate::pmu::{RegMask, PMC0_FREEZE};
use crate::task::{CpuId, Task};
use crate::Perfmon;

/// Per-CPU interrupt statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuStats {
    pub ovfl_intr_count: u64,
    pub spurious_intr_count: u64,
    pub replay_intr_count: u64,
    pub smpl_handler_calls: u64,
    pub msgs_dropped: u64,
}

/// What one interrupt did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqOutcome {
    /// No overflow bit latched, or no context owns the PMU.
    Spurious,
    /// The owning context was busy, the overflow stays latched.
    Replay,
    Handled(OvflSummary),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OvflSummary {
    /// Counters whose 64-bit value wrapped.
    pub ovfl_pmds: RegMask,
    pub notified: bool,
    pub masked: bool,
    pub blocked: bool,
    pub msg_dropped: bool,
}

impl Perfmon {
    /// PMU interrupt of `cpu`.
    pub fn interrupt(&self, cpu: CpuId) -> IrqOutcome {
        let Ok(slot) = self.cpu(cpu) else {
            return IrqOutcome::Spurious;
        };
        let mut slot = slot.lock();

        let pmc0 = slot.hw.read_pmc(0);
        let ovfl_bits = self.model.ovfl_bits(pmc0);
        if ovfl_bits.is_empty() {
            slot.stats.spurious_intr_count += 1;
            dprint_ovfl!(self, "CPU{}: spurious interrupt, pmc0={:#x}", cpu, pmc0);
            return IrqOutcome::Spurious;
        }

        let Some(ctx) = slot.owner.clone() else {
            slot.stats.spurious_intr_count += 1;
            dprint_ovfl!(self, "CPU{}: overflow with no owner, pmc0={:#x}", cpu, pmc0);
            slot.hw.write_pmc(0, PMC0_FREEZE);
            return IrqOutcome::Spurious;
        };

        let Some(mut inner) = ctx.inner.try_lock() else {
            slot.stats.replay_intr_count += 1;
            warn!("CPU{}: context {} busy, overflow {:#x} replayed", cpu, ctx.id(), pmc0);
            return IrqOutcome::Replay;
        };

        slot.stats.ovfl_intr_count += 1;
        let summary = self.overflow(&mut slot, cpu, &ctx, &mut inner, ovfl_bits);
        drop(inner);

        if summary.notified {
            ctx.notify_readers();
        }
        IrqOutcome::Handled(summary)
    }

    fn overflow(
        &self,
        slot: &mut PerCpuState,
        cpu: CpuId,
        ctx: &Arc<Context>,
        inner: &mut CtxInner,
        ovfl_bits: RegMask,
    ) -> OvflSummary {
        let model = &self.model;
        let mut summary = OvflSummary::default();

        if inner.state == CtxState::Zombie {
            // Nobody listens any more, the task tears it down shortly.
            slot.hw.set_monitoring(false);
            slot.hw.unfreeze();
            return summary;
        }

        let mut ovfl_notify = RegMask::EMPTY;
        for i in ovfl_bits.iter() {
            let sc = &mut inner.pmds[i];
            let old = sc.val;
            sc.val = sc.val.wrapping_add(model.ovfl_val + 1);
            if sc.val <= old {
                summary.ovfl_pmds.set(i);
                if sc.notify {
                    ovfl_notify.set(i);
                }
            }
        }

        dprint_ovfl!(
            self,
            "CPU{}: context {} ovfl_bits={:?} ovfl_pmds={:?} notify={:?}",
            cpu,
            ctx.id(),
            ovfl_bits,
            summary.ovfl_pmds,
            ovfl_notify
        );

        if summary.ovfl_pmds.is_empty() {
            slot.hw.unfreeze();
            return summary;
        }

        let mut ctrl = OvflCtrl::default();
        let mut reset_pmds = RegMask::EMPTY;
        match (ctx.fmt(), inner.smpl.is_some()) {
            (Some(fmt), true) => {
                let tstamp = self.tstamp();
                for i in summary.ovfl_pmds.iter() {
                    let smpl_pmds = inner.pmds[i].smpl_pmds;
                    let values = smpl_pmds
                        .iter()
                        .map(|j| {
                            let hw = slot.hw.read_pmd(j);
                            if model.pmd_is_counting(j) {
                                inner.pmds[j].val.wrapping_add(hw & model.ovfl_val)
                            } else {
                                hw
                            }
                        })
                        .collect::<Vec<_>>();
                    let arg = OvflArg {
                        ctx: ctx.id(),
                        ovfl_pmd: i,
                        ovfl_notify: ovfl_notify.test(i),
                        eventid: inner.pmds[i].eventid,
                        smpl_pmds,
                        smpl_pmds_values: &values,
                        last_reset_val: inner.pmds[i].lval,
                        pid: inner.pid,
                        cpu,
                        tstamp,
                    };

                    slot.stats.smpl_handler_calls += 1;
                    let Some(buf) = inner.smpl.as_mut() else {
                        break;
                    };
                    let ret = fmt.handle_overflow(buf, &arg);
                    ctrl.notify_user |= ret.notify_user;
                    ctrl.block_task |= ret.block_task;
                    ctrl.mask_monitoring |= ret.mask_monitoring;
                    if ret.reset_ovfl_pmds {
                        reset_pmds.set(i);
                    }
                }
            }
            _ => {
                let notify = !ovfl_notify.is_empty();
                ctrl.notify_user = notify;
                ctrl.block_task = notify && ctx.flags().block;
                ctrl.mask_monitoring = notify;
                if !notify {
                    reset_pmds = summary.ovfl_pmds;
                }
            }
        }

        // System-wide sessions have no task to block.
        ctrl.block_task &= !ctx.is_system();

        if !reset_pmds.is_empty() {
            self.reset_regs(inner, Some(&mut *slot.hw), reset_pmds, true);
        }

        if ctrl.notify_user {
            inner.ovfl_regs = summary.ovfl_pmds;
            summary.notified = true;

            if !ctx.flags().no_msg {
                let eventid = ovfl_notify
                    .iter()
                    .next()
                    .map_or(0, |i| inner.pmds[i].eventid);
                let msg = Message {
                    kind: MsgKind::Overflow,
                    ctx: ctx.id(),
                    ovfl_pmds: summary.ovfl_pmds,
                    eventid,
                    tstamp: self.tstamp(),
                };
                if inner.msgq.push(msg).is_err() {
                    slot.stats.msgs_dropped += 1;
                    summary.msg_dropped = true;
                    warn!("context {}: message queue full, overflow notification dropped", ctx.id());
                }
            }

            if ctrl.block_task {
                if let Some(task) = inner.task() {
                    inner.trap_reason = TrapReason::Block;
                    task.post_work();
                    summary.blocked = true;
                }
            }
        }

        if ctrl.mask_monitoring {
            self.mask_monitoring(inner, Some(&mut *slot.hw));
            if inner.set_state(CtxState::Masked).is_ok() {
                inner.can_restart = true;
                summary.masked = true;
            }
        } else if ctrl.notify_user {
            inner.can_restart = true;
        }

        slot.hw.unfreeze();
        summary
    }

    /// Reloads `regs` and the counters they reset along with them.
    pub(crate) fn reset_regs(&self, inner: &mut CtxInner, mut hw: LiveHw<'_>, regs: RegMask, long: bool) {
        let mut deps = RegMask::EMPTY;
        for i in regs.iter() {
            deps |= inner.pmds[i].reset_pmds;
            let val = inner.pmds[i].next_reset(long);
            self.write_counter(inner, hw.as_deref_mut(), i, val);
        }
        for i in deps.iter().filter(|i| !regs.test(*i)) {
            let val = inner.pmds[i].next_reset(long);
            self.write_counter(inner, hw.as_deref_mut(), i, val);
        }
    }

    fn write_counter(&self, inner: &mut CtxInner, hw: LiveHw<'_>, i: usize, val: u64) {
        let ovfl = self.model.ovfl_val;
        inner.pmds[i].val = val & !ovfl;
        inner.th_pmds[i] = val & ovfl;
        match hw {
            Some(hw) => hw.write_pmd(i, val & ovfl),
            None if inner.state.is_attached() => inner.reload_pmds.set(i),
            None => {}
        }
    }

    /// Clears the privilege levels of every used monitor.
    pub(crate) fn mask_monitoring(&self, inner: &mut CtxInner, hw: LiveHw<'_>) {
        match hw {
            Some(hw) => inner
                .used_monitors
                .iter()
                .for_each(|i| hw.write_pmc(i, inner.pmcs[i] & !self.model.plm_mask)),
            None => inner.reload_pmcs |= inner.used_monitors,
        }
    }

    pub(crate) fn restore_monitoring(&self, inner: &mut CtxInner, hw: LiveHw<'_>) {
        match hw {
            Some(hw) => inner
                .used_monitors
                .iter()
                .for_each(|i| hw.write_pmc(i, inner.pmcs[i])),
            None => inner.reload_pmcs |= inner.used_monitors,
        }
    }

    /// Leaves MASKED: the format (or the default policy) decides whether
    /// overflowed counters get their short reset and whether monitoring
    /// stays masked.
    pub(crate) fn resume(&self, ctx: &Context, inner: &mut CtxInner, mut hw: LiveHw<'_>) {
        let ctrl = match (ctx.fmt(), inner.smpl.as_mut()) {
            (Some(fmt), Some(buf)) => fmt.restart(buf),
            _ => OvflCtrl {
                reset_ovfl_pmds: true,
                ..Default::default()
            },
        };

        if ctrl.reset_ovfl_pmds {
            let ovfl = std::mem::take(&mut inner.ovfl_regs);
            self.reset_regs(inner, hw.as_deref_mut(), ovfl, false);
        }
        if !ctrl.mask_monitoring && inner.state == CtxState::Masked && inner.set_state(CtxState::Loaded).is_ok() {
            self.restore_monitoring(inner, hw);
        }
        inner.can_restart = false;
    }

    /// Restart of a notified context that kept running.
    pub(crate) fn restart_active(&self, ctx: &Context, inner: &mut CtxInner, hw: LiveHw<'_>) {
        inner.can_restart = false;
        let ctrl = match (ctx.fmt(), inner.smpl.as_mut()) {
            (Some(fmt), Some(buf)) => fmt.restart_active(buf),
            _ => OvflCtrl {
                reset_ovfl_pmds: true,
                ..Default::default()
            },
        };
        if ctrl.reset_ovfl_pmds {
            let ovfl = std::mem::take(&mut inner.ovfl_regs);
            self.reset_regs(inner, hw, ovfl, false);
        }
    }

    /// Pending context work of `task`, run on its way back to user level
    /// on `cpu`.
    ///
    /// A reset request resumes monitoring. A block request suspends the
    /// caller until the context is restarted or closed.
    pub fn handle_work(&self, cpu: CpuId, task: &Arc<Task>) -> Result<()> {
        {
            let mut ts = task.state.lock();
            if !ts.work_pending {
                return Ok(());
            }
            ts.work_pending = false;
        }
        let Some(ctx) = task.context() else {
            return Ok(());
        };

        {
            let mut slot = self.cpu(cpu)?.lock();
            let mut inner = ctx.lock();

            if inner.state == CtxState::Zombie {
                let detached = self.detach(&mut slot, &ctx, &mut inner);
                drop(inner);
                drop(slot);
                self.finish_detach(&ctx, detached);
                return Ok(());
            }

            match std::mem::take(&mut inner.trap_reason) {
                TrapReason::None => return Ok(()),
                TrapReason::Reset => {
                    if inner.state == CtxState::Masked {
                        let hw = if slot.owns(&ctx) { Some(&mut *slot.hw) } else { None };
                        self.resume(&ctx, &mut inner, hw);
                    }
                    return Ok(());
                }
                TrapReason::Block => inner.blocked = true,
            }
        }

        dprint!(self, "[{}] blocks on context {}", task.pid(), ctx.id());
        block_on(poll_fn(|cx| {
            let mut inner = ctx.lock();
            if inner.going_zombie || std::mem::take(&mut inner.restart_posted) {
                return Poll::Ready(());
            }
            ctx.restart_wq.register(cx.waker());
            Poll::Pending
        }));

        let mut slot = self.cpu(cpu)?.lock();
        let mut inner = ctx.lock();
        inner.blocked = false;

        if inner.going_zombie || inner.state == CtxState::Zombie {
            let detached = self.detach(&mut slot, &ctx, &mut inner);
            drop(inner);
            drop(slot);
            ctx.zombie_wq.wake_all();
            self.finish_detach(&ctx, detached);
            dprint!(self, "[{}] released closed context {}", task.pid(), ctx.id());
            return Ok(());
        }

        match inner.state {
            CtxState::Masked => {
                let hw = if slot.owns(&ctx) { Some(&mut *slot.hw) } else { None };
                self.resume(&ctx, &mut inner, hw);
            }
            CtxState::Loaded => {}
            state => error!("context {} woke up {:?}", ctx.id(), state),
        }
        Ok(())
    }
}
