//! Context switch hooks.
//!
//! A switched-out context leaves its registers on the CPU. They are
//! reused at switch-in only if nothing else was installed there in
//! between, which the per-CPU activation number tells. A uniprocessor
//! keeps the hardware owner instead.

use std::sync::Arc;

use crate::config::{dprint, ReloadPolicy};
use crate::ctx::{Context, CtxInner, CtxState};
use crate::manager::PerCpuState;
use crate::pmu::PMC0_FREEZE;
use crate::task::{CpuId, Task};
use crate::Perfmon;

impl Perfmon {
    /// Makes `ctx` the live owner of `slot`.
    ///
    /// A full install writes every accessible PMC and implemented PMD
    /// from the context; otherwise only registers changed while the
    /// context was off the CPU are written.
    pub(crate) fn install(
        &self,
        slot: &mut PerCpuState,
        cpu: CpuId,
        ctx: &Arc<Context>,
        inner: &mut CtxInner,
        full: bool,
    ) {
        let model = &self.model;
        let (pmcs, pmds) = if full {
            (model.accessible_pmcs(), model.impl_pmds)
        } else {
            (inner.reload_pmcs, inner.reload_pmds)
        };

        let hw = &mut slot.hw;
        hw.set_monitoring(false);
        let masked = inner.state == CtxState::Masked;
        for i in pmcs.iter() {
            let val = if masked && model.pmc_is_monitor(i) {
                inner.pmcs[i] & !model.plm_mask
            } else {
                inner.pmcs[i]
            };
            hw.write_pmc(i, val);
        }
        for i in pmds.iter() {
            hw.write_pmd(i, inner.th_pmds[i]);
        }
        if inner.using_dbreg && full {
            inner.ibrs.iter().enumerate().for_each(|(i, v)| hw.write_ibr(i, *v));
            inner.dbrs.iter().enumerate().for_each(|(i, v)| hw.write_dbr(i, *v));
        }

        // Overflows latched before switch-out fire again here.
        match std::mem::take(&mut inner.pending_ovfl) {
            0 => hw.unfreeze(),
            pending => hw.write_pmc(0, pending | PMC0_FREEZE),
        }

        let idle_off = ctx.flags().excl_idle && slot.idle;
        slot.hw.set_monitoring(inner.started && !idle_off);

        inner.reload_pmcs = Default::default();
        inner.reload_pmds = Default::default();
        slot.owner = Some(ctx.clone());
        slot.activation += 1;
        inner.last_activation = slot.activation;
        inner.last_cpu = Some(cpu);
    }

    /// `task` leaves `cpu`.
    pub fn switch_out(&self, cpu: CpuId, task: &Arc<Task>) {
        let Some(ctx) = task.context() else {
            return;
        };
        let Ok(slot) = self.cpu(cpu) else {
            return;
        };
        let mut slot = slot.lock();
        let mut inner = ctx.lock();

        if inner.state == CtxState::Zombie {
            let detached = self.detach(&mut slot, &ctx, &mut inner);
            drop(inner);
            drop(slot);
            self.finish_detach(&ctx, detached);
            dprint!(self, "[{}] released closed context {} at switch-out", task.pid(), ctx.id());
            return;
        }
        if ctx.is_system() || !slot.owns(&ctx) {
            return;
        }

        let hw = &mut slot.hw;
        hw.set_monitoring(false);
        // Keep latched overflows for the next switch-in.
        inner.pending_ovfl = hw.read_pmc(0) & !PMC0_FREEZE;
        hw.write_pmc(0, PMC0_FREEZE);

        let inner = &mut *inner;
        for i in inner.used_pmds.iter() {
            inner.th_pmds[i] = hw.read_pmd(i);
        }
        // On a uniprocessor the registers stay ours until another context
        // is installed.
        if !self.config.uniprocessor {
            slot.owner = None;
        }
    }

    /// `task` is about to run on `cpu`.
    pub fn switch_in(&self, cpu: CpuId, task: &Arc<Task>) {
        let Ok(slot) = self.cpu(cpu) else {
            return;
        };
        let mut slot = slot.lock();
        slot.idle = task.is_idle();

        // A system-wide owner only cares about the idle task.
        if let Some(owner) = slot.owner.clone().filter(|o| o.is_system()) {
            if owner.flags().excl_idle {
                let started = owner.lock().started;
                let on = started && !slot.idle;
                slot.hw.set_monitoring(on);
            }
            return;
        }

        let Some(ctx) = task.context() else {
            return;
        };
        let mut inner = ctx.lock();

        match inner.state {
            CtxState::Zombie => {
                let detached = self.detach(&mut slot, &ctx, &mut inner);
                drop(inner);
                drop(slot);
                self.finish_detach(&ctx, detached);
                dprint!(self, "[{}] released closed context {} at switch-in", task.pid(), ctx.id());
            }
            CtxState::Unloaded => {}
            CtxState::Loaded | CtxState::Masked => {
                let still_here = if self.config.uniprocessor {
                    slot.owns(&ctx)
                } else {
                    inner.last_cpu == Some(cpu) && inner.last_activation == slot.activation
                };
                let reuse = self.config.reload == ReloadPolicy::Lazy && still_here;
                self.install(&mut slot, cpu, &ctx, &mut inner, !reuse);
            }
        }
    }
}
