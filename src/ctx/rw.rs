//! Register read/write paths.

use std::sync::Arc;

use super::{Context, CtxInner, CtxState};
use crate::cmd::{
    needs_stop, DbregArg, DbregMode, RegArg, PFM_READ_PMDS, PFM_WRITE_DBRS, PFM_WRITE_IBRS, PFM_WRITE_PMCS,
    PFM_WRITE_PMDS,
};
use crate::config::dprint;
use crate::error::{Error, Result};
use crate::hw::LiveHw;
use crate::pmu::RegCheck;
use crate::registry::DbregUser;
use crate::task::Caller;
use crate::{ContextHandle, Perfmon};

// Odd IBRs: execute bit. Odd DBRs: read and write bits. Cleared so the
// registers only restrict ranges and never raise debug faults.
const IBR_X: u64 = 1 << 63;
const DBR_RW: u64 = 3 << 62;

impl Perfmon {
    /// Checks that `caller` may operate on a context in its current state.
    ///
    /// A loaded system-wide context is only reachable from its CPU. A
    /// loaded per-task context is reachable from the monitored task, or
    /// from another task once the monitored one is stopped when
    /// `needs_stop` is set.
    pub(crate) fn check_state(
        &self,
        caller: Caller<'_>,
        ctx: &Context,
        inner: &CtxInner,
        needs_stop: bool,
    ) -> Result<()> {
        match inner.state {
            CtxState::Unloaded => return Ok(()),
            CtxState::Zombie => return Err(Error::Busy("zombie context")),
            CtxState::Loaded | CtxState::Masked => {}
        }

        if ctx.is_system() {
            if inner.cpu != Some(caller.cpu) {
                return Err(Error::Busy("system-wide context bound to another CPU"));
            }
            return Ok(());
        }

        let task = inner
            .task()
            .ok_or(Error::NoSuchProcess(inner.pid.unwrap_or_default()))?;
        if !caller.is(&task) && needs_stop && !task.is_stopped() {
            return Err(Error::Busy("monitored task not stopped"));
        }
        Ok(())
    }

    /// Writes PMCs, stopping at the first rejected record.
    pub fn write_pmcs(&self, caller: Caller<'_>, h: &ContextHandle, regs: &mut [RegArg]) -> Result<()> {
        let ctx = h.ctx();
        let mut slot = self.cpu(caller.cpu)?.lock();
        let mut inner = ctx.lock();
        self.check_state(caller, ctx, &inner, needs_stop(PFM_WRITE_PMCS))?;

        let live = slot.owns(ctx);
        for reg in regs.iter_mut() {
            let hw = if live { Some(&mut *slot.hw) } else { None };
            if let Err(e) = self.write_pmc(ctx, &mut inner, hw, reg) {
                dprint!(self, "context {}: PMC{} <- {:#x} rejected: {}", ctx.id(), reg.num, reg.value, e);
                reg.flags.ret_invalid = true;
                return Err(e);
            }
            reg.flags.ret_invalid = false;
        }
        Ok(())
    }

    fn write_pmc(&self, ctx: &Context, inner: &mut CtxInner, hw: LiveHw<'_>, reg: &RegArg) -> Result<()> {
        let model = &self.model;
        let i = reg.num;
        let desc = model.writable_pmc(i)?;

        let mut val = desc.sanitize(reg.value);
        if desc.kind.is_monitor() {
            desc.check_pm(val, ctx.is_system())?;
        }
        if desc.kind.is_counting() {
            if !model.valid_dep_mask(&reg.reset_pmds) || !model.valid_dep_mask(&reg.smpl_pmds) {
                return Err(Error::InvalidArgument("dependency mask names a non-counting PMD"));
            }
            val |= 1 << model.oi_pos;
        }
        if let (false, Some(check)) = (self.config.expert_mode, desc.write_check) {
            let arg = RegCheck {
                is_system: ctx.is_system(),
                pmcs: &inner.pmcs,
            };
            check(&arg, i, &mut val)?;
        }

        // Nothing below can fail.
        if desc.kind.is_counting() {
            let pmd = &mut inner.pmds[i];
            pmd.notify = reg.flags.notify;
            pmd.random = reg.flags.random;
            pmd.reset_pmds = reg.reset_pmds;
            pmd.smpl_pmds = reg.smpl_pmds;
        }
        inner.pmcs[i] = val;
        inner.used_pmds |= model.pmc_deps(i);
        if desc.kind.is_monitor() {
            inner.used_monitors.set(i);
        }

        // A masked monitor keeps its privilege levels cleared until restart.
        let masked = inner.state == CtxState::Masked && desc.kind.is_monitor();
        match hw {
            Some(hw) if !masked => hw.write_pmc(i, val),
            Some(_) => {}
            None if inner.state.is_attached() => inner.reload_pmcs.set(i),
            None => {}
        }

        dprint!(self, "context {}: PMC{} <- {:#x}", ctx.id(), i, val);
        Ok(())
    }

    /// Writes PMDs with their reset values, stopping at the first
    /// rejected record.
    pub fn write_pmds(&self, caller: Caller<'_>, h: &ContextHandle, regs: &mut [RegArg]) -> Result<()> {
        let ctx = h.ctx();
        let mut slot = self.cpu(caller.cpu)?.lock();
        let mut inner = ctx.lock();
        self.check_state(caller, ctx, &inner, needs_stop(PFM_WRITE_PMDS))?;

        let live = slot.owns(ctx);
        for reg in regs.iter_mut() {
            let hw = if live { Some(&mut *slot.hw) } else { None };
            if let Err(e) = self.write_pmd(ctx, &mut inner, hw, reg) {
                dprint!(self, "context {}: PMD{} <- {:#x} rejected: {}", ctx.id(), reg.num, reg.value, e);
                reg.flags.ret_invalid = true;
                return Err(e);
            }
            reg.flags.ret_invalid = false;
        }
        Ok(())
    }

    fn write_pmd(&self, ctx: &Context, inner: &mut CtxInner, hw: LiveHw<'_>, reg: &RegArg) -> Result<()> {
        let model = &self.model;
        let i = reg.num;
        let desc = model.accessible_pmd(i)?;

        let mut val = reg.value;
        if let (false, Some(check)) = (self.config.expert_mode, desc.write_check) {
            let arg = RegCheck {
                is_system: ctx.is_system(),
                pmcs: &inner.pmcs,
            };
            check(&arg, i, &mut val)?;
        }

        let counting = model.pmd_is_counting(i);
        let sc = &mut inner.pmds[i];
        sc.long_reset = reg.long_reset;
        sc.short_reset = reg.short_reset;
        sc.seed = reg.seed;
        sc.mask = reg.mask;
        sc.eventid = reg.eventid;
        sc.lval = val;

        let hw_val = if counting {
            sc.val = val & !model.ovfl_val;
            val & model.ovfl_val
        } else {
            val
        };
        inner.th_pmds[i] = hw_val;
        inner.used_pmds.set(i);
        inner.ovfl_regs.clear(i);

        match hw {
            Some(hw) => hw.write_pmd(i, hw_val),
            None if inner.state.is_attached() => inner.reload_pmds.set(i),
            None => {}
        }

        dprint!(self, "context {}: PMD{} <- {:#x}", ctx.id(), i, val);
        Ok(())
    }

    /// Reads PMDs, only those the context has already used.
    pub fn read_pmds(&self, caller: Caller<'_>, h: &ContextHandle, regs: &mut [RegArg]) -> Result<()> {
        let ctx = h.ctx();
        let slot = self.cpu(caller.cpu)?.lock();
        let inner = ctx.lock();
        self.check_state(caller, ctx, &inner, needs_stop(PFM_READ_PMDS))?;

        let live = slot.owns(ctx);
        for reg in regs.iter_mut() {
            let hw_val = live.then(|| slot.hw.read_pmd(reg.num));
            if let Err(e) = self.read_pmd(ctx, &inner, hw_val, reg) {
                reg.flags.ret_invalid = true;
                return Err(e);
            }
            reg.flags.ret_invalid = false;
        }
        Ok(())
    }

    fn read_pmd(&self, ctx: &Context, inner: &CtxInner, hw_val: Option<u64>, reg: &mut RegArg) -> Result<()> {
        let model = &self.model;
        let i = reg.num;
        let desc = model.accessible_pmd(i)?;
        if !inner.used_pmds.test(i) {
            return Err(Error::InvalidArgument("PMD not used by this context"));
        }

        let hw_val = hw_val.unwrap_or(inner.th_pmds[i]);
        let mut val = if model.pmd_is_counting(i) {
            inner.pmds[i].val.wrapping_add(hw_val & model.ovfl_val)
        } else {
            hw_val
        };
        if let (false, Some(check)) = (self.config.expert_mode, desc.read_check) {
            let arg = RegCheck {
                is_system: ctx.is_system(),
                pmcs: &inner.pmcs,
            };
            check(&arg, i, &mut val)?;
        }

        reg.value = val;
        reg.last_reset_val = inner.pmds[i].lval;
        Ok(())
    }

    /// Writes instruction range-restriction registers.
    pub fn write_ibrs(&self, caller: Caller<'_>, h: &ContextHandle, regs: &mut [DbregArg]) -> Result<()> {
        self.write_dbregs(caller, h, DbregMode::Code, regs)
    }

    /// Writes data range-restriction registers.
    pub fn write_dbrs(&self, caller: Caller<'_>, h: &ContextHandle, regs: &mut [DbregArg]) -> Result<()> {
        self.write_dbregs(caller, h, DbregMode::Data, regs)
    }

    fn write_dbregs(
        &self,
        caller: Caller<'_>,
        h: &ContextHandle,
        mode: DbregMode,
        regs: &mut [DbregArg],
    ) -> Result<()> {
        let ctx = h.ctx();
        let user = DbregUser::Perfmon {
            system: ctx.is_system(),
        };

        // A loaded context claims the registers on first use. The registry
        // cannot be entered with the context locked, so claim up front and
        // give the claim back if it turns out to be unneeded.
        let claimed = {
            let inner = ctx.lock();
            !inner.using_dbreg && inner.state.is_attached()
        };
        if claimed {
            self.registry.claim_debug_registers(user)?;
        }

        let (consumed, ret) = self.write_dbregs_locked(caller, ctx, mode, regs, claimed);
        if claimed && !consumed {
            self.registry.release_debug_registers(user);
        }
        ret
    }

    fn write_dbregs_locked(
        &self,
        caller: Caller<'_>,
        ctx: &Arc<Context>,
        mode: DbregMode,
        regs: &mut [DbregArg],
        claimed: bool,
    ) -> (bool, Result<()>) {
        let mut slot = match self.cpu(caller.cpu) {
            Ok(slot) => slot.lock(),
            Err(e) => return (false, Err(e)),
        };
        let mut inner = ctx.lock();
        let cmd = match mode {
            DbregMode::Code => PFM_WRITE_IBRS,
            DbregMode::Data => PFM_WRITE_DBRS,
        };
        if let Err(e) = self.check_state(caller, ctx, &inner, needs_stop(cmd)) {
            return (false, Err(e));
        }
        let live = slot.owns(ctx);

        // A batch rejected at its first record leaves the context as it was.
        let nr = match mode {
            DbregMode::Code => inner.ibrs.len(),
            DbregMode::Data => inner.dbrs.len(),
        };
        match regs.first_mut() {
            None => return (false, Ok(())),
            Some(reg) if reg.num >= nr => {
                reg.flags.ret_invalid = true;
                return (false, Err(Error::InvalidArgument("unimplemented debug register")));
            }
            Some(_) => {}
        }

        let mut consumed = false;
        if !inner.using_dbreg {
            if inner.state.is_attached() {
                if !claimed {
                    return (false, Err(Error::Busy("context loaded while claiming debug registers")));
                }
                if let Some(task) = inner.task().filter(|_| !ctx.is_system()) {
                    if task.has_ptrace_dbregs() {
                        return (false, Err(Error::Busy("debug registers used by ptrace")));
                    }
                }
                consumed = true;
            }

            // First use starts from cleared registers.
            inner.using_dbreg = true;
            inner.ibrs.fill(0);
            inner.dbrs.fill(0);
            if live {
                (0..inner.ibrs.len()).for_each(|i| slot.hw.write_ibr(i, 0));
                (0..inner.dbrs.len()).for_each(|i| slot.hw.write_dbr(i, 0));
            }
        }

        let inner = &mut *inner;
        for reg in regs.iter_mut() {
            let n = reg.num;
            let (bank, used, odd_clear) = match mode {
                DbregMode::Code => (&mut inner.ibrs, &mut inner.used_ibrs, IBR_X),
                DbregMode::Data => (&mut inner.dbrs, &mut inner.used_dbrs, DBR_RW),
            };
            let Some(shadow) = bank.get_mut(n) else {
                reg.flags.ret_invalid = true;
                return (consumed, Err(Error::InvalidArgument("unimplemented debug register")));
            };

            let val = if n % 2 == 1 { reg.value & !odd_clear } else { reg.value };
            *shadow = val;
            *used |= 1 << n;
            if live {
                match mode {
                    DbregMode::Code => slot.hw.write_ibr(n, val),
                    DbregMode::Data => slot.hw.write_dbr(n, val),
                }
            }
            reg.flags.ret_invalid = false;

            dprint!(self, "context {}: {:?} breakpoint {} <- {:#x}", ctx.id(), mode, n, val);
        }

        (consumed, Ok(()))
    }
}
