//! Numeric command interface.
//!
//! [`Perfmon::ctl`] is the single entry point of the command surface:
//! it looks the command up in a static table, checks the argument
//! against the table entry, then runs the typed operation.

use std::mem::size_of;

use crate::config::dprint;
use crate::ctx::CtxState;
use crate::error::{Error, Result};
use crate::task::Caller;
use crate::{ContextHandle, Perfmon};

mod arg;

pub use arg::*;

/// Interface version reported by `PFM_GET_FEATURES`.
pub const PFM_VERSION: u32 = 2 << 16;

/// Largest argument a command accepts, in bytes.
pub const PFM_MAX_ARGSIZE: usize = 4096;

pub const PFM_WRITE_PMCS: u32 = 0x01;
pub const PFM_WRITE_PMDS: u32 = 0x02;
pub const PFM_READ_PMDS: u32 = 0x03;
pub const PFM_STOP: u32 = 0x04;
pub const PFM_START: u32 = 0x05;
pub const PFM_CREATE_CONTEXT: u32 = 0x08;
pub const PFM_RESTART: u32 = 0x0a;
pub const PFM_GET_FEATURES: u32 = 0x0c;
pub const PFM_DEBUG: u32 = 0x0d;
pub const PFM_GET_PMC_RESET: u32 = 0x0f;
pub const PFM_LOAD_CONTEXT: u32 = 0x10;
pub const PFM_UNLOAD_CONTEXT: u32 = 0x11;
pub const PFM_WRITE_IBRS: u32 = 0x20;
pub const PFM_WRITE_DBRS: u32 = 0x21;

/// Command argument.
#[derive(Debug)]
pub enum Arg<'a> {
    None,
    Regs(&'a mut [RegArg]),
    Dbregs(&'a mut [DbregArg]),
    Context(&'a mut CtxArg),
    Load(&'a LoadArg),
    Features(&'a mut Features),
    Debug(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArgKind {
    None,
    Reg,
    Dbreg,
    Context,
    Load,
    Features,
    Debug,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Narg {
    Zero,
    One,
    Many,
}

#[derive(Clone, Copy, Debug, Default)]
struct CmdFlags {
    /// Operates on an existing context.
    fd: bool,
    /// A loaded context's task must be the caller or stopped.
    stop: bool,
}

#[derive(Clone, Copy, Debug)]
struct CmdDesc {
    name: &'static str,
    arg: ArgKind,
    narg: Narg,
    flags: CmdFlags,
}

const fn cmd(name: &'static str, arg: ArgKind, narg: Narg, fd: bool, stop: bool) -> Option<CmdDesc> {
    Some(CmdDesc {
        name,
        arg,
        narg,
        flags: CmdFlags { fd, stop },
    })
}

const CMD_TAB: [Option<CmdDesc>; 0x22] = {
    use ArgKind as A;
    use Narg as N;

    let mut tab = [None; 0x22];
    tab[PFM_WRITE_PMCS as usize] = cmd("write_pmcs", A::Reg, N::Many, true, true);
    tab[PFM_WRITE_PMDS as usize] = cmd("write_pmds", A::Reg, N::Many, true, true);
    tab[PFM_READ_PMDS as usize] = cmd("read_pmds", A::Reg, N::Many, true, true);
    tab[PFM_STOP as usize] = cmd("stop", A::None, N::Zero, true, true);
    tab[PFM_START as usize] = cmd("start", A::None, N::Zero, true, true);
    tab[PFM_CREATE_CONTEXT as usize] = cmd("create_context", A::Context, N::One, false, false);
    tab[PFM_RESTART as usize] = cmd("restart", A::None, N::Zero, true, false);
    tab[PFM_GET_FEATURES as usize] = cmd("get_features", A::Features, N::One, false, false);
    tab[PFM_DEBUG as usize] = cmd("debug", A::Debug, N::One, false, false);
    tab[PFM_GET_PMC_RESET as usize] = cmd("get_pmc_reset", A::Reg, N::Many, false, false);
    tab[PFM_LOAD_CONTEXT as usize] = cmd("load_context", A::Load, N::One, true, true);
    tab[PFM_UNLOAD_CONTEXT as usize] = cmd("unload_context", A::None, N::Zero, true, true);
    tab[PFM_WRITE_IBRS as usize] = cmd("write_ibrs", A::Dbreg, N::Many, true, true);
    tab[PFM_WRITE_DBRS as usize] = cmd("write_dbrs", A::Dbreg, N::Many, true, true);
    tab
};

/// Whether `cmd` on a loaded per-task context needs the monitored task
/// to be the caller or stopped.
pub(crate) fn needs_stop(cmd: u32) -> bool {
    CMD_TAB
        .get(cmd as usize)
        .copied()
        .flatten()
        .is_some_and(|desc| desc.flags.stop)
}

impl Arg<'_> {
    fn kind(&self) -> ArgKind {
        match self {
            Arg::None => ArgKind::None,
            Arg::Regs(_) => ArgKind::Reg,
            Arg::Dbregs(_) => ArgKind::Dbreg,
            Arg::Context(_) => ArgKind::Context,
            Arg::Load(_) => ArgKind::Load,
            Arg::Features(_) => ArgKind::Features,
            Arg::Debug(_) => ArgKind::Debug,
        }
    }

    fn count(&self) -> usize {
        match self {
            Arg::None => 0,
            Arg::Regs(regs) => regs.len(),
            Arg::Dbregs(regs) => regs.len(),
            _ => 1,
        }
    }

    /// Size the argument would have in the numeric interface.
    fn size(&self) -> usize {
        match self {
            Arg::None => 0,
            Arg::Regs(regs) => regs.len() * size_of::<RegArg>(),
            Arg::Dbregs(regs) => regs.len() * size_of::<DbregArg>(),
            Arg::Context(ctx) => size_of::<CtxArg>() + ctx.smpl_arg.len(),
            Arg::Load(_) => size_of::<LoadArg>(),
            Arg::Features(_) => size_of::<Features>(),
            Arg::Debug(_) => size_of::<u32>(),
        }
    }
}

/// Result of [`Perfmon::ctl`].
#[derive(Debug)]
#[must_use]
pub enum CmdOutput {
    Done,
    /// A new context, from `PFM_CREATE_CONTEXT`.
    Created(ContextHandle),
}

impl Perfmon {
    /// Runs command `cmd` with `arg`, on the context behind `h` when the
    /// command needs one.
    pub fn ctl(&self, caller: Caller<'_>, h: Option<&ContextHandle>, cmd: u32, arg: Arg<'_>) -> Result<CmdOutput> {
        let desc = CMD_TAB
            .get(cmd as usize)
            .copied()
            .flatten()
            .ok_or(Error::InvalidArgument("unknown command"))?;

        if arg.kind() != desc.arg {
            return Err(Error::InvalidArgument("argument does not match command"));
        }
        let count = arg.count();
        let arity_ok = match desc.narg {
            Narg::Zero => count == 0,
            Narg::One => count == 1,
            Narg::Many => count >= 1,
        };
        if !arity_ok {
            return Err(Error::InvalidArgument("wrong number of records"));
        }
        if arg.size() > PFM_MAX_ARGSIZE {
            return Err(Error::InvalidArgument("argument too large"));
        }

        let h = match (desc.flags.fd, h) {
            (true, None) => return Err(Error::InvalidArgument("command needs a context")),
            (true, Some(h)) => {
                if h.state() == CtxState::Zombie {
                    return Err(Error::Busy("zombie context"));
                }
                Some(h)
            }
            (false, _) => None,
        };

        dprint!(
            self,
            "[{}] CPU{} cmd={} count={}",
            caller.task.pid(),
            caller.cpu,
            desc.name,
            count
        );

        let ret = match (h, arg) {
            (Some(h), Arg::Regs(regs)) if cmd == PFM_WRITE_PMCS => self.write_pmcs(caller, h, regs),
            (Some(h), Arg::Regs(regs)) if cmd == PFM_WRITE_PMDS => self.write_pmds(caller, h, regs),
            (Some(h), Arg::Regs(regs)) if cmd == PFM_READ_PMDS => self.read_pmds(caller, h, regs),
            (Some(h), Arg::Dbregs(regs)) if cmd == PFM_WRITE_IBRS => self.write_ibrs(caller, h, regs),
            (Some(h), Arg::Dbregs(regs)) if cmd == PFM_WRITE_DBRS => self.write_dbrs(caller, h, regs),
            (Some(h), Arg::None) if cmd == PFM_START => self.start(caller, h),
            (Some(h), Arg::None) if cmd == PFM_STOP => self.stop(caller, h),
            (Some(h), Arg::None) if cmd == PFM_RESTART => self.restart(caller, h),
            (Some(h), Arg::None) if cmd == PFM_UNLOAD_CONTEXT => self.unload(caller, h),
            (Some(h), Arg::Load(load)) => self.load(caller, h, load),
            (None, Arg::Context(ctx)) => return self.create_context(caller, ctx).map(CmdOutput::Created),
            (None, Arg::Features(features)) => {
                *features = self.features();
                Ok(())
            }
            (None, Arg::Debug(on)) => {
                self.set_debug(on != 0);
                log::info!("perfmon debugging {}", if on != 0 { "on" } else { "off" });
                Ok(())
            }
            (None, Arg::Regs(regs)) => self.get_pmc_reset(regs),
            _ => Err(Error::InvalidArgument("argument does not match command")),
        };

        if let Err(e) = &ret {
            dprint!(self, "cmd={} failed: {}", desc.name, e);
        }
        ret.map(|()| CmdOutput::Done)
    }

    pub fn features(&self) -> Features {
        Features {
            version: PFM_VERSION,
        }
    }

    /// Default values of PMCs, stopping at the first unimplemented one.
    pub fn get_pmc_reset(&self, regs: &mut [RegArg]) -> Result<()> {
        for reg in regs.iter_mut() {
            if !self.model.pmc_is_impl(reg.num) {
                reg.flags.ret_invalid = true;
                return Err(Error::InvalidArgument("unimplemented PMC"));
            }
            reg.value = self.model.pmc(reg.num).default;
            reg.flags.ret_invalid = false;
        }
        Ok(())
    }
}
