use uuid::Uuid;

use crate::ctx::{ContextId, CtxFlags};
use crate::pmu::RegMask;
use crate::task::Pid;

/// Per-record flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegFlags {
    /// Queue a message when this counter overflows.
    pub notify: bool,
    /// Randomize reload values with `seed` and `mask`.
    pub random: bool,
    /// Set on return if this record was rejected.
    pub ret_invalid: bool,
}

/// Register record used by the PMC/PMD commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegArg {
    pub num: usize,
    pub flags: RegFlags,
    pub value: u64,
    pub long_reset: u64,
    pub short_reset: u64,
    /// Output of `read_pmds`.
    pub last_reset_val: u64,
    pub reset_pmds: RegMask,
    pub smpl_pmds: RegMask,
    pub seed: u64,
    pub mask: u64,
    pub eventid: u64,
}

impl RegArg {
    pub fn new(num: usize, value: u64) -> Self {
        Self {
            num,
            value,
            ..Default::default()
        }
    }
}

/// Debug-register record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DbregArg {
    pub num: usize,
    pub value: u64,
    pub flags: RegFlags,
}

impl DbregArg {
    pub fn new(num: usize, value: u64) -> Self {
        Self {
            num,
            value,
            flags: RegFlags::default(),
        }
    }
}

/// Debug-register bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbregMode {
    /// Instruction breakpoint registers.
    Code,
    /// Data breakpoint registers.
    Data,
}

/// Argument of the create command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CtxArg {
    pub flags: CtxFlags,
    /// Sampling-buffer format, none for plain counting.
    pub smpl_fmt: Option<Uuid>,
    /// Format-specific argument.
    pub smpl_arg: Vec<u8>,
    /// Output: id of the new context.
    pub ctx_id: ContextId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LoadArg {
    /// Task to monitor, the caller itself for a system-wide context.
    pub load_pid: Pid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Features {
    pub version: u32,
}
