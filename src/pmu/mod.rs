//! PMU model descriptor.
//!
//! A [`PmuModel`] is the static, per-CPU-family description of the
//! registers a PMU exposes. It is built once, then shared read-only by
//! every context.

use std::fmt;

use crate::error::{Error, Result};

mod generic;
pub mod guard;
mod mask;

pub use mask::*;

/// Freeze bit of the overflow-status PMC.
pub const PMC0_FREEZE: u64 = 1;

// Bits 0..4 of the overflow-status PMC are not overflow bits.
pub(crate) const PMC0_OVFL_SHIFT: usize = 4;

/// Register kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegKind {
    /// Not present on this model.
    Unimplemented,
    /// PMU control register, never writable by users (e.g. overflow status).
    Control,
    /// Configuration register with no privilege-level bit.
    Config,
    /// Monitor register carrying a privilege-level bit.
    Monitor,
    /// Monitor paired with a counting data register.
    Counting,
    /// Data register holding captured (non-counting) samples.
    Buffer,
}

impl RegKind {
    pub fn is_implemented(&self) -> bool {
        *self != RegKind::Unimplemented
    }

    pub fn is_counting(&self) -> bool {
        *self == RegKind::Counting
    }

    /// Counting registers are monitors too.
    pub fn is_monitor(&self) -> bool {
        matches!(self, RegKind::Monitor | RegKind::Counting)
    }

    pub fn is_control(&self) -> bool {
        *self == RegKind::Control
    }

    pub fn is_config(&self) -> bool {
        *self == RegKind::Config
    }

    pub fn is_buffer(&self) -> bool {
        *self == RegKind::Buffer
    }
}

/// State visible to register check callbacks.
pub struct RegCheck<'a> {
    pub is_system: bool,
    /// Current PMC values of the context.
    pub pmcs: &'a [u64],
}

/// Register check callback, may adjust the value in place.
pub type RegCheckFn = fn(&RegCheck<'_>, usize, &mut u64) -> Result<()>;

/// Per-register descriptor.
#[derive(Clone, Copy)]
pub struct RegDesc {
    pub kind: RegKind,
    /// Position of the privilege (system-wide) bit for monitors.
    pub pm_pos: Option<u8>,
    pub default: u64,
    /// Bits the user cannot change, they keep the default value.
    pub reserved: u64,
    pub read_check: Option<RegCheckFn>,
    pub write_check: Option<RegCheckFn>,
    /// PMDs for a PMC, PMCs for a PMD.
    pub deps: RegMask,
}

impl RegDesc {
    pub const NONE: RegDesc = RegDesc {
        kind: RegKind::Unimplemented,
        pm_pos: None,
        default: 0,
        reserved: 0,
        read_check: None,
        write_check: None,
        deps: RegMask::EMPTY,
    };

    pub const fn new(kind: RegKind) -> Self {
        RegDesc { kind, ..Self::NONE }
    }
}

impl fmt::Debug for RegDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegDesc")
            .field("kind", &self.kind)
            .field("pm_pos", &self.pm_pos)
            .field("default", &format_args!("{:#x}", self.default))
            .field("reserved", &format_args!("{:#x}", self.reserved))
            .field("read_check", &self.read_check.is_some())
            .field("write_check", &self.write_check.is_some())
            .field("deps", &self.deps)
            .finish()
    }
}

/// PMU model descriptor.
#[derive(Clone, Debug)]
pub struct PmuModel {
    pub name: &'static str,
    pub(crate) pmc_desc: Vec<RegDesc>,
    pub(crate) pmd_desc: Vec<RegDesc>,
    /// Hardware counter mask, `2^width - 1`.
    pub ovfl_val: u64,
    pub num_ibrs: usize,
    pub num_dbrs: usize,
    /// Bit position of the "interrupt on overflow" bit in counting PMCs.
    pub oi_pos: u8,
    /// Privilege-level bits of monitor PMCs, all clear stops counting.
    pub plm_mask: u64,

    pub impl_pmcs: RegMask,
    pub impl_pmds: RegMask,
    pub counting_pmds: RegMask,
    pub monitor_pmcs: RegMask,
}

impl PmuModel {
    /// Builds a model, computing the capability masks once.
    pub fn new(
        name: &'static str,
        pmc_desc: Vec<RegDesc>,
        pmd_desc: Vec<RegDesc>,
        counter_width: u8,
        num_ibrs: usize,
        num_dbrs: usize,
    ) -> Result<Self> {
        if pmc_desc.len() > PMU_MAX_REGS || pmd_desc.len() > PMU_MAX_REGS {
            return Err(Error::InvalidArgument("register table too large"));
        }
        if !(1..64).contains(&counter_width) {
            return Err(Error::InvalidArgument("counter width out of range"));
        }
        if num_ibrs > crate::MAX_DBREGS || num_dbrs > crate::MAX_DBREGS {
            return Err(Error::InvalidArgument("too many debug registers"));
        }
        if !pmc_desc.first().is_some_and(|d| d.kind.is_control()) {
            return Err(Error::InvalidArgument("PMC0 must be the overflow status register"));
        }

        let mask_of = |table: &[RegDesc], f: fn(&RegKind) -> bool| {
            RegMask::from_indices(
                table
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| f(&d.kind))
                    .map(|(i, _)| i),
            )
        };

        let counting_pmds = mask_of(&pmd_desc, RegKind::is_counting);
        // Overflow bits live in PMC0 bits 4..64.
        if counting_pmds.iter().any(|i| !(PMC0_OVFL_SHIFT..64).contains(&i)) {
            return Err(Error::InvalidArgument("counting PMD outside overflow status range"));
        }

        // Counting PMC `i` drives counting PMD `i`.
        let unpaired = pmc_desc
            .iter()
            .enumerate()
            .any(|(i, d)| d.kind.is_counting() && !counting_pmds.test(i));
        if unpaired {
            return Err(Error::InvalidArgument("counting PMC without counting PMD"));
        }

        Ok(Self {
            name,
            impl_pmcs: mask_of(&pmc_desc, RegKind::is_implemented),
            impl_pmds: mask_of(&pmd_desc, RegKind::is_implemented),
            monitor_pmcs: mask_of(&pmc_desc, RegKind::is_monitor),
            counting_pmds,
            pmc_desc,
            pmd_desc,
            ovfl_val: (1 << counter_width) - 1,
            num_ibrs,
            num_dbrs,
            oi_pos: 5,
            plm_mask: 0xf,
        })
    }

    pub fn num_pmcs(&self) -> usize {
        self.pmc_desc.len()
    }

    pub fn num_pmds(&self) -> usize {
        self.pmd_desc.len()
    }

    pub fn pmc(&self, i: usize) -> &RegDesc {
        self.pmc_desc.get(i).unwrap_or(&RegDesc::NONE)
    }

    pub fn pmd(&self, i: usize) -> &RegDesc {
        self.pmd_desc.get(i).unwrap_or(&RegDesc::NONE)
    }
}
