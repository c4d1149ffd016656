//! Register access guard.
//!
//! Pure checks deciding which registers a context may touch and how a
//! user-supplied value is sanitized before it reaches the hardware.

use super::{PmuModel, RegDesc, RegMask};
use crate::error::{Error, Result};

impl PmuModel {
    pub fn pmc_is_impl(&self, i: usize) -> bool {
        self.impl_pmcs.test(i)
    }

    pub fn pmd_is_impl(&self, i: usize) -> bool {
        self.impl_pmds.test(i)
    }

    pub fn pmc_is_counting(&self, i: usize) -> bool {
        self.pmc(i).kind.is_counting()
    }

    pub fn pmd_is_counting(&self, i: usize) -> bool {
        self.counting_pmds.test(i)
    }

    pub fn pmc_is_monitor(&self, i: usize) -> bool {
        self.monitor_pmcs.test(i)
    }

    /// Descriptor of a PMC the user may write.
    pub fn writable_pmc(&self, i: usize) -> Result<&RegDesc> {
        let desc = self.pmc(i);
        if !desc.kind.is_implemented() {
            return Err(Error::InvalidArgument("unimplemented PMC"));
        }
        if desc.kind.is_control() {
            return Err(Error::InvalidArgument("read-only control PMC"));
        }
        Ok(desc)
    }

    /// Descriptor of a PMD the user may read or write.
    pub fn accessible_pmd(&self, i: usize) -> Result<&RegDesc> {
        let desc = self.pmd(i);
        if !desc.kind.is_implemented() {
            return Err(Error::InvalidArgument("unimplemented PMD"));
        }
        Ok(desc)
    }

    /// PMDs a context starts using once PMC `i` is programmed.
    pub fn pmc_deps(&self, i: usize) -> RegMask {
        self.pmc(i).deps
    }

    /// Every PMC a context may have to reload, i.e. the implemented
    /// non-control ones.
    pub fn accessible_pmcs(&self) -> RegMask {
        let mut mask = self.impl_pmcs;
        (0..self.num_pmcs())
            .filter(|i| self.pmc(*i).kind.is_control())
            .for_each(|i| mask.clear(i));
        mask
    }

    /// Whether a reset/sample dependency mask only names counting PMDs.
    pub fn valid_dep_mask(&self, mask: &RegMask) -> bool {
        self.counting_pmds.contains(mask)
    }

    /// Overflow bits of the overflow-status register as a PMD mask.
    pub fn ovfl_bits(&self, pmc0: u64) -> RegMask {
        RegMask::from_word(pmc0) & self.counting_pmds
    }
}

impl RegDesc {
    /// Checks the privilege bit of a monitor value against the session scope.
    ///
    /// The hardware default is always accepted, it is what an unprogrammed
    /// register holds.
    pub fn check_pm(&self, val: u64, is_system: bool) -> Result<()> {
        let Some(pos) = self.pm_pos else {
            return Ok(());
        };
        if val == self.default {
            return Ok(());
        }
        let pm = (val >> pos) & 1 == 1;
        if pm != is_system {
            return Err(Error::InvalidArgument("privilege bit does not match session scope"));
        }
        Ok(())
    }

    /// Forces the reserved bits back to their default value.
    pub fn sanitize(&self, val: u64) -> u64 {
        (val & !self.reserved) | (self.default & self.reserved)
    }
}
