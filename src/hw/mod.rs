//! Hardware access.
//!
//! Everything above this module reaches the PMU of one CPU through
//! [`PmuHw`]. The overflow-status register is PMC0: bit 0 freezes all
//! counters, bit `i` (for `i >= 4`) latches an overflow of PMD `i`.

pub mod sim;

/// Hardware of the current CPU when the context is installed there.
pub(crate) type LiveHw<'a> = Option<&'a mut (dyn PmuHw + 'static)>;

/// PMU registers of a single CPU.
pub trait PmuHw: Send {
    fn read_pmc(&self, i: usize) -> u64;
    fn write_pmc(&mut self, i: usize, val: u64);
    fn read_pmd(&self, i: usize) -> u64;
    fn write_pmd(&mut self, i: usize, val: u64);
    fn write_ibr(&mut self, i: usize, val: u64);
    fn write_dbr(&mut self, i: usize, val: u64);

    /// Global monitoring enable (the user/privileged monitor bit).
    fn set_monitoring(&mut self, on: bool);
    fn monitoring(&self) -> bool;

    fn freeze(&mut self) {
        let pmc0 = self.read_pmc(0);
        self.write_pmc(0, pmc0 | crate::pmu::PMC0_FREEZE);
    }

    /// Clears overflow status and unfreezes.
    fn unfreeze(&mut self) {
        self.write_pmc(0, 0);
    }
}
