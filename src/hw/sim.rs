use std::sync::Arc;

use spin::Mutex;

use super::PmuHw;
use crate::pmu::{PmuModel, RegMask, PMC0_FREEZE};
use crate::MAX_DBREGS;

/// Software emulated PMU.
///
/// Clones share the same register file, so a test (or a load generator)
/// can keep one to feed events while the manager owns another.
#[derive(Clone)]
pub struct SimPmu(Arc<Mutex<SimState>>);

struct SimState {
    pmcs: Vec<u64>,
    pmds: Vec<u64>,
    ibrs: [u64; MAX_DBREGS],
    dbrs: [u64; MAX_DBREGS],
    monitoring: bool,
    ovfl_val: u64,
    oi_pos: u8,
    plm_mask: u64,
    counting: RegMask,
}

impl SimPmu {
    pub fn new(model: &PmuModel) -> Self {
        let mut pmcs: Vec<u64> = (0..model.num_pmcs()).map(|i| model.pmc(i).default).collect();
        if let Some(pmc0) = pmcs.first_mut() {
            *pmc0 = PMC0_FREEZE;
        }
        let state = SimState {
            pmcs,
            pmds: vec![0; model.num_pmds()],
            ibrs: [0; MAX_DBREGS],
            dbrs: [0; MAX_DBREGS],
            monitoring: false,
            ovfl_val: model.ovfl_val,
            oi_pos: model.oi_pos,
            plm_mask: model.plm_mask,
            counting: model.counting_pmds,
        };
        Self(Arc::new(Mutex::new(state)))
    }

    /// Feeds `n` events to counter `pmd`.
    ///
    /// Events are dropped unless monitoring is on, the PMU is not frozen and
    /// the controlling PMC has a privilege level enabled. Returns `true` if
    /// the counter wrapped with its interrupt bit set, i.e. an overflow
    /// interrupt is now pending.
    pub fn count(&self, pmd: usize, n: u64) -> bool {
        let mut st = self.0.lock();
        let frozen = st.pmcs.first().map_or(true, |pmc0| pmc0 & PMC0_FREEZE != 0);
        if !st.monitoring || frozen || !st.counting.test(pmd) {
            return false;
        }
        let pmc = st.pmcs.get(pmd).copied().unwrap_or(0);
        if pmc & st.plm_mask == 0 {
            return false;
        }

        let total = st.pmds[pmd] as u128 + n as u128;
        if total <= st.ovfl_val as u128 {
            st.pmds[pmd] = total as u64;
            return false;
        }

        st.pmds[pmd] = total as u64 & st.ovfl_val;
        if (pmc >> st.oi_pos) & 1 == 0 {
            return false;
        }
        st.pmcs[0] |= 1 << pmd | PMC0_FREEZE;
        true
    }

    /// Whether overflow bits are latched in the status register.
    pub fn interrupt_pending(&self) -> bool {
        let st = self.0.lock();
        st.pmcs.first().is_some_and(|pmc0| pmc0 & !PMC0_FREEZE != 0)
    }

    pub fn ibr(&self, i: usize) -> u64 {
        self.0.lock().ibrs[i]
    }

    pub fn dbr(&self, i: usize) -> u64 {
        self.0.lock().dbrs[i]
    }
}

impl PmuHw for SimPmu {
    fn read_pmc(&self, i: usize) -> u64 {
        self.0.lock().pmcs.get(i).copied().unwrap_or(0)
    }

    fn write_pmc(&mut self, i: usize, val: u64) {
        if let Some(pmc) = self.0.lock().pmcs.get_mut(i) {
            *pmc = val;
        }
    }

    fn read_pmd(&self, i: usize) -> u64 {
        let st = self.0.lock();
        let val = st.pmds.get(i).copied().unwrap_or(0);
        if st.counting.test(i) {
            val & st.ovfl_val
        } else {
            val
        }
    }

    fn write_pmd(&mut self, i: usize, val: u64) {
        let mut st = self.0.lock();
        // Counters only implement the low `width` bits.
        let val = if st.counting.test(i) { val & st.ovfl_val } else { val };
        if let Some(pmd) = st.pmds.get_mut(i) {
            *pmd = val;
        }
    }

    fn write_ibr(&mut self, i: usize, val: u64) {
        if let Some(ibr) = self.0.lock().ibrs.get_mut(i) {
            *ibr = val;
        }
    }

    fn write_dbr(&mut self, i: usize, val: u64) {
        if let Some(dbr) = self.0.lock().dbrs.get_mut(i) {
            *dbr = val;
        }
    }

    fn set_monitoring(&mut self, on: bool) {
        self.0.lock().monitoring = on;
    }

    fn monitoring(&self) -> bool {
        self.0.lock().monitoring
    }
}
