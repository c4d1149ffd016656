use crate::pmu::RegMask;

/// Virtualized state of one PMD.
///
/// For counters, `val` holds the bits above the hardware width; the low
/// bits stay in the hardware register or its saved copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftCounter {
    pub val: u64,
    /// Last value the counter was (re)loaded with.
    pub lval: u64,
    pub long_reset: u64,
    pub short_reset: u64,
    /// Other counters reset together with this one.
    pub reset_pmds: RegMask,
    /// PMDs recorded when this one overflows.
    pub smpl_pmds: RegMask,
    pub seed: u64,
    pub mask: u64,
    pub notify: bool,
    pub random: bool,
    pub eventid: u64,
}

impl SoftCounter {
    /// Next reload value, randomized by the seed when requested.
    pub fn next_reset(&mut self, long: bool) -> u64 {
        let mut val = if long { self.long_reset } else { self.short_reset };

        if self.random {
            let old = self.seed;
            val = val.wrapping_sub(old & self.mask);

            let mut new = carta_random32(old as u32) as u64;
            if self.mask >> 32 != 0 {
                new |= (carta_random32((old >> 32) as u32) as u64) << 32;
            }
            self.seed = new;
        }

        self.lval = val;
        val
    }
}

/// Park-Miller minimal standard generator.
pub fn carta_random32(seed: u32) -> u32 {
    ((seed as u64 * 16807) % 0x7fff_ffff) as u32
}
