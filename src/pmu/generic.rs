use super::{PmuModel, RegCheck, RegDesc, RegKind, RegMask};
use crate::error::{Error, Result};

const COUNTING_RSVD: u64 = 0xffff_ffff_ffff_0000;
const MATCH_DFL: u64 = 0xffff_ffff_3fff_ffff;
const MATCH_RSVD: u64 = 0x3fff_ffff_0000_0000;

// Opcode matcher: with both the M and I bits clear nothing would ever match,
// silently stopping every counter qualified by it.
fn match_write_check(_: &RegCheck<'_>, _: usize, val: &mut u64) -> Result<()> {
    if *val >> 62 == 0 {
        return Err(Error::InvalidArgument("opcode matcher matches nothing"));
    }
    Ok(())
}

const fn counting_pmc(pmd: usize) -> RegDesc {
    RegDesc {
        kind: RegKind::Counting,
        pm_pos: Some(6),
        reserved: COUNTING_RSVD,
        deps: RegMask::from_word(1 << pmd),
        ..RegDesc::NONE
    }
}

const fn counting_pmd(pmc: usize) -> RegDesc {
    RegDesc {
        kind: RegKind::Counting,
        deps: RegMask::from_word(1 << pmc),
        ..RegDesc::NONE
    }
}

const fn buffer_pmd() -> RegDesc {
    RegDesc {
        kind: RegKind::Buffer,
        deps: RegMask::from_word(1 << 12),
        ..RegDesc::NONE
    }
}

impl PmuModel {
    /// Architecture-neutral model.
    ///
    /// | register    | kind                             |
    /// |-------------|----------------------------------|
    /// | PMC0..=3    | control (PMC0 = overflow status) |
    /// | PMC4..=7    | counting monitors for PMD4..=7   |
    /// | PMC8        | opcode matcher (config)          |
    /// | PMC12       | branch-trace monitor             |
    /// | PMD4..=7    | 47-bit counters                  |
    /// | PMD8..=15   | branch-trace buffer              |
    ///
    /// Eight instruction and eight data range-restriction registers.
    pub fn generic() -> PmuModel {
        let mut pmcs = vec![RegDesc::NONE; 13];
        pmcs[..4].fill(RegDesc::new(RegKind::Control));
        (4..8).for_each(|i| pmcs[i] = counting_pmc(i));
        pmcs[8] = RegDesc {
            kind: RegKind::Config,
            default: MATCH_DFL,
            reserved: MATCH_RSVD,
            write_check: Some(match_write_check),
            ..RegDesc::NONE
        };
        pmcs[12] = RegDesc {
            kind: RegKind::Monitor,
            pm_pos: Some(6),
            reserved: COUNTING_RSVD,
            deps: RegMask::from_word(0xff00),
            ..RegDesc::NONE
        };

        let mut pmds = vec![RegDesc::NONE; 16];
        (4..8).for_each(|i| pmds[i] = counting_pmd(i));
        pmds[8..16].fill(buffer_pmd());

        // The table above is well-formed, construction cannot fail.
        match PmuModel::new("generic", pmcs, pmds, 47, 8, 8) {
            Ok(model) => model,
            Err(e) => unreachable!("generic PMU table rejected: {}", e),
        }
    }
}
