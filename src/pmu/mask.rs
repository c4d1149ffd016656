use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Upper bound on register indices for both PMCs and PMDs.
pub const PMU_MAX_REGS: usize = 256;

const MASK_WORDS: usize = PMU_MAX_REGS / 64;

/// Register bitmask.
///
/// Word 0 holds registers 0..64, the following words extend the mask
/// for models exposing more registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegMask(pub [u64; MASK_WORDS]);

impl RegMask {
    pub const EMPTY: RegMask = RegMask([0; MASK_WORDS]);

    pub const fn from_word(word: u64) -> Self {
        let mut words = [0; MASK_WORDS];
        words[0] = word;
        Self(words)
    }

    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        let mut mask = Self::EMPTY;
        indices.into_iter().for_each(|i| mask.set(i));
        mask
    }

    /// First word, the only one overflow status can live in.
    pub fn word(&self) -> u64 {
        self.0[0]
    }

    pub fn set(&mut self, i: usize) {
        self.0[i / 64] |= 1 << (i % 64);
    }

    pub fn clear(&mut self, i: usize) {
        self.0[i / 64] &= !(1 << (i % 64));
    }

    pub fn test(&self, i: usize) -> bool {
        i < PMU_MAX_REGS && self.0[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Whether every bit of `other` is also set in `self`.
    pub fn contains(&self, other: &RegMask) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| b & !a == 0)
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(n, word)| {
            let mut w = *word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(n * 64 + bit)
            })
        })
    }
}

impl BitOr for RegMask {
    type Output = RegMask;

    fn bitor(mut self, rhs: Self) -> Self::Output {
        self |= rhs;
        self
    }
}

impl BitOrAssign for RegMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0.iter_mut().zip(rhs.0).for_each(|(a, b)| *a |= b);
    }
}

impl BitAnd for RegMask {
    type Output = RegMask;

    fn bitand(mut self, rhs: Self) -> Self::Output {
        self.0.iter_mut().zip(rhs.0).for_each(|(a, b)| *a &= b);
        self
    }
}

impl Not for RegMask {
    type Output = RegMask;

    fn not(mut self) -> Self::Output {
        self.0.iter_mut().for_each(|w| *w = !*w);
        self
    }
}
