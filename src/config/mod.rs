/// Largest sampling buffer a format may ask for by default (16 MiB).
pub const DEFAULT_MAX_SMPL_BUF_SIZE: usize = 16 << 20;

// Per-operation tracing, only emitted while `debug` is switched on.
macro_rules! dprint {
    ($pfm:expr, $($arg:tt)+) => {
        if $pfm.debug_enabled() {
            log::debug!($($arg)+)
        }
    };
}
pub(crate) use dprint;

// Interrupt-path tracing, gated by `debug_ovfl`.
macro_rules! dprint_ovfl {
    ($pfm:expr, $($arg:tt)+) => {
        if $pfm.debug_ovfl_enabled() {
            log::trace!($($arg)+)
        }
    };
}
pub(crate) use dprint_ovfl;

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Trace every command and context lifetime event.
    pub debug: bool,
    /// Trace the overflow interrupt path.
    pub debug_ovfl: bool,
    /// Skip the model's register read/write checks.
    pub expert_mode: bool,
    pub reload: ReloadPolicy,
    /// Only one hardware owner can exist, the activation stamp is not
    /// needed to validate lazily saved state.
    pub uniprocessor: bool,
    /// Sampling buffers above this size fail with `OutOfMemory`.
    pub max_smpl_buf_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            debug_ovfl: false,
            expert_mode: false,
            reload: ReloadPolicy::default(),
            uniprocessor: false,
            max_smpl_buf_size: DEFAULT_MAX_SMPL_BUF_SIZE,
        }
    }
}

/// How much register state is rewritten when a task is switched in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReloadPolicy {
    /// Reuse the registers left on the CPU if nothing else ran there in
    /// between, rewriting only what changed while switched out.
    #[default]
    Lazy,
    /// Always rewrite every accessible register.
    Eager,
}
