/// Context states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CtxState {
    /// Not bound to any task or CPU.
    Unloaded,
    /// Bound, monitoring running or momentarily stopped.
    Loaded,
    /// An overflow needs user intervention before monitoring resumes.
    Masked,
    /// Controlling handle closed while still bound.
    Zombie,
}

impl CtxState {
    /// Whether the state may move to `to`.
    pub fn can_become(self, to: CtxState) -> bool {
        use CtxState::*;

        matches!(
            (self, to),
            (Unloaded, Loaded)
                | (Loaded, Unloaded)
                | (Masked, Unloaded)
                | (Loaded, Masked)
                | (Masked, Loaded)
                | (Loaded, Zombie)
                | (Masked, Zombie)
                | (Zombie, Unloaded)
        )
    }

    /// Bound to a task or CPU.
    pub fn is_attached(self) -> bool {
        matches!(self, CtxState::Loaded | CtxState::Masked)
    }
}
