/// Context flags chosen at creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CtxFlags {
    /// The monitored task blocks on a notifying overflow until restarted.
    pub block: bool,
    /// Monitors a whole CPU instead of a task.
    pub system: bool,
    /// System-wide only: do not count while the idle task runs.
    pub excl_idle: bool,
    /// Notify without queueing messages.
    pub no_msg: bool,
}

/// Work the monitored task must do on its way back to user level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrapReason {
    #[default]
    None,
    /// Wait for a restart.
    Block,
    /// Reset overflowed counters and unmask.
    Reset,
}

/// Owners keeping a context alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Owner {
    /// The controlling handle.
    Handle,
    /// The monitored task or the bound CPU.
    Attachment,
}

#[derive(Debug)]
pub(crate) struct Owners {
    pub handle: bool,
    pub attachment: bool,
}

impl Owners {
    pub fn set(&mut self, owner: Owner, held: bool) {
        match owner {
            Owner::Handle => self.handle = held,
            Owner::Attachment => self.attachment = held,
        }
    }

    pub fn none(&self) -> bool {
        !self.handle && !self.attachment
    }
}
