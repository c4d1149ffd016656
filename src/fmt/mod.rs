//! Sampling-buffer formats.
//!
//! A format owns the layout of a context's sampling buffer: the overflow
//! handler hands it every overflowed counter and the format decides what
//! happens next through [`OvflCtrl`]. Formats are registered at runtime
//! and looked up by [`Uuid`] when a context is created.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use spin::Mutex;
use uuid::Uuid;

use crate::ctx::{ContextId, CtxFlags};
use crate::error::{Error, Result};
use crate::pmu::RegMask;
use crate::task::{CpuId, Pid};


/// Kernel-owned sampling buffer.
#[derive(Debug)]
pub struct SmplBuf {
    data: Vec<u8>,
}

impl SmplBuf {
    /// Allocates `size` zeroed bytes, failing instead of aborting.
    pub(crate) fn alloc(size: usize, max: usize) -> Result<Self> {
        if size > max {
            return Err(Error::OutOfMemory(size));
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::OutOfMemory(size))?;
        data.resize(size, 0);
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// What the overflow handler tells a format about one overflowed counter.
#[derive(Debug)]
pub struct OvflArg<'a> {
    pub ctx: ContextId,
    pub ovfl_pmd: usize,
    /// The counter asked for notification.
    pub ovfl_notify: bool,
    pub eventid: u64,
    pub smpl_pmds: RegMask,
    /// Values of `smpl_pmds`, lowest index first.
    pub smpl_pmds_values: &'a [u64],
    /// Value the counter was last reloaded with.
    pub last_reset_val: u64,
    pub pid: Option<Pid>,
    pub cpu: CpuId,
    pub tstamp: u64,
}

/// Overflow handling decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OvflCtrl {
    pub notify_user: bool,
    pub block_task: bool,
    pub mask_monitoring: bool,
    pub reset_ovfl_pmds: bool,
}

/// Sampling-buffer format.
///
/// `handle_overflow` runs on the interrupt path with the context locked:
/// it must not block or allocate.
pub trait SamplingFormat: Send + Sync {
    fn name(&self) -> &str;

    /// Checks the format-specific creation argument.
    fn validate(&self, flags: &CtxFlags, arg: &[u8]) -> Result<()>;

    /// Sampling buffer size needed for `arg`.
    fn get_size(&self, flags: &CtxFlags, arg: &[u8]) -> Result<usize>;

    fn init(&self, buf: &mut SmplBuf, flags: &CtxFlags, arg: &[u8]) -> Result<()>;

    fn handle_overflow(&self, buf: &mut SmplBuf, arg: &OvflArg<'_>) -> OvflCtrl;

    /// Restart of a masked context.
    fn restart(&self, buf: &mut SmplBuf) -> OvflCtrl;

    /// Restart of a context that is still running.
    fn restart_active(&self, buf: &mut SmplBuf) -> OvflCtrl {
        self.restart(buf)
    }

    /// Called once when the context is freed, before the buffer is dropped.
    fn exit(&self, _buf: &mut SmplBuf) {}
}

/// Registered formats.
#[derive(Default)]
pub struct FormatRegistry {
    formats: Mutex<HashMap<Uuid, Arc<dyn SamplingFormat>>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, fmt: Arc<dyn SamplingFormat>) -> Result<()> {
        let mut formats = self.formats.lock();
        if formats.contains_key(&id) {
            return Err(Error::Busy("sampling format already registered"));
        }
        debug!("registered sampling format {} ({})", fmt.name(), id);
        formats.insert(id, fmt);
        Ok(())
    }

    pub fn unregister(&self, id: &Uuid) -> Result<()> {
        match self.formats.lock().remove(id) {
            Some(fmt) => {
                debug!("unregistered sampling format {} ({})", fmt.name(), id);
                Ok(())
            }
            None => Err(Error::InvalidArgument("unknown sampling format")),
        }
    }

    pub fn find(&self, id: &Uuid) -> Option<Arc<dyn SamplingFormat>> {
        self.formats.lock().get(id).cloned()
    }
}
