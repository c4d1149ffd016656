//! Monitoring contexts.
//!
//! A [`Context`] holds the virtualized register state of one monitoring
//! session. It is created unloaded, then bound to a task or to a CPU.
//! Two owners keep it alive: the controlling [`ContextHandle`] and the
//! attachment to its task or CPU. It is freed when both are gone.

use std::sync::{Arc, Weak};

use arrayvec::ArrayVec;
use futures::channel::mpsc::UnboundedSender;
use log::error;
use spin::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::fmt::{SamplingFormat, SmplBuf};
use crate::pmu::{PmuModel, RegMask};
use crate::sync::WaitQueue;
use crate::task::{CpuId, Pid, Task};
use crate::MAX_DBREGS;

mod close;
mod counter;
mod flags;
mod handle;
mod load;
mod msg;
mod rw;
mod state;

pub use counter::*;
pub use flags::{CtxFlags, TrapReason};
pub(crate) use flags::{Owner, Owners};
pub use handle::ContextHandle;
pub(crate) use msg::MsgQueue;
pub use msg::{Message, MsgKind, MSG_SIZE, PFM_MAX_MSGS};
pub use state::CtxState;

pub type ContextId = u32;

pub struct Context {
    id: ContextId,
    flags: CtxFlags,
    fmt: Option<Arc<dyn SamplingFormat>>,
    pub(crate) inner: Mutex<CtxInner>,
    owners: Mutex<Owners>,
    /// Readers of the message queue.
    pub(crate) msg_wq: WaitQueue,
    /// The monitored task blocked on an overflow.
    pub(crate) restart_wq: WaitQueue,
    /// `close` waiting for the blocked task to let go.
    pub(crate) zombie_wq: WaitQueue,
    pub(crate) async_queue: Mutex<Vec<UnboundedSender<ContextId>>>,
}

pub(crate) struct CtxInner {
    pub state: CtxState,
    pub task: Option<Weak<Task>>,
    pub pid: Option<Pid>,
    /// Bound CPU of a loaded system-wide context.
    pub cpu: Option<CpuId>,
    pub last_cpu: Option<CpuId>,
    pub last_activation: u64,

    pub pmcs: Vec<u64>,
    pub pmds: Vec<SoftCounter>,
    /// Saved hardware image of the PMDs.
    pub th_pmds: Vec<u64>,
    pub used_pmds: RegMask,
    pub used_monitors: RegMask,
    pub reload_pmcs: RegMask,
    pub reload_pmds: RegMask,
    /// Overflowed counters waiting for a restart.
    pub ovfl_regs: RegMask,
    /// Overflow status saved at switch-out.
    pub pending_ovfl: u64,

    pub ibrs: ArrayVec<u64, MAX_DBREGS>,
    pub dbrs: ArrayVec<u64, MAX_DBREGS>,
    pub used_ibrs: u64,
    pub used_dbrs: u64,
    pub using_dbreg: bool,

    pub started: bool,
    pub going_zombie: bool,
    pub trap_reason: TrapReason,
    pub can_restart: bool,
    /// The monitored task sleeps in `handle_work`.
    pub blocked: bool,
    pub restart_posted: bool,

    pub msgq: MsgQueue,
    pub smpl: Option<SmplBuf>,
}

impl CtxInner {
    /// Moves to `to`, refusing edges the state machine does not have.
    pub fn set_state(&mut self, to: CtxState) -> Result<()> {
        if !self.state.can_become(to) {
            error!("invalid context transition {:?} -> {:?}", self.state, to);
            return Err(Error::Io("invalid context state transition"));
        }
        self.state = to;
        Ok(())
    }

    pub fn task(&self) -> Option<Arc<Task>> {
        self.task.as_ref().and_then(Weak::upgrade)
    }
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        flags: CtxFlags,
        model: &PmuModel,
        fmt: Option<Arc<dyn SamplingFormat>>,
        smpl: Option<SmplBuf>,
    ) -> Self {
        let inner = CtxInner {
            state: CtxState::Unloaded,
            task: None,
            pid: None,
            cpu: None,
            last_cpu: None,
            last_activation: 0,
            pmcs: (0..model.num_pmcs()).map(|i| model.pmc(i).default).collect(),
            pmds: vec![SoftCounter::default(); model.num_pmds()],
            th_pmds: vec![0; model.num_pmds()],
            used_pmds: RegMask::EMPTY,
            used_monitors: RegMask::EMPTY,
            reload_pmcs: RegMask::EMPTY,
            reload_pmds: RegMask::EMPTY,
            ovfl_regs: RegMask::EMPTY,
            pending_ovfl: 0,
            ibrs: (0..model.num_ibrs).map(|_| 0).collect(),
            dbrs: (0..model.num_dbrs).map(|_| 0).collect(),
            used_ibrs: 0,
            used_dbrs: 0,
            using_dbreg: false,
            started: false,
            going_zombie: false,
            trap_reason: TrapReason::None,
            can_restart: false,
            blocked: false,
            restart_posted: false,
            msgq: MsgQueue::new(),
            smpl,
        };

        Self {
            id,
            flags,
            fmt,
            inner: Mutex::new(inner),
            owners: Mutex::new(Owners {
                handle: true,
                attachment: false,
            }),
            msg_wq: WaitQueue::new(),
            restart_wq: WaitQueue::new(),
            zombie_wq: WaitQueue::new(),
            async_queue: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn flags(&self) -> CtxFlags {
        self.flags
    }

    pub fn is_system(&self) -> bool {
        self.flags.system
    }

    pub fn state(&self) -> CtxState {
        self.inner.lock().state
    }

    pub(crate) fn fmt(&self) -> Option<&Arc<dyn SamplingFormat>> {
        self.fmt.as_ref()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock()
    }

    pub(crate) fn acquire(&self, owner: Owner) {
        self.owners.lock().set(owner, true);
    }

    /// Drops one owner, returns `true` if it was the last.
    pub(crate) fn release(&self, owner: Owner) -> bool {
        let mut owners = self.owners.lock();
        owners.set(owner, false);
        owners.none()
    }

    /// Wakes readers and async subscribers after a message was queued.
    pub(crate) fn notify_readers(&self) {
        self.msg_wq.wake_all();
        self.async_queue
            .lock()
            .retain(|tx| tx.unbounded_send(self.id).is_ok());
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("fmt", &self.fmt.as_ref().map(|f| f.name().to_string()))
            .finish_non_exhaustive()
    }
}
