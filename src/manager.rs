use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::debug;
use spin::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::ctx::{Context, ContextId, Owner};
use crate::error::{Error, Result};
use crate::fmt::{FormatRegistry, SamplingFormat};
use crate::hw::PmuHw;
use crate::intr::CpuStats;
use crate::pmu::PmuModel;
use crate::registry::{DbregUser, Registry, Sessions};
use crate::task::{CpuId, Pid, Task};

/// Per-CPU monitoring state.
///
/// The slot lock stands for "interrupts disabled on this CPU": whoever
/// holds it is the only code touching this CPU's PMU.
pub struct PerCpuState {
    pub(crate) hw: Box<dyn PmuHw>,
    /// Context whose state is live in the hardware.
    pub(crate) owner: Option<Arc<Context>>,
    /// Bumped every time a context is installed on this CPU.
    pub activation: u64,
    /// The idle task is running.
    pub idle: bool,
    pub stats: CpuStats,
}

impl PerCpuState {
    pub(crate) fn owns(&self, ctx: &Arc<Context>) -> bool {
        self.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, ctx))
    }

    pub fn owner(&self) -> Option<ContextId> {
        self.owner.as_ref().map(|ctx| ctx.id())
    }
}

/// The context manager.
///
/// Owns the PMU model, one [`PerCpuState`] per CPU, the session registry
/// and the sampling-format registry. Every operation names the CPU it
/// runs on through a [`Caller`][crate::Caller] or an explicit `cpu`.
pub struct Perfmon {
    pub(crate) model: PmuModel,
    pub(crate) cpus: Vec<Mutex<PerCpuState>>,
    pub(crate) registry: Registry,
    pub(crate) formats: FormatRegistry,
    pub(crate) config: Config,
    debug: AtomicBool,
    debug_ovfl: AtomicBool,
    tasks: Mutex<HashMap<Pid, Weak<Task>>>,
    next_id: AtomicU32,
    nr_contexts: AtomicUsize,
    epoch: Instant,
}

impl Perfmon {
    /// One hardware handle per CPU, CPU ids are indices into `hws`.
    pub fn new(model: PmuModel, hws: Vec<Box<dyn PmuHw>>, config: Config) -> Result<Self> {
        if hws.is_empty() {
            return Err(Error::InvalidArgument("no CPU"));
        }

        let cpus = hws
            .into_iter()
            .map(|mut hw| {
                hw.set_monitoring(false);
                hw.freeze();
                Mutex::new(PerCpuState {
                    hw,
                    owner: None,
                    activation: 0,
                    idle: false,
                    stats: CpuStats::default(),
                })
            })
            .collect::<Vec<_>>();

        debug!("perfmon: {} PMU on {} CPUs", model.name, cpus.len());

        Ok(Self {
            registry: Registry::new(cpus.len()),
            formats: FormatRegistry::new(),
            debug: AtomicBool::new(config.debug),
            debug_ovfl: AtomicBool::new(config.debug_ovfl),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            nr_contexts: AtomicUsize::new(0),
            epoch: Instant::now(),
            model,
            cpus,
            config,
        })
    }

    pub fn model(&self) -> &PmuModel {
        &self.model
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub(crate) fn cpu(&self, cpu: CpuId) -> Result<&Mutex<PerCpuState>> {
        self.cpus
            .get(cpu)
            .ok_or(Error::InvalidArgument("no such CPU"))
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn debug_ovfl_enabled(&self) -> bool {
        self.debug_ovfl.load(Ordering::Relaxed)
    }

    pub(crate) fn set_debug(&self, on: bool) {
        self.debug.store(on, Ordering::Relaxed);
        self.debug_ovfl.store(on, Ordering::Relaxed);
        if !on {
            self.cpus
                .iter()
                .for_each(|slot| slot.lock().stats = CpuStats::default());
        }
    }

    /// Nanoseconds since the manager was created.
    pub(crate) fn tstamp(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub(crate) fn next_id(&self) -> ContextId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn context_created(&self) {
        self.nr_contexts.fetch_add(1, Ordering::Relaxed);
    }

    /// Contexts not yet freed.
    pub fn nr_contexts(&self) -> usize {
        self.nr_contexts.load(Ordering::Relaxed)
    }

    pub fn sessions(&self) -> Sessions {
        self.registry.sessions()
    }

    /// Whether idle CPUs may enter low-power states.
    pub fn idle_fast_path(&self) -> bool {
        self.registry.idle_fast_path()
    }

    pub fn stats(&self, cpu: CpuId) -> Result<CpuStats> {
        Ok(self.cpu(cpu)?.lock().stats)
    }

    /// Context live on `cpu`.
    pub fn cpu_owner(&self, cpu: CpuId) -> Result<Option<ContextId>> {
        Ok(self.cpu(cpu)?.lock().owner())
    }

    pub fn activation(&self, cpu: CpuId) -> Result<u64> {
        Ok(self.cpu(cpu)?.lock().activation)
    }

    pub fn register_format(&self, id: Uuid, fmt: Arc<dyn SamplingFormat>) -> Result<()> {
        self.formats.register(id, fmt)
    }

    pub fn unregister_format(&self, id: &Uuid) -> Result<()> {
        self.formats.unregister(id)
    }

    /// Makes `task` visible to `load`.
    pub fn register_task(&self, task: Task) -> Arc<Task> {
        let task = Arc::new(task);
        self.tasks.lock().insert(task.pid(), Arc::downgrade(&task));
        task
    }

    pub(crate) fn find_task(&self, pid: Pid) -> Result<Arc<Task>> {
        self.tasks
            .lock()
            .get(&pid)
            .and_then(Weak::upgrade)
            .ok_or(Error::NoSuchProcess(pid))
    }

    pub(crate) fn forget_task(&self, pid: Pid) {
        self.tasks.lock().remove(&pid);
    }

    /// Claims the debug registers of `task` for a debugger.
    pub fn ptrace_claim_dbregs(&self, task: &Task) -> Result<()> {
        if let Some(ctx) = task.context() {
            if ctx.lock().using_dbreg {
                return Err(Error::Busy("debug registers used by perfmon"));
            }
        }
        self.registry.claim_debug_registers(DbregUser::Ptrace)?;
        task.state.lock().ptrace_dbregs = true;
        Ok(())
    }

    pub fn ptrace_release_dbregs(&self, task: &Task) {
        let held = std::mem::take(&mut task.state.lock().ptrace_dbregs);
        if held {
            self.registry.release_debug_registers(DbregUser::Ptrace);
        }
    }

    /// Drops `owner`, freeing the context if nothing else holds it.
    pub(crate) fn release_owner(&self, ctx: &Arc<Context>, owner: Owner) {
        if ctx.release(owner) {
            self.free_context(ctx);
        }
    }

    fn free_context(&self, ctx: &Arc<Context>) {
        let smpl = ctx.lock().smpl.take();

        // Buffer teardown runs with the context unlocked.
        if let (Some(fmt), Some(mut buf)) = (ctx.fmt(), smpl) {
            fmt.exit(&mut buf);
        }

        self.nr_contexts.fetch_sub(1, Ordering::Relaxed);
        crate::config::dprint!(self, "context {} freed", ctx.id());
    }
}
